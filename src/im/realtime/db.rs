//! 实时数据库抽象
//!
//! 对外部托管实时数据库的最小能力约定：读写、追加、订阅子节点增删与值变化、
//! 断线钩子、服务器时间戳以及连接状态。

use crate::im::types::server_timestamp;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde_json::{Map, Value};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};

/// 子节点快照（child-added / child-removed 事件）
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSnapshot {
    pub key: String,
    pub value: Value,
    /// 后端事件序号，同一后端内单调递增，用于合并同一路径上的多个订阅
    pub seq: u64,
}

/// 值快照（value 事件），`value` 为 `None` 表示节点不存在
#[derive(Debug, Clone, PartialEq)]
pub struct DataSnapshot {
    pub path: String,
    pub value: Option<Value>,
}

impl DataSnapshot {
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// 以子节点形式遍历（按 key 排序）
    pub fn children(&self) -> Vec<(String, Value)> {
        match &self.value {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => Vec::new(),
        }
    }
}

/// 订阅句柄：显式取消或 drop 时解除监听
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// 不持有任何后端资源的句柄
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// 订阅事件流：事件通过通道投递，持有订阅句柄
pub struct DbStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
}

impl<T> DbStream<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, subscription: Subscription) -> Self {
        Self {
            rx,
            _subscription: subscription,
        }
    }

    /// 等待下一条事件；订阅结束返回 `None`
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// 非阻塞读取已到达的事件
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for DbStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// 实时数据库协作者接口
#[async_trait]
pub trait RealtimeDb: Send + Sync {
    /// 读取路径上的值，不存在返回 `None`
    async fn read(&self, path: &str) -> Result<Option<Value>>;

    /// 覆盖写入；写入 `null` 等同删除
    async fn write(&self, path: &str, value: Value) -> Result<()>;

    /// 在路径下追加子节点，返回后端分配的 ID（字典序即追加顺序）
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    async fn remove(&self, path: &str) -> Result<()>;

    /// 局部更新子字段
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()>;

    /// 查询 `path` 下某个子字段等于 `value` 的子节点
    async fn query_equal_to(
        &self,
        path: &str,
        child: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>> {
        let snapshot = self.read(path).await?;
        Ok(match snapshot {
            Some(Value::Object(map)) => map
                .into_iter()
                .filter(|(_, v)| v.get(child) == Some(value))
                .collect(),
            _ => Vec::new(),
        })
    }

    /// 订阅子节点新增；订阅时会先回放已存在的子节点
    async fn subscribe_child_added(&self, path: &str) -> Result<DbStream<ChildSnapshot>>;

    async fn subscribe_child_removed(&self, path: &str) -> Result<DbStream<ChildSnapshot>>;

    /// 订阅值变化；订阅时会先投递当前值
    async fn subscribe_value(&self, path: &str) -> Result<DbStream<DataSnapshot>>;

    /// 注册断线钩子：连接丢失时由后端自动写入
    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<()>;

    /// 注册断线钩子：连接丢失时由后端自动删除
    async fn on_disconnect_remove(&self, path: &str) -> Result<()>;

    /// 取消路径上已注册的断线钩子
    async fn cancel_on_disconnect(&self, path: &str) -> Result<()>;

    /// 服务器时间戳占位符
    fn server_timestamp(&self) -> Value {
        server_timestamp()
    }

    /// 当前连接状态（可订阅）
    fn connectivity(&self) -> watch::Receiver<bool>;
}
