//! 进程内实时数据库
//!
//! `MemoryServer` 模拟托管实时数据库的服务端（JSON 树 + 监听器），
//! `MemoryConnection` 模拟单个客户端连接（断线钩子、连接状态、写入失败注入）。
//! 语义与托管后端保持一致：child-added 订阅会先回放已有子节点，写入 null 即删除，
//! 空对象不存在，断线时按注册顺序执行钩子。

use crate::im::realtime::db::{ChildSnapshot, DataSnapshot, DbStream, RealtimeDb, Subscription};
use crate::im::types::is_server_timestamp;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// 进程内后端服务
#[derive(Clone, Default)]
pub struct MemoryServer {
    inner: Arc<Mutex<ServerState>>,
}

struct ServerState {
    root: Value,
    /// 手动设置的服务器时钟（毫秒），未设置时使用系统时间
    clock: Option<i64>,
    next_listener_id: u64,
    next_seq: u64,
    push_counter: u64,
    listeners: BTreeMap<u64, Listener>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
            clock: None,
            next_listener_id: 1,
            next_seq: 1,
            push_counter: 0,
            listeners: BTreeMap::new(),
        }
    }
}

struct Listener {
    path: Vec<String>,
    sink: Sink,
}

enum Sink {
    ChildAdded(mpsc::UnboundedSender<ChildSnapshot>),
    ChildRemoved(mpsc::UnboundedSender<ChildSnapshot>),
    Value(mpsc::UnboundedSender<DataSnapshot>),
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn get_at<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segs {
        node = node.as_object()?.get(seg)?;
    }
    if is_empty(node) {
        None
    } else {
        Some(node)
    }
}

fn is_empty(value: &Value) -> bool {
    value.is_null() || value.as_object().map(|o| o.is_empty()).unwrap_or(false)
}

/// 去掉 null 子节点与空对象
fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| prune(v).map(|v| (k, v)))
                .collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        other => Some(other),
    }
}

fn resolve_server_values(value: &mut Value, now: i64) {
    if is_server_timestamp(value) {
        *value = Value::from(now);
        return;
    }
    match value {
        Value::Object(map) => map.values_mut().for_each(|v| resolve_server_values(v, now)),
        Value::Array(items) => items.iter_mut().for_each(|v| resolve_server_values(v, now)),
        _ => {}
    }
}

fn set_at(node: &mut Value, segs: &[String], value: Option<Value>) {
    let Some((head, rest)) = segs.split_first() else {
        *node = value.unwrap_or_else(|| Value::Object(Map::new()));
        return;
    };
    if !node.is_object() {
        if value.is_none() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        match value {
            Some(v) => {
                map.insert(head.clone(), v);
            }
            None => {
                map.remove(head);
            }
        }
        return;
    }
    if value.is_none() && !map.contains_key(head) {
        return;
    }
    let child = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    set_at(child, rest, value);
    if is_empty(child) {
        map.remove(head);
    }
}

impl ServerState {
    fn now(&self) -> i64 {
        self.clock.unwrap_or_else(crate::im::types::now_millis)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn snapshot_listeners(&self) -> Vec<(u64, Option<Value>)> {
        self.listeners
            .iter()
            .map(|(id, l)| (*id, get_at(&self.root, &l.path).cloned()))
            .collect()
    }

    /// 对比变更前后各监听路径上的值并投递事件
    fn dispatch(&mut self, before: Vec<(u64, Option<Value>)>) {
        let mut seq = self.next_seq;
        let mut closed = Vec::new();

        for (id, old) in before {
            let Some(listener) = self.listeners.get(&id) else {
                continue;
            };
            let new = get_at(&self.root, &listener.path).cloned();
            if old == new {
                continue;
            }

            let empty = Map::new();
            let old_children = old.as_ref().and_then(|v| v.as_object()).unwrap_or(&empty);
            let new_children = new.as_ref().and_then(|v| v.as_object()).unwrap_or(&empty);

            let delivered = match &listener.sink {
                Sink::ChildAdded(tx) => new_children
                    .iter()
                    .filter(|(k, _)| !old_children.contains_key(*k))
                    .all(|(k, v)| {
                        seq += 1;
                        tx.send(ChildSnapshot {
                            key: k.clone(),
                            value: v.clone(),
                            seq,
                        })
                        .is_ok()
                    }),
                Sink::ChildRemoved(tx) => old_children
                    .iter()
                    .filter(|(k, _)| !new_children.contains_key(*k))
                    .all(|(k, v)| {
                        seq += 1;
                        tx.send(ChildSnapshot {
                            key: k.clone(),
                            value: v.clone(),
                            seq,
                        })
                        .is_ok()
                    }),
                Sink::Value(tx) => tx
                    .send(DataSnapshot {
                        path: listener.path.join("/"),
                        value: new.clone(),
                    })
                    .is_ok(),
            };
            if !delivered {
                closed.push(id);
            }
        }

        self.next_seq = seq + 1;
        for id in closed {
            self.listeners.remove(&id);
        }
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 建立一个新的客户端连接（初始为已连接）
    pub fn connect(&self, label: &str) -> MemoryConnection {
        info!("[MemDB] 🔗 客户端连接: {}", label);
        let (tx, _rx) = watch::channel(true);
        MemoryConnection {
            server: self.clone(),
            label: label.to_string(),
            inner: Arc::new(Mutex::new(ConnState {
                connected: true,
                hooks: Vec::new(),
                write_budget: None,
            })),
            connected: Arc::new(tx),
        }
    }

    /// 固定服务器时钟（毫秒）
    pub fn set_time(&self, millis: i64) {
        self.state().clock = Some(millis);
    }

    /// 推进服务器时钟
    pub fn advance_time(&self, millis: i64) {
        let mut state = self.state();
        let now = state.now();
        state.clock = Some(now + millis);
    }

    pub fn now(&self) -> i64 {
        self.state().now()
    }

    /// 同步读取（测试与演示用）
    pub fn get(&self, path: &str) -> Option<Value> {
        let state = self.state();
        get_at(&state.root, &split_path(path)).cloned()
    }

    /// 当前所有活跃监听器的路径
    pub fn listener_paths(&self) -> Vec<String> {
        self.state()
            .listeners
            .values()
            .map(|l| l.path.join("/"))
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    fn mutate(&self, f: impl FnOnce(&mut ServerState)) {
        let mut state = self.state();
        let before = state.snapshot_listeners();
        f(&mut state);
        state.dispatch(before);
    }

    fn set(&self, path: &str, value: Option<Value>) {
        let segs = split_path(path);
        self.mutate(|state| {
            let now = state.now();
            let value = value.and_then(|mut v| {
                resolve_server_values(&mut v, now);
                prune(v)
            });
            set_at(&mut state.root, &segs, value);
        });
    }

    fn update(&self, path: &str, fields: Map<String, Value>) {
        let base = split_path(path);
        self.mutate(|state| {
            let now = state.now();
            for (key, value) in fields {
                let mut segs = base.clone();
                segs.extend(split_path(&key));
                let mut value = value;
                resolve_server_values(&mut value, now);
                set_at(&mut state.root, &segs, prune(value));
            }
        });
    }

    fn push(&self, path: &str, value: Value) -> String {
        let mut key = String::new();
        let segs = split_path(path);
        self.mutate(|state| {
            state.push_counter += 1;
            key = format!("-M{:012}", state.push_counter);
            let now = state.now();
            let mut value = value;
            resolve_server_values(&mut value, now);
            let mut full = segs.clone();
            full.push(key.clone());
            set_at(&mut state.root, &full, prune(value));
        });
        key
    }

    fn register(&self, state: &mut ServerState, path: &str, sink: Sink) -> Subscription {
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.insert(
            id,
            Listener {
                path: split_path(path),
                sink,
            },
        );
        debug!("[MemDB] 注册监听器 #{}: {}", id, path);

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
                state.listeners.remove(&id);
                debug!("[MemDB] 移除监听器 #{}", id);
            }
        })
    }

    fn listen_child_added(&self, path: &str) -> DbStream<ChildSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let existing: Vec<(String, Value)> = get_at(&state.root, &split_path(path))
            .and_then(|v| v.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        for (key, value) in existing {
            let seq = state.take_seq();
            let _ = tx.send(ChildSnapshot { key, value, seq });
        }
        let subscription = self.register(&mut state, path, Sink::ChildAdded(tx));
        DbStream::new(rx, subscription)
    }

    fn listen_child_removed(&self, path: &str) -> DbStream<ChildSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let subscription = self.register(&mut state, path, Sink::ChildRemoved(tx));
        DbStream::new(rx, subscription)
    }

    fn listen_value(&self, path: &str) -> DbStream<DataSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let segs = split_path(path);
        let _ = tx.send(DataSnapshot {
            path: segs.join("/"),
            value: get_at(&state.root, &segs).cloned(),
        });
        let subscription = self.register(&mut state, path, Sink::Value(tx));
        DbStream::new(rx, subscription)
    }
}

#[derive(Debug, Clone)]
enum DisconnectAction {
    Set(Value),
    Remove,
}

struct ConnState {
    connected: bool,
    hooks: Vec<(String, DisconnectAction)>,
    /// 剩余允许成功的写入次数，`None` 表示不限制
    write_budget: Option<usize>,
}

/// 单个客户端到进程内后端的连接
#[derive(Clone)]
pub struct MemoryConnection {
    server: MemoryServer,
    label: String,
    inner: Arc<Mutex<ConnState>>,
    connected: Arc<watch::Sender<bool>>,
}

impl MemoryConnection {
    fn conn(&self) -> MutexGuard<'_, ConnState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn server(&self) -> &MemoryServer {
        &self.server
    }

    pub fn is_connected(&self) -> bool {
        self.conn().connected
    }

    /// 模拟连接丢失（崩溃、断网）：后端执行该连接注册的全部断线钩子
    pub fn disconnect(&self) {
        let hooks = {
            let mut conn = self.conn();
            if !conn.connected {
                return;
            }
            conn.connected = false;
            std::mem::take(&mut conn.hooks)
        };
        warn!(
            "[MemDB] ⚠️ 连接断开: {}，执行断线钩子 {} 个",
            self.label,
            hooks.len()
        );
        for (path, action) in hooks {
            match action {
                DisconnectAction::Set(value) => self.server.set(&path, Some(value)),
                DisconnectAction::Remove => self.server.set(&path, None),
            }
        }
        self.connected.send_replace(false);
    }

    /// 模拟重新连接
    pub fn reconnect(&self) {
        {
            let mut conn = self.conn();
            if conn.connected {
                return;
            }
            conn.connected = true;
        }
        info!("[MemDB] 🔗 连接恢复: {}", self.label);
        self.connected.send_replace(true);
    }

    /// 允许接下来 `after` 次写入（含断线钩子的注册与取消）成功，此后全部失败
    pub fn inject_write_failures(&self, after: usize) {
        self.conn().write_budget = Some(after);
    }

    pub fn clear_write_failures(&self) {
        self.conn().write_budget = None;
    }

    /// 当前已注册的断线钩子路径
    pub fn disconnect_hook_paths(&self) -> Vec<String> {
        self.conn().hooks.iter().map(|(p, _)| p.clone()).collect()
    }

    fn check_online(&self) -> Result<()> {
        if !self.conn().connected {
            bail!("连接已断开: {}", self.label);
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        let mut conn = self.conn();
        if !conn.connected {
            bail!("连接已断开，写入失败: {}", self.label);
        }
        self.take_write_budget(&mut conn)
    }

    fn take_write_budget(&self, conn: &mut ConnState) -> Result<()> {
        if let Some(budget) = conn.write_budget.as_mut() {
            if *budget == 0 {
                bail!("网络不可达，写入失败: {}", self.label);
            }
            *budget -= 1;
        }
        Ok(())
    }

    /// 断线钩子在离线时也可注册（恢复连接后生效），但同样消耗写入次数
    fn register_hook(&self, path: &str, action: DisconnectAction) -> Result<()> {
        let mut conn = self.conn();
        self.take_write_budget(&mut conn)?;
        conn.hooks.retain(|(p, _)| p != path);
        conn.hooks.push((path.to_string(), action));
        Ok(())
    }
}

#[async_trait]
impl RealtimeDb for MemoryConnection {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        self.check_online()?;
        Ok(self.server.get(path))
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        self.check_write()?;
        self.server.set(path, Some(value));
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        self.check_write()?;
        Ok(self.server.push(path, value))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.check_write()?;
        self.server.set(path, None);
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        self.check_write()?;
        self.server.update(path, fields);
        Ok(())
    }

    async fn subscribe_child_added(&self, path: &str) -> Result<DbStream<ChildSnapshot>> {
        Ok(self.server.listen_child_added(path))
    }

    async fn subscribe_child_removed(&self, path: &str) -> Result<DbStream<ChildSnapshot>> {
        Ok(self.server.listen_child_removed(path))
    }

    async fn subscribe_value(&self, path: &str) -> Result<DbStream<DataSnapshot>> {
        Ok(self.server.listen_value(path))
    }

    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<()> {
        self.register_hook(path, DisconnectAction::Set(value))
    }

    async fn on_disconnect_remove(&self, path: &str) -> Result<()> {
        self.register_hook(path, DisconnectAction::Remove)
    }

    async fn cancel_on_disconnect(&self, path: &str) -> Result<()> {
        let prefix = format!("{}/", path);
        let mut conn = self.conn();
        self.take_write_budget(&mut conn)?;
        conn.hooks
            .retain(|(p, _)| p != path && !p.starts_with(&prefix));
        Ok(())
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
