//! 好友服务层
//!
//! 好友关系是对称的：A 的好友列表中有 B，则 B 的列表中也应有 A。
//! 建立和解除关系都是两次独立写入，没有跨写入事务；
//! 中途失败会留下单向关系，这里不做自动修复，只记录日志并把错误返回调用方。

use crate::im::account::{normalize_username, AccountService, UserProfile};
use crate::im::error::{Result, SyncError};
use crate::im::friend::models::{FriendRecord, FriendRequestRecord, RequestStatus};
use crate::im::realtime::db::{DataSnapshot, DbStream, RealtimeDb};
use crate::im::types::{paths, Session};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 好友服务
pub struct FriendService {
    db: Arc<dyn RealtimeDb>,
    account: AccountService,
}

impl FriendService {
    pub fn new(db: Arc<dyn RealtimeDb>, session: Session) -> Self {
        Self {
            account: AccountService::new(db.clone(), session),
            db,
        }
    }

    fn me(&self) -> &Session {
        self.account.session()
    }

    /// 当前用户的最新资料，读取不到时退回会话中的信息
    async fn own_profile(&self) -> Result<UserProfile> {
        let me = self.me();
        Ok(self
            .account
            .load_profile(&me.user_id)
            .await?
            .unwrap_or_else(|| UserProfile {
                user_id: me.user_id.clone(),
                username: me.username.clone(),
                email: me.email.clone(),
                ..Default::default()
            }))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self
            .db
            .read(path)
            .await
            .with_context(|| format!("读取失败: {}", path))?
            .is_some())
    }

    /// 按用户名发送好友申请
    pub async fn send_request(&self, raw_username: &str) -> Result<FriendRequestRecord> {
        let username = normalize_username(raw_username);
        if username.is_empty() {
            return Err(SyncError::InvalidUsername(username));
        }
        let me = self.own_profile().await?;
        if username == me.username {
            return Err(SyncError::SelfRequest);
        }

        let target = self
            .account
            .find_by_username(&username)
            .await?
            .ok_or_else(|| SyncError::UserNotFound(username.clone()))?;
        if target.user_id == me.user_id {
            return Err(SyncError::SelfRequest);
        }
        if self.exists(&paths::friend(&me.user_id, &target.user_id)).await? {
            return Err(SyncError::AlreadyFriends(username));
        }
        let request_path = paths::friend_request(&target.user_id, &me.user_id);
        if self.exists(&request_path).await? {
            return Err(SyncError::RequestAlreadySent(username));
        }
        if self
            .exists(&paths::friend_request(&me.user_id, &target.user_id))
            .await?
        {
            return Err(SyncError::ReverseRequestPending(username));
        }

        let request = FriendRequestRecord {
            from: me.user_id.clone(),
            from_username: me.username.clone(),
            from_email: me.email.clone(),
            to: target.user_id.clone(),
            to_username: target.username.clone(),
            to_email: target.email.clone(),
            timestamp: None,
            status: RequestStatus::Pending,
        };
        self.db
            .write(&request_path, request.to_value(self.db.server_timestamp())?)
            .await
            .context("发送好友申请失败")?;
        info!("[Contact] 📨 好友申请已发送: {} -> @{}", me.user_id, username);
        Ok(request)
    }

    async fn load_request(&self, recipient: &str, sender: &str) -> Result<FriendRequestRecord> {
        let path = paths::friend_request(recipient, sender);
        let value = self
            .db
            .read(&path)
            .await
            .with_context(|| format!("读取好友申请失败: {}", path))?
            .ok_or_else(|| SyncError::RequestNotFound(sender.to_string()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// 接受好友申请：写入双方好友记录后删除申请
    pub async fn accept_request(&self, sender_id: &str) -> Result<FriendRecord> {
        let me = self.own_profile().await?;
        let request = self.load_request(&me.user_id, sender_id).await?;

        let friend = FriendRecord::new(&request.from, &request.from_username, &request.from_email);
        self.db
            .write(
                &paths::friend(&me.user_id, &request.from),
                friend.to_value(self.db.server_timestamp())?,
            )
            .await
            .context("写入好友记录失败")?;

        let reverse = FriendRecord::new(&me.user_id, &me.username, &me.email);
        if let Err(e) = self
            .db
            .write(
                &paths::friend(&request.from, &me.user_id),
                reverse.to_value(self.db.server_timestamp())?,
            )
            .await
        {
            error!(
                "[Contact] ❌ 对方好友记录写入失败，关系不对称: {} 有 {}，反向缺失",
                me.user_id, request.from
            );
            return Err(SyncError::Transient(e.context("写入对方好友记录失败")));
        }

        self.db
            .remove(&paths::friend_request(&me.user_id, sender_id))
            .await
            .context("删除已处理的好友申请失败")?;
        info!("[Contact] 🤝 已接受好友申请: {} <-> {}", me.user_id, request.from);
        Ok(friend)
    }

    /// 拒绝收到的好友申请
    pub async fn reject_request(&self, sender_id: &str) -> Result<()> {
        let path = paths::friend_request(&self.me().user_id, sender_id);
        if !self.exists(&path).await? {
            return Err(SyncError::RequestNotFound(sender_id.to_string()));
        }
        self.db.remove(&path).await.context("拒绝好友申请失败")?;
        info!("[Contact] 已拒绝好友申请: {}", sender_id);
        Ok(())
    }

    /// 撤回自己发出的好友申请
    pub async fn cancel_request(&self, recipient_id: &str) -> Result<()> {
        let path = paths::friend_request(recipient_id, &self.me().user_id);
        if !self.exists(&path).await? {
            return Err(SyncError::RequestNotFound(recipient_id.to_string()));
        }
        self.db.remove(&path).await.context("撤回好友申请失败")?;
        info!("[Contact] 已撤回好友申请: {}", recipient_id);
        Ok(())
    }

    /// 解除好友关系（两次独立删除）
    pub async fn remove_friend(&self, friend_id: &str) -> Result<()> {
        let my_id = self.me().user_id.clone();
        self.db
            .remove(&paths::friend(&my_id, friend_id))
            .await
            .context("删除好友记录失败")?;
        if let Err(e) = self.db.remove(&paths::friend(friend_id, &my_id)).await {
            error!(
                "[Contact] ❌ 对方好友记录删除失败，关系不对称: {} 仍有 {}",
                friend_id, my_id
            );
            return Err(SyncError::Transient(e.context("删除对方好友记录失败")));
        }
        info!("[Contact] 已删除好友: {}", friend_id);
        Ok(())
    }

    pub async fn friends(&self) -> Result<Vec<FriendRecord>> {
        let value = self
            .db
            .read(&paths::friends(&self.me().user_id))
            .await
            .context("读取好友列表失败")?;
        Ok(parse_children(value.as_ref()))
    }

    /// 收到的待处理申请
    pub async fn pending_requests(&self) -> Result<Vec<FriendRequestRecord>> {
        let value = self
            .db
            .read(&paths::incoming_requests(&self.me().user_id))
            .await
            .context("读取好友申请失败")?;
        Ok(parse_children(value.as_ref()))
    }

    /// 自己发出、对方尚未处理的申请
    ///
    /// 申请按接收者分组存储，这里读取全部申请后按发送者筛选。
    pub async fn sent_requests(&self) -> Result<Vec<FriendRequestRecord>> {
        let value = self
            .db
            .read(paths::FRIEND_REQUESTS)
            .await
            .context("读取已发送申请失败")?;
        let my_id = &self.me().user_id;
        let mut sent = Vec::new();
        if let Some(Value::Object(recipients)) = value {
            for (_, requests) in recipients {
                if let Some(request) = requests.get(my_id.as_str()) {
                    match serde_json::from_value::<FriendRequestRecord>(request.clone()) {
                        Ok(r) if r.from == *my_id => sent.push(r),
                        Ok(_) => {}
                        Err(e) => warn!("[Contact] 跳过无法解析的申请: {}", e),
                    }
                }
            }
        }
        Ok(sent)
    }

    /// 实时监听好友列表
    pub async fn watch_friends(&self) -> Result<RecordListWatcher<FriendRecord>> {
        RecordListWatcher::subscribe(self.db.as_ref(), &paths::friends(&self.me().user_id)).await
    }

    /// 实时监听收到的好友申请
    pub async fn watch_requests(&self) -> Result<RecordListWatcher<FriendRequestRecord>> {
        RecordListWatcher::subscribe(
            self.db.as_ref(),
            &paths::incoming_requests(&self.me().user_id),
        )
        .await
    }
}

fn parse_children<T: DeserializeOwned>(value: Option<&Value>) -> Vec<T> {
    let Some(Value::Object(children)) = value else {
        return Vec::new();
    };
    children
        .iter()
        .filter_map(|(key, child)| match serde_json::from_value(child.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("[Contact] 跳过无法解析的记录 {}: {}", key, e);
                None
            }
        })
        .collect()
}

/// 对某个路径下子节点列表的全量监听
pub struct RecordListWatcher<T> {
    path: String,
    stream: DbStream<DataSnapshot>,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> RecordListWatcher<T> {
    pub async fn subscribe(db: &dyn RealtimeDb, path: &str) -> Result<Self> {
        let stream = db
            .subscribe_value(path)
            .await
            .with_context(|| format!("订阅失败: {}", path))?;
        Ok(Self {
            path: path.to_string(),
            stream,
            _record: PhantomData,
        })
    }

    /// 下一次变化后的完整列表（订阅后首先投递当前列表）
    pub async fn next(&mut self) -> Option<Vec<T>> {
        let snapshot = self.stream.next().await?;
        debug!("[Contact] 列表变更: {}", self.path);
        Some(parse_children(snapshot.value.as_ref()))
    }
}
