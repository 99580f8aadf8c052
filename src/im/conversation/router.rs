//! 会话路由
//!
//! 同一时刻只有一个打开的会话。切换会话时先拆除旧会话的全部订阅（消息、输入状态）
//! 并清除本地输入标记，再计算新会话 ID、重置时间线、建立新订阅。
//! 旧会话迟到的事件在应用时按会话 ID 比对后丢弃。

use crate::im::error::{Result, SyncError};
use crate::im::feed::{ChangeFeed, FeedEvent, LiveFeed};
use crate::im::message::models::{Message, MessageContent, MessageRecord};
use crate::im::message::timeline::{InsertOrigin, MessageTimeline, TimelineChange};
use crate::im::realtime::db::RealtimeDb;
use crate::im::serialization::generate_client_temp_id;
use crate::im::typing::{TypingCoordinator, TypingWatcher};
use crate::im::types::{paths, ConversationId, Session};
use anyhow::Context;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 路由产生的界面事件
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    MessageInserted {
        conversation_id: ConversationId,
        message: Message,
        index: usize,
        origin: InsertOrigin,
    },
    MessageRemoved {
        conversation_id: ConversationId,
        id: String,
        index: usize,
    },
    TypingChanged {
        conversation_id: ConversationId,
        typing: bool,
    },
}

struct ActiveConversation {
    contact_id: String,
    conversation_id: ConversationId,
    /// 初始拉取失败时为空，重新选择该会话即重试
    live: Option<LiveFeed>,
    typing_watcher: Option<TypingWatcher>,
}

enum Incoming {
    Feed(Option<FeedEvent>),
    Typing(Option<bool>),
}

pub struct ConversationRouter {
    session: Session,
    db: Arc<dyn RealtimeDb>,
    feed: ChangeFeed,
    typing: TypingCoordinator,
    timeline: MessageTimeline,
    active: Option<ActiveConversation>,
}

impl ConversationRouter {
    pub fn new(
        session: Session,
        db: Arc<dyn RealtimeDb>,
        initial_batch_limit: usize,
        typing_debounce: Duration,
    ) -> Self {
        let typing = TypingCoordinator::new(db.clone(), &session.user_id, typing_debounce);
        let timeline = MessageTimeline::new(&session.user_id, initial_batch_limit);
        Self {
            feed: ChangeFeed::new(db.clone()),
            session,
            db,
            typing,
            timeline,
            active: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// 用户名变更后同步到发送的消息记录中
    pub fn set_username(&mut self, username: &str) {
        self.session.username = username.to_string();
    }

    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.active.as_ref().map(|a| &a.conversation_id)
    }

    pub fn active_contact(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.contact_id.as_str())
    }

    /// 当前会话是否已建立实时订阅
    pub fn is_live(&self) -> bool {
        self.active.as_ref().map(|a| a.live.is_some()).unwrap_or(false)
    }

    pub fn messages(&self) -> &[Message] {
        self.timeline.messages()
    }

    /// 选择会话：拆除旧订阅、重置时间线、建立新订阅，返回初始展示的消息
    pub async fn select_conversation(&mut self, contact_id: &str) -> Result<Vec<Message>> {
        self.teardown().await;

        let conversation_id = self.session.conversation_with(contact_id);
        self.timeline.reset(Some(conversation_id.clone()));
        self.active = Some(ActiveConversation {
            contact_id: contact_id.to_string(),
            conversation_id: conversation_id.clone(),
            live: None,
            typing_watcher: None,
        });
        info!("[Router] 🔀 打开会话: {} ({})", conversation_id, contact_id);

        let (batch, live) = self.feed.subscribe_initial_and_live(&conversation_id).await?;
        let typing_watcher =
            TypingWatcher::subscribe(self.db.as_ref(), &conversation_id, &self.session.user_id)
                .await?;

        if let Some(active) = self.active.as_mut() {
            active.live = Some(live);
            active.typing_watcher = Some(typing_watcher);
        }
        Ok(self.timeline.apply_initial_batch(batch).to_vec())
    }

    /// 关闭当前会话
    pub async fn deselect(&mut self) {
        self.teardown().await;
        self.timeline.reset(None);
    }

    async fn teardown(&mut self) {
        if let Some(previous) = self.active.take() {
            debug!("[Router] 拆除会话订阅: {}", previous.conversation_id);
            drop(previous);
        }
        if let Err(e) = self.typing.clear().await {
            warn!("[Router] 清除输入状态失败: {:#}", e);
        }
    }

    /// 等待当前会话的下一条界面事件；没有可等待的订阅时一直挂起
    ///
    /// 可以在 `select!` 中安全取消。
    pub async fn next_event(&mut self) -> RouterEvent {
        loop {
            let Some(active) = self.active.as_mut() else {
                return std::future::pending().await;
            };
            let conversation_id = active.conversation_id.clone();

            let incoming = match (active.live.as_mut(), active.typing_watcher.as_mut()) {
                (Some(live), Some(watcher)) => tokio::select! {
                    event = live.next() => Incoming::Feed(event),
                    typing = watcher.next() => Incoming::Typing(typing),
                },
                (Some(live), None) => Incoming::Feed(live.next().await),
                (None, Some(watcher)) => Incoming::Typing(watcher.next().await),
                (None, None) => return std::future::pending().await,
            };

            match incoming {
                Incoming::Feed(Some(event)) => {
                    if let Some(out) = self.apply_feed_event(&conversation_id, event) {
                        return out;
                    }
                }
                Incoming::Typing(Some(typing)) => {
                    return RouterEvent::TypingChanged {
                        conversation_id,
                        typing,
                    };
                }
                Incoming::Feed(None) => {
                    warn!("[Router] 消息订阅已结束: {}", conversation_id);
                    if let Some(active) = self.active.as_mut() {
                        active.live = None;
                    }
                }
                Incoming::Typing(None) => {
                    warn!("[Router] 输入状态订阅已结束: {}", conversation_id);
                    if let Some(active) = self.active.as_mut() {
                        active.typing_watcher = None;
                    }
                }
            }
        }
    }

    /// 将一条实时事件应用到时间线；会话 ID 与当前会话不符的事件直接丢弃
    pub(crate) fn apply_feed_event(
        &mut self,
        conversation_id: &ConversationId,
        event: FeedEvent,
    ) -> Option<RouterEvent> {
        if self.timeline.conversation_id() != Some(conversation_id) {
            debug!("[Router] 丢弃过期会话事件: {}", conversation_id);
            return None;
        }
        match event {
            FeedEvent::Added(message) => match self.timeline.apply_added(message) {
                TimelineChange::Inserted {
                    message,
                    index,
                    origin,
                } => Some(RouterEvent::MessageInserted {
                    conversation_id: conversation_id.clone(),
                    message,
                    index,
                    origin,
                }),
                _ => None,
            },
            FeedEvent::Removed { id } => match self.timeline.apply_removed(&id) {
                TimelineChange::Removed { id, index } => Some(RouterEvent::MessageRemoved {
                    conversation_id: conversation_id.clone(),
                    id,
                    index,
                }),
                _ => None,
            },
        }
    }

    /// 输入活动
    pub async fn notify_input(&mut self) -> Result<()> {
        let conversation_id = self
            .active_conversation()
            .cloned()
            .ok_or(SyncError::NoActiveConversation)?;
        self.typing.on_input(&conversation_id).await?;
        Ok(())
    }

    /// 输入框失焦
    pub async fn notify_blur(&mut self) -> Result<()> {
        self.typing.clear().await?;
        Ok(())
    }

    /// 在当前会话插入乐观占位消息
    pub fn stage_placeholder(&mut self, content: MessageContent) -> Result<Message> {
        let conversation_id = self
            .active_conversation()
            .cloned()
            .ok_or(SyncError::NoActiveConversation)?;
        let temp_id = generate_client_temp_id();
        let placeholder = Message::placeholder(
            conversation_id,
            &self.session.user_id,
            &self.session.username,
            content,
            &temp_id,
        );
        self.timeline.add_placeholder(placeholder.clone());
        debug!("[Router] 插入占位消息: {}", temp_id);
        Ok(placeholder)
    }

    /// 追加占位消息对应的服务端记录，返回后端分配的消息 ID
    ///
    /// 失败时占位消息保留并标记为发送失败。
    pub async fn publish(&mut self, placeholder: &Message, content: &MessageContent) -> Result<String> {
        let record = MessageRecord::outgoing(
            &self.session.user_id,
            &self.session.username,
            &self.session.email,
            content,
            placeholder.client_temp_id.as_deref(),
        );
        let value = record.to_value(self.db.server_timestamp())?;
        let path = paths::messages(&placeholder.conversation_id);

        match self.db.push(&path, value).await {
            Ok(id) => {
                info!("[Router] 📤 消息已发送: {} -> {}", id, placeholder.conversation_id);
                if let Err(e) = self.typing.clear().await {
                    warn!("[Router] 发送后清除输入状态失败: {:#}", e);
                }
                Ok(id)
            }
            Err(e) => {
                if let Some(temp_id) = placeholder.client_temp_id.as_deref() {
                    self.fail_placeholder(&placeholder.conversation_id, temp_id);
                }
                warn!("[Router] 消息发送失败: {:#}", e);
                Err(SyncError::Transient(e.context("发送消息失败")))
            }
        }
    }

    /// 将占位消息标记为发送失败（会话已切换时忽略）
    pub fn fail_placeholder(&mut self, conversation_id: &ConversationId, temp_id: &str) -> bool {
        if self.timeline.conversation_id() != Some(conversation_id) {
            return false;
        }
        self.timeline.mark_placeholder_failed(temp_id)
    }

    /// 放弃一条发送失败的占位消息
    pub fn discard_placeholder(&mut self, temp_id: &str) -> bool {
        self.timeline.discard_placeholder(temp_id)
    }

    /// 删除当前会话中自己发送的一条消息
    pub async fn delete_message(&mut self, message_id: &str) -> Result<()> {
        let conversation_id = self
            .active_conversation()
            .cloned()
            .ok_or(SyncError::NoActiveConversation)?;
        let path = paths::message(&conversation_id, message_id);
        let Some(value) = self
            .db
            .read(&path)
            .await
            .with_context(|| format!("读取消息失败: {}", path))?
        else {
            debug!("[Router] 消息已不存在: {}", message_id);
            return Ok(());
        };
        let record: MessageRecord = serde_json::from_value(value)?;
        if record.sender_id != self.session.user_id {
            return Err(SyncError::NotMessageOwner);
        }
        self.db
            .remove(&path)
            .await
            .with_context(|| format!("删除消息失败: {}", path))?;
        info!("[Router] 🗑️ 已删除消息: {}", message_id);
        Ok(())
    }

    /// 清空当前会话中自己发送的全部消息，对方的消息不受影响
    pub async fn clear_chat(&mut self) -> Result<usize> {
        let conversation_id = self
            .active_conversation()
            .cloned()
            .ok_or(SyncError::NoActiveConversation)?;
        let path = paths::messages(&conversation_id);
        let snapshot = self
            .db
            .read(&path)
            .await
            .with_context(|| format!("读取会话消息失败: {}", path))?;

        let mut removals = Map::new();
        if let Some(Value::Object(children)) = snapshot {
            for (id, value) in children {
                if value.get("senderId").and_then(|v| v.as_str())
                    == Some(self.session.user_id.as_str())
                {
                    removals.insert(id, Value::Null);
                }
            }
        }
        let count = removals.len();
        if count > 0 {
            self.db
                .update(&path, removals)
                .await
                .with_context(|| format!("清空会话失败: {}", path))?;
        }
        self.timeline.discard_own_placeholders();
        info!("[Router] 清空会话 {}，删除 {} 条", conversation_id, count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::models::DeliveryState;
    use crate::im::message::timeline::DEFAULT_INITIAL_BATCH_LIMIT;
    use crate::im::realtime::memory::{MemoryConnection, MemoryServer};
    use crate::im::typing::DEFAULT_TYPING_DEBOUNCE;
    use serde_json::json;

    fn router_for(server: &MemoryServer, user: &str) -> (MemoryConnection, ConversationRouter) {
        let conn = server.connect(user);
        let router = ConversationRouter::new(
            Session::new(user, user, &format!("{}@example.com", user)),
            Arc::new(conn.clone()),
            DEFAULT_INITIAL_BATCH_LIMIT,
            DEFAULT_TYPING_DEBOUNCE,
        );
        (conn, router)
    }

    async fn next(router: &mut ConversationRouter) -> RouterEvent {
        tokio::time::timeout(Duration::from_secs(1), router.next_event())
            .await
            .expect("router event")
    }

    fn record(sender: &str, text: &str, at: i64) -> Value {
        json!({"type": "text", "text": text, "sender": sender, "senderId": sender, "timestamp": at})
    }

    #[tokio::test]
    async fn switching_back_and_forth_leaves_one_subscription_set() {
        let server = MemoryServer::new();
        let (_conn, mut router) = router_for(&server, "me");
        let a = ConversationId::between("me", "a");
        let writer = server.connect("writer");
        writer
            .write(&paths::message(&a, "m1"), record("a", "hi", 100))
            .await
            .unwrap();

        router.select_conversation("a").await.unwrap();
        router.select_conversation("b").await.unwrap();
        let messages = router.select_conversation("a").await.unwrap();

        assert_eq!(messages.len(), 1);
        let mut listeners = server.listener_paths();
        listeners.sort();
        let mut expected = vec![
            paths::messages(&a),
            paths::messages(&a),
            paths::typing(&a),
        ];
        expected.sort();
        assert_eq!(listeners, expected);

        writer
            .write(&paths::message(&a, "m2"), record("a", "again", 200))
            .await
            .unwrap();
        // 输入状态与消息两个订阅之间不保证先后
        let mut inserted = None;
        for _ in 0..2 {
            match next(&mut router).await {
                RouterEvent::TypingChanged { typing, .. } => assert!(!typing),
                RouterEvent::MessageInserted {
                    message, origin, ..
                } => inserted = Some((message.id, origin)),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(inserted, Some(("m2".to_string(), InsertOrigin::Remote)));
        let ids: Vec<_> = router.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn stale_events_are_discarded() {
        let server = MemoryServer::new();
        let (_conn, mut router) = router_for(&server, "me");
        router.select_conversation("a").await.unwrap();
        router.select_conversation("b").await.unwrap();

        let old = ConversationId::between("me", "a");
        let stale = Message::from_snapshot(&old, "late", record("a", "late", 5)).unwrap();
        assert!(router
            .apply_feed_event(&old, FeedEvent::Added(stale))
            .is_none());
        assert!(router.messages().is_empty());
    }

    #[tokio::test]
    async fn switching_clears_local_typing_flag() {
        let server = MemoryServer::new();
        let (_conn, mut router) = router_for(&server, "me");
        router.select_conversation("a").await.unwrap();
        router.notify_input().await.unwrap();
        let a = ConversationId::between("me", "a");
        assert_eq!(server.get(&paths::typing_flag(&a, "me")), Some(json!(true)));

        router.select_conversation("b").await.unwrap();
        assert_eq!(server.get(&paths::typing_flag(&a, "me")), None);
    }

    #[tokio::test]
    async fn own_send_reconciles_placeholder() {
        let server = MemoryServer::new();
        server.set_time(1_000);
        let (_conn, mut router) = router_for(&server, "me");
        router.select_conversation("you").await.unwrap();
        let content = MessageContent::Text("hello".into());
        let placeholder = router.stage_placeholder(content.clone()).unwrap();
        assert_eq!(router.messages()[0].state, DeliveryState::Sending);

        let id = router.publish(&placeholder, &content).await.unwrap();
        loop {
            if let RouterEvent::MessageInserted {
                message, origin, ..
            } = next(&mut router).await
            {
                assert_eq!(message.id, id);
                assert_eq!(message.created_at, Some(1_000));
                assert_eq!(
                    origin,
                    InsertOrigin::Own {
                        reconciled_temp_id: placeholder.client_temp_id.clone()
                    }
                );
                break;
            }
        }
        assert_eq!(router.messages().len(), 1);
        assert_eq!(router.messages()[0].state, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn failed_send_keeps_placeholder_marked_failed() {
        let server = MemoryServer::new();
        let (conn, mut router) = router_for(&server, "me");
        router.select_conversation("you").await.unwrap();
        conn.inject_write_failures(0);

        let content = MessageContent::Text("lost".into());
        let placeholder = router.stage_placeholder(content.clone()).unwrap();
        let err = router.publish(&placeholder, &content).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(router.messages().len(), 1);
        assert_eq!(router.messages()[0].state, DeliveryState::Failed);
    }

    #[tokio::test]
    async fn failed_initial_fetch_keeps_selection_without_feed() {
        let server = MemoryServer::new();
        let (conn, mut router) = router_for(&server, "me");
        conn.disconnect();
        let err = router.select_conversation("you").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(router.active_contact(), Some("you"));
        assert!(!router.is_live());
        assert_eq!(server.listener_count(), 0);

        conn.reconnect();
        router.select_conversation("you").await.unwrap();
        assert!(router.is_live());
    }

    #[tokio::test]
    async fn only_sender_may_delete_and_clear_keeps_others() {
        let server = MemoryServer::new();
        let (conn, mut router) = router_for(&server, "me");
        let cid = ConversationId::between("me", "you");
        conn.write(&paths::message(&cid, "mine"), record("me", "a", 1))
            .await
            .unwrap();
        conn.write(&paths::message(&cid, "mine2"), record("me", "b", 2))
            .await
            .unwrap();
        conn.write(&paths::message(&cid, "theirs"), record("you", "c", 3))
            .await
            .unwrap();

        router.select_conversation("you").await.unwrap();
        assert!(matches!(
            router.delete_message("theirs").await,
            Err(SyncError::NotMessageOwner)
        ));
        router.delete_message("mine").await.unwrap();
        assert_eq!(server.get(&paths::message(&cid, "mine")), None);

        assert_eq!(router.clear_chat().await.unwrap(), 1);
        assert!(server.get(&paths::message(&cid, "theirs")).is_some());
        assert_eq!(server.get(&paths::message(&cid, "mine2")), None);
    }

    #[tokio::test]
    async fn actions_without_conversation_are_rejected() {
        let server = MemoryServer::new();
        let (_conn, mut router) = router_for(&server, "me");
        assert!(matches!(
            router.notify_input().await,
            Err(SyncError::NoActiveConversation)
        ));
        assert!(matches!(
            router.stage_placeholder(MessageContent::Text("x".into())),
            Err(SyncError::NoActiveConversation)
        ));
    }
}
