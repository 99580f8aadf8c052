//! 全局消息监听
//!
//! 每个联系人一路变更订阅（同样的初始批次抑制规则），好友列表变化时增删订阅。
//! 与当前打开会话的订阅相互独立。

use crate::im::feed::{ChangeFeed, FeedEvent, LiveFeed};
use crate::im::friend::models::FriendRecord;
use crate::im::inbox::chat_list::ChatList;
use crate::im::message::models::Message;
use crate::im::types::ConversationId;
use futures_util::future::select_all;
use tracing::{debug, info, warn};

/// 收件箱事件
#[derive(Debug, Clone, PartialEq)]
pub enum InboxEvent {
    MessageArrived { contact_id: String, message: Message },
    MessageRemoved {
        contact_id: String,
        conversation_id: ConversationId,
        id: String,
    },
}

pub struct InboxWatcher {
    feed: ChangeFeed,
    feeds: Vec<(String, LiveFeed)>,
    chat_list: ChatList,
}

impl InboxWatcher {
    pub fn new(feed: ChangeFeed, self_id: &str, window: usize) -> Self {
        Self {
            feed,
            feeds: Vec::new(),
            chat_list: ChatList::new(self_id, window),
        }
    }

    pub fn chat_list(&self) -> &ChatList {
        &self.chat_list
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    /// 按最新好友列表增删订阅
    ///
    /// 单个联系人订阅失败只记录日志，下次同步时会重试。
    pub async fn sync_contacts(&mut self, contacts: &[FriendRecord]) {
        let (_, removed) = self.chat_list.sync_contacts(contacts);
        if !removed.is_empty() {
            self.feeds.retain(|(contact_id, _)| !removed.contains(contact_id));
            debug!("[Inbox] 移除联系人订阅: {:?}", removed);
        }

        for contact in contacts {
            if self.feeds.iter().any(|(id, _)| id == &contact.user_id) {
                continue;
            }
            let conversation_id = ConversationId::between(self.chat_list.self_id(), &contact.user_id);
            match self.feed.subscribe_initial_and_live(&conversation_id).await {
                Ok((batch, live)) => {
                    self.chat_list.apply_initial(&contact.user_id, batch);
                    self.feeds.push((contact.user_id.clone(), live));
                }
                Err(e) => warn!("[Inbox] 订阅联系人 {} 的消息失败: {:#}", contact.user_id, e),
            }
        }
        info!("[Inbox] 📬 已订阅 {} 个会话", self.feeds.len());
    }

    /// 等待任一联系人会话的下一条变化；没有订阅时一直挂起
    ///
    /// 可以在 `select!` 中安全取消。
    pub async fn next(&mut self) -> InboxEvent {
        loop {
            if self.feeds.is_empty() {
                return std::future::pending().await;
            }
            let (event, index, rest) =
                select_all(self.feeds.iter_mut().map(|(_, feed)| Box::pin(feed.next()))).await;
            drop(rest);

            let contact_id = self.feeds[index].0.clone();
            match event {
                Some(FeedEvent::Added(message)) => {
                    if self.chat_list.apply_added(&contact_id, message.clone()) {
                        return InboxEvent::MessageArrived {
                            contact_id,
                            message,
                        };
                    }
                }
                Some(FeedEvent::Removed { id }) => {
                    let conversation_id = self.feeds[index].1.conversation_id().clone();
                    if self.chat_list.apply_removed(&contact_id, &id) {
                        return InboxEvent::MessageRemoved {
                            contact_id,
                            conversation_id,
                            id,
                        };
                    }
                }
                None => {
                    warn!("[Inbox] 联系人 {} 的订阅已结束", contact_id);
                    self.feeds.remove(index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::realtime::db::RealtimeDb;
    use crate::im::realtime::memory::MemoryServer;
    use crate::im::types::paths;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn contact(uid: &str) -> FriendRecord {
        FriendRecord::new(uid, uid, &format!("{}@example.com", uid))
    }

    async fn next(inbox: &mut InboxWatcher) -> InboxEvent {
        tokio::time::timeout(Duration::from_secs(1), inbox.next())
            .await
            .expect("inbox event")
    }

    #[tokio::test]
    async fn messages_from_any_contact_reorder_chat_list() {
        let server = MemoryServer::new();
        let me = Arc::new(server.connect("me"));
        let writer = server.connect("writer");
        let with_a = ConversationId::between("me", "a");
        let with_b = ConversationId::between("me", "b");
        writer
            .write(
                &paths::message(&with_b, "b1"),
                json!({"type": "text", "text": "old", "senderId": "b", "timestamp": 100}),
            )
            .await
            .unwrap();

        let mut inbox = InboxWatcher::new(ChangeFeed::new(me.clone()), "me", 50);
        inbox.sync_contacts(&[contact("a"), contact("b")]).await;
        assert_eq!(inbox.feed_count(), 2);
        assert_eq!(inbox.chat_list().summaries()[0].contact_id, "b");

        writer
            .write(
                &paths::message(&with_a, "a1"),
                json!({"type": "text", "text": "new", "senderId": "a", "timestamp": 200}),
            )
            .await
            .unwrap();
        match next(&mut inbox).await {
            InboxEvent::MessageArrived {
                contact_id,
                message,
            } => {
                assert_eq!(contact_id, "a");
                assert_eq!(message.id, "a1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let summaries = inbox.chat_list().summaries();
        assert_eq!(summaries[0].contact_id, "a");
        assert_eq!(summaries[0].preview.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn removing_contact_detaches_its_feed() {
        let server = MemoryServer::new();
        let me = Arc::new(server.connect("me"));
        let mut inbox = InboxWatcher::new(ChangeFeed::new(me), "me", 50);
        inbox.sync_contacts(&[contact("a"), contact("b")]).await;
        assert_eq!(server.listener_count(), 4);

        inbox.sync_contacts(&[contact("b")]).await;
        assert_eq!(inbox.feed_count(), 1);
        assert_eq!(server.listener_count(), 2);
        assert!(!inbox.chat_list().contains("a"));
    }
}
