//! 收件箱监听器回调接口

use crate::im::inbox::chat_list::ChatSummary;
use crate::im::types::ConversationId;
use async_trait::async_trait;

/// 新消息通知内容
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub contact_id: String,
    pub conversation_id: ConversationId,
    pub sender_name: String,
    pub preview: String,
}

#[async_trait]
pub trait InboxListener: Send + Sync {
    /// 会话列表（已按最新消息时间倒序）
    async fn on_chat_list_changed(&self, chats: Vec<ChatSummary>);

    /// 非当前会话收到对方的新消息
    async fn on_notification(&self, notification: Notification);
}

/// 空实现（默认监听器）
pub struct EmptyInboxListener;

#[async_trait]
impl InboxListener for EmptyInboxListener {
    async fn on_chat_list_changed(&self, _chats: Vec<ChatSummary>) {}
    async fn on_notification(&self, _notification: Notification) {}
}
