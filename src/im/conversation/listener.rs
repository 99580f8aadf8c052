//! 会话监听器回调接口

use crate::im::message::models::Message;
use crate::im::presence::tracker::PresenceRecord;
use crate::im::types::ConversationId;
use async_trait::async_trait;

/// 当前打开会话的界面回调
#[async_trait]
pub trait ConversationListener: Send + Sync {
    /// 切换会话后的初始消息列表（已排序、已截断）
    async fn on_messages_reset(&self, conversation_id: ConversationId, messages: Vec<Message>);

    /// 新消息插入到 `index` 位置；`own` 为自己发送的消息回显
    async fn on_message_inserted(&self, message: Message, index: usize, own: bool);

    async fn on_message_removed(&self, conversation_id: ConversationId, message_id: String);

    /// 对方输入状态变更
    async fn on_typing_changed(&self, conversation_id: ConversationId, typing: bool);

    /// 消息发送失败，占位消息保留为失败状态
    async fn on_send_failed(&self, placeholder: Message, error: String);

    /// 当前会话联系人的在线状态变更
    async fn on_contact_presence_changed(&self, contact_id: String, presence: PresenceRecord);
}

/// 空实现（默认监听器）
pub struct EmptyConversationListener;

#[async_trait]
impl ConversationListener for EmptyConversationListener {
    async fn on_messages_reset(&self, _conversation_id: ConversationId, _messages: Vec<Message>) {}
    async fn on_message_inserted(&self, _message: Message, _index: usize, _own: bool) {}
    async fn on_message_removed(&self, _conversation_id: ConversationId, _message_id: String) {}
    async fn on_typing_changed(&self, _conversation_id: ConversationId, _typing: bool) {}
    async fn on_send_failed(&self, _placeholder: Message, _error: String) {}
    async fn on_contact_presence_changed(&self, _contact_id: String, _presence: PresenceRecord) {}
}
