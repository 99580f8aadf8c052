//! 会话列表
//!
//! 每个联系人一项，按最新消息时间倒序；没有消息的联系人时间记为 0，排在最后。
//! 每项只保留最近若干条消息，最新一条被删除时回退到前一条作为预览。

use crate::im::friend::models::FriendRecord;
use crate::im::message::models::{Message, MessageContent};
use crate::im::presence::format::format_chat_time;
use crate::im::types::ConversationId;
use std::collections::HashSet;

/// 每个会话在列表中保留的最近消息条数
pub const CHAT_PREVIEW_WINDOW: usize = 20;

/// 最新消息预览文案
pub fn preview_text(message: &Message, self_id: &str) -> String {
    let own = message.is_from(self_id);
    match (&message.content, own) {
        (MessageContent::Image { .. }, true) => "You sent an image".to_string(),
        (MessageContent::Image { .. }, false) => "Sent an image".to_string(),
        (MessageContent::Text(text), true) => format!("You: {}", text),
        (MessageContent::Text(text), false) => text.clone(),
    }
}

/// 通知规则：对方发来的、且不属于当前打开会话的消息
pub fn should_notify(message: &Message, self_id: &str, active: Option<&ConversationId>) -> bool {
    !message.is_from(self_id) && active != Some(&message.conversation_id)
}

/// 会话列表中的一项（展示用快照）
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSummary {
    pub contact_id: String,
    pub username: String,
    pub conversation_id: ConversationId,
    pub preview: Option<String>,
    pub last_message_at: Option<i64>,
}

impl ChatSummary {
    /// 时间标签；没有消息时为空串
    pub fn time_label(&self, now: i64) -> String {
        self.last_message_at
            .map(|at| format_chat_time(at, now))
            .unwrap_or_default()
    }
}

/// 按时间升序的最近消息窗口，超出容量时丢弃最旧的一条
struct RecentMessages {
    messages: Vec<Message>,
    capacity: usize,
}

impl RecentMessages {
    fn new(capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    fn replace(&mut self, batch: Vec<Message>) {
        let mut seen = HashSet::new();
        let mut sorted: Vec<Message> = batch
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        sorted.sort_by_key(|m| m.sort_key());
        let excess = sorted.len().saturating_sub(self.capacity);
        sorted.drain(..excess);
        self.messages = sorted;
    }

    /// 返回消息是否进入窗口；重复或早于已满窗口的消息忽略
    fn insert(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let key = message.sort_key();
        let index = self.messages.partition_point(|m| m.sort_key() <= key);
        if index == 0 && self.messages.len() >= self.capacity {
            return false;
        }
        self.messages.insert(index, message);
        if self.messages.len() > self.capacity {
            self.messages.remove(0);
        }
        true
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.messages.iter().position(|m| m.id == id) {
            Some(index) => {
                self.messages.remove(index);
                true
            }
            None => false,
        }
    }

    fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

struct ChatEntry {
    contact: FriendRecord,
    conversation_id: ConversationId,
    recent: RecentMessages,
}

impl ChatEntry {
    fn last_message(&self) -> Option<&Message> {
        self.recent.last()
    }

    fn last_time(&self) -> i64 {
        self.last_message().map(|m| m.sort_key()).unwrap_or(0)
    }
}

pub struct ChatList {
    self_id: String,
    window: usize,
    entries: Vec<ChatEntry>,
}

impl ChatList {
    /// `window`: 每个会话保留的最近消息条数
    pub fn new(self_id: &str, window: usize) -> Self {
        Self {
            self_id: self_id.to_string(),
            window,
            entries: Vec::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, contact_id: &str) -> bool {
        self.position(contact_id).is_some()
    }

    fn position(&self, contact_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.contact.user_id == contact_id)
    }

    /// 按好友列表增删条目，返回 (新增的联系人, 移除的联系人)
    pub fn sync_contacts(&mut self, contacts: &[FriendRecord]) -> (Vec<String>, Vec<String>) {
        let removed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !contacts.iter().any(|c| c.user_id == e.contact.user_id))
            .map(|e| e.contact.user_id.clone())
            .collect();
        self.entries
            .retain(|e| !removed.contains(&e.contact.user_id));

        let mut added = Vec::new();
        for contact in contacts {
            match self.position(&contact.user_id) {
                Some(index) => self.entries[index].contact = contact.clone(),
                None => {
                    self.entries.push(ChatEntry {
                        contact: contact.clone(),
                        conversation_id: ConversationId::between(&self.self_id, &contact.user_id),
                        recent: RecentMessages::new(self.window),
                    });
                    added.push(contact.user_id.clone());
                }
            }
        }
        self.sort();
        (added, removed)
    }

    pub fn apply_initial(&mut self, contact_id: &str, batch: Vec<Message>) {
        if let Some(index) = self.position(contact_id) {
            self.entries[index].recent.replace(batch);
            self.sort();
        }
    }

    /// 应用一条实时消息，返回是否为新消息
    pub fn apply_added(&mut self, contact_id: &str, message: Message) -> bool {
        let Some(index) = self.position(contact_id) else {
            return false;
        };
        let changed = self.entries[index].recent.insert(message);
        if changed {
            self.sort();
        }
        changed
    }

    pub fn apply_removed(&mut self, contact_id: &str, message_id: &str) -> bool {
        let Some(index) = self.position(contact_id) else {
            return false;
        };
        let changed = self.entries[index].recent.remove(message_id);
        if changed {
            self.sort();
        }
        changed
    }

    fn sort(&mut self) {
        // 稳定排序：时间相同时保持原有先后
        self.entries.sort_by_key(|e| std::cmp::Reverse(e.last_time()));
    }

    pub fn summaries(&self) -> Vec<ChatSummary> {
        self.entries
            .iter()
            .map(|e| ChatSummary {
                contact_id: e.contact.user_id.clone(),
                username: e.contact.username.clone(),
                conversation_id: e.conversation_id.clone(),
                preview: e.last_message().map(|m| preview_text(m, &self.self_id)),
                last_message_at: e.last_message().and_then(|m| m.created_at),
            })
            .collect()
    }
}
