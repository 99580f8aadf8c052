//! 消息时间线（去重与排序）
//!
//! 为当前打开的会话维护按 `created_at` 升序、按 ID 去重的消息序列。
//! 相同时间戳按追加顺序排列：初始批次保持后端返回顺序（稳定排序），
//! 实时新增插入到所有不晚于它的消息之后。

use crate::im::message::models::{DeliveryState, Message};
use crate::im::types::ConversationId;
use std::collections::HashSet;
use tracing::{debug, info};

/// 初始批次默认保留的最近消息条数
pub const DEFAULT_INITIAL_BATCH_LIMIT: usize = 50;

/// 新增消息的来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOrigin {
    /// 自己发送的消息回显；若替换了本地占位消息则带上其临时 ID
    Own { reconciled_temp_id: Option<String> },
    /// 对方发来的新消息（触发通知类副作用）
    Remote,
}

/// 一次变更的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineChange {
    Inserted {
        message: Message,
        index: usize,
        origin: InsertOrigin,
    },
    Removed {
        id: String,
        index: usize,
    },
    Unchanged,
}

pub struct MessageTimeline {
    self_id: String,
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    ids: HashSet<String>,
    limit: usize,
}

impl MessageTimeline {
    pub fn new(self_id: &str, limit: usize) -> Self {
        Self {
            self_id: self_id.to_string(),
            conversation_id: None,
            messages: Vec::new(),
            ids: HashSet::new(),
            limit,
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// 切换会话：清空全部状态（包括占位消息），防止旧会话数据串入
    pub fn reset(&mut self, conversation_id: Option<ConversationId>) {
        debug!(
            "[Timeline] 重置时间线: {:?} -> {:?}",
            self.conversation_id, conversation_id
        );
        self.conversation_id = conversation_id;
        self.messages.clear();
        self.ids.clear();
    }

    /// 应用初始批次：按时间升序排序，只保留最近 `limit` 条
    ///
    /// 截断只是展示策略，不代表删除。已有的本地占位消息会被保留。
    pub fn apply_initial_batch(&mut self, batch: Vec<Message>) -> &[Message] {
        let total = batch.len();
        let placeholders: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|m| m.is_placeholder())
            .collect();

        let mut seen = HashSet::new();
        let mut sorted: Vec<Message> = batch
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        sorted.sort_by_key(|m| m.sort_key());
        if sorted.len() > self.limit {
            sorted.drain(..sorted.len() - self.limit);
        }

        self.messages = sorted;
        for placeholder in placeholders {
            self.insert_sorted(placeholder);
        }
        self.ids = self.messages.iter().map(|m| m.id.clone()).collect();

        info!(
            "[Timeline] 初始批次: 收到 {} 条，展示 {} 条",
            total,
            self.messages.len()
        );
        &self.messages
    }

    /// 应用实时新增；ID 已存在时为幂等空操作
    pub fn apply_added(&mut self, message: Message) -> TimelineChange {
        if self.ids.contains(&message.id) {
            debug!("[Timeline] 重复消息，忽略: {}", message.id);
            return TimelineChange::Unchanged;
        }

        let origin = if message.is_from(&self.self_id) {
            let reconciled_temp_id = message
                .client_temp_id
                .as_deref()
                .and_then(|temp_id| self.take_placeholder(temp_id));
            InsertOrigin::Own { reconciled_temp_id }
        } else {
            InsertOrigin::Remote
        };

        let index = self.insert_sorted(message.clone());
        self.ids.insert(message.id.clone());
        TimelineChange::Inserted {
            message,
            index,
            origin,
        }
    }

    /// 应用实时删除；ID 不存在时为空操作
    pub fn apply_removed(&mut self, id: &str) -> TimelineChange {
        if !self.ids.remove(id) {
            debug!("[Timeline] 删除未知消息，忽略: {}", id);
            return TimelineChange::Unchanged;
        }
        match self.messages.iter().position(|m| m.id == id) {
            Some(index) => {
                self.messages.remove(index);
                TimelineChange::Removed {
                    id: id.to_string(),
                    index,
                }
            }
            None => TimelineChange::Unchanged,
        }
    }

    /// 添加乐观占位消息
    pub fn add_placeholder(&mut self, placeholder: Message) -> usize {
        self.ids.insert(placeholder.id.clone());
        self.insert_sorted(placeholder)
    }

    /// 将占位消息标记为发送失败（保留在列表中）
    pub fn mark_placeholder_failed(&mut self, temp_id: &str) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|m| m.is_placeholder() && m.client_temp_id.as_deref() == Some(temp_id))
        {
            Some(message) => {
                message.state = DeliveryState::Failed;
                true
            }
            None => false,
        }
    }

    /// 移除本地占位消息（例如用户放弃重试）
    pub fn discard_placeholder(&mut self, temp_id: &str) -> bool {
        self.take_placeholder(temp_id).is_some()
    }

    /// 移除自己发送的所有占位消息
    pub fn discard_own_placeholders(&mut self) -> usize {
        let before = self.messages.len();
        let self_id = self.self_id.clone();
        self.messages
            .retain(|m| !(m.is_placeholder() && m.is_from(&self_id)));
        self.ids = self.messages.iter().map(|m| m.id.clone()).collect();
        before - self.messages.len()
    }

    fn take_placeholder(&mut self, temp_id: &str) -> Option<String> {
        let index = self
            .messages
            .iter()
            .position(|m| m.is_placeholder() && m.client_temp_id.as_deref() == Some(temp_id))?;
        let removed = self.messages.remove(index);
        self.ids.remove(&removed.id);
        debug!("[Timeline] 占位消息已被服务端副本替换: {}", temp_id);
        Some(temp_id.to_string())
    }

    fn insert_sorted(&mut self, message: Message) -> usize {
        let key = message.sort_key();
        let index = self.messages.partition_point(|m| m.sort_key() <= key);
        self.messages.insert(index, message);
        index
    }
}
