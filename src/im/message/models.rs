//! 消息模型定义

use crate::im::serialization::{deserialize_opt_timestamp, deserialize_string_or_null};
use crate::im::types::ConversationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
}

/// 消息内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    /// 图片引用：对象存储 URL 或内联 data URL
    Image { url: String },
}

impl MessageContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::Text(_) => MessageKind::Text,
            MessageContent::Image { .. } => MessageKind::Image,
        }
    }
}

/// 投递状态：服务端副本为 `Sent`，乐观占位消息为 `Sending` / `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Sending,
    Sent,
    Failed,
}

/// 会话中的一条消息
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// 后端追加时分配的 ID；占位消息使用客户端临时 ID
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub sender_name: String,
    pub content: MessageContent,
    /// 服务器时间戳（毫秒），尚未分配时为 `None`
    pub created_at: Option<i64>,
    pub client_temp_id: Option<String>,
    pub state: DeliveryState,
}

impl Message {
    pub fn from_record(conversation_id: ConversationId, id: String, record: MessageRecord) -> Self {
        let content = record.content();
        Self {
            id,
            conversation_id,
            sender_id: record.sender_id,
            sender_name: record.sender,
            content,
            created_at: record.timestamp,
            client_temp_id: record.client_temp_id,
            state: DeliveryState::Sent,
        }
    }

    /// 从数据库子节点快照解析
    pub fn from_snapshot(
        conversation_id: &ConversationId,
        key: &str,
        value: Value,
    ) -> Result<Self, serde_json::Error> {
        let record: MessageRecord = serde_json::from_value(value)?;
        Ok(Self::from_record(
            conversation_id.clone(),
            key.to_string(),
            record,
        ))
    }

    /// 构造乐观占位消息
    pub fn placeholder(
        conversation_id: ConversationId,
        sender_id: &str,
        sender_name: &str,
        content: MessageContent,
        client_temp_id: &str,
    ) -> Self {
        Self {
            id: client_temp_id.to_string(),
            conversation_id,
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            content,
            created_at: None,
            client_temp_id: Some(client_temp_id.to_string()),
            state: DeliveryState::Sending,
        }
    }

    /// 排序键：缺少服务器时间戳的消息视为 0（最旧）
    pub fn sort_key(&self) -> i64 {
        self.created_at.unwrap_or(0)
    }

    pub fn is_placeholder(&self) -> bool {
        self.state != DeliveryState::Sent
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}

/// 数据库中存储的消息记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub sender: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub sender_email: String,
    pub sender_id: String,
    /// 写入时由服务器时间戳占位符填充，见 [`MessageRecord::to_value`]
    #[serde(
        default,
        deserialize_with = "deserialize_opt_timestamp",
        skip_serializing
    )]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
}

impl MessageRecord {
    pub fn outgoing(
        sender_id: &str,
        sender_name: &str,
        sender_email: &str,
        content: &MessageContent,
        client_temp_id: Option<&str>,
    ) -> Self {
        let (text, image_url) = match content {
            MessageContent::Text(text) => (Some(text.clone()), None),
            MessageContent::Image { url } => (None, Some(url.clone())),
        };
        Self {
            kind: content.kind(),
            text,
            image_url,
            sender: sender_name.to_string(),
            sender_email: sender_email.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: None,
            client_temp_id: client_temp_id.map(|s| s.to_string()),
        }
    }

    /// 序列化为待写入的 JSON，`timestamp` 使用给定值（通常是服务器时间戳占位符）
    pub fn to_value(&self, timestamp: Value) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("timestamp".to_string(), timestamp);
        }
        Ok(value)
    }

    /// 旧数据可能只有 `imageUrl` 而没有 `type`
    pub fn content(&self) -> MessageContent {
        match (&self.kind, &self.image_url, &self.text) {
            (MessageKind::Image, url, _) => MessageContent::Image {
                url: url.clone().unwrap_or_default(),
            },
            (MessageKind::Text, Some(url), None) => MessageContent::Image { url: url.clone() },
            (MessageKind::Text, _, text) => MessageContent::Text(text.clone().unwrap_or_default()),
        }
    }
}
