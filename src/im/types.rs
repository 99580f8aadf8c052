//! 公共类型：会话 ID、数据库路径、服务器时间戳占位符

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// 单聊会话 ID
///
/// 由两个参与者 ID 排序后以 `_` 拼接得到，双方计算出的 ID 一致。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// 根据两个参与者计算会话 ID（与参数顺序无关）
    pub fn between(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}_{}", first, second))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 当前登录用户的会话上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub username: String,
    pub email: String,
}

impl Session {
    pub fn new(user_id: &str, username: &str, email: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            email: email.to_string(),
        }
    }

    /// 与某个联系人的会话 ID
    pub fn conversation_with(&self, contact_id: &str) -> ConversationId {
        ConversationId::between(&self.user_id, contact_id)
    }
}

/// 实时数据库路径布局
pub mod paths {
    use super::ConversationId;

    pub const USERS: &str = "users";
    pub const FRIEND_REQUESTS: &str = "friendRequests";

    pub fn user(user_id: &str) -> String {
        format!("users/{}", user_id)
    }

    pub fn user_online(user_id: &str) -> String {
        format!("users/{}/online", user_id)
    }

    pub fn user_last_seen(user_id: &str) -> String {
        format!("users/{}/lastSeen", user_id)
    }

    pub fn push_subscription(user_id: &str) -> String {
        format!("users/{}/pushSubscription", user_id)
    }

    pub fn friends(user_id: &str) -> String {
        format!("friends/{}", user_id)
    }

    pub fn friend(owner_id: &str, friend_id: &str) -> String {
        format!("friends/{}/{}", owner_id, friend_id)
    }

    /// 收到的好友申请（按接收者分组）
    pub fn incoming_requests(recipient_id: &str) -> String {
        format!("friendRequests/{}", recipient_id)
    }

    pub fn friend_request(recipient_id: &str, sender_id: &str) -> String {
        format!("friendRequests/{}/{}", recipient_id, sender_id)
    }

    pub fn messages(conversation_id: &ConversationId) -> String {
        format!("chatRooms/{}/messages", conversation_id)
    }

    pub fn message(conversation_id: &ConversationId, message_id: &str) -> String {
        format!("chatRooms/{}/messages/{}", conversation_id, message_id)
    }

    pub fn typing(conversation_id: &ConversationId) -> String {
        format!("chatRooms/{}/typing", conversation_id)
    }

    pub fn typing_flag(conversation_id: &ConversationId, user_id: &str) -> String {
        format!("chatRooms/{}/typing/{}", conversation_id, user_id)
    }
}

/// 服务器时间戳占位符，写入时由后端替换为提交时刻的毫秒时间
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// 判断一个值是否为服务器时间戳占位符
pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .map(|o| o.len() == 1 && o.get(".sv").and_then(|v| v.as_str()) == Some("timestamp"))
        .unwrap_or(false)
}

/// 本地当前时间（毫秒）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
