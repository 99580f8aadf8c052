//! 好友与好友申请记录

use crate::im::serialization::{deserialize_opt_timestamp, deserialize_string_or_null};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `friends/{owner}/{friend}` 下的好友记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRecord {
    pub user_id: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub username: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub email: String,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp", skip_serializing)]
    pub added_at: Option<i64>,
}

impl FriendRecord {
    pub fn new(user_id: &str, username: &str, email: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            email: email.to_string(),
            added_at: None,
        }
    }

    pub fn to_value(&self, added_at: Value) -> Result<Value, serde_json::Error> {
        with_field(serde_json::to_value(self)?, "addedAt", added_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    #[default]
    Pending,
}

/// `friendRequests/{recipient}/{sender}` 下的好友申请
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestRecord {
    pub from: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub from_username: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub from_email: String,
    pub to: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub to_username: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub to_email: String,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp", skip_serializing)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub status: RequestStatus,
}

impl FriendRequestRecord {
    pub fn to_value(&self, timestamp: Value) -> Result<Value, serde_json::Error> {
        with_field(serde_json::to_value(self)?, "timestamp", timestamp)
    }
}

fn with_field(mut value: Value, field: &str, field_value: Value) -> Result<Value, serde_json::Error> {
    if let Value::Object(map) = &mut value {
        map.insert(field.to_string(), field_value);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::types::server_timestamp;
    use serde_json::json;

    #[test]
    fn request_record_uses_stored_field_names() {
        let request = FriendRequestRecord {
            from: "u1".into(),
            from_username: "alice".into(),
            from_email: "a@example.com".into(),
            to: "u2".into(),
            to_username: "bob".into(),
            to_email: "b@example.com".into(),
            timestamp: None,
            status: RequestStatus::Pending,
        };
        let value = request.to_value(server_timestamp()).unwrap();
        assert_eq!(value["fromUsername"], json!("alice"));
        assert_eq!(value["toEmail"], json!("b@example.com"));
        assert_eq!(value["status"], json!("pending"));
        assert_eq!(value["timestamp"], server_timestamp());

        let parsed: FriendRequestRecord =
            serde_json::from_value(json!({"from": "u1", "to": "u2", "timestamp": 5})).unwrap();
        assert_eq!(parsed.timestamp, Some(5));
        assert_eq!(parsed.status, RequestStatus::Pending);
    }

    #[test]
    fn friend_record_added_at_is_written_separately() {
        let record = FriendRecord::new("u2", "bob", "b@example.com");
        let value = record.to_value(json!(10)).unwrap();
        assert_eq!(
            value,
            json!({"userId": "u2", "username": "bob", "email": "b@example.com", "addedAt": 10})
        );
    }
}
