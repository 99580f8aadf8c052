//! 账号资料：用户名、个人资料查询、推送订阅描述
//!
//! 身份认证本身由外部服务完成，这里只维护 `users/{uid}` 下的资料。

use crate::im::error::{Result, SyncError};
use crate::im::realtime::db::RealtimeDb;
use crate::im::serialization::{deserialize_opt_timestamp, deserialize_string_or_null};
use crate::im::types::{paths, Session};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

const USERNAME_MIN_LEN: usize = 3;
const USERNAME_MAX_LEN: usize = 20;

/// `users/{uid}` 下的用户资料
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub user_id: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub username: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub email: String,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub online: bool,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub last_seen: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_subscription: Option<Value>,
}

impl UserProfile {
    /// 解析资料；旧数据缺少 `userId` 时使用节点 key
    pub fn from_value(user_id: &str, value: Value) -> Result<Self> {
        let mut profile: UserProfile = serde_json::from_value(value)?;
        if profile.user_id.is_empty() {
            profile.user_id = user_id.to_string();
        }
        Ok(profile)
    }

    pub fn has_username(&self) -> bool {
        !self.username.is_empty()
    }
}

/// 规范化用户名：去除首尾空白并转为小写
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// 用户名只允许小写字母、数字与下划线，长度 3 到 20
pub fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if (USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) && valid_chars {
        Ok(())
    } else {
        Err(SyncError::InvalidUsername(username.to_string()))
    }
}

pub struct AccountService {
    db: Arc<dyn RealtimeDb>,
    session: Session,
}

impl AccountService {
    pub fn new(db: Arc<dyn RealtimeDb>, session: Session) -> Self {
        Self { db, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// 读取任意用户资料
    pub async fn load_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let value = self
            .db
            .read(&paths::user(user_id))
            .await
            .with_context(|| format!("读取用户资料失败: {}", user_id))?;
        value
            .map(|v| UserProfile::from_value(user_id, v))
            .transpose()
    }

    /// 按用户名查找（用户名会先规范化）
    pub async fn find_by_username(&self, username: &str) -> Result<Option<UserProfile>> {
        let username = normalize_username(username);
        if username.is_empty() {
            return Ok(None);
        }
        let hits = self
            .db
            .query_equal_to(paths::USERS, "username", &Value::String(username.clone()))
            .await
            .with_context(|| format!("查询用户名失败: {}", username))?;
        match hits.into_iter().next() {
            Some((user_id, value)) => Ok(Some(UserProfile::from_value(&user_id, value)?)),
            None => Ok(None),
        }
    }

    /// 为当前用户设置用户名，并合并写入 email、userId、createdAt
    pub async fn claim_username(&mut self, raw: &str) -> Result<UserProfile> {
        let username = normalize_username(raw);
        validate_username(&username)?;

        if let Some(owner) = self.find_by_username(&username).await? {
            if owner.user_id != self.session.user_id {
                return Err(SyncError::UsernameTaken(username));
            }
        }

        let existing = self.load_profile(&self.session.user_id).await?;
        let mut fields = Map::new();
        fields.insert("username".to_string(), json!(username));
        fields.insert("email".to_string(), json!(self.session.email));
        fields.insert("userId".to_string(), json!(self.session.user_id));
        if existing.and_then(|p| p.created_at).is_none() {
            fields.insert("createdAt".to_string(), self.db.server_timestamp());
        }
        self.db
            .update(&paths::user(&self.session.user_id), fields)
            .await
            .context("保存用户名失败")?;

        self.session.username = username.clone();
        info!("[Account] ✅ 用户名已设置: {} -> @{}", self.session.user_id, username);
        self.load_profile(&self.session.user_id)
            .await?
            .ok_or_else(|| SyncError::UserNotFound(self.session.user_id.clone()))
    }

    /// 保存推送订阅描述（由外部推送服务生成，原样存储）
    pub async fn save_push_subscription(&self, subscription: Value) -> Result<()> {
        self.db
            .write(&paths::push_subscription(&self.session.user_id), subscription)
            .await
            .context("保存推送订阅失败")?;
        debug!("[Account] 推送订阅已保存: {}", self.session.user_id);
        Ok(())
    }

    pub async fn remove_push_subscription(&self) -> Result<()> {
        self.db
            .remove(&paths::push_subscription(&self.session.user_id))
            .await
            .context("移除推送订阅失败")?;
        Ok(())
    }
}
