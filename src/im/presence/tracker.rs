//! 在线状态发布与订阅
//!
//! 每次连接建立时写入 online=true，并向后端注册断线钩子（online=false、
//! lastSeen=服务器时间），这样即使进程崩溃或断网，在线状态也能正确降级。
//! 后端在执行断线钩子后会丢弃它们，所以重连后必须重新注册。

use crate::im::presence::format::format_last_seen;
use crate::im::realtime::db::{DataSnapshot, DbStream, RealtimeDb};
use crate::im::serialization::deserialize_opt_timestamp;
use crate::im::types::paths;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 用户在线状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    #[serde(default)]
    pub online: bool,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub last_seen: Option<i64>,
}

impl PresenceRecord {
    pub fn from_profile(value: Option<&Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// 展示文案："Online" 或相对的最后在线时间
    pub fn status_text(&self, now: i64) -> String {
        if self.online {
            "Online".to_string()
        } else {
            format_last_seen(self.last_seen, now)
        }
    }
}

/// 当前用户的在线状态发布者
pub struct PresenceTracker {
    db: Arc<dyn RealtimeDb>,
    user_id: String,
    task: Option<JoinHandle<()>>,
}

impl PresenceTracker {
    pub fn new(db: Arc<dyn RealtimeDb>, user_id: &str) -> Self {
        Self {
            db,
            user_id: user_id.to_string(),
            task: None,
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.task.is_some()
    }

    /// 开始发布自己的在线状态
    ///
    /// 当前已连接时立即上线（失败返回错误），之后每次重连都会重新上线并重新注册断线钩子。
    pub async fn publish_own_presence(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let mut connectivity = self.db.connectivity();
        let connected = *connectivity.borrow_and_update();
        if connected {
            announce_online(self.db.as_ref(), &self.user_id).await?;
        }

        let db = self.db.clone();
        let user_id = self.user_id.clone();
        self.task = Some(tokio::spawn(async move {
            while connectivity.changed().await.is_ok() {
                let connected = *connectivity.borrow_and_update();
                if !connected {
                    debug!("[Presence] 连接断开，等待重连: {}", user_id);
                    continue;
                }
                if let Err(e) = announce_online(db.as_ref(), &user_id).await {
                    warn!("[Presence] 重连后上线失败: {:#}", e);
                }
            }
        }));
        Ok(())
    }

    /// 主动下线（登出）：写入 online=false 与 lastSeen，并取消断线钩子
    pub async fn go_offline(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut fields = Map::new();
        fields.insert("online".to_string(), Value::Bool(false));
        fields.insert("lastSeen".to_string(), self.db.server_timestamp());
        self.db
            .update(&paths::user(&self.user_id), fields)
            .await
            .context("写入离线状态失败")?;
        self.db
            .cancel_on_disconnect(&paths::user_online(&self.user_id))
            .await?;
        self.db
            .cancel_on_disconnect(&paths::user_last_seen(&self.user_id))
            .await?;
        info!("[Presence] 👋 已下线: {}", self.user_id);
        Ok(())
    }

    /// 订阅任意用户的在线状态
    pub async fn subscribe_presence(&self, user_id: &str) -> Result<PresenceStream> {
        let stream = self
            .db
            .subscribe_value(&paths::user(user_id))
            .await
            .with_context(|| format!("订阅在线状态失败: {}", user_id))?;
        Ok(PresenceStream {
            user_id: user_id.to_string(),
            stream,
            last: None,
        })
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn announce_online(db: &dyn RealtimeDb, user_id: &str) -> Result<()> {
    db.on_disconnect_set(&paths::user_online(user_id), Value::Bool(false))
        .await
        .context("注册断线钩子失败")?;
    db.on_disconnect_set(&paths::user_last_seen(user_id), db.server_timestamp())
        .await
        .context("注册断线钩子失败")?;

    let mut fields = Map::new();
    fields.insert("online".to_string(), Value::Bool(true));
    fields.insert("lastSeen".to_string(), db.server_timestamp());
    db.update(&paths::user(user_id), fields)
        .await
        .context("写入在线状态失败")?;
    info!("[Presence] 🟢 已上线: {}", user_id);
    Ok(())
}

/// 某个用户在线状态的变化流（相同状态不重复投递）
pub struct PresenceStream {
    user_id: String,
    stream: DbStream<DataSnapshot>,
    last: Option<PresenceRecord>,
}

impl PresenceStream {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn next(&mut self) -> Option<PresenceRecord> {
        loop {
            let snapshot = self.stream.next().await?;
            let record = PresenceRecord::from_profile(snapshot.value.as_ref());
            if self.last.as_ref() != Some(&record) {
                self.last = Some(record.clone());
                return Some(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::realtime::memory::MemoryServer;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn presence_degrades_on_crash_and_recovers_on_reconnect() {
        let server = MemoryServer::new();
        server.set_time(1_000);
        let conn = server.connect("alice");
        let mut tracker = PresenceTracker::new(Arc::new(conn.clone()), "alice");
        tracker.publish_own_presence().await.unwrap();
        assert_eq!(server.get("users/alice/online"), Some(json!(true)));

        server.set_time(5_000);
        conn.disconnect();
        assert_eq!(
            server.get("users/alice"),
            Some(json!({"online": false, "lastSeen": 5_000}))
        );

        conn.reconnect();
        let observer = server.clone();
        wait_until(move || observer.get("users/alice/online") == Some(json!(true))).await;
        let hooks = conn.disconnect_hook_paths();
        assert!(hooks.contains(&"users/alice/online".to_string()));
        assert!(hooks.contains(&"users/alice/lastSeen".to_string()));
    }

    #[tokio::test]
    async fn go_offline_cancels_hooks() {
        let server = MemoryServer::new();
        server.set_time(2_000);
        let conn = server.connect("alice");
        let mut tracker = PresenceTracker::new(Arc::new(conn.clone()), "alice");
        tracker.publish_own_presence().await.unwrap();
        tracker.go_offline().await.unwrap();
        assert!(!tracker.is_publishing());
        assert!(conn.disconnect_hook_paths().is_empty());
        assert_eq!(server.get("users/alice/online"), Some(json!(false)));
        assert_eq!(server.get("users/alice/lastSeen"), Some(json!(2_000)));
    }

    #[tokio::test]
    async fn subscribers_see_status_changes_once() {
        let server = MemoryServer::new();
        server.set_time(10_000);
        let alice = server.connect("alice");
        let bob = Arc::new(server.connect("bob"));
        let watcher = PresenceTracker::new(bob, "bob");
        let mut stream = watcher.subscribe_presence("alice").await.unwrap();
        assert_eq!(stream.next().await, Some(PresenceRecord::default()));

        let mut tracker = PresenceTracker::new(Arc::new(alice.clone()), "alice");
        tracker.publish_own_presence().await.unwrap();
        let online = stream.next().await.unwrap();
        assert!(online.online);
        assert_eq!(online.status_text(10_000), "Online");

        alice
            .update("users/alice", {
                let mut m = Map::new();
                m.insert("username".into(), json!("alice"));
                m
            })
            .await
            .unwrap();
        server.set_time(10_000 + 120_000);
        alice.disconnect();
        let offline = stream.next().await.unwrap();
        assert!(!offline.online);
        // 断线钩子按注册顺序执行：先 online，再 lastSeen
        let settled = stream.next().await.unwrap();
        assert_eq!(settled.last_seen, Some(130_000));
        assert_eq!(settled.status_text(190_000), "Last seen 1m ago");
    }
}
