//! 本地输入状态发布
//!
//! 输入时写入 `chatRooms/{cid}/typing/{uid} = true` 并注册断线删除钩子；
//! 停止输入超过防抖间隔、失焦、发送成功或切换会话时删除该标记。

use crate::im::realtime::db::RealtimeDb;
use crate::im::types::{paths, ConversationId};
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 停止输入后保持"正在输入"的时长
pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_millis(1500);

#[derive(Default)]
struct TypingState {
    conversation: Option<ConversationId>,
    typing: bool,
    /// 每次重置计时器递增，过期的计时器据此放弃清除
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    db: Arc<dyn RealtimeDb>,
    user_id: String,
    state: Mutex<TypingState>,
}

impl Shared {
    /// 删除已发布的输入标记；后端确认后才更新本地状态，失败时保留状态与计时器以便重试
    async fn clear_locked(&self, state: &mut TypingState) -> Result<()> {
        if let (true, Some(cid)) = (state.typing, state.conversation.clone()) {
            let path = paths::typing_flag(&cid, &self.user_id);
            self.db
                .remove(&path)
                .await
                .with_context(|| format!("清除输入状态失败: {}", path))?;
            self.db
                .cancel_on_disconnect(&path)
                .await
                .with_context(|| format!("取消断线钩子失败: {}", path))?;
            debug!("[Typing] 清除输入状态: {}", cid);
        }

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        state.typing = false;
        state.conversation = None;
        Ok(())
    }
}

#[derive(Clone)]
pub struct TypingCoordinator {
    shared: Arc<Shared>,
    debounce: Duration,
}

impl TypingCoordinator {
    pub fn new(db: Arc<dyn RealtimeDb>, user_id: &str, debounce: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                db,
                user_id: user_id.to_string(),
                state: Mutex::new(TypingState::default()),
            }),
            debounce,
        }
    }

    /// 输入活动：必要时发布 typing=true，并重置防抖计时器
    pub async fn on_input(&self, conversation_id: &ConversationId) -> Result<()> {
        let mut state = self.shared.state.lock().await;

        if state.typing && state.conversation.as_ref() != Some(conversation_id) {
            // 旧会话的标记未清除前不切换，下次输入时重试
            self.shared
                .clear_locked(&mut state)
                .await
                .context("清除旧会话输入状态失败")?;
        }

        let mut hook_result = Ok(());
        if !state.typing {
            let path = paths::typing_flag(conversation_id, &self.shared.user_id);
            self.shared
                .db
                .write(&path, Value::Bool(true))
                .await
                .with_context(|| format!("发布输入状态失败: {}", path))?;
            state.typing = true;
            state.conversation = Some(conversation_id.clone());
            debug!("[Typing] ⌨️ 开始输入: {}", conversation_id);
            hook_result = self
                .shared
                .db
                .on_disconnect_remove(&path)
                .await
                .with_context(|| format!("注册输入状态断线钩子失败: {}", path));
        }

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let shared = self.shared.clone();
        let debounce = self.debounce;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let mut state = shared.state.lock().await;
            if state.generation != generation {
                return;
            }
            // 计时器自身即将结束，不能被 clear_locked 中止
            state.timer = None;
            if let Err(e) = shared.clear_locked(&mut state).await {
                warn!("[Typing] 防抖到期清除输入状态失败: {:#}", e);
            }
        }));
        // 标记已发布且计时器已就绪，钩子注册失败仍会按时清除
        hook_result
    }

    /// 失焦、发送成功、切换会话或登出时立即清除
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.shared.clear_locked(&mut state).await
    }

    pub async fn is_typing(&self) -> bool {
        self.shared.state.lock().await.typing
    }

    pub async fn current_conversation(&self) -> Option<ConversationId> {
        self.shared.state.lock().await.conversation.clone()
    }
}
