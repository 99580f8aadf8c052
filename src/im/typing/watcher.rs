//! 对方输入状态订阅

use crate::im::realtime::db::{DataSnapshot, DbStream, RealtimeDb};
use crate::im::types::{paths, ConversationId};
use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

/// 订阅一个会话的全部输入标记，"除自己以外任一参与者 typing=true" 即视为对方正在输入
pub struct TypingWatcher {
    conversation_id: ConversationId,
    self_id: String,
    stream: DbStream<DataSnapshot>,
    last: Option<bool>,
}

impl TypingWatcher {
    pub async fn subscribe(
        db: &dyn RealtimeDb,
        conversation_id: &ConversationId,
        self_id: &str,
    ) -> Result<Self> {
        let stream = db
            .subscribe_value(&paths::typing(conversation_id))
            .await
            .with_context(|| format!("订阅输入状态失败: {}", conversation_id))?;
        Ok(Self {
            conversation_id: conversation_id.clone(),
            self_id: self_id.to_string(),
            stream,
            last: None,
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// 下一次状态变化（首次订阅总会投递当前状态）
    pub async fn next(&mut self) -> Option<bool> {
        loop {
            let snapshot = self.stream.next().await?;
            let typing = others_typing(snapshot.value.as_ref(), &self.self_id);
            if self.last != Some(typing) {
                self.last = Some(typing);
                debug!(
                    "[Typing] 会话 {} 对方输入状态: {}",
                    self.conversation_id, typing
                );
                return Some(typing);
            }
        }
    }
}

fn others_typing(value: Option<&Value>, self_id: &str) -> bool {
    match value {
        Some(Value::Object(flags)) => flags
            .iter()
            .any(|(uid, flag)| uid != self_id && flag.as_bool() == Some(true)),
        _ => false,
    }
}
