//! 会话消息变更订阅
//!
//! 后端只提供"子节点新增 / 删除"两类订阅，且新增订阅会回放已有子节点。
//! 适配器先订阅、再拉取初始批次，并记录初始批次中的全部 ID：
//! 实时流中第一次出现的同 ID 新增事件被丢弃，ID 随即移出抑制集合，
//! 因此删除后再次新增的同 ID 消息会正常投递。

use crate::im::message::models::Message;
use crate::im::realtime::db::{ChildSnapshot, DbStream, RealtimeDb};
use crate::im::types::{paths, ConversationId};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 实时事件
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Added(Message),
    Removed { id: String },
}

/// 会话变更订阅工厂
#[derive(Clone)]
pub struct ChangeFeed {
    db: Arc<dyn RealtimeDb>,
}

impl ChangeFeed {
    pub fn new(db: Arc<dyn RealtimeDb>) -> Self {
        Self { db }
    }

    /// 拉取初始批次并建立实时订阅
    ///
    /// 返回的批次按后端 key 顺序排列，尚未排序截断。拉取失败时已建立的订阅随之释放。
    pub async fn subscribe_initial_and_live(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(Vec<Message>, LiveFeed)> {
        let path = paths::messages(conversation_id);
        let added = self
            .db
            .subscribe_child_added(&path)
            .await
            .with_context(|| format!("订阅消息新增失败: {}", path))?;
        let removed = self
            .db
            .subscribe_child_removed(&path)
            .await
            .with_context(|| format!("订阅消息删除失败: {}", path))?;
        let snapshot = self
            .db
            .read(&path)
            .await
            .with_context(|| format!("拉取初始消息失败: {}", path))?;

        let mut suppressed = HashSet::new();
        let mut batch = Vec::new();
        if let Some(Value::Object(children)) = snapshot {
            for (key, value) in children {
                suppressed.insert(key.clone());
                match Message::from_snapshot(conversation_id, &key, value) {
                    Ok(message) => batch.push(message),
                    Err(e) => warn!("[Feed] 跳过无法解析的消息 {}: {}", key, e),
                }
            }
        }

        info!(
            "[Feed] 📥 会话 {} 初始批次 {} 条，已建立实时订阅",
            conversation_id,
            batch.len()
        );

        Ok((
            batch,
            LiveFeed {
                conversation_id: conversation_id.clone(),
                added,
                removed,
                pending_added: VecDeque::new(),
                pending_removed: VecDeque::new(),
                added_open: true,
                removed_open: true,
                suppressed,
            },
        ))
    }
}

/// 单个会话的实时事件流
///
/// drop 即退订。`next()` 可以安全地在 `select!` 中被取消。
pub struct LiveFeed {
    conversation_id: ConversationId,
    added: DbStream<ChildSnapshot>,
    removed: DbStream<ChildSnapshot>,
    pending_added: VecDeque<ChildSnapshot>,
    pending_removed: VecDeque<ChildSnapshot>,
    added_open: bool,
    removed_open: bool,
    suppressed: HashSet<String>,
}

enum Raw {
    Added(ChildSnapshot),
    Removed(ChildSnapshot),
}

impl LiveFeed {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// 仍在等待首次实时回显的初始批次 ID 数量
    pub fn suppressed_len(&self) -> usize {
        self.suppressed.len()
    }

    /// 等待下一条事件；两个订阅都结束后返回 `None`
    pub async fn next(&mut self) -> Option<FeedEvent> {
        loop {
            self.drain_ready();
            while let Some(raw) = self.pop_in_order() {
                if let Some(event) = self.accept(raw) {
                    return Some(event);
                }
            }

            tokio::select! {
                snapshot = self.added.next(), if self.added_open => match snapshot {
                    Some(s) => self.pending_added.push_back(s),
                    None => self.added_open = false,
                },
                snapshot = self.removed.next(), if self.removed_open => match snapshot {
                    Some(s) => self.pending_removed.push_back(s),
                    None => self.removed_open = false,
                },
                else => return None,
            }
        }
    }

    fn drain_ready(&mut self) {
        while let Some(s) = self.added.try_next() {
            self.pending_added.push_back(s);
        }
        while let Some(s) = self.removed.try_next() {
            self.pending_removed.push_back(s);
        }
    }

    /// 按后端事件序号合并两个订阅，恢复投递顺序
    fn pop_in_order(&mut self) -> Option<Raw> {
        let take_added = match (self.pending_added.front(), self.pending_removed.front()) {
            (Some(a), Some(r)) => a.seq < r.seq,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };
        if take_added {
            self.pending_added.pop_front().map(Raw::Added)
        } else {
            self.pending_removed.pop_front().map(Raw::Removed)
        }
    }

    fn accept(&mut self, raw: Raw) -> Option<FeedEvent> {
        match raw {
            Raw::Added(snapshot) => {
                if self.suppressed.remove(&snapshot.key) {
                    debug!("[Feed] 抑制初始批次回显: {}", snapshot.key);
                    return None;
                }
                match Message::from_snapshot(&self.conversation_id, &snapshot.key, snapshot.value)
                {
                    Ok(message) => Some(FeedEvent::Added(message)),
                    Err(e) => {
                        warn!("[Feed] 跳过无法解析的实时消息 {}: {}", snapshot.key, e);
                        None
                    }
                }
            }
            Raw::Removed(snapshot) => {
                self.suppressed.remove(&snapshot.key);
                Some(FeedEvent::Removed { id: snapshot.key })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::timeline::{MessageTimeline, DEFAULT_INITIAL_BATCH_LIMIT};
    use crate::im::realtime::memory::{MemoryConnection, MemoryServer};
    use futures_util::FutureExt;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn record(sender: &str, text: &str, at: i64) -> Value {
        json!({"type": "text", "text": text, "sender": sender, "senderId": sender, "timestamp": at})
    }

    async fn next_event(feed: &mut LiveFeed) -> FeedEvent {
        tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .expect("feed event")
            .expect("feed open")
    }

    fn assert_idle(feed: &mut LiveFeed) {
        assert!(feed.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn initial_ids_are_suppressed_once() {
        let server = MemoryServer::new();
        let db = Arc::new(server.connect("me"));
        let cid = ConversationId::between("me", "you");
        db.write(&paths::message(&cid, "m1"), record("you", "one", 100))
            .await
            .unwrap();

        let feed = ChangeFeed::new(db.clone());
        let (batch, mut live) = feed.subscribe_initial_and_live(&cid).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(live.suppressed_len(), 1);
        assert_idle(&mut live);
        assert_eq!(live.suppressed_len(), 0);

        db.write(&paths::message(&cid, "m2"), record("you", "two", 200))
            .await
            .unwrap();
        db.remove(&paths::message(&cid, "m1")).await.unwrap();

        let mut timeline = MessageTimeline::new("me", DEFAULT_INITIAL_BATCH_LIMIT);
        timeline.reset(Some(cid.clone()));
        timeline.apply_initial_batch(batch);
        for _ in 0..2 {
            match next_event(&mut live).await {
                FeedEvent::Added(m) => {
                    timeline.apply_added(m);
                }
                FeedEvent::Removed { id } => {
                    timeline.apply_removed(&id);
                }
            }
        }
        let ids: Vec<_> = timeline.messages().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["m2".to_string()]);
    }

    #[tokio::test]
    async fn re_add_after_delete_is_delivered() {
        let server = MemoryServer::new();
        let db = Arc::new(server.connect("me"));
        let cid = ConversationId::between("me", "you");
        db.write(&paths::message(&cid, "m1"), record("you", "one", 100))
            .await
            .unwrap();

        let (_, mut live) = ChangeFeed::new(db.clone())
            .subscribe_initial_and_live(&cid)
            .await
            .unwrap();
        db.remove(&paths::message(&cid, "m1")).await.unwrap();
        db.write(&paths::message(&cid, "m1"), record("you", "again", 300))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut live).await,
            FeedEvent::Removed { id: "m1".into() }
        );
        match next_event(&mut live).await {
            FeedEvent::Added(m) => assert_eq!(m.created_at, Some(300)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_children_are_skipped() {
        let server = MemoryServer::new();
        let db = Arc::new(server.connect("me"));
        let cid = ConversationId::between("me", "you");
        db.write(&paths::message(&cid, "bad"), json!({"text": "no sender"}))
            .await
            .unwrap();
        let (batch, mut live) = ChangeFeed::new(db.clone())
            .subscribe_initial_and_live(&cid)
            .await
            .unwrap();
        assert!(batch.is_empty());

        db.write(&paths::message(&cid, "bad2"), json!(42)).await.unwrap();
        db.write(&paths::message(&cid, "ok"), record("you", "fine", 5))
            .await
            .unwrap();
        match next_event(&mut live).await {
            FeedEvent::Added(m) => assert_eq!(m.id, "ok"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_initial_fetch_releases_subscriptions() {
        let server = MemoryServer::new();
        let db = Arc::new(server.connect("me"));
        db.disconnect();
        let cid = ConversationId::between("me", "you");
        let result = ChangeFeed::new(db.clone()).subscribe_initial_and_live(&cid).await;
        assert!(result.is_err());
        assert_eq!(server.listener_count(), 0);
    }

    #[tokio::test]
    async fn dropping_live_feed_detaches_both_listeners() {
        let server = MemoryServer::new();
        let db = Arc::new(server.connect("me"));
        let cid = ConversationId::between("me", "you");
        let (_, live) = ChangeFeed::new(db.clone())
            .subscribe_initial_and_live(&cid)
            .await
            .unwrap();
        assert_eq!(server.listener_count(), 2);
        assert_eq!(live.conversation_id(), &cid);
        drop(live);
        assert_eq!(server.listener_count(), 0);
    }

    #[derive(Clone, Copy, Debug)]
    enum Op {
        /// 仅在该 ID 不存在时写入，消息不可覆盖
        Add(&'static str, i64),
        Remove(&'static str),
    }

    const LIVE_OPS: [Op; 5] = [
        Op::Add("m3", 200),
        Op::Add("m4", 50),
        Op::Remove("m1"),
        Op::Remove("m3"),
        Op::Add("m1", 400),
    ];

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for (i, &first) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, first);
                out.push(tail);
            }
        }
        out
    }

    async fn apply_op(
        db: &MemoryConnection,
        cid: &ConversationId,
        op: Op,
        expected: &mut BTreeMap<String, i64>,
    ) {
        match op {
            Op::Add(id, at) => {
                if !expected.contains_key(id) {
                    db.write(&paths::message(cid, id), record("you", id, at))
                        .await
                        .unwrap();
                    expected.insert(id.to_string(), at);
                }
            }
            Op::Remove(id) => {
                db.remove(&paths::message(cid, id)).await.unwrap();
                expected.remove(id);
            }
        }
    }

    #[tokio::test]
    async fn every_interleaving_converges_to_backend_state() {
        let order: Vec<usize> = (0..LIVE_OPS.len()).collect();
        let mut runs = 0;
        for perm in permutations(&order) {
            for split in 0..=perm.len() {
                let server = MemoryServer::new();
                let db = Arc::new(server.connect("me"));
                let cid = ConversationId::between("me", "you");
                let mut expected = BTreeMap::new();
                for op in [Op::Add("m1", 100), Op::Add("m2", 300)] {
                    apply_op(&db, &cid, op, &mut expected).await;
                }
                for &i in &perm[..split] {
                    apply_op(&db, &cid, LIVE_OPS[i], &mut expected).await;
                }

                let (batch, mut live) = ChangeFeed::new(db.clone())
                    .subscribe_initial_and_live(&cid)
                    .await
                    .unwrap();
                let mut timeline = MessageTimeline::new("me", DEFAULT_INITIAL_BATCH_LIMIT);
                timeline.reset(Some(cid.clone()));
                timeline.apply_initial_batch(batch);

                for &i in &perm[split..] {
                    apply_op(&db, &cid, LIVE_OPS[i], &mut expected).await;
                }
                timeline.apply_removed("never-seen");

                // 每条事件投递两次
                while let Some(Some(event)) = live.next().now_or_never() {
                    match event {
                        FeedEvent::Added(message) => {
                            timeline.apply_added(message.clone());
                            timeline.apply_added(message);
                        }
                        FeedEvent::Removed { id } => {
                            timeline.apply_removed(&id);
                            timeline.apply_removed(&id);
                        }
                    }
                }

                let messages = timeline.messages();
                let unique: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
                assert_eq!(
                    unique.len(),
                    messages.len(),
                    "duplicate ids: order={:?} split={}",
                    perm,
                    split
                );
                assert!(
                    messages
                        .windows(2)
                        .all(|w| w[0].sort_key() <= w[1].sort_key()),
                    "unsorted: order={:?} split={}",
                    perm,
                    split
                );
                let actual: BTreeMap<String, i64> = messages
                    .iter()
                    .map(|m| (m.id.clone(), m.sort_key()))
                    .collect();
                assert_eq!(actual, expected, "order={:?} split={}", perm, split);
                runs += 1;
            }
        }
        assert_eq!(runs, 120 * 6);
    }
}
