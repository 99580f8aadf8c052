//! Chaterly 客户端核心实现模块
//!
//! 持有一次登录会话的全部状态：当前会话路由、收件箱订阅、好友监听、在线状态，
//! 并把各组件产生的事件分发给调用方注册的监听器。

use crate::im::account::AccountService;
use crate::im::blob::{upload_or_inline, BlobStore, BlobStoreConfig, HttpBlobStore};
use crate::im::conversation::{
    listener::{ConversationListener, EmptyConversationListener},
    router::{ConversationRouter, RouterEvent},
};
use crate::im::error::{Result, SyncError};
use crate::im::feed::ChangeFeed;
use crate::im::friend::{
    EmptyFriendListener, FriendListener, FriendRecord, FriendRequestRecord, FriendService,
    RecordListWatcher,
};
use crate::im::inbox::{
    preview_text, should_notify, EmptyInboxListener, InboxEvent, InboxListener, InboxWatcher,
    Notification, CHAT_PREVIEW_WINDOW,
};
use crate::im::message::models::{DeliveryState, Message, MessageContent};
use crate::im::message::timeline::{InsertOrigin, DEFAULT_INITIAL_BATCH_LIMIT};
use crate::im::presence::tracker::{PresenceRecord, PresenceStream, PresenceTracker};
use crate::im::realtime::db::RealtimeDb;
use crate::im::serialization::encode_data_url;
use crate::im::typing::DEFAULT_TYPING_DEBOUNCE;
use crate::im::types::Session;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 用户 ID（由外部认证服务提供）
    pub user_id: String,
    /// 用户名（未设置时为空串）
    pub username: String,
    pub email: String,
    /// 打开会话时展示的最近消息条数
    pub initial_batch_limit: usize,
    /// 停止输入后清除输入状态的延迟
    pub typing_debounce: Duration,
    /// 图片上传的对象存储，未配置时图片以内联 data URL 发送
    pub blob_store: Option<BlobStoreConfig>,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(user_id: String, username: String, email: String) -> Self {
        Self {
            user_id,
            username,
            email,
            initial_batch_limit: DEFAULT_INITIAL_BATCH_LIMIT,
            typing_debounce: DEFAULT_TYPING_DEBOUNCE,
            blob_store: None,
        }
    }

    pub fn session(&self) -> Session {
        Session::new(&self.user_id, &self.username, &self.email)
    }
}

/// 客户端内部事件
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Conversation(RouterEvent),
    Inbox(InboxEvent),
    FriendsChanged(Vec<FriendRecord>),
    RequestsChanged(Vec<FriendRequestRecord>),
    PresenceChanged {
        contact_id: String,
        presence: PresenceRecord,
    },
}

enum Incoming {
    Event(ClientEvent),
    FriendsClosed,
    RequestsClosed,
    PresenceClosed,
}

/// Chaterly 客户端
pub struct ChaterlyClient {
    config: ClientConfig,
    account: AccountService,
    friends: FriendService,
    presence: PresenceTracker,
    router: ConversationRouter,
    inbox: InboxWatcher,
    blob_store: Option<Arc<dyn BlobStore>>,
    friends_watcher: Option<RecordListWatcher<FriendRecord>>,
    requests_watcher: Option<RecordListWatcher<FriendRequestRecord>>,
    /// 当前会话联系人的在线状态订阅
    contact_presence: Option<PresenceStream>,
    conversation_listener: Arc<dyn ConversationListener>,
    friend_listener: Arc<dyn FriendListener>,
    inbox_listener: Arc<dyn InboxListener>,
}

impl ChaterlyClient {
    /// 创建新的客户端
    pub fn new(config: ClientConfig, db: Arc<dyn RealtimeDb>) -> anyhow::Result<Self> {
        let blob_store = match &config.blob_store {
            Some(blob_config) => {
                Some(Arc::new(HttpBlobStore::new(blob_config.clone())?) as Arc<dyn BlobStore>)
            }
            None => None,
        };
        let session = config.session();
        Ok(Self {
            account: AccountService::new(db.clone(), session.clone()),
            friends: FriendService::new(db.clone(), session.clone()),
            presence: PresenceTracker::new(db.clone(), &session.user_id),
            router: ConversationRouter::new(
                session.clone(),
                db.clone(),
                config.initial_batch_limit,
                config.typing_debounce,
            ),
            inbox: InboxWatcher::new(
                ChangeFeed::new(db),
                &session.user_id,
                CHAT_PREVIEW_WINDOW,
            ),
            config,
            blob_store,
            friends_watcher: None,
            requests_watcher: None,
            contact_presence: None,
            conversation_listener: Arc::new(EmptyConversationListener),
            friend_listener: Arc::new(EmptyFriendListener),
            inbox_listener: Arc::new(EmptyInboxListener),
        })
    }

    /// 替换对象存储实现
    pub fn set_blob_store(&mut self, store: Arc<dyn BlobStore>) {
        self.blob_store = Some(store);
    }

    /// 注册会话监听器
    pub fn set_conversation_listener(&mut self, listener: Arc<dyn ConversationListener>) {
        self.conversation_listener = listener;
    }

    /// 注册好友监听器
    pub fn set_friend_listener(&mut self, listener: Arc<dyn FriendListener>) {
        self.friend_listener = listener;
    }

    /// 注册收件箱监听器
    pub fn set_inbox_listener(&mut self, listener: Arc<dyn InboxListener>) {
        self.inbox_listener = listener;
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn account(&self) -> &AccountService {
        &self.account
    }

    pub fn friend_service(&self) -> &FriendService {
        &self.friends
    }

    pub fn router(&self) -> &ConversationRouter {
        &self.router
    }

    pub fn inbox(&self) -> &InboxWatcher {
        &self.inbox
    }

    /// 登录后启动：发布在线状态，订阅好友列表与好友申请
    ///
    /// 好友列表的首次投递会建立各联系人的收件箱订阅。
    pub async fn start(&mut self) -> Result<()> {
        info!("[Client] 🚀 启动客户端: {}", self.config.user_id);
        self.presence.publish_own_presence().await?;
        self.friends_watcher = Some(self.friends.watch_friends().await?);
        self.requests_watcher = Some(self.friends.watch_requests().await?);
        Ok(())
    }

    /// 设置用户名
    pub async fn claim_username(&mut self, username: &str) -> Result<()> {
        let profile = self.account.claim_username(username).await?;
        self.config.username = profile.username.clone();
        self.router.set_username(&profile.username);
        Ok(())
    }

    /// 打开与某个联系人的会话
    pub async fn select_conversation(&mut self, contact_id: &str) -> Result<Vec<Message>> {
        self.contact_presence = None;
        let result = self.router.select_conversation(contact_id).await;

        match self.presence.subscribe_presence(contact_id).await {
            Ok(stream) => self.contact_presence = Some(stream),
            Err(e) => warn!("[Client] 订阅联系人在线状态失败: {:#}", e),
        }

        let messages = result?;
        if let Some(conversation_id) = self.router.active_conversation().cloned() {
            self.conversation_listener
                .on_messages_reset(conversation_id, messages.clone())
                .await;
        }
        Ok(messages)
    }

    /// 关闭当前会话
    pub async fn close_conversation(&mut self) {
        self.contact_presence = None;
        self.router.deselect().await;
    }

    /// 输入活动
    pub async fn on_input(&mut self) -> Result<()> {
        self.router.notify_input().await
    }

    /// 输入框失焦
    pub async fn on_blur(&mut self) -> Result<()> {
        self.router.notify_blur().await
    }

    /// 发送文本消息，返回后端分配的消息 ID
    pub async fn send_text_message(&mut self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let content = MessageContent::Text(text.to_string());
        let placeholder = self.router.stage_placeholder(content.clone())?;
        self.publish(placeholder, content).await
    }

    /// 发送图片消息：先以本地预览作为占位，上传完成后写入最终 URL
    pub async fn send_image_message(
        &mut self,
        bytes: &[u8],
        content_type: &str,
        file_name: &str,
    ) -> Result<String> {
        if bytes.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let preview = MessageContent::Image {
            url: encode_data_url(content_type, bytes),
        };
        let placeholder = self.router.stage_placeholder(preview)?;
        let url = upload_or_inline(self.blob_store.as_deref(), bytes, content_type, file_name).await;
        self.publish(placeholder, MessageContent::Image { url }).await
    }

    async fn publish(&mut self, placeholder: Message, content: MessageContent) -> Result<String> {
        match self.router.publish(&placeholder, &content).await {
            Ok(id) => Ok(id),
            Err(e) => {
                let mut failed = placeholder;
                failed.state = DeliveryState::Failed;
                self.conversation_listener
                    .on_send_failed(failed, e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    /// 删除自己发送的一条消息
    pub async fn delete_message(&mut self, message_id: &str) -> Result<()> {
        self.router.delete_message(message_id).await
    }

    /// 清空当前会话中自己发送的消息
    pub async fn clear_chat(&mut self) -> Result<usize> {
        self.router.clear_chat().await
    }

    pub async fn send_friend_request(&self, username: &str) -> Result<FriendRequestRecord> {
        self.friends.send_request(username).await
    }

    pub async fn accept_friend_request(&self, sender_id: &str) -> Result<FriendRecord> {
        self.friends.accept_request(sender_id).await
    }

    pub async fn reject_friend_request(&self, sender_id: &str) -> Result<()> {
        self.friends.reject_request(sender_id).await
    }

    pub async fn cancel_friend_request(&self, recipient_id: &str) -> Result<()> {
        self.friends.cancel_request(recipient_id).await
    }

    pub async fn remove_friend(&self, friend_id: &str) -> Result<()> {
        self.friends.remove_friend(friend_id).await
    }

    /// 登出：关闭会话（清除输入状态）、下线、释放全部订阅
    pub async fn logout(&mut self) -> Result<()> {
        self.close_conversation().await;
        self.friends_watcher = None;
        self.requests_watcher = None;
        self.inbox.sync_contacts(&[]).await;
        self.presence.go_offline().await?;
        info!("[Client] 👋 已登出: {}", self.config.user_id);
        Ok(())
    }

    /// 等待下一条事件（可以在 `select!` 或超时中安全取消）
    pub async fn next_event(&mut self) -> ClientEvent {
        loop {
            let incoming = tokio::select! {
                event = self.router.next_event() => Incoming::Event(ClientEvent::Conversation(event)),
                event = self.inbox.next() => Incoming::Event(ClientEvent::Inbox(event)),
                list = next_list(&mut self.friends_watcher) => match list {
                    Some(list) => Incoming::Event(ClientEvent::FriendsChanged(list)),
                    None => Incoming::FriendsClosed,
                },
                list = next_list(&mut self.requests_watcher) => match list {
                    Some(list) => Incoming::Event(ClientEvent::RequestsChanged(list)),
                    None => Incoming::RequestsClosed,
                },
                presence = next_presence(&mut self.contact_presence) => match presence {
                    Some((contact_id, presence)) => {
                        Incoming::Event(ClientEvent::PresenceChanged { contact_id, presence })
                    }
                    None => Incoming::PresenceClosed,
                },
            };
            match incoming {
                Incoming::Event(event) => return event,
                Incoming::FriendsClosed => self.friends_watcher = None,
                Incoming::RequestsClosed => self.requests_watcher = None,
                Incoming::PresenceClosed => self.contact_presence = None,
            }
        }
    }

    /// 处理一条事件：更新内部状态并回调监听器
    pub async fn dispatch(&mut self, event: ClientEvent) {
        debug!("[Client] 分发事件: {:?}", event);
        match event {
            ClientEvent::Conversation(RouterEvent::MessageInserted {
                message,
                index,
                origin,
                ..
            }) => {
                let own = matches!(origin, InsertOrigin::Own { .. });
                self.conversation_listener
                    .on_message_inserted(message, index, own)
                    .await;
            }
            ClientEvent::Conversation(RouterEvent::MessageRemoved {
                conversation_id,
                id,
                ..
            }) => {
                self.conversation_listener
                    .on_message_removed(conversation_id, id)
                    .await;
            }
            ClientEvent::Conversation(RouterEvent::TypingChanged {
                conversation_id,
                typing,
            }) => {
                self.conversation_listener
                    .on_typing_changed(conversation_id, typing)
                    .await;
            }
            ClientEvent::Inbox(InboxEvent::MessageArrived {
                contact_id,
                message,
            }) => {
                if should_notify(
                    &message,
                    &self.config.user_id,
                    self.router.active_conversation(),
                ) {
                    let notification = Notification {
                        contact_id,
                        conversation_id: message.conversation_id.clone(),
                        sender_name: message.sender_name.clone(),
                        preview: preview_text(&message, &self.config.user_id),
                    };
                    info!(
                        "[Client] 🔔 新消息通知: {} - {}",
                        notification.sender_name, notification.preview
                    );
                    self.inbox_listener.on_notification(notification).await;
                }
                self.notify_chat_list().await;
            }
            ClientEvent::Inbox(InboxEvent::MessageRemoved { .. }) => {
                self.notify_chat_list().await;
            }
            ClientEvent::FriendsChanged(friends) => {
                self.inbox.sync_contacts(&friends).await;
                self.friend_listener.on_friend_list_changed(friends).await;
                self.notify_chat_list().await;
            }
            ClientEvent::RequestsChanged(requests) => {
                self.friend_listener
                    .on_friend_request_list_changed(requests)
                    .await;
            }
            ClientEvent::PresenceChanged {
                contact_id,
                presence,
            } => {
                self.conversation_listener
                    .on_contact_presence_changed(contact_id, presence)
                    .await;
            }
        }
    }

    async fn notify_chat_list(&self) {
        self.inbox_listener
            .on_chat_list_changed(self.inbox.chat_list().summaries())
            .await;
    }

    /// 处理事件直到空闲 `idle` 时长，返回处理的事件数
    pub async fn process_pending(&mut self, idle: Duration) -> usize {
        let mut processed = 0;
        while let Ok(event) = tokio::time::timeout(idle, self.next_event()).await {
            self.dispatch(event).await;
            processed += 1;
        }
        processed
    }
}

async fn next_list<T: DeserializeOwned>(
    watcher: &mut Option<RecordListWatcher<T>>,
) -> Option<Vec<T>> {
    match watcher {
        Some(watcher) => watcher.next().await,
        None => std::future::pending().await,
    }
}

async fn next_presence(stream: &mut Option<PresenceStream>) -> Option<(String, PresenceRecord)> {
    match stream {
        Some(stream) => {
            let presence = stream.next().await?;
            Some((stream.user_id().to_string(), presence))
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::inbox::ChatSummary;
    use crate::im::realtime::memory::{MemoryConnection, MemoryServer};
    use crate::im::types::{paths, ConversationId};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Mutex, Once};

    static INIT_LOGGER: Once = Once::new();

    fn init_test_logger() {
        INIT_LOGGER.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
                )
                .with_test_writer()
                .try_init();
        });
    }

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        chats: Mutex<Vec<ChatSummary>>,
        friends: Mutex<Vec<FriendRecord>>,
        requests: Mutex<Vec<FriendRequestRecord>>,
    }

    impl Recorder {
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn has(&self, prefix: &str) -> bool {
            self.entries().iter().any(|e| e.starts_with(prefix))
        }
    }

    #[async_trait]
    impl ConversationListener for Recorder {
        async fn on_messages_reset(&self, conversation_id: ConversationId, messages: Vec<Message>) {
            self.push(format!("reset {} {}", conversation_id, messages.len()));
        }
        async fn on_message_inserted(&self, message: Message, index: usize, own: bool) {
            self.push(format!("inserted {} {} {}", message.id, index, own));
        }
        async fn on_message_removed(&self, _conversation_id: ConversationId, message_id: String) {
            self.push(format!("removed {}", message_id));
        }
        async fn on_typing_changed(&self, _conversation_id: ConversationId, typing: bool) {
            self.push(format!("typing {}", typing));
        }
        async fn on_send_failed(&self, placeholder: Message, _error: String) {
            self.push(format!("failed {:?}", placeholder.state));
        }
        async fn on_contact_presence_changed(&self, contact_id: String, presence: PresenceRecord) {
            self.push(format!("presence {} {}", contact_id, presence.online));
        }
    }

    #[async_trait]
    impl FriendListener for Recorder {
        async fn on_friend_list_changed(&self, friends: Vec<FriendRecord>) {
            *self.friends.lock().unwrap() = friends;
        }
        async fn on_friend_request_list_changed(&self, requests: Vec<FriendRequestRecord>) {
            *self.requests.lock().unwrap() = requests;
        }
    }

    #[async_trait]
    impl InboxListener for Recorder {
        async fn on_chat_list_changed(&self, chats: Vec<ChatSummary>) {
            *self.chats.lock().unwrap() = chats;
        }
        async fn on_notification(&self, notification: Notification) {
            self.push(format!("notify {}", notification.preview));
        }
    }

    const IDLE: Duration = Duration::from_millis(50);

    async fn login(
        server: &MemoryServer,
        uid: &str,
        name: &str,
    ) -> (MemoryConnection, ChaterlyClient, Arc<Recorder>) {
        let conn = server.connect(uid);
        let config = ClientConfig::new(
            uid.to_string(),
            String::new(),
            format!("{}@example.com", name),
        );
        let mut client = ChaterlyClient::new(config, Arc::new(conn.clone())).unwrap();
        let recorder = Arc::new(Recorder::default());
        client.set_conversation_listener(recorder.clone());
        client.set_friend_listener(recorder.clone());
        client.set_inbox_listener(recorder.clone());
        client.claim_username(name).await.unwrap();
        client.start().await.unwrap();
        client.process_pending(IDLE).await;
        (conn, client, recorder)
    }

    async fn befriend(alice: &mut ChaterlyClient, bob: &mut ChaterlyClient, bob_name: &str) {
        alice.send_friend_request(bob_name).await.unwrap();
        bob.process_pending(IDLE).await;
        let sender = alice.config().user_id.clone();
        bob.accept_friend_request(&sender).await.unwrap();
        alice.process_pending(IDLE).await;
        bob.process_pending(IDLE).await;
    }

    #[tokio::test]
    async fn two_users_chat_end_to_end() {
        init_test_logger();
        let server = MemoryServer::new();
        let (_a, mut alice, alice_log) = login(&server, "u1", "alice").await;
        let (_b, mut bob, bob_log) = login(&server, "u2", "bob").await;

        alice.send_friend_request("bob").await.unwrap();
        bob.process_pending(IDLE).await;
        assert_eq!(bob_log.requests.lock().unwrap().len(), 1);
        bob.accept_friend_request("u1").await.unwrap();
        alice.process_pending(IDLE).await;
        bob.process_pending(IDLE).await;
        assert_eq!(alice_log.friends.lock().unwrap().len(), 1);
        assert!(bob_log.requests.lock().unwrap().is_empty());
        assert_eq!(alice.inbox().feed_count(), 1);

        let initial = alice.select_conversation("u2").await.unwrap();
        assert!(initial.is_empty());
        alice.send_text_message("  hello bob ").await.unwrap();
        alice.process_pending(IDLE).await;
        assert!(alice_log.has("inserted"));
        assert!(alice_log.entries().contains(&"presence u2 true".to_string()));
        assert!(!alice_log.has("notify"));

        bob.process_pending(IDLE).await;
        assert_eq!(bob_log.entries(), vec!["notify hello bob".to_string()]);
        let chats = bob_log.chats.lock().unwrap().clone();
        assert_eq!(chats[0].contact_id, "u1");
        assert_eq!(chats[0].preview.as_deref(), Some("hello bob"));

        bob.select_conversation("u1").await.unwrap();
        assert!(bob_log.has("reset"));
        bob.on_input().await.unwrap();
        alice.process_pending(IDLE).await;
        assert!(alice_log.entries().contains(&"typing true".to_string()));

        bob.send_text_message("hi alice").await.unwrap();
        alice.process_pending(IDLE).await;
        let entries = alice_log.entries();
        let typed_at = entries.iter().position(|e| e == "typing true").unwrap();
        assert!(entries[typed_at..].contains(&"typing false".to_string()));
        assert_eq!(alice.router().messages().len(), 2);
        assert!(!alice_log.has("notify"));
    }

    #[tokio::test]
    async fn failed_send_is_reported_and_kept() {
        init_test_logger();
        let server = MemoryServer::new();
        let (a, mut alice, alice_log) = login(&server, "u1", "alice").await;
        let (_b, mut bob, _) = login(&server, "u2", "bob").await;
        befriend(&mut alice, &mut bob, "bob").await;

        alice.select_conversation("u2").await.unwrap();
        a.inject_write_failures(0);
        let err = alice.send_text_message("lost").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(alice_log.has("failed Failed"));
        assert_eq!(alice.router().messages().len(), 1);

        assert!(matches!(
            alice.send_text_message("   ").await,
            Err(SyncError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn image_without_blob_store_is_inlined() {
        let server = MemoryServer::new();
        let (_a, mut alice, _) = login(&server, "u1", "alice").await;
        let (_b, mut bob, bob_log) = login(&server, "u2", "bob").await;
        befriend(&mut alice, &mut bob, "bob").await;

        alice.select_conversation("u2").await.unwrap();
        let id = alice
            .send_image_message(b"png-bytes", "image/png", "cat.png")
            .await
            .unwrap();
        let cid = ConversationId::between("u1", "u2");
        let stored = server.get(&paths::message(&cid, &id)).unwrap();
        assert_eq!(stored["type"], json!("image"));
        assert!(stored["imageUrl"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));

        bob.process_pending(IDLE).await;
        assert!(bob_log.entries().contains(&"notify Sent an image".to_string()));
    }

    #[tokio::test]
    async fn logout_goes_offline_and_releases_listeners() {
        let server = MemoryServer::new();
        let (a, mut alice, _) = login(&server, "u1", "alice").await;
        let (_b, mut bob, _) = login(&server, "u2", "bob").await;
        befriend(&mut alice, &mut bob, "bob").await;
        alice.select_conversation("u2").await.unwrap();
        alice.on_input().await.unwrap();

        let before = server.listener_count();
        alice.logout().await.unwrap();
        assert_eq!(server.get("users/u1/online"), Some(json!(false)));
        assert!(a.disconnect_hook_paths().is_empty());
        let cid = ConversationId::between("u1", "u2");
        assert_eq!(server.get(&paths::typing_flag(&cid, "u1")), None);
        // 会话 3 个 + 联系人在线状态 1 个 + 收件箱 2 个 + 好友与申请 2 个
        assert_eq!(before - server.listener_count(), 8);
    }
}
