//! Chaterly CLI 演示客户端
//!
//! 非交互式 CLI：在进程内实时数据库上登录两个用户，互加好友后互相发送消息，
//! 通过监听器把收到的事件打印出来

use anyhow::Result;
use async_trait::async_trait;
use chaterly_sdk_core_rust::im::client::{ChaterlyClient, ClientConfig};
use chaterly_sdk_core_rust::im::conversation::ConversationListener;
use chaterly_sdk_core_rust::im::friend::{FriendListener, FriendRecord, FriendRequestRecord};
use chaterly_sdk_core_rust::im::inbox::{ChatSummary, InboxListener, Notification};
use chaterly_sdk_core_rust::im::message::{Message, MessageContent};
use chaterly_sdk_core_rust::im::presence::PresenceRecord;
use chaterly_sdk_core_rust::im::realtime::{MemoryConnection, MemoryServer};
use chaterly_sdk_core_rust::im::types::{now_millis, ConversationId};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Chaterly CLI 演示客户端
#[derive(Parser, Debug)]
#[command(name = "chaterly-cli")]
#[command(about = "Chaterly CLI - 在内存数据库上演示实时聊天同步", long_about = None)]
struct Args {
    /// 第一个用户的用户名
    #[arg(long, default_value = "alice")]
    alice: String,

    /// 第二个用户的用户名
    #[arg(long, default_value = "bob")]
    bob: String,

    /// 每个用户发送的消息条数
    #[arg(short, long, default_value = "3")]
    messages: usize,

    /// 日志级别（默认: info,chaterly_sdk_core_rust=debug）
    #[arg(long, default_value = "info,chaterly_sdk_core_rust=debug")]
    log_level: String,

    /// 额外写入的日志文件
    #[arg(long)]
    log_file: Option<String>,
}

/// 初始化日志（stdout，可选同时写入文件）
fn init_logger(log_level: &str, log_file: Option<&str>) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file {
        info!("[CLI] 📝 日志已同时输出到控制台和文件: {}", path);
    }
    Ok(())
}

fn describe(message: &Message) -> String {
    match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Image { url } => format!("[图片] {}", url.chars().take(40).collect::<String>()),
    }
}

/// 打印所有事件的监听器
struct CliListener {
    name: String,
}

#[async_trait]
impl ConversationListener for CliListener {
    async fn on_messages_reset(&self, conversation_id: ConversationId, messages: Vec<Message>) {
        info!(
            "[CLI/{}] 📂 打开会话 {}，共 {} 条消息",
            self.name,
            conversation_id,
            messages.len()
        );
    }

    async fn on_message_inserted(&self, message: Message, index: usize, own: bool) {
        info!(
            "[CLI/{}] 💬 #{} {}{}: {}",
            self.name,
            index,
            message.sender_name,
            if own { "（自己）" } else { "" },
            describe(&message)
        );
    }

    async fn on_message_removed(&self, _conversation_id: ConversationId, message_id: String) {
        info!("[CLI/{}] 🗑️ 消息删除: {}", self.name, message_id);
    }

    async fn on_typing_changed(&self, _conversation_id: ConversationId, typing: bool) {
        if typing {
            info!("[CLI/{}] ⌨️ 对方正在输入...", self.name);
        } else {
            info!("[CLI/{}] ⌨️ 对方停止输入", self.name);
        }
    }

    async fn on_send_failed(&self, placeholder: Message, error: String) {
        error!(
            "[CLI/{}] ❌ 发送失败: {} ({})",
            self.name,
            describe(&placeholder),
            error
        );
    }

    async fn on_contact_presence_changed(&self, contact_id: String, presence: PresenceRecord) {
        info!(
            "[CLI/{}] 🟢 {} {}",
            self.name,
            contact_id,
            presence.status_text(now_millis())
        );
    }
}

#[async_trait]
impl FriendListener for CliListener {
    async fn on_friend_list_changed(&self, friends: Vec<FriendRecord>) {
        let names: Vec<&str> = friends.iter().map(|f| f.username.as_str()).collect();
        info!("[CLI/{}] 👥 好友列表: {:?}", self.name, names);
    }

    async fn on_friend_request_list_changed(&self, requests: Vec<FriendRequestRecord>) {
        let names: Vec<&str> = requests.iter().map(|r| r.from_username.as_str()).collect();
        info!("[CLI/{}] 📝 好友申请: {:?}", self.name, names);
    }
}

#[async_trait]
impl InboxListener for CliListener {
    async fn on_chat_list_changed(&self, chats: Vec<ChatSummary>) {
        let now = now_millis();
        for chat in chats.iter().take(5) {
            info!(
                "[CLI/{}]   - {} | {} | {}",
                self.name,
                chat.username,
                chat.preview.as_deref().unwrap_or("暂无消息"),
                chat.time_label(now)
            );
        }
    }

    async fn on_notification(&self, notification: Notification) {
        info!(
            "[CLI/{}] 🔔 {}: {}",
            self.name, notification.sender_name, notification.preview
        );
    }
}

async fn login(
    server: &MemoryServer,
    user_id: &str,
    username: &str,
) -> Result<(MemoryConnection, ChaterlyClient)> {
    let config = ClientConfig::new(
        user_id.to_string(),
        String::new(),
        format!("{}@example.com", username),
    );
    let connection = server.connect(user_id);
    let mut client = ChaterlyClient::new(config, Arc::new(connection.clone()))?;
    let listener = Arc::new(CliListener {
        name: username.to_string(),
    });
    client.set_conversation_listener(listener.clone());
    client.set_friend_listener(listener.clone());
    client.set_inbox_listener(listener);
    client.claim_username(username).await?;
    client.start().await?;
    info!("[CLI] ✅ 登录成功: {} ({})", username, user_id);
    Ok((connection, client))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level, args.log_file.as_deref())?;

    info!("[CLI] 🚀 Chaterly CLI 演示");
    let idle = Duration::from_millis(100);
    let server = MemoryServer::new();

    let (_alice_conn, mut alice) = login(&server, "user-alice", &args.alice).await?;
    let (bob_conn, mut bob) = login(&server, "user-bob", &args.bob).await?;

    alice.send_friend_request(&args.bob).await?;
    bob.process_pending(idle).await;
    bob.accept_friend_request("user-alice").await?;
    alice.process_pending(idle).await;
    bob.process_pending(idle).await;

    alice.select_conversation("user-bob").await?;
    for i in 1..=args.messages {
        alice.on_input().await?;
        bob.process_pending(idle).await;
        alice
            .send_text_message(&format!("{} 的第 {} 条消息", args.alice, i))
            .await?;
        alice.process_pending(idle).await;
        bob.process_pending(idle).await;
    }

    bob.select_conversation("user-alice").await?;
    for i in 1..=args.messages {
        bob.send_text_message(&format!("{} 的第 {} 条回复", args.bob, i))
            .await?;
        bob.process_pending(idle).await;
        alice.process_pending(idle).await;
    }

    alice
        .send_image_message(b"\x89PNG demo", "image/png", "demo.png")
        .await?;
    bob.process_pending(idle).await;
    alice.process_pending(idle).await;

    // 模拟对方断网再恢复，观察在线状态变化
    bob_conn.disconnect();
    alice.process_pending(idle).await;
    bob_conn.reconnect();
    alice.process_pending(idle).await;

    let cleared = alice.clear_chat().await?;
    info!("[CLI] 🧹 {} 清空了自己的 {} 条消息", args.alice, cleared);
    alice.process_pending(idle).await;
    bob.process_pending(idle).await;

    alice.logout().await?;
    bob.process_pending(idle).await;
    bob.logout().await?;
    info!("[CLI] 👋 程序退出");
    Ok(())
}
