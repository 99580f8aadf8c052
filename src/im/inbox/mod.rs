//! 收件箱模块
//!
//! 为每个联系人维护一路消息订阅，驱动会话列表排序、最新消息预览与新消息通知

pub mod chat_list;
pub mod listener;
pub mod watcher;

pub use chat_list::{preview_text, should_notify, ChatList, ChatSummary, CHAT_PREVIEW_WINDOW};
pub use listener::{EmptyInboxListener, InboxListener, Notification};
pub use watcher::{InboxEvent, InboxWatcher};
