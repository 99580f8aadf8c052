//! 会话模块
//!
//! 负责当前打开会话的订阅生命周期、消息时间线与输入状态

pub mod listener;
pub mod router;

// 重新导出主要类型
pub use listener::{ConversationListener, EmptyConversationListener};
pub use router::{ConversationRouter, RouterEvent};
