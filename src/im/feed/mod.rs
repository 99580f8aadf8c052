//! 变更订阅适配
//!
//! 将实时数据库上一个会话的消息路径转换为"初始批次 + 实时事件流"

pub mod adapter;

pub use adapter::{ChangeFeed, FeedEvent, LiveFeed};
