//! 消息模块
//!
//! 消息模型与单会话时间线（去重、排序、乐观占位消息对齐）

pub mod models;
pub mod timeline;

// 重新导出主要类型
pub use models::{DeliveryState, Message, MessageContent, MessageKind, MessageRecord};
pub use timeline::{InsertOrigin, MessageTimeline, TimelineChange, DEFAULT_INITIAL_BATCH_LIMIT};
