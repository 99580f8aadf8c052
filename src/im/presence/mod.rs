//! 在线状态模块

pub mod format;
pub mod tracker;

pub use format::{calendar_date, format_chat_time, format_last_seen};
pub use tracker::{PresenceRecord, PresenceStream, PresenceTracker};
