//! 输入状态模块

pub mod coordinator;
pub mod watcher;

pub use coordinator::{TypingCoordinator, DEFAULT_TYPING_DEBOUNCE};
pub use watcher::TypingWatcher;
