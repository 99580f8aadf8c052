pub mod account;
pub mod blob;
pub mod client;
pub mod conversation;
pub mod error;
pub mod feed;
pub mod friend;
pub mod inbox;
pub mod message;
pub mod presence;
pub mod realtime;
pub mod serialization;
pub mod types;
pub mod typing;

// 重新导出错误类型
pub use error::{Result, SyncError};
