//! 联系人（好友）模块
//!
//! 好友申请的发送、接受、拒绝、撤回，好友关系维护与实时监听

pub mod listener;
pub mod models;
pub mod service;

// 重新导出主要类型
pub use listener::{EmptyFriendListener, FriendListener};
pub use models::{FriendRecord, FriendRequestRecord, RequestStatus};
pub use service::{FriendService, RecordListWatcher};
