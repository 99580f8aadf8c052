//! 好友监听器回调接口

use crate::im::friend::models::{FriendRecord, FriendRequestRecord};
use async_trait::async_trait;

/// 好友监听器回调接口
#[async_trait]
pub trait FriendListener: Send + Sync {
    /// 好友列表发生变更（全量）
    async fn on_friend_list_changed(&self, friends: Vec<FriendRecord>);

    /// 收到的好友申请列表发生变更（全量）
    async fn on_friend_request_list_changed(&self, requests: Vec<FriendRequestRecord>);
}

/// 默认空实现（无操作）
pub struct EmptyFriendListener;

#[async_trait]
impl FriendListener for EmptyFriendListener {
    async fn on_friend_list_changed(&self, _friends: Vec<FriendRecord>) {
        // 默认不做任何处理
    }

    async fn on_friend_request_list_changed(&self, _requests: Vec<FriendRequestRecord>) {
        // 默认不做任何处理
    }
}
