//! 同步层错误类型
//!
//! 后端协作者（实时数据库、对象存储）返回 `anyhow::Result`，
//! 面向调用方的服务接口统一转换为 [`SyncError`]。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// 网络或后端暂时性失败，调用方应提示用户重试
    #[error("请求失败，请重试: {0:#}")]
    Transient(#[from] anyhow::Error),

    #[error("不能添加自己为好友")]
    SelfRequest,

    #[error("用户不存在: {0}")]
    UserNotFound(String),

    #[error("已经是好友: {0}")]
    AlreadyFriends(String),

    #[error("好友申请已发送: {0}")]
    RequestAlreadySent(String),

    /// 对方已经向当前用户发起申请，应去处理待办申请
    #[error("对方已向你发送好友申请: {0}")]
    ReverseRequestPending(String),

    #[error("好友申请不存在: {0}")]
    RequestNotFound(String),

    #[error("用户名格式无效: {0}")]
    InvalidUsername(String),

    #[error("用户名已被占用: {0}")]
    UsernameTaken(String),

    #[error("只能删除自己发送的消息")]
    NotMessageOwner,

    #[error("当前没有打开的会话")]
    NoActiveConversation,

    #[error("消息内容为空")]
    EmptyMessage,

    #[error("数据解析失败: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SyncError {
    /// 是否为可重试的暂时性错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
