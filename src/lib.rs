pub mod im;

// 重新导出常用类型，方便外部使用
pub use im::{
    client::{ChaterlyClient, ClientConfig, ClientEvent},
    realtime::{MemoryConnection, MemoryServer, RealtimeDb},
    types::{ConversationId, Session},
    Result, SyncError,
};
