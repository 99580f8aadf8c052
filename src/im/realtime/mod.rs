//! 实时数据库模块
//!
//! 定义外部实时数据库协作者的接口，并提供进程内实现

pub mod db;
pub mod memory;

pub use db::{ChildSnapshot, DataSnapshot, DbStream, RealtimeDb, Subscription};
pub use memory::{MemoryConnection, MemoryServer};
