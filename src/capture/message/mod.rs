//! 消息模块
//!
//! 宿主消息对象的类型、规整逻辑与本地存储

pub mod dao;
pub mod models;
pub mod normalizer;
pub mod types;

// 重新导出主要类型和函数
pub use dao::{MessageStore, WriteOutcome};
pub use models::{ContentElement, ContentPayload, MessageRecord, NormalizedMessage};
pub use normalizer::normalize;
pub use types::{ChatType, ElementType, RawMsgElement, RawMsgRecord};
