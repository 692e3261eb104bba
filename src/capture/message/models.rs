//! 消息本地模型定义

use crate::capture::message::types::{ChatType, ElementType};

/// `info` 表的一行
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    pub sender_uin: Option<String>,
    pub sender_nickname: Option<String>,
    /// 群名片
    pub sender_display_name: Option<String>,
    pub peer_uin: Option<String>,
    pub peer_name: Option<String>,
    /// 秒级时间戳
    pub timestamp: i64,
    pub chat_type: ChatType,
}

/// `content` 列的取值，写入时保持 SQLite 的动态类型
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPayload {
    Text(String),
    Bytes(Vec<u8>),
    Integer(i64),
    Null,
}

/// `content` 表的一行，主键为 (message_id, element_id)
#[derive(Debug, Clone, PartialEq)]
pub struct ContentElement {
    pub message_id: String,
    pub element_id: String,
    pub element_type: ElementType,
    pub payload: ContentPayload,
}

/// 规整后的一条消息：元数据加内容行
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub record: MessageRecord,
    pub elements: Vec<ContentElement>,
}
