//! 宿主消息对象的类型定义
//!
//! 只描述捕获需要的字段，其余字段忽略。元素的子对象保留为 `Value`，
//! 按元素类型再逐个解析，单个元素格式异常不影响同一消息里的其他元素。

use crate::capture::serialization::{
    lenient_array, lenient_i32, lenient_i64, lenient_string, string_or_number,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    /// 私聊
    DirectMessage,
    /// 群聊
    GroupMessage,
    /// 未识别的取值，原样保留
    Other(i32),
}

impl ChatType {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ChatType::DirectMessage,
            2 => ChatType::GroupMessage,
            other => ChatType::Other(other),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            ChatType::DirectMessage => 1,
            ChatType::GroupMessage => 2,
            ChatType::Other(v) => v,
        }
    }
}

/// 消息元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Text,
    Image,
    Face,
    Reply,
    Forward,
    /// 未识别的类型，保存时使用原始数值
    Other(i32),
}

impl ElementType {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ElementType::Text,
            2 => ElementType::Image,
            6 => ElementType::Face,
            7 => ElementType::Reply,
            16 => ElementType::Forward,
            other => ElementType::Other(other),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            ElementType::Text => 1,
            ElementType::Image => 2,
            ElementType::Face => 6,
            ElementType::Reply => 7,
            ElementType::Forward => 16,
            ElementType::Other(v) => v,
        }
    }
}

/// 宿主消息记录（`msgList` / `msgRecord` 中的单项）
///
/// 除 `msgId` 外的字段都宽松解析：类型不对时按缺失处理，由规整阶段兜底，
/// 不因为某个元数据字段而丢掉整条消息。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMsgRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub msg_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sender_uin: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub send_nick_name: Option<String>,
    /// 群名片，仅群聊有
    #[serde(default, deserialize_with = "lenient_string")]
    pub send_member_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub peer_uin: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub peer_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub peer_uid: Option<String>,
    /// 发送时间（秒），宿主通常以字符串给出
    #[serde(default, deserialize_with = "lenient_i64")]
    pub msg_time: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i32")]
    pub chat_type: Option<i32>,
    #[serde(default, deserialize_with = "lenient_array")]
    pub elements: Option<Vec<Value>>,
}

/// 元素公共头，子对象按类型延迟解析
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMsgElement {
    pub element_type: i32,
    #[serde(deserialize_with = "string_or_number")]
    pub element_id: String,
    #[serde(default)]
    pub text_element: Option<Value>,
    #[serde(default)]
    pub pic_element: Option<Value>,
    #[serde(default)]
    pub face_element: Option<Value>,
    #[serde(default)]
    pub reply_element: Option<Value>,
    #[serde(default)]
    pub multi_forward_msg_element: Option<Value>,
}

/// 文本元素
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextElement {
    pub content: String,
}

/// 图片元素
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PicElement {
    /// 本地缓存的原图路径，宿主可能稍后清理
    pub source_path: String,
}

/// 表情元素
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceElement {
    pub face_index: i64,
}

/// 回复元素
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyElement {
    #[serde(deserialize_with = "string_or_number")]
    pub source_msg_id_in_records: String,
}

/// 合并转发元素
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiForwardMsgElement {
    pub xml_content: String,
}
