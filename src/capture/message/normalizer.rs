//! 消息规整：宿主消息对象 -> 一条元数据 + N 条内容行

use crate::capture::message::models::{
    ContentElement, ContentPayload, MessageRecord, NormalizedMessage,
};
use crate::capture::message::types::{
    ChatType, ElementType, FaceElement, MultiForwardMsgElement, PicElement, RawMsgElement,
    RawMsgRecord, ReplyElement, TextElement,
};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// 规整一条消息
///
/// 缺少 `msgId` 时返回错误；单个元素提取失败只丢弃该元素。
/// 图片在此处同步读取，源文件随时可能被宿主清理。
pub fn normalize(raw: &Value) -> Result<NormalizedMessage> {
    let msg = RawMsgRecord::deserialize(raw).context("消息对象格式无法识别")?;

    let timestamp = match msg.msg_time {
        Some(t) => t,
        None => {
            warn!("[Normalizer] 消息 {} 缺少可解析的 msgTime，按 0 保存", msg.msg_id);
            0
        }
    };

    let record = MessageRecord {
        id: msg.msg_id.clone(),
        sender_uin: msg.sender_uin.clone(),
        sender_nickname: msg.send_nick_name.clone(),
        sender_display_name: msg.send_member_name.clone(),
        peer_uin: msg.peer_uin.clone(),
        peer_name: msg.peer_name.clone(),
        timestamp,
        chat_type: ChatType::from_i32(msg.chat_type.unwrap_or_else(|| {
            warn!("[Normalizer] 消息 {} 缺少可解析的 chatType，按 0 保存", msg.msg_id);
            0
        })),
    };

    let raw_elements: &[Value] = match msg.elements.as_deref() {
        Some(items) => items,
        None => {
            warn!("[Normalizer] 消息 {} 的 elements 不是数组，只保存元数据", msg.msg_id);
            &[]
        }
    };
    let mut elements = Vec::with_capacity(raw_elements.len());
    for (index, element) in raw_elements.iter().enumerate() {
        match extract_element(&msg.msg_id, raw, element) {
            Ok(content) => elements.push(content),
            Err(e) => warn!(
                "[Normalizer] 消息 {} 的第 {} 个元素提取失败，已丢弃: {:#}",
                msg.msg_id, index, e
            ),
        }
    }

    Ok(NormalizedMessage { record, elements })
}

fn extract_element(msg_id: &str, raw_msg: &Value, element: &Value) -> Result<ContentElement> {
    let header = RawMsgElement::deserialize(element).context("元素缺少 elementType/elementId")?;
    let element_type = ElementType::from_i32(header.element_type);

    let payload = match element_type {
        ElementType::Text => {
            let text: TextElement = sub_element(&header.text_element, "textElement")?;
            ContentPayload::Text(text.content)
        }
        ElementType::Image => {
            let pic: PicElement = sub_element(&header.pic_element, "picElement")?;
            let bytes = std::fs::read(&pic.source_path)
                .with_context(|| format!("读取图片源文件失败: {}", pic.source_path))?;
            ContentPayload::Bytes(bytes)
        }
        ElementType::Face => {
            let face: FaceElement = sub_element(&header.face_element, "faceElement")?;
            ContentPayload::Integer(face.face_index)
        }
        ElementType::Reply => {
            let reply: ReplyElement = sub_element(&header.reply_element, "replyElement")?;
            ContentPayload::Text(reply.source_msg_id_in_records)
        }
        ElementType::Forward => {
            let forward: MultiForwardMsgElement =
                sub_element(&header.multi_forward_msg_element, "multiForwardMsgElement")?;
            ContentPayload::Text(forward.xml_content)
        }
        // 未识别的类型保存整条消息，避免静默丢失
        ElementType::Other(_) => ContentPayload::Text(
            serde_json::to_string_pretty(raw_msg).context("序列化原始消息失败")?,
        ),
    };

    Ok(ContentElement {
        message_id: msg_id.to_string(),
        element_id: header.element_id,
        element_type,
        payload,
    })
}

fn sub_element<T>(value: &Option<Value>, field: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let value = value
        .as_ref()
        .filter(|v| !v.is_null())
        .ok_or_else(|| anyhow!("缺少 {}", field))?;
    T::deserialize(value).with_context(|| format!("{} 格式错误", field))
}
