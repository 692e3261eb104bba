//! 最近消息缓冲区
//!
//! 按插入顺序保存最近见过的消息，按 id 去重；重复出现的 id 原位替换值，
//! 不改变相对位置。超出容量后从头部成批淘汰，避免繁忙群聊里逐条裁剪的开销。

use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// 缓冲区中的一项
#[derive(Debug, Clone, PartialEq)]
pub struct RecencyEntry {
    pub id: String,
    /// 发送方引用（宿主的 peerUid）
    pub sender_ref: Option<String>,
    pub raw_message: Value,
}

/// 有界、去重、保持插入顺序的缓冲区
///
/// `index` 记录每个 id 的绝对序号，`head` 为队首的绝对序号，
/// 队首淘汰只需推进 `head`，其余项的序号不变。
#[derive(Debug, Default)]
pub struct RecencyBuffer {
    entries: VecDeque<RecencyEntry>,
    index: HashMap<String, u64>,
    head: u64,
}

impl RecencyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// 插入或原位更新；返回 `true` 表示是新 id
    pub fn upsert(&mut self, entry: RecencyEntry) -> bool {
        if let Some(&seq) = self.index.get(&entry.id) {
            let pos = (seq - self.head) as usize;
            self.entries[pos] = entry;
            return false;
        }
        let seq = self.head + self.entries.len() as u64;
        self.index.insert(entry.id.clone(), seq);
        self.entries.push_back(entry);
        true
    }

    /// 从头部淘汰至多 `batch_size` 项，返回实际淘汰数
    pub fn evict(&mut self, batch_size: usize) -> usize {
        let count = batch_size.min(self.entries.len());
        for entry in self.entries.drain(..count) {
            self.index.remove(&entry.id);
        }
        self.head += count as u64;
        count
    }

    /// 长度超过 `capacity` 时淘汰一批，返回淘汰数
    pub fn trim(&mut self, capacity: usize, batch_size: usize) -> usize {
        if self.entries.len() > capacity {
            self.evict(batch_size)
        } else {
            0
        }
    }

    pub fn get(&self, id: &str) -> Option<&RecencyEntry> {
        self.index
            .get(id)
            .map(|&seq| &self.entries[(seq - self.head) as usize])
    }

    /// 从旧到新的 id 列表
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }
}
