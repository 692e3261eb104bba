//! 捕获配置
//!
//! 对应数据目录下的 `config.json`。缺失的键不在加载时补齐，
//! 而是在使用时通过访问器回落到默认值。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// 最近消息缓冲区默认容量
pub const DEFAULT_MAX_MSG_SAVE_LIMIT: usize = 10_000;

/// 超出容量时默认一次淘汰的条数
pub const DEFAULT_DELETE_MSG_COUNT_PER_TIME: usize = 500;

/// 同一消息 id 重复写入时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// 保留已有行，新写入记日志后跳过
    #[default]
    Skip,
    /// 用新写入覆盖已有行（适合保留被编辑后的版本）
    Replace,
}

/// 捕获配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    /// 缓冲区容量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msg_save_limit: Option<usize>,
    /// 每次淘汰条数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_msg_count_per_time: Option<usize>,
    /// 重复 id 写入策略
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_policy: Option<DuplicatePolicy>,
    /// 未识别的键，原样写回
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CaptureConfig {
    /// 首次运行时写出的示例配置（所有键取默认值）
    pub fn sample() -> Self {
        Self {
            max_msg_save_limit: Some(DEFAULT_MAX_MSG_SAVE_LIMIT),
            delete_msg_count_per_time: Some(DEFAULT_DELETE_MSG_COUNT_PER_TIME),
            duplicate_policy: Some(DuplicatePolicy::Skip),
            extra: serde_json::Map::new(),
        }
    }

    /// 缓冲区容量
    pub fn capacity(&self) -> usize {
        self.max_msg_save_limit.unwrap_or(DEFAULT_MAX_MSG_SAVE_LIMIT)
    }

    /// 每次淘汰条数，至少为 1
    pub fn eviction_batch(&self) -> usize {
        self.delete_msg_count_per_time
            .unwrap_or(DEFAULT_DELETE_MSG_COUNT_PER_TIME)
            .max(1)
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.duplicate_policy.unwrap_or_default()
    }

    /// 读取配置文件；文件不存在时写出示例配置并返回它
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("[Config] 配置文件不存在，写入默认配置: {}", path.display());
            let sample = Self::sample();
            sample.save(path)?;
            return Ok(sample);
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    /// 与 [`load_or_init`](Self::load_or_init) 相同，但解析失败时记录日志并使用默认值，
    /// 成功读取后会把配置原样写回（补齐格式）
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load_or_init(path) {
            Ok(config) => {
                if let Err(e) = config.save(path) {
                    warn!("[Config] 写回配置文件失败: {:#}", e);
                }
                config
            }
            Err(e) => {
                warn!("[Config] 配置不可用，使用默认值: {:#}", e);
                Self::default()
            }
        }
    }

    /// 以两空格缩进的 JSON 写出
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        std::fs::write(path, text)
            .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        Ok(())
    }
}
