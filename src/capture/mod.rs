//! 消息捕获与持久化
//!
//! 旁路观察宿主的出站通知，把其中的消息规整后写入本地 SQLite，
//! 使上游撤回、编辑或删除的内容在本地仍可找回。

pub mod config;
pub mod context;
pub mod db;
pub mod interceptor;
pub mod message;
pub mod recency;
pub mod serialization;

// 重新导出主要类型和函数
pub use config::{CaptureConfig, DuplicatePolicy};
pub use context::CaptureContext;
pub use db::{open_or_create_database, MAX_OPEN_ATTEMPTS};
pub use interceptor::{InterceptedChannel, Notification, NotificationObserver, NotificationSink};
pub use recency::{RecencyBuffer, RecencyEntry};

/// 插件私有数据目录下的数据库文件名
pub const DB_FILE_NAME: &str = "qq-storage.sqlite";

/// 插件私有数据目录下的配置文件名
pub const CONFIG_FILE_NAME: &str = "config.json";

#[cfg(test)]
pub(crate) fn init_test_logger() {
    use std::sync::Once;
    static INIT_LOGGER: Once = Once::new();

    INIT_LOGGER.call_once(|| {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        // 测试中默认打开当前 crate 的 debug，sqlx 只保留 warn
        let filter_layer = EnvFilter::new("info,message_storage_rust=debug,sqlx=warn");

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_file(true) // 包含文件名
            .with_line_number(true) // 包含行号
            .with_target(false)
            .with_test_writer();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}
