pub mod capture;

// 重新导出常用类型和函数，方便外部使用
pub use capture::{
    config::{CaptureConfig, DuplicatePolicy},
    context::CaptureContext,
    db::open_or_create_database,
    interceptor::{InterceptedChannel, Notification, NotificationObserver, NotificationSink},
    message::{ContentElement, ContentPayload, MessageRecord, MessageStore, NormalizedMessage},
    recency::{RecencyBuffer, RecencyEntry},
};
