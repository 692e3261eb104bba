//! 捕获上下文
//!
//! 启动时构造一次，持有配置、消息存储、最近消息缓冲区、本端 uid 和已挂载窗口，
//! 以引用方式交给拦截通道使用；关闭时先等待写入队列清空再关闭存储。

use crate::capture::config::CaptureConfig;
use crate::capture::db::open_or_create_database;
use crate::capture::interceptor::{
    classify, InterceptedChannel, Notification, NotificationEvent, NotificationObserver,
    NotificationSink,
};
use crate::capture::message::{normalize, MessageStore};
use crate::capture::recency::{RecencyBuffer, RecencyEntry};
use crate::capture::{CONFIG_FILE_NAME, DB_FILE_NAME};
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 需要捕获的窗口 URL 特征（主界面消息页和独立聊天窗口）
const CAPTURE_WINDOW_MARKERS: [&str; 2] = ["#/main/message", "#/chat"];

/// 捕获上下文
pub struct CaptureContext {
    config: RwLock<CaptureConfig>,
    store: MessageStore,
    buffer: Mutex<RecencyBuffer>,
    self_uid: RwLock<Option<String>>,
    windows: Mutex<Vec<String>>,
}

impl CaptureContext {
    pub fn new(config: CaptureConfig, store: MessageStore) -> Self {
        Self {
            config: RwLock::new(config),
            store,
            buffer: Mutex::new(RecencyBuffer::new()),
            self_uid: RwLock::new(None),
            windows: Mutex::new(Vec::new()),
        }
    }

    /// 启动屏障：准备数据目录、加载配置、打开（必要时恢复）数据库
    ///
    /// 返回前不会有任何写入提交；失败时捕获子系统不启用，宿主照常运行。
    pub async fn initialize(data_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("创建数据目录失败: {}", data_dir.display()))?;

        let config = CaptureConfig::load_or_default(&data_dir.join(CONFIG_FILE_NAME));
        info!(
            "[Capture] 配置: capacity={}, batch={}, duplicate={:?}",
            config.capacity(),
            config.eviction_batch(),
            config.duplicate_policy()
        );

        let store =
            open_or_create_database(&data_dir.join(DB_FILE_NAME), config.duplicate_policy())
                .await?;
        Ok(Arc::new(Self::new(config, store)))
    }

    /// 为窗口挂载拦截通道；只有消息相关窗口才会挂载
    pub fn attach_window<S: NotificationSink>(
        self: &Arc<Self>,
        url: &str,
        downstream: S,
    ) -> Option<InterceptedChannel<S>> {
        if !CAPTURE_WINDOW_MARKERS.iter().any(|m| url.contains(m)) {
            debug!("[Capture] 跳过非消息窗口: {}", url);
            return None;
        }
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());
        info!("[Capture] 已为窗口挂载消息捕获: {}", url);
        let observer: Arc<dyn NotificationObserver> = self.clone();
        Some(InterceptedChannel::new(url, observer, downstream))
    }

    pub fn windows(&self) -> Vec<String> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn config(&self) -> CaptureConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 运行时替换配置，下一条消息起生效
    pub fn update_config(&self, config: CaptureConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// 最近一次资料变更通知里的本端 uid
    pub fn self_uid(&self) -> Option<String> {
        self.self_uid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 缓冲区中从旧到新的 id
    pub fn buffer_ids(&self) -> Vec<String> {
        self.lock_buffer().ids()
    }

    /// 缓冲区中某条消息最近一次见到的原始对象
    pub fn buffered(&self, id: &str) -> Option<RecencyEntry> {
        self.lock_buffer().get(id).cloned()
    }

    fn lock_buffer(&self) -> MutexGuard<'_, RecencyBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 捕获一条消息：更新缓冲区、异步持久化、必要时淘汰
    pub fn capture_message(&self, raw: &Value) -> Result<()> {
        let id = raw
            .get("msgId")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| anyhow!("消息缺少 msgId"))?;
        let sender_ref = raw
            .get("peerUid")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (capacity, batch) = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (config.capacity(), config.eviction_batch())
        };

        let is_new = self.lock_buffer().upsert(RecencyEntry {
            id: id.clone(),
            sender_ref,
            raw_message: raw.clone(),
        });

        let persisted = normalize(raw).and_then(|message| self.store.insert_message(message));

        let evicted = self.lock_buffer().trim(capacity, batch);
        if evicted > 0 {
            debug!("[Capture] 缓冲区超过 {} 条，淘汰最早的 {} 条", capacity, evicted);
        }

        persisted.with_context(|| format!("持久化消息 {} 失败", id))?;
        debug!("[Capture] 已捕获消息 {} (new={})", id, is_new);
        Ok(())
    }

    fn capture_all<'a>(&self, messages: impl IntoIterator<Item = &'a Value>) {
        for raw in messages {
            if let Err(e) = self.capture_message(raw) {
                error!("[Capture] 捕获消息失败: {:#}", e);
            }
        }
    }

    /// 等待写入队列清空（带超时）后关闭存储
    pub async fn shutdown(&self, timeout: Duration) {
        info!("[Capture] 正在关闭，等待写入队列清空...");
        if let Err(e) = self.store.drain(timeout).await {
            warn!("[Capture] {:#}", e);
        }
        self.store.close().await;
    }
}

impl NotificationObserver for CaptureContext {
    fn observe(&self, notification: &Notification) -> Result<()> {
        for event in classify(notification) {
            match event {
                NotificationEvent::Snapshot { messages } => {
                    debug!("[Capture] 全量消息列表，共 {} 条", messages.len());
                    self.capture_all(messages);
                }
                NotificationEvent::Delta { command, messages } => {
                    debug!("[Capture] 增量通知 {:?}，共 {} 条", command, messages.len());
                    self.capture_all(messages);
                }
                NotificationEvent::ProfileChanged { uid } => {
                    info!("[Capture] 本端用户: {}", uid);
                    *self.self_uid.write().unwrap_or_else(PoisonError::into_inner) =
                        Some(uid.to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::config::DuplicatePolicy;
    use crate::capture::init_test_logger;
    use crate::capture::message::{ContentPayload, ElementType};
    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
    use sqlx::Connection;

    const DRAIN: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Notification>>);

    impl NotificationSink for Arc<RecordingSink> {
        fn send(&self, notification: Notification) {
            self.0.lock().unwrap().push(notification);
        }
    }

    async fn context_with(capacity: usize, batch: usize) -> Arc<CaptureContext> {
        let config = CaptureConfig {
            max_msg_save_limit: Some(capacity),
            delete_msg_count_per_time: Some(batch),
            ..CaptureConfig::default()
        };
        let store = MessageStore::in_memory(DuplicatePolicy::Skip).await.unwrap();
        Arc::new(CaptureContext::new(config, store))
    }

    fn msg(id: &str, elements: Value) -> Value {
        json!({
            "msgId": id,
            "senderUin": "10001",
            "sendNickName": "Alice",
            "peerUin": "20002",
            "peerName": "Bob",
            "peerUid": "u_bob",
            "msgTime": "1700000000",
            "chatType": 1,
            "elements": elements,
        })
    }

    fn text(element_id: &str, content: &str) -> Value {
        json!({"elementType": 1, "elementId": element_id, "textElement": {"content": content}})
    }

    fn pic(element_id: &str, source_path: &str) -> Value {
        json!({
            "elementType": 2,
            "elementId": element_id,
            "picElement": {"sourcePath": source_path},
        })
    }

    fn recv(messages: Vec<Value>) -> Notification {
        Notification::new(
            "IPC_DOWN_2",
            vec![
                json!({"type": "request", "eventName": "ns-ntApi-2"}),
                json!([{
                    "cmdName": "nodeIKernelMsgListener/onRecvMsg",
                    "payload": {"msgList": messages},
                }]),
            ],
        )
    }

    #[tokio::test]
    async fn incremental_messages_respect_capacity() {
        init_test_logger();
        let ctx = context_with(3, 2).await;

        for id in ["A", "B", "C"] {
            ctx.observe(&recv(vec![msg(id, json!([]))])).unwrap();
        }
        assert_eq!(ctx.buffer_ids(), vec!["A", "B", "C"]);

        ctx.observe(&recv(vec![msg("D", json!([]))])).unwrap();
        assert_eq!(ctx.buffer_ids(), vec!["C", "D"]);

        // 被淘汰的消息仍然在库里
        ctx.store().drain(DRAIN).await.unwrap();
        assert!(ctx.store().get_by_id("A").await.is_some());
    }

    #[tokio::test]
    async fn config_changes_apply_at_use_time() {
        let ctx = context_with(10, 5).await;
        for id in ["A", "B", "C"] {
            ctx.observe(&recv(vec![msg(id, json!([]))])).unwrap();
        }
        ctx.update_config(CaptureConfig {
            max_msg_save_limit: Some(2),
            delete_msg_count_per_time: None,
            ..CaptureConfig::default()
        });
        ctx.observe(&recv(vec![msg("D", json!([]))])).unwrap();
        // 默认批量 500，超出即清空
        assert!(ctx.buffer_ids().is_empty());
    }

    #[tokio::test]
    async fn resighting_updates_in_place() {
        let ctx = context_with(10, 5).await;
        ctx.observe(&recv(vec![msg("A", json!([])), msg("B", json!([text("e1", "v1")]))]))
            .unwrap();
        ctx.observe(&recv(vec![msg("C", json!([]))])).unwrap();
        ctx.observe(&recv(vec![msg("B", json!([text("e1", "v2")]))])).unwrap();

        assert_eq!(ctx.buffer_ids(), vec!["A", "B", "C"]);
        let entry = ctx.buffered("B").unwrap();
        assert_eq!(entry.sender_ref.as_deref(), Some("u_bob"));
        assert_eq!(entry.raw_message["elements"][0]["textElement"]["content"], "v2");
    }

    #[tokio::test]
    async fn snapshot_messages_are_captured() {
        let ctx = context_with(10, 5).await;
        let history = vec![msg("H1", json!([text("e1", "history")])), msg("H2", json!([]))];
        let snapshot = Notification::new(
            "IPC_DOWN_2",
            vec![
                json!({"type": "response"}),
                json!({"result": 0, "msgList": history}),
            ],
        );
        ctx.observe(&snapshot).unwrap();
        ctx.store().drain(DRAIN).await.unwrap();

        assert_eq!(ctx.buffer_ids(), vec!["H1", "H2"]);
        let content = ctx.store().get_content("H1").await;
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].payload, ContentPayload::Text("history".into()));
    }

    #[tokio::test]
    async fn deleted_image_keeps_metadata_and_other_messages() {
        init_test_logger();
        let ctx = context_with(10, 5).await;
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone.jpg");

        ctx.observe(&recv(vec![
            msg(
                "IMG",
                json!([pic("p1", gone.to_str().unwrap()), text("t1", "caption")]),
            ),
            msg("NEXT", json!([text("t1", "still here")])),
        ]))
        .unwrap();
        ctx.store().drain(DRAIN).await.unwrap();

        let record = ctx.store().get_by_id("IMG").await.unwrap();
        assert_eq!(record.timestamp, 1_700_000_000);
        let content = ctx.store().get_content("IMG").await;
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].element_id, "t1");
        assert_eq!(ctx.store().get_content("NEXT").await.len(), 1);
    }

    #[tokio::test]
    async fn one_row_per_element_with_typed_payloads() {
        let ctx = context_with(10, 5).await;
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("cat.gif");
        std::fs::write(&image, b"GIF89a").unwrap();

        ctx.observe(&recv(vec![msg(
            "ALL",
            json!([
                text("e1", "hi"),
                pic("e2", image.to_str().unwrap()),
                {"elementType": 6, "elementId": "e6", "faceElement": {"faceIndex": 277}},
                {
                    "elementType": 7,
                    "elementId": "e7",
                    "replyElement": {"sourceMsgIdInRecords": "PREV"},
                },
                {
                    "elementType": 16,
                    "elementId": "e16",
                    "multiForwardMsgElement": {"xmlContent": "<forward/>"},
                },
            ]),
        )]))
        .unwrap();
        ctx.store().drain(DRAIN).await.unwrap();

        let rows: Vec<_> = ctx
            .store()
            .get_content("ALL")
            .await
            .into_iter()
            .map(|c| {
                assert_eq!(c.message_id, "ALL");
                (c.element_id, c.element_type, c.payload)
            })
            .collect();
        let text_payload = |s: &str| ContentPayload::Text(s.to_string());
        assert_eq!(
            rows,
            vec![
                ("e1".to_string(), ElementType::Text, text_payload("hi")),
                ("e2".to_string(), ElementType::Image, ContentPayload::Bytes(b"GIF89a".to_vec())),
                ("e6".to_string(), ElementType::Face, ContentPayload::Integer(277)),
                ("e7".to_string(), ElementType::Reply, text_payload("PREV")),
                ("e16".to_string(), ElementType::Forward, text_payload("<forward/>")),
            ]
        );
    }

    #[tokio::test]
    async fn bad_message_does_not_stop_siblings() {
        let ctx = context_with(10, 5).await;
        ctx.observe(&recv(vec![json!({"noId": true}), msg("OK", json!([]))]))
            .unwrap();
        ctx.store().drain(DRAIN).await.unwrap();
        assert_eq!(ctx.buffer_ids(), vec!["OK"]);
        assert!(ctx.store().get_by_id("OK").await.is_some());
    }

    #[tokio::test]
    async fn profile_change_records_self_uid() {
        let ctx = context_with(10, 5).await;
        assert_eq!(ctx.self_uid(), None);
        ctx.observe(&Notification::new(
            "IPC_DOWN_2",
            vec![
                json!({}),
                json!([{
                    "cmdName": "nodeIKernelProfileListener/onProfileDetailInfoChanged",
                    "payload": {"info": {"uid": "u_me"}},
                }]),
            ],
        ))
        .unwrap();
        assert_eq!(ctx.self_uid().as_deref(), Some("u_me"));
    }

    #[tokio::test]
    async fn attached_window_forwards_and_captures() {
        let ctx = context_with(10, 5).await;
        let sink = Arc::new(RecordingSink::default());

        assert!(ctx
            .attach_window("app://./renderer/index.html#/setting", sink.clone())
            .is_none());
        let channel = ctx
            .attach_window("app://./renderer/index.html#/main/message", sink.clone())
            .unwrap();

        let notification = recv(vec![msg("W1", json!([text("e1", "hello")]))]);
        channel.send(notification.clone());

        assert_eq!(*sink.0.lock().unwrap(), vec![notification]);
        assert_eq!(ctx.windows(), vec!["app://./renderer/index.html#/main/message"]);
        ctx.shutdown(DRAIN).await;
    }

    #[tokio::test]
    async fn shutdown_drains_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CaptureContext::initialize(dir.path()).await.unwrap();
        for i in 0..50 {
            ctx.observe(&recv(vec![msg(&format!("S{}", i), json!([text("e1", "x")]))]))
                .unwrap();
        }
        ctx.shutdown(DRAIN).await;
        assert_eq!(ctx.store().pending_writes(), 0);

        let reopened = MessageStore::open(dir.path().join(DB_FILE_NAME), DuplicatePolicy::Skip)
            .await
            .unwrap();
        assert!(reopened.get_by_id("S49").await.is_some());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        reopened.close().await;
    }

    #[tokio::test]
    async fn shutdown_closes_even_when_drain_times_out() {
        init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        let ctx = CaptureContext::initialize(dir.path()).await.unwrap();

        // 另一个连接占住写锁，写入任务卡在这条消息上
        let options = SqliteConnectOptions::new().filename(dir.path().join(DB_FILE_NAME));
        let mut locker = SqliteConnection::connect_with(&options).await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut locker)
            .await
            .unwrap();
        ctx.observe(&recv(vec![msg("STALLED", json!([]))])).unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            sqlx::query("COMMIT").execute(&mut locker).await.unwrap();
            locker.close().await.unwrap();
        });

        ctx.shutdown(Duration::from_millis(100)).await;
        assert!(ctx.capture_message(&msg("LATE", json!([]))).is_err());
        release.await.unwrap();
    }
}
