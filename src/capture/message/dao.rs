//! 消息数据访问层（DAO）
//!
//! 负责 `info` / `content` 两张表的所有读写。写入经由单写者队列串行执行：
//! 同一条消息的元数据行与内容行连续写入，不同消息之间不保证事务边界。

use crate::capture::config::DuplicatePolicy;
use crate::capture::message::models::{
    ContentElement, ContentPayload, MessageRecord, NormalizedMessage,
};
use crate::capture::message::types::{ChatType, ElementType};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// 写入队列中的命令
enum WriteCommand {
    /// 写入一条消息（先元数据，后内容）
    Message(NormalizedMessage),
    /// 队列屏障：之前的命令全部执行完后应答
    Flush(oneshot::Sender<()>),
}

/// 单条消息的写入结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub info_written: bool,
    pub content_written: usize,
    /// 主键冲突被跳过的行数
    pub skipped: usize,
    /// 其他原因失败的行数
    pub failed: usize,
}

/// 本地消息存储（sqlx / SQLite）
pub struct MessageStore {
    pool: Pool<Sqlite>,
    policy: DuplicatePolicy,
    writer: Mutex<Option<mpsc::UnboundedSender<WriteCommand>>>,
    pending: Arc<AtomicUsize>,
}

impl MessageStore {
    /// 打开（不存在则创建）数据库文件并初始化表结构
    ///
    /// 表结构初始化失败时先关闭连接池再返回错误，便于调用方把文件挪走。
    pub async fn open(path: impl AsRef<Path>, policy: DuplicatePolicy) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("打开数据库失败: {}", path.display()))?;

        if let Err(e) = Self::init_schema_with_connection(&pool).await {
            pool.close().await;
            return Err(e);
        }

        info!("[MsgStore/DB] 已打开数据库: {}", path.display());
        Ok(Self::with_pool(pool, policy))
    }

    /// 创建内存数据库（测试用）
    pub async fn in_memory(policy: DuplicatePolicy) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("创建内存数据库失败")?;
        Self::init_schema_with_connection(&pool).await?;
        Ok(Self::with_pool(pool, policy))
    }

    fn with_pool(pool: Pool<Sqlite>, policy: DuplicatePolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_writer(pool.clone(), policy, rx, pending.clone()));
        Self {
            pool,
            policy,
            writer: Mutex::new(Some(tx)),
            pending,
        }
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// 初始化表结构（幂等）
    pub async fn init_schema(&self) -> Result<()> {
        Self::init_schema_with_connection(&self.pool).await
    }

    async fn init_schema_with_connection(db: &Pool<Sqlite>) -> Result<()> {
        debug!("[MsgStore/DB] 初始化消息表结构");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS info (
                id TEXT PRIMARY KEY,
                senderUin TEXT,
                sendNickName TEXT,
                sendMemberName TEXT,
                peerUin TEXT,
                peerName TEXT,
                msgTime INTEGER,
                chatType INTEGER
            )
            "#,
        )
        .execute(db)
        .await
        .context("创建 info 表失败")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content (
                id TEXT,
                elementId TEXT,
                elementType INTEGER,
                content BLOB,
                PRIMARY KEY (id, elementId)
            )
            "#,
        )
        .execute(db)
        .await
        .context("创建 content 表失败")?;

        Ok(())
    }

    /// 把一条消息放入写入队列（不等待写入完成）
    ///
    /// 仅在存储已关闭时返回错误。
    pub fn insert_message(&self, message: NormalizedMessage) -> Result<()> {
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard
            .as_ref()
            .ok_or_else(|| anyhow!("消息存储已关闭，丢弃消息 {}", message.record.id))?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(cmd)) = tx.send(WriteCommand::Message(message)) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let id = match cmd {
                WriteCommand::Message(m) => m.record.id,
                WriteCommand::Flush(_) => String::new(),
            };
            return Err(anyhow!("写入队列已停止，丢弃消息 {}", id));
        }
        Ok(())
    }

    /// 已入队但尚未写完的消息数
    pub fn pending_writes(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// 等待调用前入队的所有写入完成
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = guard.as_ref() else {
                return Ok(());
            };
            if tx.send(WriteCommand::Flush(ack_tx)).is_err() {
                return Ok(());
            }
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(anyhow!(
                "等待写入队列清空超时（{:?}），仍有 {} 条待写入",
                timeout,
                self.pending_writes()
            )),
        }
    }

    /// 关闭写入队列并释放数据库文件句柄；不等待队列中尚未执行的写入
    pub async fn close(&self) {
        let tx = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);
        let pending = self.pending_writes();
        if pending > 0 {
            warn!("[MsgStore/DB] 关闭时仍有 {} 条消息未写入", pending);
        }
        self.pool.close().await;
        info!("[MsgStore/DB] 数据库已关闭");
    }

    /// 按消息 id 查询元数据；未找到或查询失败都返回 `None`
    pub async fn get_by_id(&self, id: &str) -> Option<MessageRecord> {
        let result = sqlx::query(
            r#"
            SELECT id, senderUin, sendNickName, sendMemberName, peerUin, peerName, msgTime, chatType
            FROM info
            WHERE id = ?
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.map(|row| Self::row_to_record(&row)),
            Err(e) => {
                warn!("[MsgStore/DB] 查询消息 {} 失败: {}", id, e);
                None
            }
        }
    }

    /// 按写入顺序查询一条消息的全部内容行；查询失败返回空列表
    pub async fn get_content(&self, id: &str) -> Vec<ContentElement> {
        let result = sqlx::query(
            r#"
            SELECT id, elementId, elementType, typeof(content) AS content_kind, content
            FROM content
            WHERE id = ?
            ORDER BY rowid
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await;

        match result {
            Ok(rows) => rows.iter().map(Self::row_to_content).collect(),
            Err(e) => {
                warn!("[MsgStore/DB] 查询消息 {} 的内容失败: {}", id, e);
                Vec::new()
            }
        }
    }

    fn row_to_record(row: &SqliteRow) -> MessageRecord {
        MessageRecord {
            id: row.try_get::<String, _>("id").unwrap_or_default(),
            sender_uin: row.try_get("senderUin").unwrap_or_default(),
            sender_nickname: row.try_get("sendNickName").unwrap_or_default(),
            sender_display_name: row.try_get("sendMemberName").unwrap_or_default(),
            peer_uin: row.try_get("peerUin").unwrap_or_default(),
            peer_name: row.try_get("peerName").unwrap_or_default(),
            timestamp: row
                .try_get::<Option<i64>, _>("msgTime")
                .ok()
                .flatten()
                .unwrap_or_default(),
            chat_type: ChatType::from_i32(
                row.try_get::<Option<i32>, _>("chatType")
                    .ok()
                    .flatten()
                    .unwrap_or_default(),
            ),
        }
    }

    fn row_to_content(row: &SqliteRow) -> ContentElement {
        let kind: String = row.try_get("content_kind").unwrap_or_default();
        let payload = match kind.as_str() {
            "text" => row
                .try_get_unchecked::<String, _>("content")
                .map(ContentPayload::Text),
            "blob" => row
                .try_get_unchecked::<Vec<u8>, _>("content")
                .map(ContentPayload::Bytes),
            "integer" => row
                .try_get_unchecked::<i64, _>("content")
                .map(ContentPayload::Integer),
            "real" => row
                .try_get_unchecked::<f64, _>("content")
                .map(|f| ContentPayload::Text(f.to_string())),
            _ => Ok(ContentPayload::Null),
        }
        .unwrap_or(ContentPayload::Null);

        ContentElement {
            message_id: row.try_get::<String, _>("id").unwrap_or_default(),
            element_id: row.try_get::<String, _>("elementId").unwrap_or_default(),
            element_type: ElementType::from_i32(
                row.try_get::<Option<i32>, _>("elementType")
                    .ok()
                    .flatten()
                    .unwrap_or_default(),
            ),
            payload,
        }
    }
}

/// 写入任务：按入队顺序逐条执行
async fn run_writer(
    pool: Pool<Sqlite>,
    policy: DuplicatePolicy,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCommand::Message(message) => {
                let outcome = write_message(&pool, policy, &message).await;
                pending.fetch_sub(1, Ordering::SeqCst);
                debug!(
                    "[MsgStore/DB] 消息 {} 写入完成: info={} content={} skipped={} failed={}",
                    message.record.id,
                    outcome.info_written,
                    outcome.content_written,
                    outcome.skipped,
                    outcome.failed
                );
            }
            WriteCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("[MsgStore/DB] 写入队列已关闭");
}

/// 写入一条消息：一行 info 加 N 行 content，单行失败不影响其余行
async fn write_message(
    pool: &Pool<Sqlite>,
    policy: DuplicatePolicy,
    message: &NormalizedMessage,
) -> WriteOutcome {
    let verb = match policy {
        DuplicatePolicy::Skip => "INSERT",
        DuplicatePolicy::Replace => "INSERT OR REPLACE",
    };
    let mut outcome = WriteOutcome::default();
    let record = &message.record;

    let info_sql = format!(
        r#"
        {verb} INTO info (
            id, senderUin, sendNickName, sendMemberName, peerUin, peerName, msgTime, chatType
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#
    );
    let result = sqlx::query(&info_sql)
        .bind(&record.id)
        .bind(&record.sender_uin)
        .bind(&record.sender_nickname)
        .bind(&record.sender_display_name)
        .bind(&record.peer_uin)
        .bind(&record.peer_name)
        .bind(record.timestamp)
        .bind(record.chat_type.as_i32())
        .execute(pool)
        .await;
    match result {
        Ok(_) => outcome.info_written = true,
        Err(e) => record_failure(&mut outcome, "info", &record.id, "-", &e),
    }

    let content_sql = format!(
        r#"
        {verb} INTO content (id, elementId, elementType, content) VALUES (?, ?, ?, ?)
        "#
    );
    for element in &message.elements {
        let query = sqlx::query(&content_sql)
            .bind(&element.message_id)
            .bind(&element.element_id)
            .bind(element.element_type.as_i32());
        let query = match &element.payload {
            ContentPayload::Text(text) => query.bind(text.as_str()),
            ContentPayload::Bytes(bytes) => query.bind(bytes.as_slice()),
            ContentPayload::Integer(value) => query.bind(*value),
            ContentPayload::Null => query.bind(Option::<String>::None),
        };
        match query.execute(pool).await {
            Ok(_) => outcome.content_written += 1,
            Err(e) => record_failure(
                &mut outcome,
                "content",
                &element.message_id,
                &element.element_id,
                &e,
            ),
        }
    }

    outcome
}

fn record_failure(
    outcome: &mut WriteOutcome,
    table: &str,
    id: &str,
    element_id: &str,
    err: &sqlx::Error,
) {
    let conflict = err
        .as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation());
    if conflict {
        debug!(
            "[MsgStore/DB] {} 表已存在 ({}, {})，跳过",
            table, id, element_id
        );
        outcome.skipped += 1;
    } else {
        error!(
            "[MsgStore/DB] 写入 {} 表失败 ({}, {}): {}",
            table, id, element_id, err
        );
        outcome.failed += 1;
    }
}
