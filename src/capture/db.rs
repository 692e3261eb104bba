//! 数据库初始化与损坏恢复
//!
//! 打开失败（文件损坏、被锁等）时，把现有文件改名为带时间戳的备份后重建，
//! 最多尝试 [`MAX_OPEN_ATTEMPTS`] 次。数据不会在改名备份之前被删除。

use crate::capture::config::DuplicatePolicy;
use crate::capture::message::MessageStore;
use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// 打开数据库的总尝试次数
pub const MAX_OPEN_ATTEMPTS: u32 = 3;

/// SQLite 可能在主文件旁留下的附属文件
const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// 打开（必要时重建）消息数据库
pub async fn open_or_create_database(
    db_file: &Path,
    policy: DuplicatePolicy,
) -> Result<MessageStore> {
    open_with_recovery(db_file, |path| MessageStore::open(path, policy)).await
}

/// 带备份重试的打开流程，`open` 每次尝试调用一次
pub async fn open_with_recovery<T, F, Fut>(db_file: &Path, mut open: F) -> Result<T>
where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match open(db_file.to_path_buf()).await {
            Ok(store) => {
                info!(
                    "[Recovery] 数据库就绪: {} (第 {} 次尝试)",
                    db_file.display(),
                    attempt
                );
                return Ok(store);
            }
            Err(e) if attempt >= MAX_OPEN_ATTEMPTS => {
                error!(
                    "[Recovery] 达到最大尝试次数 {}，初始化数据库失败: {:#}",
                    MAX_OPEN_ATTEMPTS, e
                );
                return Err(e.context(format!(
                    "数据库在 {} 次尝试后仍无法打开: {}",
                    MAX_OPEN_ATTEMPTS,
                    db_file.display()
                )));
            }
            Err(e) => {
                warn!(
                    "[Recovery] 数据库打开失败 (尝试 {}/{}): {:#}",
                    attempt, MAX_OPEN_ATTEMPTS, e
                );
                backup_database_file(db_file)?;
                info!("[Recovery] 正在重试创建新的数据库...");
                attempt += 1;
            }
        }
    }
}

/// 备份文件名：`<stem>_backup_<unix 毫秒>.<ext>`
pub fn backup_file_name(db_file: &Path, timestamp_millis: i64) -> PathBuf {
    let stem = db_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match db_file.extension() {
        Some(ext) => format!("{}_backup_{}.{}", stem, timestamp_millis, ext.to_string_lossy()),
        None => format!("{}_backup_{}", stem, timestamp_millis),
    };
    db_file.with_file_name(name)
}

/// 把现有数据库文件（及附属文件）改名备份，并清理规范路径上的残留
///
/// 原文件不存在时返回 `Ok(None)`。改名失败视为致命错误。
pub fn backup_database_file(db_file: &Path) -> Result<Option<PathBuf>> {
    backup_database_file_at(db_file, chrono::Utc::now().timestamp_millis())
}

/// 以给定毫秒时间戳为起点备份；同名备份已存在时时间戳逐次加一
fn backup_database_file_at(db_file: &Path, timestamp_millis: i64) -> Result<Option<PathBuf>> {
    let mut backup = None;

    if db_file.exists() {
        let mut millis = timestamp_millis;
        let mut target = backup_file_name(db_file, millis);
        while target.exists() {
            millis += 1;
            target = backup_file_name(db_file, millis);
        }

        std::fs::rename(db_file, &target).with_context(|| {
            format!(
                "备份数据库失败: {} -> {}",
                db_file.display(),
                target.display()
            )
        })?;
        info!("[Recovery] 已将现有数据库备份到: {}", target.display());

        for suffix in SIDECAR_SUFFIXES {
            let sidecar = with_suffix(db_file, suffix);
            if sidecar.exists() {
                let sidecar_target = with_suffix(&target, suffix);
                if let Err(e) = std::fs::rename(&sidecar, &sidecar_target) {
                    warn!(
                        "[Recovery] 备份附属文件失败 {}: {}",
                        sidecar.display(),
                        e
                    );
                }
            }
        }
        backup = Some(target);
    }

    // 删除规范路径上可能残留的损坏文件
    for path in std::iter::once(db_file.to_path_buf())
        .chain(SIDECAR_SUFFIXES.iter().map(|s| with_suffix(db_file, s)))
    {
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("删除残留文件失败: {}", path.display()))?;
        }
    }

    Ok(backup)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{init_test_logger, DB_FILE_NAME};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backups_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| {
                name.strip_prefix("qq-storage_backup_")
                    .and_then(|rest| rest.strip_suffix(".sqlite"))
                    .is_some_and(|millis| {
                        !millis.is_empty() && millis.chars().all(|c| c.is_ascii_digit())
                    })
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn backup_name_keeps_extension() {
        let name = backup_file_name(Path::new("/data/qq-storage.sqlite"), 1700000000123);
        assert_eq!(name, PathBuf::from("/data/qq-storage_backup_1700000000123.sqlite"));

        let bare = backup_file_name(Path::new("/data/store"), 5);
        assert_eq!(bare, PathBuf::from("/data/store_backup_5"));
    }

    #[tokio::test]
    async fn corrupted_file_is_backed_up_and_recreated() {
        init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        let db_file = dir.path().join(DB_FILE_NAME);
        let garbage = b"definitely not a sqlite database ".repeat(128);
        std::fs::write(&db_file, &garbage).unwrap();

        let store = open_or_create_database(&db_file, DuplicatePolicy::Skip)
            .await
            .unwrap();
        store.init_schema().await.unwrap();
        assert_eq!(store.get_by_id("anything").await, None);
        store.close().await;

        let backups = backups_in(dir.path());
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read(dir.path().join(&backups[0])).unwrap(), garbage);
        assert!(db_file.exists());
    }

    #[tokio::test]
    async fn healthy_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let db_file = dir.path().join(DB_FILE_NAME);

        let store = open_or_create_database(&db_file, DuplicatePolicy::Skip)
            .await
            .unwrap();
        store.close().await;
        let store = open_or_create_database(&db_file, DuplicatePolicy::Skip)
            .await
            .unwrap();
        store.close().await;

        assert!(backups_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn three_failures_are_fatal() {
        init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        let db_file = dir.path().join(DB_FILE_NAME);
        std::fs::write(&db_file, b"locked").unwrap();

        let attempts = AtomicU32::new(0);
        let result: Result<()> = open_with_recovery(&db_file, |_path| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("database is locked")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_OPEN_ATTEMPTS);
        // 只有第一次失败时文件存在，之后每次都是新建的空路径
        assert_eq!(backups_in(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn recovers_on_second_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let db_file = dir.path().join(DB_FILE_NAME);
        std::fs::write(&db_file, b"old").unwrap();
        std::fs::write(with_suffix(&db_file, "-wal"), b"old wal").unwrap();

        let attempts = AtomicU32::new(0);
        let opened = open_with_recovery(&db_file, |path| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(anyhow::anyhow!("file is not a database"))
                } else {
                    Ok(path)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(opened, db_file);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let backups = backups_in(dir.path());
        assert_eq!(backups.len(), 1);
        let wal_backup = dir.path().join(format!("{}-wal", backups[0]));
        assert_eq!(std::fs::read(wal_backup).unwrap(), b"old wal");
        assert!(!with_suffix(&db_file, "-wal").exists());
    }

    #[test]
    fn backup_name_collision_bumps_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let db_file = dir.path().join(DB_FILE_NAME);
        std::fs::write(&db_file, b"current").unwrap();
        let taken = backup_file_name(&db_file, 1_700_000_000_000);
        std::fs::write(&taken, b"earlier backup").unwrap();

        let backup = backup_database_file_at(&db_file, 1_700_000_000_000)
            .unwrap()
            .unwrap();

        assert_eq!(backup, backup_file_name(&db_file, 1_700_000_000_001));
        assert_eq!(std::fs::read(&backup).unwrap(), b"current");
        assert_eq!(std::fs::read(&taken).unwrap(), b"earlier backup");
        assert!(!db_file.exists());
    }

    #[tokio::test]
    async fn failed_rename_stops_recovery_and_keeps_file() {
        init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        // 主文件名合法，但加上备份后缀后超过文件名长度上限，改名必然失败
        let db_file = dir.path().join(format!("{}.sqlite", "q".repeat(240)));
        std::fs::write(&db_file, b"precious").unwrap();

        let attempts = AtomicU32::new(0);
        let result: Result<()> = open_with_recovery(&db_file, |_path| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("file is not a database")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&db_file).unwrap(), b"precious");
    }
}
