//! SQLite 指纹存储

pub mod models;
pub use models::*;

use crate::core::cache::{full_delta, CacheDelta, CacheSnapshot, FingerprintStore, SourceDelta};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_cache (
    source_name TEXT NOT NULL,
    file_key TEXT NOT NULL,
    hash TEXT,
    mtime REAL,
    size INTEGER,
    PRIMARY KEY (source_name, file_key)
);
CREATE INDEX IF NOT EXISTS idx_source ON file_cache(source_name);
"#;

/// 基于 SQLite 的指纹存储，每次保存在一个事务内完成
pub struct SqliteStore {
    pool: SqlitePool,
    name: String,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件
    ///
    /// 文件损坏时移到 `*.corrupt` 并新建空库。
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
            }
        }

        let pool = match Self::connect(db_path).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!("数据库无法使用 {:?}: {:#}，改用新的空库", db_path, e);
                Self::set_aside(db_path)?;
                Self::connect(db_path).await?
            }
        };
        info!("SQLite 指纹存储已就绪: {:?}", db_path);

        Ok(Self {
            pool,
            name: format!("sqlite:{}", db_path.display()),
        })
    }

    async fn connect(db_path: &Path) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(2) // 写入由缓存任务串行完成，不需要太多连接
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .with_context(|| format!("连接数据库失败: {:?}", db_path))?;

        if let Err(e) = sqlx::raw_sql(SCHEMA).execute(&pool).await {
            pool.close().await;
            return Err(e).with_context(|| format!("初始化数据表失败: {:?}", db_path));
        }
        Ok(pool)
    }

    /// 把损坏的数据库及其 WAL 文件移走
    fn set_aside(db_path: &Path) -> Result<PathBuf> {
        let with_suffix = |suffix: &str| {
            let mut name = OsString::from(db_path.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };

        let corrupt = with_suffix(".corrupt");
        std::fs::rename(db_path, &corrupt)
            .with_context(|| format!("无法移走损坏的数据库 {:?}", db_path))?;
        for side in ["-wal", "-shm"] {
            let path = with_suffix(side);
            if path.exists() {
                std::fs::rename(&path, with_suffix(&format!(".corrupt{}", side)))?;
            }
        }
        warn!("损坏的数据库已移到 {:?}", corrupt);
        Ok(corrupt)
    }

    /// 内存数据库（测试用，单连接保证数据不丢失）
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self {
            pool,
            name: "sqlite::memory:".to_string(),
        })
    }

    /// 是否还没有任何记录
    pub async fn is_empty(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count == 0)
    }

    async fn load_all(&self) -> Result<CacheSnapshot> {
        let rows = sqlx::query_as::<_, FileCacheRow>(
            "SELECT source_name, file_key, hash, mtime, size FROM file_cache",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = CacheSnapshot::new();
        for row in rows {
            if let Some((source, key, fingerprint)) = row.into_entry() {
                snapshot.entry(source).or_default().insert(key, fingerprint);
            }
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl FingerprintStore for SqliteStore {
    async fn load(&self) -> CacheSnapshot {
        match self.load_all().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("读取 SQLite 指纹缓存失败: {:#}，使用空缓存", e);
                CacheSnapshot::new()
            }
        }
    }

    /// 只写变化涉及的源：整体替换先删后插，阶段性保存逐条覆盖
    async fn save(&self, delta: &CacheDelta) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for (source, change) in delta {
            let entries = match change {
                SourceDelta::Replace(entries) => {
                    sqlx::query("DELETE FROM file_cache WHERE source_name = ?")
                        .bind(source)
                        .execute(&mut *tx)
                        .await?;
                    entries
                }
                SourceDelta::Upsert(entries) => entries,
            };

            for (key, fingerprint) in entries {
                sqlx::query(
                    "INSERT OR REPLACE INTO file_cache (source_name, file_key, hash, mtime, size) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(source)
                .bind(key)
                .bind(&fingerprint.hash)
                .bind(fingerprint.mtime)
                .bind(fingerprint.size as i64)
                .execute(&mut *tx)
                .await?;
                written += 1;
            }
        }

        tx.commit().await?;
        debug!("SQLite 指纹缓存已写入 {} 条记录", written);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 把旧版 JSON 状态文件导入 SQLite，返回导入的记录数
///
/// 文件中出现的源整体替换，其余源保持不变。
pub async fn import_json(json_path: &Path, store: &SqliteStore) -> Result<usize> {
    let data = tokio::fs::read(json_path)
        .await
        .with_context(|| format!("读取 {:?} 失败", json_path))?;
    let snapshot: CacheSnapshot = serde_json::from_slice(&data)
        .with_context(|| format!("{:?} 不是有效的状态文件", json_path))?;

    let sources = snapshot.len();
    let records: usize = snapshot.values().map(|s| s.len()).sum();
    store.save(&full_delta(snapshot)).await?;
    info!(
        "已从 {:?} 导入 {} 个源共 {} 条记录",
        json_path, sources, records
    );
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::SourceEntries;
    use crate::core::file_state::Fingerprint;

    fn entries(keys: &[&str]) -> SourceEntries {
        keys.iter()
            .map(|k| {
                (
                    k.to_string(),
                    Fingerprint {
                        hash: format!("hash-{}", k),
                        mtime: 1_700_000_000.0,
                        size: 42,
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_save_replaces_per_source() {
        let store = SqliteStore::in_memory().await.unwrap();

        let mut first = CacheSnapshot::new();
        first.insert("a".to_string(), entries(&["x.txt", "y.txt"]));
        first.insert("b".to_string(), entries(&["z.txt"]));
        store.save(&full_delta(first)).await.unwrap();

        let mut second = CacheSnapshot::new();
        second.insert("a".to_string(), entries(&["y.txt"]));
        store.save(&full_delta(second)).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded["a"], entries(&["y.txt"]));
        assert_eq!(loaded["b"], entries(&["z.txt"]));
    }

    #[tokio::test]
    async fn test_upsert_keeps_unlisted_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut first = CacheSnapshot::new();
        first.insert("a".to_string(), entries(&["x.txt", "y.txt"]));
        store.save(&full_delta(first)).await.unwrap();

        let mut changed = entries(&["y.txt", "z.txt"]);
        changed.get_mut("y.txt").unwrap().hash = "new".to_string();
        let mut delta = CacheDelta::new();
        delta.insert("a".to_string(), SourceDelta::Upsert(changed));
        store.save(&delta).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded["a"].len(), 3);
        assert_eq!(loaded["a"]["y.txt"].hash, "new");
        assert_eq!(loaded["a"]["x.txt"].hash, "hash-x.txt");
    }

    #[tokio::test]
    async fn test_corrupt_database_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synced_db.sqlite3");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();

        let store = SqliteStore::open(&path).await.unwrap();
        assert!(store.is_empty().await.unwrap());
        assert!(dir.path().join("synced_db.sqlite3.corrupt").exists());

        let mut snapshot = CacheSnapshot::new();
        snapshot.insert("a".to_string(), entries(&["x.txt"]));
        store.save(&full_delta(snapshot)).await.unwrap();
        assert_eq!(store.load().await["a"].len(), 1);
    }

    #[tokio::test]
    async fn test_import_json_keeps_other_sources() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut existing = CacheSnapshot::new();
        existing.insert("keep".to_string(), entries(&["k.txt"]));
        existing.insert("alice".to_string(), entries(&["stale.txt"]));
        store.save(&full_delta(existing)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("synced_db.json");
        std::fs::write(
            &json,
            r#"{"alice": {"a.txt": {"hash": "h", "mtime": 1.5, "size": 1}, "b.txt": {"hash": "i", "mtime": 2.0, "size": 2}}}"#,
        )
        .unwrap();

        let written = import_json(&json, &store).await.unwrap();
        assert_eq!(written, 2);

        let loaded = store.load().await;
        assert_eq!(loaded["alice"].len(), 2);
        assert!(!loaded["alice"].contains_key("stale.txt"));
        assert!(loaded["keep"].contains_key("k.txt"));
    }

    #[tokio::test]
    async fn test_import_rejects_garbage() {
        let store = SqliteStore::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("broken.json");
        std::fs::write(&json, b"not json").unwrap();
        assert!(import_json(&json, &store).await.is_err());
    }
}
