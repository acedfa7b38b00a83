//! 指纹缓存
//!
//! 记录每个源中每个文件的 (hash, mtime, size)，用于跳过未变化文件的重新哈希。
//! 内存中的快照由所有同步任务共享；落盘由唯一的写入任务串行完成，
//! 多个源同时完成时不会互相覆盖。

use crate::core::file_state::Fingerprint;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// 单个源的缓存：path_key -> 指纹
pub type SourceEntries = HashMap<String, Fingerprint>;

/// 完整快照：源名称 -> 该源的缓存
pub type CacheSnapshot = HashMap<String, SourceEntries>;

/// 一个源自上次落盘以来的变化
#[derive(Debug, Clone, PartialEq)]
pub enum SourceDelta {
    /// 新增或更新的记录，其余记录保持不变
    Upsert(SourceEntries),
    /// 整个源的记录被替换
    Replace(SourceEntries),
}

/// 一次落盘的内容：源名称 -> 变化，未出现的源保持不变
pub type CacheDelta = HashMap<String, SourceDelta>;

/// 把完整快照中的每个源都作为整体替换
pub fn full_delta(snapshot: CacheSnapshot) -> CacheDelta {
    snapshot
        .into_iter()
        .map(|(source, entries)| (source, SourceDelta::Replace(entries)))
        .collect()
}

/// 把变化应用到快照上
pub fn apply_delta(snapshot: &mut CacheSnapshot, delta: &CacheDelta) {
    for (source, change) in delta {
        match change {
            SourceDelta::Replace(entries) => {
                snapshot.insert(source.clone(), entries.clone());
            }
            SourceDelta::Upsert(entries) => {
                snapshot
                    .entry(source.clone())
                    .or_default()
                    .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
    }
}

/// 写入队列容量
const WRITER_QUEUE: usize = 64;

/// 持久化存储接口
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// 加载全部状态；不存在、不可读或损坏时返回空快照
    async fn load(&self) -> CacheSnapshot;

    /// 原子地写入一批变化
    async fn save(&self, delta: &CacheDelta) -> Result<()>;

    /// 存储名称（用于日志）
    fn name(&self) -> &str;
}

/// JSON 文件存储（格式与旧版 synced_db.json 兼容）
///
/// 文件格式只能整体重写，所以保留一份已落盘内容的副本，每次把变化合并进去再写出。
pub struct JsonStore {
    path: PathBuf,
    name: String,
    written: Mutex<Option<CacheSnapshot>>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("json:{}", path.display());
        Self {
            path,
            name,
            written: Mutex::new(None),
        }
    }

    fn load_blocking(path: &Path) -> CacheSnapshot {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("缓存文件不存在: {:?}，使用空缓存", path);
                return CacheSnapshot::new();
            }
            Err(e) => {
                warn!("读取缓存文件失败: {:?} - {}，使用空缓存", path, e);
                return CacheSnapshot::new();
            }
        };

        match serde_json::from_slice::<CacheSnapshot>(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("缓存文件格式无效: {:?} - {}，使用空缓存", path, e);
                CacheSnapshot::new()
            }
        }
    }

    async fn read_file(&self) -> CacheSnapshot {
        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || Self::load_blocking(&path)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("加载缓存任务失败: {}", e);
                CacheSnapshot::new()
            }
        }
    }

    /// 写入同目录下的临时文件（尚未替换正式文件）
    fn stage(path: &Path, data: &[u8]) -> std::io::Result<NamedTempFile> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    /// 用临时文件一步替换正式文件
    fn commit(tmp: NamedTempFile, path: &Path) -> std::io::Result<()> {
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl FingerprintStore for JsonStore {
    async fn load(&self) -> CacheSnapshot {
        let snapshot = self.read_file().await;
        *self.written.lock().await = Some(snapshot.clone());
        snapshot
    }

    async fn save(&self, delta: &CacheDelta) -> Result<()> {
        let mut written = self.written.lock().await;
        let mut next = match written.take() {
            Some(snapshot) => snapshot,
            None => self.read_file().await,
        };
        apply_delta(&mut next, delta);

        let data = serde_json::to_vec_pretty(&next)?;
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let tmp = Self::stage(&path, &data)?;
            Self::commit(tmp, &path)
        })
        .await;

        // 写入失败时文件内容未知，下次重新读取
        if let Ok(Ok(())) = result {
            *written = Some(next);
        }
        result?.with_context(|| format!("写入缓存文件失败: {:?}", self.path))?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 某个源等待落盘的变化
#[derive(Debug, Clone)]
enum Dirty {
    Keys(HashSet<String>),
    Whole,
}

impl Dirty {
    fn merge(&mut self, other: Dirty) {
        if let Dirty::Keys(keys) = self {
            match other {
                Dirty::Keys(more) => keys.extend(more),
                Dirty::Whole => *self = Dirty::Whole,
            }
        }
    }
}

#[derive(Default)]
struct CacheState {
    snapshot: CacheSnapshot,
    dirty: HashMap<String, Dirty>,
}

impl CacheState {
    fn mark(&mut self, source: &str, dirty: Dirty) {
        match self.dirty.get_mut(source) {
            Some(existing) => existing.merge(dirty),
            None => {
                self.dirty.insert(source.to_string(), dirty);
            }
        }
    }

    /// 取出等待落盘的变化，只复制变化涉及的记录
    fn take_delta(&mut self) -> (CacheDelta, HashMap<String, Dirty>) {
        let dirty = std::mem::take(&mut self.dirty);
        let mut delta = CacheDelta::with_capacity(dirty.len());
        for (source, mark) in &dirty {
            let entries = self.snapshot.get(source);
            let change = match mark {
                Dirty::Whole => SourceDelta::Replace(entries.cloned().unwrap_or_default()),
                Dirty::Keys(keys) => SourceDelta::Upsert(
                    keys.iter()
                        .filter_map(|k| entries?.get(k).map(|v| (k.clone(), v.clone())))
                        .collect(),
                ),
            };
            delta.insert(source.clone(), change);
        }
        (delta, dirty)
    }
}

enum CacheCommand {
    /// 有新的变化
    Dirty,
    Flush(oneshot::Sender<()>),
}

/// 指纹缓存（可克隆，克隆共享同一份状态）
#[derive(Clone)]
pub struct FingerprintCache {
    state: Arc<RwLock<CacheState>>,
    tx: mpsc::Sender<CacheCommand>,
}

impl FingerprintCache {
    /// 从存储加载并启动写入任务，必须在 tokio 运行时中调用
    pub async fn open(store: Arc<dyn FingerprintStore>) -> Self {
        let snapshot = store.load().await;
        let entries: usize = snapshot.values().map(|s| s.len()).sum();
        info!(
            "已加载指纹缓存 {}: {} 个源, {} 条记录",
            store.name(),
            snapshot.len(),
            entries
        );

        let state = Arc::new(RwLock::new(CacheState {
            snapshot,
            dirty: HashMap::new(),
        }));
        let (tx, rx) = mpsc::channel(WRITER_QUEUE);
        tokio::spawn(run_writer(store, state.clone(), rx));

        Self { state, tx }
    }

    /// 当前内存快照的副本
    pub async fn snapshot(&self) -> CacheSnapshot {
        self.state.read().await.snapshot.clone()
    }

    /// 某个源的缓存副本
    pub async fn source_entries(&self, source: &str) -> SourceEntries {
        self.state
            .read()
            .await
            .snapshot
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    /// 扫描中途的阶段性保存：把本批观察到的记录叠加到该源上，不做淘汰
    pub async fn checkpoint(&self, source: &str, batch: SourceEntries) {
        if batch.is_empty() {
            return;
        }
        {
            let mut state = self.state.write().await;
            let keys: HashSet<String> = batch.keys().cloned().collect();
            state
                .snapshot
                .entry(source.to_string())
                .or_default()
                .extend(batch);
            state.mark(source, Dirty::Keys(keys));
        }
        self.notify();
    }

    /// 扫描完成后用本轮观察结果整体替换该源的记录
    pub async fn replace_source(&self, source: &str, entries: SourceEntries) {
        {
            let mut state = self.state.write().await;
            state.snapshot.insert(source.to_string(), entries);
            state.mark(source, Dirty::Whole);
        }
        self.notify();
    }

    /// 通知写入任务有新的变化
    ///
    /// 队列已满时队列里已有未处理的通知，它会带上这次的变化。
    fn notify(&self) {
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.tx.try_send(CacheCommand::Dirty) {
            warn!("缓存写入任务已停止，本次保存被丢弃");
        }
    }

    /// 等待之前的变化全部落盘
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(CacheCommand::Flush(ack_tx)).await.is_err() {
            warn!("缓存写入任务已停止，无法刷新");
            return;
        }
        let _ = ack_rx.await;
    }
}

/// 唯一的写入任务：串行落盘，积压的多次通知合并为一次写入
async fn run_writer(
    store: Arc<dyn FingerprintStore>,
    state: Arc<RwLock<CacheState>>,
    mut rx: mpsc::Receiver<CacheCommand>,
) {
    while let Some(command) = rx.recv().await {
        let mut acks = Vec::new();
        let mut absorb = |command: CacheCommand| {
            if let CacheCommand::Flush(ack) = command {
                acks.push(ack);
            }
        };

        absorb(command);
        while let Ok(command) = rx.try_recv() {
            absorb(command);
        }

        let (delta, marks) = state.write().await.take_delta();
        if !delta.is_empty() {
            match store.save(&delta).await {
                Ok(()) => debug!("指纹缓存已保存到 {} ({} 个源)", store.name(), delta.len()),
                Err(e) => {
                    error!("保存指纹缓存失败: {:#}", e);
                    // 放回去，下次写入时重试
                    let mut state = state.write().await;
                    for (source, mark) in marks {
                        state.mark(&source, mark);
                    }
                }
            }
        }

        for ack in acks {
            let _ = ack.send(());
        }
    }
    debug!("缓存写入任务退出");
}
