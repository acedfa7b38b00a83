//! 单个源的一次同步：扫描、判断变化、复制到所有目标、更新指纹缓存

use crate::config::SourceConfig;
use crate::core::cache::{FingerprintCache, SourceEntries};
use crate::core::comparator::{ChangeStatus, FileComparator};
use crate::core::file_state::{display_path, path_key, ContentHasher, Fingerprint};
use crate::core::report::{Change, SyncStats};
use crate::core::scanner::{FileScanner, ScannedFile};
use crate::core::transfer::{copy_to_all, target_path, CopyOutcome};
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 一次同步的结果
#[derive(Debug, Clone, Default)]
pub struct SourceSync {
    pub changes: Vec<Change>,
    pub stats: SyncStats,
    /// 从缓存中淘汰的记录数
    pub evicted: usize,
}

/// 单个文件的处理结果
enum FileResult {
    Unchanged,
    Changed(Change, Option<CopyOutcome>),
    Skipped,
}

/// 源同步器
#[derive(Clone)]
pub struct SourceReconciler {
    cache: FingerprintCache,
    hasher: Arc<dyn ContentHasher>,
    comparator: FileComparator,
    scanner: FileScanner,
    /// 每处理多少个文件保存一次缓存（0 表示只在结束时保存）
    flush_every: usize,
}

impl SourceReconciler {
    pub fn new(
        cache: FingerprintCache,
        hasher: Arc<dyn ContentHasher>,
        comparator: FileComparator,
        scanner: FileScanner,
        flush_every: usize,
    ) -> Self {
        Self {
            cache,
            hasher,
            comparator,
            scanner,
            flush_every,
        }
    }

    /// 同步一个源
    ///
    /// `reference_root` 为空时以第一个目标目录为参照。
    pub async fn reconcile(
        &self,
        source: &SourceConfig,
        destination_roots: &[PathBuf],
        reference_root: Option<&Path>,
        dry_run: bool,
    ) -> Result<SourceSync> {
        let reference_root = reference_root
            .or_else(|| destination_roots.first().map(PathBuf::as_path))
            .ok_or_else(|| anyhow!("没有可用的目标目录"))?
            .to_path_buf();

        info!("开始同步源: {} ({})", source.name, source.path);

        let scan = self.scanner.scan(PathBuf::from(&source.path)).await?;
        let previous = self.cache.source_entries(&source.name).await;
        let mut observed = SourceEntries::with_capacity(scan.files.len());
        let mut result = SourceSync::default();
        // 上次保存以来处理过的键
        let mut pending: Vec<String> = Vec::new();

        for (index, file) in scan.files.into_iter().enumerate() {
            result.stats.scanned += 1;
            let key = path_key(&file.relative);

            pending.push(key.clone());
            let outcome = self
                .process_file(
                    source,
                    &file,
                    &key,
                    &previous,
                    &mut observed,
                    destination_roots,
                    &reference_root,
                    dry_run,
                )
                .await;

            match outcome {
                FileResult::Unchanged => {}
                FileResult::Skipped => result.stats.skipped += 1,
                FileResult::Changed(change, copy) => {
                    match change.status {
                        ChangeStatus::Added => result.stats.added += 1,
                        ChangeStatus::Modified => result.stats.modified += 1,
                    }
                    if let Some(copy) = copy {
                        if copy.any_copied() {
                            result.stats.copied += 1;
                        }
                        result.stats.copy_failures += copy.failed as u64;
                    }
                    result.changes.push(change);
                }
            }

            if self.flush_every > 0 && (index + 1) % self.flush_every == 0 {
                let batch: SourceEntries = pending
                    .drain(..)
                    .filter_map(|k| observed.get(&k).map(|v| (k, v.clone())))
                    .collect();
                self.cache.checkpoint(&source.name, batch).await;
            }
        }

        // 读不到的目录下的文件不能当作已删除
        let unreadable: Vec<String> = scan.unreadable.iter().map(|p| path_key(p)).collect();
        if !unreadable.is_empty() {
            for (key, old) in &previous {
                if observed.contains_key(key) || !unreadable.iter().any(|u| is_under(key, u)) {
                    continue;
                }
                observed.insert(key.clone(), old.clone());
                result.stats.skipped += 1;
            }
            warn!(
                "{}: {} 个路径无法读取，保留其下的缓存记录",
                source.name,
                unreadable.len()
            );
        }

        result.evicted = previous.keys().filter(|k| !observed.contains_key(*k)).count();
        if result.evicted > 0 {
            debug!("{}: 淘汰 {} 条过期缓存记录", source.name, result.evicted);
        }
        self.cache.replace_source(&source.name, observed).await;

        info!(
            "源 {} 同步完成: 新增 {}, 修改 {}, 复制 {}, 跳过 {}{}",
            source.name,
            result.stats.added,
            result.stats.modified,
            result.stats.copied,
            result.stats.skipped,
            if dry_run { " (试运行)" } else { "" }
        );

        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_file(
        &self,
        source: &SourceConfig,
        file: &ScannedFile,
        key: &str,
        previous: &SourceEntries,
        observed: &mut SourceEntries,
        destination_roots: &[PathBuf],
        reference_root: &Path,
        dry_run: bool,
    ) -> FileResult {
        let shown = display_path(&file.relative);

        let hash = match self.comparator.cached_hash(previous.get(key), file.meta) {
            Some(hash) => hash.to_string(),
            None => {
                let hasher = self.hasher.clone();
                let path = file.path.clone();
                match tokio::task::spawn_blocking(move || hasher.hash_file(&path)).await {
                    Ok(Ok(hash)) => hash,
                    Ok(Err(e)) => {
                        warn!("{}: 无法读取 {}，本次跳过: {}", source.name, shown, e);
                        // 保留旧记录，文件仍然存在
                        if let Some(old) = previous.get(key) {
                            observed.insert(key.to_string(), old.clone());
                        }
                        return FileResult::Skipped;
                    }
                    Err(e) => {
                        warn!("{}: 哈希任务失败 {}: {}", source.name, shown, e);
                        if let Some(old) = previous.get(key) {
                            observed.insert(key.to_string(), old.clone());
                        }
                        return FileResult::Skipped;
                    }
                }
            }
        };

        observed.insert(
            key.to_string(),
            Fingerprint {
                hash: hash.clone(),
                mtime: file.meta.mtime,
                size: file.meta.size,
            },
        );

        let reference = target_path(reference_root, &source.name, &file.relative);
        let comparator = self.comparator;
        let hasher = self.hasher.clone();
        let live = file.meta;
        let classified = tokio::task::spawn_blocking(move || {
            comparator.classify(&reference, live, &hash, hasher.as_ref())
        })
        .await;

        let status = match classified {
            Ok(Some(status)) => status,
            Ok(None) => return FileResult::Unchanged,
            Err(e) => {
                warn!("{}: 比较任务失败 {}: {}", source.name, shown, e);
                ChangeStatus::Modified
            }
        };

        let change = Change {
            path: shown,
            status,
            size: file.meta.size,
            mtime: file.meta.mtime,
        };

        if dry_run {
            debug!("[试运行] {} {}: {}", status, source.name, change.path);
            return FileResult::Changed(change, None);
        }

        let mut targets: Vec<PathBuf> = destination_roots
            .iter()
            .map(|root| target_path(root, &source.name, &file.relative))
            .collect();
        // 单独配置的参照目录也要更新，否则下次仍会判为变化
        let reference = target_path(reference_root, &source.name, &file.relative);
        if !targets.contains(&reference) {
            targets.push(reference);
        }

        let target_count = targets.len();
        let from = file.path.clone();
        let copy = match tokio::task::spawn_blocking(move || copy_to_all(&from, &targets)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{}: 复制任务失败 {}: {}", source.name, change.path, e);
                CopyOutcome {
                    succeeded: 0,
                    failed: target_count,
                }
            }
        };
        debug!("{} {}: {}", status, source.name, change.path);

        FileResult::Changed(change, Some(copy))
    }
}

/// 键是否位于某个路径之下（空路径表示整个源）
fn is_under(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || (key.len() > prefix.len() && key.starts_with(prefix) && key.as_bytes()[prefix.len()] == b'/')
}
