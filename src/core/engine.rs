//! 同步引擎
//!
//! 一次运行的阶段：
//!
//! 1. **探测**：并发探测所有源，分成可用（ready）和待定（pending）
//! 2. **主同步**：可用源通过有上限的任务池并行同步
//! 3. **后台监视**：与主同步同时运行，定期探测待定源，恢复后立即同步
//! 4. **等待**：主同步结束后，在总时长预算内、且最近一段时间内仍有进展时继续等待
//! 5. **汇总**：按源、分组和全局统计；始终不可达的源统计为零

use crate::config::{Settings, SourceConfig};
use crate::core::cache::FingerprintCache;
use crate::core::comparator::{CompareConfig, FileComparator};
use crate::core::file_state::{Blake3Hasher, ContentHasher};
use crate::core::probe::{NetworkProber, Prober};
use crate::core::reconciler::SourceReconciler;
use crate::core::report::{RunResult, SourceOutcome, SourceReport};
use crate::core::scanner::FileScanner;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 引擎拒绝运行的原因
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("未配置任何源目录")]
    NoSources,

    #[error("未配置任何目标目录")]
    NoDestinations,

    #[error("没有可用的目标目录: {0:?}")]
    NoUsableDestination(Vec<PathBuf>),
}

/// 同步配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 主同步最大并行源数
    pub max_workers: usize,
    /// 后台监视器同步恢复源的并行数
    pub monitor_workers: usize,
    /// 待定源的探测间隔
    pub poll_interval: Duration,
    /// 从运行开始计算的总等待预算
    pub total_budget: Duration,
    /// 多久没有新完成的源就停止等待
    pub progress_timeout: Duration,
    pub compare: CompareConfig,
    /// 每处理多少个文件保存一次缓存
    pub flush_every: usize,
    /// 判断变化时的参照目录，默认第一个目标目录
    pub reference_root: Option<PathBuf>,
    /// 是否自动创建目标目录
    pub auto_create_dir: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            monitor_workers: 2,
            poll_interval: Duration::from_secs(2),
            total_budget: Duration::from_secs(300),
            progress_timeout: Duration::from_secs(10),
            compare: CompareConfig::default(),
            flush_every: 50,
            reference_root: None,
            auto_create_dir: true,
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let engine = &settings.engine;
        Self {
            max_workers: engine.max_workers,
            monitor_workers: engine.monitor_workers,
            poll_interval: Duration::from_secs(engine.poll_interval_secs),
            total_budget: Duration::from_secs(engine.total_budget_secs),
            progress_timeout: Duration::from_secs(engine.progress_timeout_secs),
            compare: CompareConfig {
                mtime_tolerance: engine.mtime_tolerance_secs,
            },
            flush_every: engine.flush_every,
            reference_root: settings.destination.reference.clone(),
            auto_create_dir: engine.auto_create_dir,
        }
    }
}

/// 一次运行的共享状态，传给每个同步任务
struct RunContext {
    dry_run: bool,
    destinations: Vec<PathBuf>,
    reference_root: Option<PathBuf>,
    results: Mutex<HashMap<String, SourceReport>>,
    /// 已完成的源数量
    completed: watch::Sender<usize>,
    /// 停止后台监视
    stop: CancellationToken,
    cancelled: Arc<AtomicBool>,
}

impl RunContext {
    async fn record(&self, report: SourceReport) {
        let mut results = self.results.lock().await;
        results.insert(report.name.clone(), report);
        self.completed.send_replace(results.len());
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// 同步引擎
pub struct SyncEngine {
    config: EngineConfig,
    cache: FingerprintCache,
    prober: Arc<dyn Prober>,
    hasher: Arc<dyn ContentHasher>,
    scanner: FileScanner,
    cancelled: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(cache: FingerprintCache, config: EngineConfig) -> Self {
        Self {
            config,
            cache,
            prober: Arc::new(NetworkProber::default()),
            hasher: Arc::new(Blake3Hasher),
            scanner: FileScanner::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_scanner(mut self, scanner: FileScanner) -> Self {
        self.scanner = scanner;
        self
    }

    /// 取消同步：正在同步的源会完成，尚未开始的源不再处理
    ///
    /// 没有正在进行的运行时，作用于下一次运行。
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 检查是否已取消
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn reconciler(&self) -> SourceReconciler {
        SourceReconciler::new(
            self.cache.clone(),
            self.hasher.clone(),
            FileComparator::new(self.config.compare),
            self.scanner.clone(),
            self.config.flush_every,
        )
    }

    /// 运行一次完整同步
    pub async fn run(
        &self,
        sources: &[SourceConfig],
        destinations: &[PathBuf],
        dry_run: bool,
    ) -> Result<RunResult, EngineError> {
        let result = self.run_once(sources, destinations, dry_run).await;
        // 取消只对本次运行有效
        self.cancelled.store(false, Ordering::SeqCst);
        result
    }

    async fn run_once(
        &self,
        sources: &[SourceConfig],
        destinations: &[PathBuf],
        dry_run: bool,
    ) -> Result<RunResult, EngineError> {
        if sources.is_empty() {
            return Err(EngineError::NoSources);
        }
        if destinations.is_empty() {
            return Err(EngineError::NoDestinations);
        }
        let destinations = self.prepare_destinations(destinations, dry_run).await?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            "开始同步 {}: {} 个源, {} 个目标{}",
            run_id,
            sources.len(),
            destinations.len(),
            if dry_run { " (试运行)" } else { "" }
        );

        // 探测
        let checks = futures::future::join_all(sources.iter().map(|s| self.prober.probe(s))).await;
        let (ready, pending): (Vec<_>, Vec<_>) = sources
            .iter()
            .cloned()
            .zip(checks)
            .partition(|(_, available)| *available);
        let ready: Vec<SourceConfig> = ready.into_iter().map(|(s, _)| s).collect();
        let pending: Vec<SourceConfig> = pending.into_iter().map(|(s, _)| s).collect();

        for source in &pending {
            warn!("源不可用，转入后台等待: {} ({})", source.name, source.path);
        }
        info!("探测完成: {} 个可用, {} 个不可用", ready.len(), pending.len());

        let (completed, _) = watch::channel(0usize);
        let ctx = Arc::new(RunContext {
            dry_run,
            destinations,
            reference_root: self.config.reference_root.clone(),
            results: Mutex::new(HashMap::new()),
            completed,
            stop: CancellationToken::new(),
            cancelled: self.cancelled.clone(),
        });

        // 后台监视与主同步同时进行
        let monitor = if pending.is_empty() {
            None
        } else {
            Some(tokio::spawn(monitor_pending(
                ctx.clone(),
                pending,
                self.reconciler(),
                self.prober.clone(),
                self.config.poll_interval,
                self.config.monitor_workers,
            )))
        };

        self.sync_primary(&ctx, ready).await;

        if let Some(handle) = monitor {
            self.drain(&ctx, sources.len(), started).await;
            ctx.stop.cancel();
            if let Err(e) = handle.await {
                error!("后台监视任务异常退出: {}", e);
            }
        }

        // 汇总
        let mut results = std::mem::take(&mut *ctx.results.lock().await);
        let reports: Vec<SourceReport> = sources
            .iter()
            .map(|s| {
                results
                    .remove(&s.name)
                    .unwrap_or_else(|| SourceReport::empty(&s.name, &s.group, SourceOutcome::Unavailable))
            })
            .collect();

        let result = RunResult::aggregate(run_id, started_at, dry_run, reports);
        info!(
            "同步完成: 新增 {}, 修改 {}, 复制 {}, 不可用源 {}, 耗时 {:?}",
            result.totals.added,
            result.totals.modified,
            result.totals.copied,
            result.unavailable().len(),
            started.elapsed()
        );
        Ok(result)
    }

    /// 检查目标目录，按需创建；返回可用的目标
    async fn prepare_destinations(
        &self,
        destinations: &[PathBuf],
        dry_run: bool,
    ) -> Result<Vec<PathBuf>, EngineError> {
        let mut usable = Vec::new();
        for root in destinations {
            match tokio::fs::metadata(root).await {
                Ok(m) if m.is_dir() => usable.push(root.clone()),
                Ok(_) => warn!("目标路径不是目录: {:?}", root),
                Err(_) if self.config.auto_create_dir && dry_run => {
                    // 试运行不创建目录，但视为可用
                    debug!("[试运行] 目标目录将被创建: {:?}", root);
                    usable.push(root.clone());
                }
                Err(_) if self.config.auto_create_dir => match tokio::fs::create_dir_all(root).await {
                    Ok(()) => {
                        info!("已创建目标目录: {:?}", root);
                        usable.push(root.clone());
                    }
                    Err(e) => warn!("目标目录不存在且无法创建 {:?}: {}", root, e),
                },
                Err(e) => warn!("目标目录不可访问 {:?}: {}", root, e),
            }
        }

        if usable.is_empty() {
            return Err(EngineError::NoUsableDestination(destinations.to_vec()));
        }
        Ok(usable)
    }

    /// 主同步：有上限的并行任务池
    async fn sync_primary(&self, ctx: &Arc<RunContext>, ready: Vec<SourceConfig>) {
        if ready.is_empty() {
            return;
        }

        let workers = self.config.max_workers.min(ready.len()).max(1);
        debug!("主同步并行数: {}", workers);
        let semaphore = Arc::new(Semaphore::new(workers));
        let reconciler = self.reconciler();
        let mut handles: Vec<(String, String, JoinHandle<()>)> = Vec::new();

        for source in ready {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            if self.is_cancelled() {
                ctx.record(SourceReport::empty(&source.name, &source.group, SourceOutcome::Cancelled))
                    .await;
                continue;
            }

            let ctx = ctx.clone();
            let reconciler = reconciler.clone();
            let name = source.name.clone();
            let group = source.group.clone();

            let handle = tokio::spawn(async move {
                let report = reconcile_source(&reconciler, &ctx, &source, SourceOutcome::Synced).await;
                drop(permit);
                ctx.record(report).await;
            });
            handles.push((name, group, handle));
        }

        // 等待所有任务完成
        for (name, group, handle) in handles {
            if let Err(e) = handle.await {
                error!("源 {} 的同步任务异常: {}", name, e);
                ctx.record(SourceReport::empty(
                    &name,
                    &group,
                    SourceOutcome::Failed {
                        error: e.to_string(),
                    },
                ))
                .await;
            }
        }
    }

    /// 等待后台恢复的源
    ///
    /// 总预算未用完且最近 progress_timeout 内有新完成的源时继续等待。
    async fn drain(&self, ctx: &RunContext, total: usize, started: Instant) {
        let deadline = started + self.config.total_budget;
        let mut completed = ctx.completed.subscribe();

        loop {
            let done = *completed.borrow_and_update();
            if done >= total {
                info!("所有源已完成");
                return;
            }
            if self.is_cancelled() {
                info!("同步已取消，停止等待");
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("等待时间已用完，仍有 {} 个源未完成", total - done);
                return;
            }

            let window = self.config.progress_timeout.min(deadline - now);
            debug!("等待恢复中的源: 已完成 {}/{}", done, total);
            match tokio::time::timeout(window, completed.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => {
                    if Instant::now() >= deadline {
                        warn!("等待时间已用完，仍有 {} 个源未完成", total - done);
                    } else {
                        warn!(
                            "{:?} 内没有新的源完成，停止等待 ({} 个未完成)",
                            self.config.progress_timeout,
                            total - done
                        );
                    }
                    return;
                }
            }
        }
    }
}

/// 同步一个源，错误转为 Failed 报告
async fn reconcile_source(
    reconciler: &SourceReconciler,
    ctx: &RunContext,
    source: &SourceConfig,
    outcome: SourceOutcome,
) -> SourceReport {
    match reconciler
        .reconcile(
            source,
            &ctx.destinations,
            ctx.reference_root.as_deref(),
            ctx.dry_run,
        )
        .await
    {
        Ok(sync) => SourceReport {
            name: source.name.clone(),
            group: source.group.clone(),
            outcome,
            changes: sync.changes,
            stats: sync.stats,
        },
        Err(e) => {
            error!("同步源 {} 失败: {:#}", source.name, e);
            SourceReport::empty(
                &source.name,
                &source.group,
                SourceOutcome::Failed {
                    error: format!("{:#}", e),
                },
            )
        }
    }
}

/// 后台监视：定期探测待定源，恢复的源用自己的小任务池同步
async fn monitor_pending(
    ctx: Arc<RunContext>,
    mut pending: Vec<SourceConfig>,
    reconciler: SourceReconciler,
    prober: Arc<dyn Prober>,
    poll_interval: Duration,
    workers: usize,
) {
    info!("后台监视 {} 个不可用的源", pending.len());
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut running: Vec<(String, String, JoinHandle<()>)> = Vec::new();

    while !pending.is_empty() {
        tokio::select! {
            _ = ctx.stop.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
        if ctx.is_cancelled() {
            break;
        }

        let checks = futures::future::join_all(pending.iter().map(|s| prober.probe(s))).await;
        let mut still_pending = Vec::new();

        for (source, available) in pending.into_iter().zip(checks) {
            if !available || ctx.stop.is_cancelled() {
                still_pending.push(source);
                continue;
            }

            info!("源已恢复，开始同步: {}", source.name);
            let semaphore = semaphore.clone();
            let ctx = ctx.clone();
            let reconciler = reconciler.clone();
            let name = source.name.clone();
            let group = source.group.clone();

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                // 排队期间运行可能已被取消或停止等待
                if ctx.is_cancelled() {
                    ctx.record(SourceReport::empty(&source.name, &source.group, SourceOutcome::Cancelled))
                        .await;
                    return;
                }
                if ctx.stop.is_cancelled() {
                    debug!("停止等待，不再开始同步: {}", source.name);
                    return;
                }
                let report = reconcile_source(&reconciler, &ctx, &source, SourceOutcome::Recovered).await;
                ctx.record(report).await;
            });
            running.push((name, group, handle));
        }

        pending = still_pending;
    }

    if !pending.is_empty() {
        debug!("后台监视停止，{} 个源仍不可用", pending.len());
    }

    // 已经开始的同步允许完成，避免留下半个文件
    for (name, group, handle) in running {
        if let Err(e) = handle.await {
            error!("源 {} 的恢复同步任务异常: {}", name, e);
            ctx.record(SourceReport::empty(
                &name,
                &group,
                SourceOutcome::Failed {
                    error: e.to_string(),
                },
            ))
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::JsonStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// 前 n 次探测失败，之后成功
    struct FlakyProber {
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Prober for FlakyProber {
        async fn probe(&self, _source: &SourceConfig) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= self.fail_first
        }
    }

    struct NeverProber;

    #[async_trait]
    impl Prober for NeverProber {
        async fn probe(&self, _source: &SourceConfig) -> bool {
            false
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(20),
            total_budget: Duration::from_secs(5),
            progress_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    async fn engine(dir: &std::path::Path, config: EngineConfig) -> SyncEngine {
        let cache = FingerprintCache::open(Arc::new(JsonStore::new(dir.join("db.json")))).await;
        SyncEngine::new(cache, config)
    }

    fn source(name: &str, path: &std::path::Path) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            path: path.to_string_lossy().to_string(),
            group: "g".to_string(),
            mounted: true,
        }
    }

    #[tokio::test]
    async fn test_refuses_without_sources_or_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), fast_config()).await;
        let src = source("a", dir.path());

        assert!(matches!(
            engine.run(&[], &[dir.path().to_path_buf()], false).await,
            Err(EngineError::NoSources)
        ));
        assert!(matches!(
            engine.run(&[src], &[], false).await,
            Err(EngineError::NoDestinations)
        ));
    }

    #[tokio::test]
    async fn test_unusable_destination_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let engine = engine(dir.path(), fast_config()).await;
        let result = engine
            .run(&[source("a", dir.path())], &[blocker], false)
            .await;
        assert!(matches!(result, Err(EngineError::NoUsableDestination(_))));
    }

    #[tokio::test]
    async fn test_recovered_source_is_synced_by_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("late.txt"), b"late").unwrap();
        let dest = dir.path().join("dest");

        let prober = Arc::new(FlakyProber {
            fail_first: 3,
            calls: AtomicUsize::new(0),
        });
        let engine = engine(dir.path(), fast_config()).await.with_prober(prober);

        let result = engine
            .run(&[source("late", &src)], &[dest.clone()], false)
            .await
            .unwrap();

        let report = result.source("late").unwrap();
        assert_eq!(report.outcome, SourceOutcome::Recovered);
        assert_eq!(report.stats.added, 1);
        assert!(dest.join("late/late.txt").exists());
    }

    #[tokio::test]
    async fn test_drain_stops_after_progress_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest");
        let config = EngineConfig {
            total_budget: Duration::from_secs(60),
            progress_timeout: Duration::from_millis(200),
            ..fast_config()
        };
        let engine = engine(dir.path(), config).await.with_prober(Arc::new(NeverProber));

        let started = std::time::Instant::now();
        let result = engine
            .run(&[source("gone", dir.path())], &[dest], false)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.source("gone").unwrap().outcome, SourceOutcome::Unavailable);
        assert_eq!(result.totals, Default::default());
    }

    #[tokio::test]
    async fn test_drain_stops_at_total_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            total_budget: Duration::from_millis(150),
            progress_timeout: Duration::from_secs(60),
            ..fast_config()
        };
        let engine = engine(dir.path(), config).await.with_prober(Arc::new(NeverProber));

        let started = std::time::Instant::now();
        let result = engine
            .run(&[source("gone", dir.path())], &[dir.path().join("dest")], false)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.unavailable(), vec!["gone"]);
    }

    #[tokio::test]
    async fn test_failing_source_does_not_abort_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        std::fs::create_dir_all(&good).unwrap();
        std::fs::write(good.join("a.txt"), b"a").unwrap();
        let dest = dir.path().join("dest");

        // 探测器说可用，但路径根本不存在，扫描时报错
        struct YesProber;
        #[async_trait]
        impl Prober for YesProber {
            async fn probe(&self, _source: &SourceConfig) -> bool {
                true
            }
        }

        let engine = engine(dir.path(), fast_config()).await.with_prober(Arc::new(YesProber));
        let sources = vec![
            source("broken", &dir.path().join("missing")),
            source("good", &good),
        ];
        let result = engine.run(&sources, &[dest.clone()], false).await.unwrap();

        assert!(matches!(
            result.source("broken").unwrap().outcome,
            SourceOutcome::Failed { .. }
        ));
        assert_eq!(result.source("good").unwrap().stats.copied, 1);
        assert_eq!(result.totals.added, 1);
    }

    /// 每个文件都要等一会儿的哈希
    struct SlowHasher(Duration);

    impl ContentHasher for SlowHasher {
        fn hash_file(&self, path: &std::path::Path) -> std::io::Result<String> {
            std::thread::sleep(self.0);
            Blake3Hasher.hash_file(path)
        }
    }

    #[tokio::test]
    async fn test_queued_recovery_does_not_start_after_drain_stops() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest");
        let mut sources = Vec::new();
        for name in ["one", "two"] {
            let src = dir.path().join(name);
            std::fs::create_dir_all(&src).unwrap();
            std::fs::write(src.join("a.txt"), name.as_bytes()).unwrap();
            sources.push(source(name, &src));
        }

        // 初次探测两个源都失败，第一次轮询时同时恢复
        let prober = Arc::new(FlakyProber {
            fail_first: 2,
            calls: AtomicUsize::new(0),
        });
        let config = EngineConfig {
            monitor_workers: 1,
            progress_timeout: Duration::from_millis(300),
            ..fast_config()
        };
        let engine = engine(dir.path(), config)
            .await
            .with_prober(prober)
            .with_hasher(Arc::new(SlowHasher(Duration::from_millis(600))));

        let result = engine.run(&sources, &[dest], false).await.unwrap();

        let outcomes: Vec<SourceOutcome> = ["one", "two"]
            .iter()
            .map(|n| result.source(n).unwrap().outcome.clone())
            .collect();
        assert_eq!(
            outcomes.iter().filter(|o| **o == SourceOutcome::Recovered).count(),
            1
        );
        assert_eq!(
            outcomes.iter().filter(|o| **o == SourceOutcome::Unavailable).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_before_run_applies_to_that_run_only() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"a").unwrap();
        let dest = dir.path().join("dest");
        let sources = [source("s", &src)];

        let engine = engine(dir.path(), fast_config()).await;
        engine.cancel();
        let cancelled = engine.run(&sources, &[dest.clone()], false).await.unwrap();
        assert_eq!(cancelled.source("s").unwrap().outcome, SourceOutcome::Cancelled);
        assert!(!dest.join("s/a.txt").exists());

        let next = engine.run(&sources, &[dest.clone()], false).await.unwrap();
        assert_eq!(next.source("s").unwrap().outcome, SourceOutcome::Synced);
        assert!(dest.join("s/a.txt").exists());
    }
}
