use std::sync::Arc;

pub mod config;
pub mod core;
pub mod db;
pub mod logging;

pub use config::{ConfigError, Settings, SourceConfig};
pub use crate::core::{EngineConfig, EngineError, RunResult, SyncEngine};

use crate::config::CacheBackend;
use crate::core::{FileScanner, FingerprintCache, FingerprintStore, JsonStore, NetworkProber};

/// 应用状态：配置、指纹缓存和同步引擎
pub struct App {
    pub settings: Settings,
    pub cache: FingerprintCache,
    pub engine: SyncEngine,
}

impl App {
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let cache_path = settings.cache.resolved_path();
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store: Arc<dyn FingerprintStore> = match settings.cache.backend {
            CacheBackend::Json => Arc::new(JsonStore::new(&cache_path)),
            CacheBackend::Sqlite => {
                let store = db::SqliteStore::open(&cache_path).await?;
                // 第一次切换到 SQLite 时导入旧的 JSON 缓存，失败时从空缓存开始
                let legacy = cache_path.with_file_name("synced_db.json");
                if legacy.exists() && store.is_empty().await.unwrap_or(false) {
                    match db::import_json(&legacy, &store).await {
                        Ok(imported) => {
                            tracing::info!("已从 {:?} 导入 {} 条缓存记录", legacy, imported)
                        }
                        Err(e) => tracing::warn!("导入旧缓存失败 {:?}: {:#}，将重新计算", legacy, e),
                    }
                }
                Arc::new(store)
            }
        };
        tracing::debug!("指纹缓存: {}", store.name());

        let cache = FingerprintCache::open(store).await;
        let prober = NetworkProber::new(settings.engine.probe_timeout())
            .with_port(settings.engine.probe_port);
        let engine = SyncEngine::new(cache.clone(), EngineConfig::from_settings(&settings))
            .with_prober(Arc::new(prober))
            .with_scanner(FileScanner::new(&settings.scan));

        Ok(Self {
            settings,
            cache,
            engine,
        })
    }

    /// 按配置运行一次同步
    pub async fn run(&self, dry_run: bool) -> Result<RunResult, EngineError> {
        self.engine
            .run(
                &self.settings.sources,
                &self.settings.destination.paths,
                dry_run,
            )
            .await
    }

    /// 清理资源（退出前调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在保存指纹缓存...");
        self.cache.flush().await;
        tracing::info!("资源清理完成");
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }

    /// 应用数据目录（缓存、日志）
    pub fn app_dir() -> PathBuf {
        config_dir()
            .map(|p| p.join("sharesync"))
            .unwrap_or_else(|| PathBuf::from(".sharesync"))
    }
}
