//! 应用配置模块

use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("配置文件格式错误 {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("未配置任何源目录")]
    NoSources,

    #[error("未配置任何目标目录")]
    NoDestinations,

    #[error("源名称重复: {0}")]
    DuplicateSource(String),

    #[error("字段 {0} 不能为空")]
    EmptyField(String),
}

/// 一个源目录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// 根路径，可以是 \\host\share 形式的网络路径
    pub path: String,
    /// 报告分组
    #[serde(default = "default_group")]
    pub group: String,
    /// 已挂载到本地，探测时跳过主机检查
    #[serde(default)]
    pub mounted: bool,
}

fn default_group() -> String {
    "default".to_string()
}

/// 目标配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub paths: Vec<PathBuf>,
    /// 判断新增/修改时参照的根目录，默认第一个目标目录
    #[serde(default)]
    pub reference: Option<PathBuf>,
}

/// 同步引擎参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// 最大并行源数
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// 后台监视器恢复源时使用的并行数
    #[serde(default = "default_monitor_workers")]
    pub monitor_workers: usize,
    /// 不可用源的轮询间隔（秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// 等待恢复源的总时长上限（秒）
    #[serde(default = "default_total_budget")]
    pub total_budget_secs: u64,
    /// 无进展多久后停止等待（秒）
    #[serde(default = "default_progress_timeout")]
    pub progress_timeout_secs: u64,
    /// mtime 容差（秒）
    #[serde(default = "default_mtime_tolerance")]
    pub mtime_tolerance_secs: f64,
    /// 每处理多少个文件保存一次缓存
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    /// 探测超时（毫秒）
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// 主机存活检查使用的端口
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
    /// 目标目录不存在时自动创建
    #[serde(default = "default_true")]
    pub auto_create_dir: bool,
}

fn default_max_workers() -> usize {
    8
}

fn default_monitor_workers() -> usize {
    2
}

fn default_poll_interval() -> u64 {
    2
}

fn default_total_budget() -> u64 {
    300
}

fn default_progress_timeout() -> u64 {
    10
}

fn default_mtime_tolerance() -> f64 {
    2.0
}

fn default_flush_every() -> usize {
    50
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_probe_port() -> u16 {
    crate::core::probe::SMB_PORT
}

fn default_true() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            monitor_workers: default_monitor_workers(),
            poll_interval_secs: default_poll_interval(),
            total_budget_secs: default_total_budget(),
            progress_timeout_secs: default_progress_timeout(),
            mtime_tolerance_secs: default_mtime_tolerance(),
            flush_every: default_flush_every(),
            probe_timeout_ms: default_probe_timeout(),
            probe_port: default_probe_port(),
            auto_create_dir: true,
        }
    }
}

impl EngineSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// 缓存后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Json,
    Sqlite,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_backend")]
    pub backend: CacheBackend,
    /// 缓存文件位置，默认放在应用数据目录
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_backend() -> CacheBackend {
    CacheBackend::Json
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

impl CacheConfig {
    /// 实际使用的缓存文件路径
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        let file = match self.backend {
            CacheBackend::Json => "synced_db.json",
            CacheBackend::Sqlite => "synced_db.sqlite3",
        };
        crate::dirs::app_dir().join(file)
    }
}

/// 扫描配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// 最大文件大小（0 表示不限制）
    #[serde(default)]
    pub max_file_size: u64,
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "Thumbs.db".to_string(),
        ".DS_Store".to_string(),
        "~$*".to_string(),
        "*.tmp".to_string(),
    ]
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            max_file_size: 0,
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub sources: Vec<SourceConfig>,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub log: LogConfig,
}

impl Settings {
    /// 从 YAML 文件加载并校验
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// 校验：至少一个源和一个目标，源名称唯一且非空
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.destination.paths.is_empty() {
            return Err(ConfigError::NoDestinations);
        }

        let mut seen = HashSet::new();
        for (i, source) in self.sources.iter().enumerate() {
            if source.name.trim().is_empty() {
                return Err(ConfigError::EmptyField(format!("sources[{}].name", i)));
            }
            if source.path.trim().is_empty() {
                return Err(ConfigError::EmptyField(format!("sources[{}].path", i)));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
        }

        for (i, dest) in self.destination.paths.iter().enumerate() {
            if dest.as_os_str().is_empty() {
                return Err(ConfigError::EmptyField(format!("destination.paths[{}]", i)));
            }
        }
        Ok(())
    }
}
