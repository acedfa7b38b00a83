use crate::core::file_state::{mtime_secs, ContentHasher, Fingerprint, LiveMeta};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// 变化类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// 参照目录中不存在
    Added,
    /// 参照目录中存在但内容不同
    Modified,
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeStatus::Added => write!(f, "added"),
            ChangeStatus::Modified => write!(f, "modified"),
        }
    }
}

/// 比较配置
#[derive(Debug, Clone, Copy)]
pub struct CompareConfig {
    /// 时间容差（秒），吸收网络文件系统的时间精度和时钟偏差
    pub mtime_tolerance: f64,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            mtime_tolerance: 2.0,
        }
    }
}

/// 文件比较器
#[derive(Debug, Clone, Copy, Default)]
pub struct FileComparator {
    config: CompareConfig,
}

impl FileComparator {
    pub fn new(config: CompareConfig) -> Self {
        Self { config }
    }

    /// 元数据是否一致：大小相同且时间差在容差内
    pub fn same_meta(&self, a: LiveMeta, b: LiveMeta) -> bool {
        a.size == b.size && (a.mtime - b.mtime).abs() <= self.config.mtime_tolerance
    }

    /// 快速路径：缓存记录与实时元数据一致时可以直接复用缓存的 hash
    ///
    /// 容差内的改动（同大小、时间差小于容差）会被当作未变化，这是接受的代价。
    pub fn cached_hash<'a>(&self, cached: Option<&'a Fingerprint>, live: LiveMeta) -> Option<&'a str> {
        let cached = cached?;
        let cached_meta = LiveMeta {
            mtime: cached.mtime,
            size: cached.size,
        };
        self.same_meta(cached_meta, live).then_some(cached.hash.as_str())
    }

    /// 与参照文件比较，返回 None 表示无需复制
    ///
    /// 复制时保留了 mtime，所以参照文件元数据与源一致时不再读取它。
    /// 参照文件无法读取时按“不同”处理，强制重新复制。
    pub fn classify(
        &self,
        reference: &Path,
        live: LiveMeta,
        source_hash: &str,
        hasher: &dyn ContentHasher,
    ) -> Option<ChangeStatus> {
        let metadata = match std::fs::metadata(reference) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Some(ChangeStatus::Modified),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Some(ChangeStatus::Added),
            Err(e) => {
                debug!("无法读取参照文件 {:?}: {}", reference, e);
                return Some(ChangeStatus::Modified);
            }
        };

        let reference_meta = LiveMeta {
            mtime: mtime_secs(&metadata),
            size: metadata.len(),
        };
        if self.same_meta(reference_meta, live) {
            return None;
        }
        if reference_meta.size != live.size {
            return Some(ChangeStatus::Modified);
        }

        match hasher.hash_file(reference) {
            Ok(hash) if hash == source_hash => None,
            Ok(_) => Some(ChangeStatus::Modified),
            Err(e) => {
                debug!("参照文件哈希失败 {:?}: {}", reference, e);
                Some(ChangeStatus::Modified)
            }
        }
    }
}
