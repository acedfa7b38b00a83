use crate::core::file_state::Fingerprint;

/// file_cache 表的一行
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileCacheRow {
    pub source_name: String,
    pub file_key: String,
    pub hash: Option<String>,
    pub mtime: Option<f64>,
    pub size: Option<i64>,
}

impl FileCacheRow {
    /// 转换为指纹；缺少 hash 的旧数据返回 None
    pub fn into_entry(self) -> Option<(String, String, Fingerprint)> {
        let hash = self.hash?;
        Some((
            self.source_name,
            self.file_key,
            Fingerprint {
                hash,
                mtime: self.mtime.unwrap_or(0.0),
                size: self.size.unwrap_or(0).max(0) as u64,
            },
        ))
    }
}
