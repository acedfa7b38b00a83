//! 日志模块 - 提供文件日志和大小管理功能

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// 日志文件名
pub const LOG_FILE_NAME: &str = "sync.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用文件日志
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 保留的轮转文件数
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志目录，默认在应用数据目录下的 logs
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_backup_count() -> u32 {
    2
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            backup_count: default_backup_count(),
            level: default_level(),
            dir: None,
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    /// 日志目录
    pub fn log_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| crate::dirs::app_dir().join("logs"))
    }
}

/// 带大小限制的日志写入器
///
/// 超过上限时 sync.log -> sync.log.1 -> sync.log.2 ...，只保留 backup_count 个旧文件。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    backup_count: u32,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32, backup_count: u32) -> io::Result<Self> {
        Self::with_max_bytes(log_dir, (max_size_mb as u64) * 1024 * 1024, backup_count)
    }

    pub fn with_max_bytes(log_dir: &Path, max_size: u64, backup_count: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let mut writer = Self {
            file_path: log_dir.join(LOG_FILE_NAME),
            max_size,
            backup_count,
            written: 0,
            writer: None,
        };

        // 现有文件已超限则先轮转
        let existing = fs::metadata(&writer.file_path).map(|m| m.len()).unwrap_or(0);
        if existing >= max_size {
            writer.rotate()?;
        } else {
            writer.open(existing)?;
        }
        Ok(writer)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open(&mut self, existing: u64) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.writer = Some(BufWriter::new(file));
        self.written = existing;
        Ok(())
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        let mut name = self.file_path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    /// 轮转日志文件
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }

        if self.backup_count == 0 {
            if self.file_path.exists() {
                fs::remove_file(&self.file_path)?;
            }
        } else {
            let oldest = self.backup_path(self.backup_count);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for index in (1..self.backup_count).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            if self.file_path.exists() {
                fs::rename(&self.file_path, self.backup_path(1))?;
            }
        }

        self.open(0)
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Writer not available"))?;
        let n = writer.write(buf)?;
        writer.flush()?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        let mut config = LogConfig::default();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
        config.level = "DEBUG".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        config.level = "nonsense".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_rotation_keeps_backup_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::with_max_bytes(dir.path(), 100, 2).unwrap();

        let line = [b'x'; 60];
        for _ in 0..6 {
            writer.write_all(&line).unwrap();
        }
        writer.flush().unwrap();

        let log = dir.path().join(LOG_FILE_NAME);
        assert!(log.exists());
        assert!(dir.path().join("sync.log.1").exists());
        assert!(dir.path().join("sync.log.2").exists());
        assert!(!dir.path().join("sync.log.3").exists());
        assert!(fs::metadata(&log).unwrap().len() <= 100);
    }

    #[test]
    fn test_oversized_existing_file_rotates_on_open() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE_NAME), vec![b'y'; 500]).unwrap();

        let writer = SizeRotatingWriter::with_max_bytes(dir.path(), 100, 1).unwrap();
        assert_eq!(fs::metadata(writer.file_path()).unwrap().len(), 0);
        assert_eq!(fs::metadata(dir.path().join("sync.log.1")).unwrap().len(), 500);
    }
}
