//! 文件指纹 - 用于增量同步

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path};
use std::time::UNIX_EPOCH;

/// 流式哈希的分块大小
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// 文件指纹记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// 内容摘要（BLAKE3 十六进制）
    pub hash: String,
    /// 修改时间（Unix 秒，带小数）
    pub mtime: f64,
    /// 文件大小（字节）
    pub size: u64,
}

/// 文件的实时元数据（快速检查用）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveMeta {
    pub mtime: f64,
    pub size: u64,
}

impl LiveMeta {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            mtime: mtime_secs(metadata),
            size: metadata.len(),
        }
    }
}

/// 修改时间转换为浮点秒，早于 1970 的时间返回负值
pub fn mtime_secs(metadata: &std::fs::Metadata) -> f64 {
    match metadata.modified() {
        Ok(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs_f64(),
            Err(e) => -e.duration().as_secs_f64(),
        },
        Err(_) => 0.0,
    }
}

/// 生成缓存键：与分隔符风格、大小写、根路径写法无关
///
/// `Docs\Report.TXT`、`docs/report.txt`、`./docs//report.txt` 得到同一个键。
pub fn path_key(relative: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                // Linux 上反斜杠不是分隔符，但源可能来自 Windows 共享
                for piece in part.to_string_lossy().split('\\') {
                    if !piece.is_empty() && piece != "." {
                        parts.push(piece.to_lowercase());
                    }
                }
            }
            Component::ParentDir => parts.push("..".to_string()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}

/// 用于展示的相对路径（保留大小写，统一使用 /）
pub fn display_path(relative: &Path) -> String {
    relative.to_string_lossy().replace('\\', "/")
}

/// 内容哈希接口，测试中可替换为计数实现
pub trait ContentHasher: Send + Sync {
    fn hash_file(&self, path: &Path) -> io::Result<String>;
}

/// 默认哈希实现：分块流式 BLAKE3
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn hash_file(&self, path: &Path) -> io::Result<String> {
        hash_file(path)
    }
}

/// 计算文件内容的 hash，内存占用与文件大小无关
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

/// 从任意读取器计算 hash
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
