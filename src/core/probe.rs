//! 源可用性探测
//!
//! 对一个已经断开的 SMB 主机直接访问路径，系统会一直阻塞到 socket 超时（几十秒）。
//! 所以先对主机做一次有超时的 TCP 连接，主机不可达就直接返回，不触碰文件系统。

use crate::config::SourceConfig;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// SMB 默认端口
pub const SMB_PORT: u16 = 445;

/// 可用性探测接口
#[async_trait]
pub trait Prober: Send + Sync {
    /// 源当前是否可以访问（快速、无副作用）
    async fn probe(&self, source: &SourceConfig) -> bool;
}

/// 从网络路径中提取主机名
///
/// 支持 `\\host\share`、`//host/share` 和 `smb://host/share`；本地路径返回 None。
pub fn host_of(root: &str) -> Option<&str> {
    let rest = if let Some(r) = root.strip_prefix("smb://") {
        r
    } else if root.starts_with("\\\\") || root.starts_with("//") {
        &root[2..]
    } else {
        return None;
    };

    let host = rest.split(['\\', '/']).next()?;
    // \\?\C:\... 是 Windows 的长路径前缀，不是网络主机
    if host.is_empty() || host == "?" || host == "." {
        return None;
    }
    Some(host)
}

/// 默认探测器：主机存活检查 + 路径存在检查
#[derive(Debug, Clone)]
pub struct NetworkProber {
    timeout: Duration,
    port: u16,
}

impl NetworkProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            port: SMB_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 主机在超时内能否建立 TCP 连接（DNS 解析也计入超时）
    pub async fn host_alive(&self, host: &str) -> bool {
        let addr = format!("{}:{}", host, self.port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("主机 {} 不可达: {}", addr, e);
                false
            }
            Err(_) => {
                debug!("主机 {} 连接超时 ({:?})", addr, self.timeout);
                false
            }
        }
    }

    /// 路径在超时内是否存在且为目录
    pub async fn path_exists(&self, root: &str) -> bool {
        let path = Path::new(root).to_path_buf();
        match tokio::time::timeout(self.timeout, tokio::fs::metadata(&path)).await {
            Ok(Ok(metadata)) => metadata.is_dir(),
            Ok(Err(e)) => {
                debug!("路径不可访问 {:?}: {}", path, e);
                false
            }
            Err(_) => {
                debug!("检查路径超时 {:?}", path);
                false
            }
        }
    }
}

impl Default for NetworkProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, source: &SourceConfig) -> bool {
        if !source.mounted {
            if let Some(host) = host_of(&source.path) {
                if !self.host_alive(host).await {
                    return false;
                }
            }
        }
        self.path_exists(&source.path).await
    }
}
