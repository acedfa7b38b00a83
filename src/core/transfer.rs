//! 文件复制 - 把一个源文件写到所有目标目录

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// 一个文件的复制结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

impl CopyOutcome {
    /// 至少成功写入了一个目标
    pub fn any_copied(&self) -> bool {
        self.succeeded > 0
    }
}

/// 目标文件路径：<目标根>/<源名称>/<相对路径>
pub fn target_path(dest_root: &Path, source_name: &str, relative: &Path) -> PathBuf {
    dest_root.join(source_name).join(relative)
}

/// 复制到每个目标，单个目标失败不影响其余目标
pub fn copy_to_all(source_file: &Path, targets: &[PathBuf]) -> CopyOutcome {
    let mut outcome = CopyOutcome::default();
    for target in targets {
        match copy_preserving_mtime(source_file, target) {
            Ok(bytes) => {
                debug!("已复制 {:?} -> {:?} ({} 字节)", source_file, target, bytes);
                outcome.succeeded += 1;
            }
            Err(e) => {
                warn!("复制失败 {:?} -> {:?}: {}", source_file, target, e);
                outcome.failed += 1;
            }
        }
    }
    outcome
}

/// 复制单个文件并保留修改时间
///
/// 先写同目录下的临时文件再重命名，中断时不会留下半个文件。
pub fn copy_preserving_mtime(source_file: &Path, target: &Path) -> io::Result<u64> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "目标路径没有父目录"))?;
    fs::create_dir_all(parent)?;

    let mut input = File::open(source_file)?;
    let metadata = input.metadata()?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    let bytes = io::copy(&mut input, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;

    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    let atime = filetime::FileTime::from_last_access_time(&metadata);
    filetime::set_file_handle_times(tmp.as_file(), Some(atime), Some(mtime))?;
    fs::set_permissions(tmp.path(), metadata.permissions())?;

    tmp.persist(target).map_err(|e| e.error)?;
    Ok(bytes)
}
