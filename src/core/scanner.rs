use crate::config::ScanSettings;
use crate::core::file_state::LiveMeta;
use anyhow::{anyhow, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 扫描到的文件
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// 完整路径
    pub path: PathBuf,
    /// 相对源根目录的路径
    pub relative: PathBuf,
    pub meta: LiveMeta,
}

/// 扫描结果
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub files: Vec<ScannedFile>,
    pub excluded: usize,
    /// 无法读取的目录或文件（相对路径，空路径表示根目录）
    ///
    /// 这些路径下缓存中的文件不能当作已删除。
    pub unreadable: Vec<PathBuf>,
}

/// 编译后的排除规则
#[derive(Debug, Clone)]
enum Pattern {
    /// dir/** 形式：前缀匹配
    Prefix(String),
    /// 含 * 的通配符
    Glob(Regex),
    /// 精确匹配文件名或相对路径
    Exact(String),
}

/// 文件扫描器
#[derive(Debug, Clone)]
pub struct FileScanner {
    patterns: Vec<Pattern>,
    max_file_size: u64,
}

impl FileScanner {
    pub fn new(settings: &ScanSettings) -> Self {
        let patterns = settings
            .exclude_patterns
            .iter()
            .filter_map(|p| Self::compile(p))
            .collect();
        Self {
            patterns,
            max_file_size: settings.max_file_size,
        }
    }

    fn compile(pattern: &str) -> Option<Pattern> {
        let pattern = pattern.to_lowercase().replace('\\', "/");
        if pattern.is_empty() {
            return None;
        }

        // 处理 ** 通配符
        if let Some(prefix) = pattern.strip_suffix("/**") {
            return Some(Pattern::Prefix(format!("{}/", prefix)));
        }

        // 处理 * 通配符
        if pattern.contains('*') {
            let regex_pattern = regex::escape(&pattern).replace("\\*", ".*");
            return match Regex::new(&format!("^{}$", regex_pattern)) {
                Ok(re) => Some(Pattern::Glob(re)),
                Err(e) => {
                    warn!("无效的排除规则 {}: {}", pattern, e);
                    None
                }
            };
        }

        Some(Pattern::Exact(pattern))
    }

    /// 检查路径是否应该被排除（相对路径，/ 分隔）
    pub fn should_exclude(&self, relative: &str) -> bool {
        let path = relative.to_lowercase();
        let name = path.rsplit('/').next().unwrap_or(&path);

        self.patterns.iter().any(|pattern| match pattern {
            Pattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Pattern::Glob(re) => re.is_match(name) || re.is_match(&path),
            Pattern::Exact(exact) => name == exact || path == *exact,
        })
    }

    /// 递归列出源目录中的所有文件（阻塞调用）
    pub fn scan_blocking(&self, root: &Path) -> Result<ScanOutcome> {
        if !root.is_dir() {
            return Err(anyhow!("源目录不可访问: {:?}", root));
        }

        let mut outcome = ScanOutcome::default();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("读取目录项失败: {}", e);
                    let relative = e
                        .path()
                        .and_then(|p| p.strip_prefix(root).ok())
                        .map(Path::to_path_buf)
                        .unwrap_or_default();
                    outcome.unreadable.push(relative);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let relative = match entry.path().strip_prefix(root) {
                Ok(r) => r.to_path_buf(),
                Err(_) => continue,
            };

            let relative_str = relative.to_string_lossy().replace('\\', "/");
            if self.should_exclude(&relative_str) {
                debug!("排除文件: {}", relative_str);
                outcome.excluded += 1;
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("获取元数据失败 {}: {}", relative_str, e);
                    outcome.unreadable.push(relative);
                    continue;
                }
            };

            // 检查文件大小
            if self.max_file_size > 0 && metadata.len() > self.max_file_size {
                debug!("跳过大文件: {} ({})", relative_str, metadata.len());
                outcome.excluded += 1;
                continue;
            }

            outcome.files.push(ScannedFile {
                path: entry.path().to_path_buf(),
                relative,
                meta: LiveMeta::from_metadata(&metadata),
            });
        }

        info!(
            "扫描完成 {:?}: {} 个文件, {} 个被排除, {} 个无法读取",
            root,
            outcome.files.len(),
            outcome.excluded,
            outcome.unreadable.len()
        );

        Ok(outcome)
    }

    /// 在阻塞线程池中扫描
    pub async fn scan(&self, root: PathBuf) -> Result<ScanOutcome> {
        let scanner = self.clone();
        tokio::task::spawn_blocking(move || scanner.scan_blocking(&root)).await?
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new(&ScanSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scanner(patterns: &[&str]) -> FileScanner {
        FileScanner::new(&ScanSettings {
            exclude_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            max_file_size: 0,
        })
    }

    #[test]
    fn test_exclude_patterns() {
        let s = scanner(&["Thumbs.db", "~$*", "*.tmp", ".git/**"]);
        assert!(s.should_exclude("photos/thumbs.db"));
        assert!(s.should_exclude("docs/~$report.docx"));
        assert!(s.should_exclude("build/out.TMP"));
        assert!(s.should_exclude(".git/objects/ab"));
        assert!(!s.should_exclude("docs/report.docx"));
        assert!(!s.should_exclude("tmp/file.txt"));
    }

    #[test]
    fn test_scan_lists_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.txt"), b"1").unwrap();
        fs::write(dir.path().join("a/b/deep.txt"), b"22").unwrap();
        fs::write(dir.path().join("a/skip.tmp"), b"333").unwrap();

        let outcome = FileScanner::default().scan_blocking(dir.path()).unwrap();
        let mut names: Vec<String> = outcome
            .files
            .iter()
            .map(|f| f.relative.to_string_lossy().replace('\\', "/"))
            .collect();
        names.sort();

        assert_eq!(names, vec!["a/b/deep.txt", "top.txt"]);
        assert_eq!(outcome.excluded, 1);
        let deep = outcome
            .files
            .iter()
            .find(|f| f.relative.ends_with("deep.txt"))
            .unwrap();
        assert_eq!(deep.meta.size, 2);
    }

    #[test]
    fn test_max_file_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("small.bin"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("large.bin"), vec![0u8; 1000]).unwrap();

        let s = FileScanner::new(&ScanSettings {
            exclude_patterns: vec![],
            max_file_size: 100,
        });
        let outcome = s.scan_blocking(dir.path()).unwrap();
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.excluded, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), b"1").unwrap();
        fs::write(dir.path().join("top.txt"), b"2").unwrap();

        let sub = dir.path().join("sub");
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&sub).is_ok() {
            // 以 root 运行时权限不起作用
            fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let outcome = FileScanner::default().scan_blocking(dir.path()).unwrap();
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.unreadable, vec![PathBuf::from("sub")]);
    }

    #[test]
    fn test_missing_root_is_error() {
        assert!(FileScanner::default()
            .scan_blocking(Path::new("/no/such/source"))
            .is_err());
    }
}
