use anyhow::Context;
use clap::Parser;
use sharesync_lib::logging::{LogConfig, SizeRotatingWriter};
use sharesync_lib::{App, RunResult, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "sharesync", version, about = "把网络共享目录增量镜像到本地备份目录")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// 只报告变化，不复制文件
    #[arg(long)]
    dry_run: bool,

    /// 把运行结果写入 JSON 文件
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

/// 控制台输出层，每种订阅器组合各建一个
fn console_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
}

/// 初始化日志系统
///
/// 返回的 guard 必须存活到程序结束，否则文件日志会丢失尾部。
fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy();
    if let Ok(directive) = "sqlx=warn".parse::<Directive>() {
        env_filter = env_filter.add_directive(directive);
    }

    if !config.enabled {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer())
            .try_init();
        return None;
    }

    let log_dir = config.log_dir();
    match SizeRotatingWriter::new(&log_dir, config.max_size_mb, config.backup_count) {
        Ok(file_writer) => {
            let (writer, guard) = tracing_appender::non_blocking(file_writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer())
                .try_init();
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer())
                .try_init();
            tracing::warn!("无法创建日志文件 {:?}: {}", log_dir, e);
            None
        }
    }
}

fn write_report(path: &Path, result: &RunResult) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json).with_context(|| format!("写入报告失败: {:?}", path))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    let _guard = init_logging(&settings.log);

    tracing::info!("使用配置文件: {:?}", cli.config);
    let app = Arc::new(App::new(settings).await?);

    // Ctrl+C：正在同步的源做完，其余不再开始
    {
        let app = app.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("收到中断信号，正在停止...");
                app.engine.cancel();
            }
        });
    }

    let outcome = app.run(cli.dry_run).await;
    app.cleanup().await;
    let result = outcome?;

    for (group, stats) in &result.groups {
        tracing::info!(
            "分组 {}: 新增 {}, 修改 {}, 复制 {}",
            group,
            stats.added,
            stats.modified,
            stats.copied
        );
    }
    let unavailable = result.unavailable();
    if !unavailable.is_empty() {
        tracing::warn!("以下源不可用: {}", unavailable.join(", "));
    }

    if let Some(path) = &cli.report {
        write_report(path, &result)?;
        tracing::info!("报告已写入: {:?}", path);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_writes_to_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let guard = init_logging(&config);
        assert!(guard.is_some());
        assert!(dir.path().join("sync.log").exists());

        // 已经初始化过，再次调用只是不生效
        let disabled = LogConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(init_logging(&disabled).is_none());
    }

    #[test]
    fn test_report_parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        let result = RunResult::aggregate(
            "run".to_string(),
            chrono::Utc::now(),
            false,
            Vec::new(),
        );

        write_report(&path, &result).unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["dry_run"], false);
    }
}
