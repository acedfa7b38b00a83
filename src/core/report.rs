//! 运行结果：每个源的变化列表和统计，以及按分组和全局的汇总

use crate::core::comparator::ChangeStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::AddAssign;

/// 一个变化的文件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    /// 相对路径（/ 分隔）
    pub path: String,
    pub status: ChangeStatus,
    pub size: u64,
    pub mtime: f64,
}

/// 统计计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub added: u64,
    pub modified: u64,
    /// 至少复制到一个目标的文件数（不按目标数重复计算）
    pub copied: u64,
    pub scanned: u64,
    /// 读取失败而跳过的文件
    pub skipped: u64,
    /// 失败的单个目标写入次数
    pub copy_failures: u64,
}

impl AddAssign for SyncStats {
    fn add_assign(&mut self, other: Self) {
        self.added += other.added;
        self.modified += other.modified;
        self.copied += other.copied;
        self.scanned += other.scanned;
        self.skipped += other.skipped;
        self.copy_failures += other.copy_failures;
    }
}

/// 源的最终状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SourceOutcome {
    /// 首轮即可访问并完成同步
    Synced,
    /// 首轮不可访问，等待期间恢复并完成同步
    Recovered,
    /// 直到等待结束都不可访问
    Unavailable,
    /// 同步过程中出错
    Failed { error: String },
    /// 运行被取消，未处理
    Cancelled,
}

impl SourceOutcome {
    /// 是否完成了同步
    pub fn is_done(&self) -> bool {
        matches!(self, SourceOutcome::Synced | SourceOutcome::Recovered)
    }
}

/// 单个源的报告
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub group: String,
    pub outcome: SourceOutcome,
    pub changes: Vec<Change>,
    pub stats: SyncStats,
}

impl SourceReport {
    /// 没有结果的源（不可达、失败或取消），统计全为零
    pub fn empty(name: &str, group: &str, outcome: SourceOutcome) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            outcome,
            changes: Vec::new(),
            stats: SyncStats::default(),
        }
    }
}

/// 一次运行的完整结果
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    /// 按源名称排序
    pub sources: BTreeMap<String, SourceReport>,
    pub groups: BTreeMap<String, SyncStats>,
    pub totals: SyncStats,
}

impl RunResult {
    /// 汇总各源报告，与报告的先后顺序无关
    pub fn aggregate(
        run_id: String,
        started_at: DateTime<Utc>,
        dry_run: bool,
        reports: impl IntoIterator<Item = SourceReport>,
    ) -> Self {
        let mut sources = BTreeMap::new();
        let mut groups: BTreeMap<String, SyncStats> = BTreeMap::new();
        let mut totals = SyncStats::default();

        for report in reports {
            *groups.entry(report.group.clone()).or_default() += report.stats;
            totals += report.stats;
            sources.insert(report.name.clone(), report);
        }

        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run,
            sources,
            groups,
            totals,
        }
    }

    pub fn source(&self, name: &str) -> Option<&SourceReport> {
        self.sources.get(name)
    }

    /// 不可达的源名称
    pub fn unavailable(&self) -> Vec<&str> {
        self.sources
            .values()
            .filter(|r| r.outcome == SourceOutcome::Unavailable)
            .map(|r| r.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, group: &str, added: u64, copied: u64) -> SourceReport {
        SourceReport {
            name: name.to_string(),
            group: group.to_string(),
            outcome: SourceOutcome::Synced,
            changes: Vec::new(),
            stats: SyncStats {
                added,
                copied,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_aggregate_by_group_is_order_independent() {
        let reports = vec![
            report("a", "shop", 1, 1),
            report("b", "shop", 2, 2),
            report("c", "office", 5, 4),
        ];
        let mut reversed = reports.clone();
        reversed.reverse();

        let one = RunResult::aggregate("r".into(), Utc::now(), false, reports);
        let two = RunResult::aggregate("r".into(), Utc::now(), false, reversed);

        assert_eq!(one.groups, two.groups);
        assert_eq!(one.totals, two.totals);
        assert_eq!(one.groups["shop"].added, 3);
        assert_eq!(one.groups["office"].copied, 4);
        assert_eq!(one.totals.added, 8);
    }

    #[test]
    fn test_unavailable_distinct_from_unchanged() {
        let reports = vec![
            report("quiet", "g", 0, 0),
            SourceReport::empty("gone", "g", SourceOutcome::Unavailable),
        ];
        let result = RunResult::aggregate("r".into(), Utc::now(), false, reports);

        assert_eq!(result.unavailable(), vec!["gone"]);
        assert!(result.source("quiet").unwrap().outcome.is_done());
        assert_eq!(result.source("gone").unwrap().stats, SyncStats::default());
    }
}
