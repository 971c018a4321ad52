/*
 * SwiftProbe - メモリプロファイル集計
 *
 * 定期的なヒープスナップショットを割り当て箇所ごとに記録し、
 * 連続するスナップショット間の増加量からリークの疑いを判定します。
 */

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Bottleneck, ProfileSummary, Recommendation, Severity};
use crate::adapter::ProfileEvent;

/// これを超える増加量はリークの疑い（Medium）
pub const LEAK_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// これを超える増加量は High
pub const HIGH_LEAK_BYTES: u64 = 10 * 1024 * 1024;

/// 1回分のヒープスナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapSnapshot {
    pub index: u64,
    pub total_bytes: u64,
    /// 割り当て箇所 → バイト数
    pub sites: BTreeMap<String, u64>,
}

/// リークの疑いがある割り当て箇所
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakSuspect {
    pub site: String,
    pub from_snapshot: u64,
    pub to_snapshot: u64,
    pub delta_bytes: u64,
    pub severity: Severity,
}

pub fn leak_severity(delta: u64) -> Option<Severity> {
    if delta > HIGH_LEAK_BYTES {
        Some(Severity::High)
    } else if delta > LEAK_THRESHOLD_BYTES {
        Some(Severity::Medium)
    } else {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryAggregator {
    snapshots: BTreeMap<u64, BTreeMap<String, u64>>,
}

impl MemoryAggregator {
    pub fn record(&mut self, event: &ProfileEvent) {
        if let ProfileEvent::HeapSample { snapshot, site, bytes } = event {
            let sites = self.snapshots.entry(*snapshot).or_default();
            *sites.entry(site.clone()).or_insert(0) += bytes;
        }
    }

    /// 次に使うスナップショット番号
    pub fn next_index(&self) -> u64 {
        self.snapshots.keys().next_back().map_or(0, |last| last + 1)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn analyze(&self, top_n: usize) -> (Vec<HeapSnapshot>, Vec<LeakSuspect>, ProfileSummary) {
        let snapshots: Vec<HeapSnapshot> = self
            .snapshots
            .iter()
            .map(|(index, sites)| HeapSnapshot {
                index: *index,
                total_bytes: sites.values().sum(),
                sites: sites.clone(),
            })
            .collect();

        let mut leaks = Vec::new();
        for pair in snapshots.windows(2) {
            let (before, after) = (&pair[0], &pair[1]);
            for (site, bytes) in &after.sites {
                let previous = before.sites.get(site).copied().unwrap_or(0);
                let delta = bytes.saturating_sub(previous);
                if let Some(severity) = leak_severity(delta) {
                    leaks.push(LeakSuspect {
                        site: site.clone(),
                        from_snapshot: before.index,
                        to_snapshot: after.index,
                        delta_bytes: delta,
                        severity,
                    });
                }
            }
        }
        leaks.sort_by(|a, b| b.delta_bytes.cmp(&a.delta_bytes).then_with(|| a.site.cmp(&b.site)));

        let bottlenecks: Vec<Bottleneck> = leaks
            .iter()
            .take(top_n)
            .map(|leak| Bottleneck {
                name: leak.site.clone(),
                severity: leak.severity,
                value: leak.delta_bytes as f64,
                description: format!(
                    "スナップショット {} → {} で {} バイト増加",
                    leak.from_snapshot, leak.to_snapshot, leak.delta_bytes
                ),
            })
            .collect();

        let recommendations = bottlenecks
            .iter()
            .map(|b| Recommendation {
                severity: b.severity,
                target: b.name.clone(),
                message: format!("{} でメモリリークの可能性があります ({})", b.name, b.description),
            })
            .collect();

        let mut metrics = BTreeMap::new();
        metrics.insert("snapshots".to_string(), snapshots.len() as f64);
        metrics.insert(
            "peak_bytes".to_string(),
            snapshots.iter().map(|s| s.total_bytes).max().unwrap_or(0) as f64,
        );
        let first = snapshots.first().map_or(0, |s| s.total_bytes);
        let last = snapshots.last().map_or(0, |s| s.total_bytes);
        metrics.insert("final_bytes".to_string(), last as f64);
        metrics.insert("growth_bytes".to_string(), last as f64 - first as f64);
        metrics.insert("leak_suspects".to_string(), leaks.len() as f64);

        (
            snapshots,
            leaks,
            ProfileSummary {
                bottlenecks,
                recommendations,
                metrics,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn sample(snapshot: u64, site: &str, bytes: u64) -> ProfileEvent {
        ProfileEvent::HeapSample {
            snapshot,
            site: site.to_string(),
            bytes,
        }
    }

    #[test]
    fn test_leak_thresholds() {
        assert_eq!(leak_severity(MIB), None);
        assert_eq!(leak_severity(MIB + 1), Some(Severity::Medium));
        assert_eq!(leak_severity(10 * MIB), Some(Severity::Medium));
        assert_eq!(leak_severity(10 * MIB + 1), Some(Severity::High));
    }

    #[test]
    fn test_consecutive_diffs() {
        let mut memory = MemoryAggregator::default();
        memory.record(&sample(0, "cache.py:10", MIB));
        memory.record(&sample(0, "io.py:3", 100));
        memory.record(&sample(1, "cache.py:10", 3 * MIB));
        memory.record(&sample(1, "io.py:3", 50));
        memory.record(&sample(2, "cache.py:10", 15 * MIB));
        memory.record(&sample(2, "new.py:1", 2 * MIB));

        let (snapshots, leaks, summary) = memory.analyze(10);
        assert_eq!(snapshots.len(), 3);
        assert_eq!(memory.next_index(), 3);

        // 12 MiB (1→2), 2 MiB (1→2, 新規), 2 MiB (0→1)
        assert_eq!(leaks.len(), 3);
        assert_eq!(leaks[0].site, "cache.py:10");
        assert_eq!(leaks[0].severity, Severity::High);
        assert_eq!((leaks[0].from_snapshot, leaks[0].to_snapshot), (1, 2));
        assert!(leaks.iter().all(|l| l.site != "io.py:3"));

        assert_eq!(summary.recommendations.len(), 3);
        assert_eq!(summary.metrics["peak_bytes"], (17 * MIB) as f64);
    }

    #[test]
    fn test_single_snapshot_has_no_leaks() {
        let mut memory = MemoryAggregator::default();
        memory.record(&sample(0, "a.py:1", 50 * MIB));
        let (_, leaks, summary) = memory.analyze(10);
        assert!(leaks.is_empty());
        assert!(summary.bottlenecks.is_empty());
        assert_eq!(summary.metrics["growth_bytes"], 0.0);
    }
}
