/*
 * SwiftProbe - CPUプロファイル集計
 *
 * 関数単位（CPU）と行単位（LineLevel）の呼び出し回数と累積時間を集計し、
 * 累積時間の降順でボトルネックを判定します。
 */

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Bottleneck, ProfileSummary, Recommendation, Severity};
use crate::adapter::ProfileEvent;

/// これを超える累積時間は High
pub const HIGH_CUMULATIVE: Duration = Duration::from_secs(1);

/// これを超える累積時間は Medium
pub const MEDIUM_CUMULATIVE: Duration = Duration::from_millis(100);

/// 関数ごとの集計値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProfile {
    pub function: String,
    pub calls: u64,
    pub cumulative_us: u64,
}

/// 行ごとの集計値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineProfile {
    pub file_path: PathBuf,
    pub line: usize,
    pub hits: u64,
    pub total_us: u64,
}

pub fn severity_for(cumulative: Duration) -> Severity {
    if cumulative > HIGH_CUMULATIVE {
        Severity::High
    } else if cumulative > MEDIUM_CUMULATIVE {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn as_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn format_us(us: u64) -> String {
    if us >= 1_000_000 {
        format!("{:.2}s", us as f64 / 1e6)
    } else {
        format!("{:.1}ms", us as f64 / 1e3)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CpuAggregator {
    functions: HashMap<String, FunctionProfile>,
}

impl CpuAggregator {
    pub fn record(&mut self, event: &ProfileEvent) {
        match event {
            ProfileEvent::Call { function, elapsed, .. } => self.add(function, 1, *elapsed),
            ProfileEvent::FunctionStats {
                function,
                calls,
                cumulative,
            } => self.add(function, *calls, *cumulative),
            _ => {}
        }
    }

    fn add(&mut self, function: &str, calls: u64, elapsed: Duration) {
        let entry = self
            .functions
            .entry(function.to_string())
            .or_insert_with(|| FunctionProfile {
                function: function.to_string(),
                calls: 0,
                cumulative_us: 0,
            });
        entry.calls = entry.calls.saturating_add(calls);
        entry.cumulative_us = entry.cumulative_us.saturating_add(as_micros(elapsed));
    }

    /// 累積時間の降順（同値は関数名順）
    pub fn ranked(&self) -> Vec<FunctionProfile> {
        let mut functions: Vec<FunctionProfile> = self.functions.values().cloned().collect();
        functions.sort_by(|a, b| {
            b.cumulative_us
                .cmp(&a.cumulative_us)
                .then_with(|| a.function.cmp(&b.function))
        });
        functions
    }

    pub fn analyze(&self, top_n: usize) -> (Vec<FunctionProfile>, ProfileSummary) {
        let ranked = self.ranked();

        let bottlenecks: Vec<Bottleneck> = ranked
            .iter()
            .take(top_n)
            .map(|f| Bottleneck {
                name: f.function.clone(),
                severity: severity_for(Duration::from_micros(f.cumulative_us)),
                value: f.cumulative_us as f64 / 1e3,
                description: format!("累積 {} / {} 回", format_us(f.cumulative_us), f.calls),
            })
            .collect();

        let recommendations = bottlenecks
            .iter()
            .filter(|b| b.severity >= Severity::Medium)
            .map(|b| Recommendation {
                severity: b.severity,
                target: b.name.clone(),
                message: format!("{} の処理時間が大きいため最適化を検討してください ({})", b.name, b.description),
            })
            .collect();

        let mut metrics = BTreeMap::new();
        metrics.insert("functions".to_string(), ranked.len() as f64);
        metrics.insert(
            "total_calls".to_string(),
            ranked.iter().map(|f| f.calls).sum::<u64>() as f64,
        );
        // 累積時間は入れ子を含むため最大値を全体時間とみなす
        metrics.insert(
            "max_cumulative_ms".to_string(),
            ranked.first().map_or(0.0, |f| f.cumulative_us as f64 / 1e3),
        );

        (
            ranked,
            ProfileSummary {
                bottlenecks,
                recommendations,
                metrics,
            },
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct LineAggregator {
    lines: HashMap<(PathBuf, usize), LineProfile>,
}

impl LineAggregator {
    pub fn record(&mut self, event: &ProfileEvent) {
        if let ProfileEvent::LineHit {
            file_path,
            line,
            elapsed,
        } = event
        {
            let entry = self
                .lines
                .entry((file_path.clone(), *line))
                .or_insert_with(|| LineProfile {
                    file_path: file_path.clone(),
                    line: *line,
                    hits: 0,
                    total_us: 0,
                });
            entry.hits += 1;
            entry.total_us = entry.total_us.saturating_add(as_micros(*elapsed));
        }
    }

    pub fn analyze(&self, top_n: usize) -> (Vec<LineProfile>, ProfileSummary) {
        let mut ranked: Vec<LineProfile> = self.lines.values().cloned().collect();
        ranked.sort_by(|a, b| {
            b.total_us
                .cmp(&a.total_us)
                .then_with(|| a.file_path.cmp(&b.file_path))
                .then_with(|| a.line.cmp(&b.line))
        });

        let bottlenecks: Vec<Bottleneck> = ranked
            .iter()
            .take(top_n)
            .map(|l| Bottleneck {
                name: format!("{}:{}", l.file_path.display(), l.line),
                severity: severity_for(Duration::from_micros(l.total_us)),
                value: l.total_us as f64 / 1e3,
                description: format!("{} / {} ヒット", format_us(l.total_us), l.hits),
            })
            .collect();

        let recommendations = bottlenecks
            .iter()
            .filter(|b| b.severity >= Severity::Medium)
            .map(|b| Recommendation {
                severity: b.severity,
                target: b.name.clone(),
                message: format!("{} 行の処理が集中しています ({})", b.name, b.description),
            })
            .collect();

        let mut metrics = BTreeMap::new();
        metrics.insert("lines".to_string(), ranked.len() as f64);
        metrics.insert("total_hits".to_string(), ranked.iter().map(|l| l.hits).sum::<u64>() as f64);
        metrics.insert(
            "total_ms".to_string(),
            ranked.iter().map(|l| l.total_us).sum::<u64>() as f64 / 1e3,
        );

        (
            ranked,
            ProfileSummary {
                bottlenecks,
                recommendations,
                metrics,
            },
        )
    }
}
