/*
 * SwiftProbe - コールグラフ集計
 *
 * 呼び出し元→呼び出し先のエッジごとに回数と時間を記録し、
 * 最も多く呼ばれた関数と呼び出し元の多い関数を報告します。
 */

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Bottleneck, ProfileSummary, Recommendation, Severity};
use crate::adapter::ProfileEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEdge {
    pub caller: String,
    pub callee: String,
    pub calls: u64,
    pub total_us: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallNode {
    pub function: String,
    /// 呼び出された回数
    pub calls: u64,
    /// 異なる呼び出し元の数
    pub callers: usize,
    pub total_us: u64,
}

pub fn caller_severity(callers: usize) -> Severity {
    match callers {
        n if n >= 5 => Severity::High,
        n if n >= 3 => Severity::Medium,
        _ => Severity::Low,
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallGraphAggregator {
    edges: HashMap<(String, String), CallEdge>,
    /// 呼び出し元のない呼び出し（エントリポイント）
    roots: HashMap<String, (u64, u64)>,
}

impl CallGraphAggregator {
    pub fn record(&mut self, event: &ProfileEvent) {
        match event {
            ProfileEvent::Call {
                caller: Some(caller),
                function,
                elapsed,
            } => self.add_edge(caller, function, 1, *elapsed),
            ProfileEvent::Call {
                caller: None,
                function,
                elapsed,
            } => {
                let root = self.roots.entry(function.clone()).or_insert((0, 0));
                root.0 += 1;
                root.1 = root.1.saturating_add(micros(*elapsed));
            }
            ProfileEvent::Edge {
                caller,
                callee,
                calls,
                elapsed,
            } => self.add_edge(caller, callee, *calls, *elapsed),
            _ => {}
        }
    }

    fn add_edge(&mut self, caller: &str, callee: &str, calls: u64, elapsed: Duration) {
        let edge = self
            .edges
            .entry((caller.to_string(), callee.to_string()))
            .or_insert_with(|| CallEdge {
                caller: caller.to_string(),
                callee: callee.to_string(),
                calls: 0,
                total_us: 0,
            });
        edge.calls = edge.calls.saturating_add(calls);
        edge.total_us = edge.total_us.saturating_add(micros(elapsed));
    }

    pub fn nodes(&self) -> Vec<CallNode> {
        let mut callers: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut totals: BTreeMap<&str, (u64, u64)> = BTreeMap::new();

        for edge in self.edges.values() {
            callers.entry(&edge.callee).or_default().insert(&edge.caller);
            let total = totals.entry(&edge.callee).or_insert((0, 0));
            total.0 += edge.calls;
            total.1 += edge.total_us;
            totals.entry(&edge.caller).or_insert((0, 0));
        }
        for (function, (calls, us)) in &self.roots {
            let total = totals.entry(function).or_insert((0, 0));
            total.0 += calls;
            total.1 += us;
        }

        totals
            .into_iter()
            .map(|(function, (calls, total_us))| CallNode {
                function: function.to_string(),
                calls,
                callers: callers.get(function).map_or(0, |c| c.len()),
                total_us,
            })
            .collect()
    }

    pub fn analyze(&self, top_n: usize) -> (Vec<CallNode>, Vec<CallEdge>, Option<String>, ProfileSummary) {
        let mut nodes = self.nodes();
        let mut edges: Vec<CallEdge> = self.edges.values().cloned().collect();
        edges.sort_by(|a, b| {
            b.calls
                .cmp(&a.calls)
                .then_with(|| a.caller.cmp(&b.caller))
                .then_with(|| a.callee.cmp(&b.callee))
        });

        let most_called = nodes
            .iter()
            .filter(|n| n.calls > 0)
            .max_by(|a, b| a.calls.cmp(&b.calls).then_with(|| b.function.cmp(&a.function)))
            .map(|n| n.function.clone());

        // 呼び出し元の多い順
        nodes.sort_by(|a, b| {
            b.callers
                .cmp(&a.callers)
                .then_with(|| b.calls.cmp(&a.calls))
                .then_with(|| a.function.cmp(&b.function))
        });

        let bottlenecks: Vec<Bottleneck> = nodes
            .iter()
            .filter(|n| n.callers > 0)
            .take(top_n)
            .map(|n| Bottleneck {
                name: n.function.clone(),
                severity: caller_severity(n.callers),
                value: n.callers as f64,
                description: format!("{} 箇所から {} 回呼び出し", n.callers, n.calls),
            })
            .collect();

        let mut recommendations: Vec<Recommendation> = bottlenecks
            .iter()
            .filter(|b| b.severity >= Severity::Medium)
            .map(|b| Recommendation {
                severity: b.severity,
                target: b.name.clone(),
                message: format!("{} は多くの箇所から呼ばれています。キャッシュや呼び出しの集約を検討してください ({})", b.name, b.description),
            })
            .collect();
        if let Some(function) = &most_called {
            if !recommendations.iter().any(|r| &r.target == function) {
                recommendations.push(Recommendation {
                    severity: Severity::Low,
                    target: function.clone(),
                    message: format!("{} が最も多く呼び出されています", function),
                });
            }
        }

        let mut metrics = BTreeMap::new();
        metrics.insert("nodes".to_string(), nodes.len() as f64);
        metrics.insert("edges".to_string(), edges.len() as f64);
        metrics.insert("total_calls".to_string(), edges.iter().map(|e| e.calls).sum::<u64>() as f64);
        metrics.insert(
            "max_callers".to_string(),
            nodes.first().map_or(0.0, |n| n.callers as f64),
        );

        (
            nodes,
            edges,
            most_called,
            ProfileSummary {
                bottlenecks,
                recommendations,
                metrics,
            },
        )
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
