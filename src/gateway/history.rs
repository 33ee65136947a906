use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Primary,
    Secondary,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub gateway: String,
    pub request_type: String,
    pub outcome: Outcome,
    pub quality_score: f64,
    pub latency_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GatewayStats {
    pub calls: usize,
    pub degraded: usize,
    pub avg_quality: f64,
    pub avg_latency_ms: f64,
}

/// Diagnostic ring of recent gateway calls. Not used for cost accounting.
#[derive(Debug)]
pub struct PerformanceHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl PerformanceHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> BTreeMap<String, GatewayStats> {
        let mut out: BTreeMap<String, GatewayStats> = BTreeMap::new();
        for entry in &self.entries {
            let stats = out.entry(entry.gateway.clone()).or_default();
            stats.calls += 1;
            if matches!(entry.outcome, Outcome::Degraded | Outcome::Failed) {
                stats.degraded += 1;
            }
            stats.avg_quality += entry.quality_score;
            stats.avg_latency_ms += entry.latency_ms as f64;
        }
        for stats in out.values_mut() {
            let n = stats.calls as f64;
            stats.avg_quality /= n;
            stats.avg_latency_ms /= n;
        }
        out
    }
}
