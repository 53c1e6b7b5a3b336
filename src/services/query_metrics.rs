//! Bounded ring buffer of query timings, kept for diagnostics only.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

/// One timed read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetric {
    pub label: String,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub cache_hit: bool,
}

/// Aggregate view over the retained metrics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub samples: usize,
    pub cache_hits: usize,
    pub avg_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Slowest retained samples first.
    pub slowest: Vec<QueryMetric>,
}

/// Append-only metrics buffer. The oldest sample is dropped once full.
pub struct QueryMetrics {
    samples: Mutex<VecDeque<QueryMetric>>,
    capacity: usize,
}

impl QueryMetrics {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, label: impl Into<String>, duration: Duration, cache_hit: bool) {
        let metric = QueryMetric {
            label: label.into(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
            cache_hit,
        };

        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(metric);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<QueryMetric> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn summary(&self, slowest: usize) -> MetricsSummary {
        let samples = self.snapshot();
        if samples.is_empty() {
            return MetricsSummary::default();
        }

        let total: f64 = samples.iter().map(|m| m.duration_ms).sum();
        let max = samples.iter().map(|m| m.duration_ms).fold(0.0, f64::max);
        let cache_hits = samples.iter().filter(|m| m.cache_hit).count();

        let mut ranked = samples.clone();
        ranked.sort_by(|a, b| b.duration_ms.total_cmp(&a.duration_ms));
        ranked.truncate(slowest);

        #[allow(clippy::cast_precision_loss)]
        let avg = total / samples.len() as f64;

        MetricsSummary {
            samples: samples.len(),
            cache_hits,
            avg_duration_ms: avg,
            max_duration_ms: max,
            slowest: ranked,
        }
    }
}

/// Run `fut` and return its output with the elapsed wall time.
pub async fn timed<Fut, T>(fut: Fut) -> (T, Duration)
where
    Fut: Future<Output = T>,
{
    let start = Instant::now();
    let output = fut.await;
    (output, start.elapsed())
}
