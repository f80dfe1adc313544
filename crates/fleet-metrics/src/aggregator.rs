//! Windowed per-instance load samples.
//!
//! Samples are kept per instance in arrival order and evicted once they
//! are older than the retention window, both when new samples arrive and
//! when aggregates are read. An empty window yields `Aggregate::Unknown`,
//! never zero.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use fleet_core::LoadMetric;
use fleet_state::InstanceId;

/// One load observation of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub instance_id: InstanceId,
    pub at: Instant,
    /// CPU utilization fraction (0.0–1.0).
    pub cpu: f64,
    /// Requests routed to the instance during the collection interval.
    pub requests: u64,
}

impl MetricSample {
    fn value(&self, metric: LoadMetric) -> f64 {
        match metric {
            LoadMetric::Cpu => self.cpu,
            LoadMetric::RequestRate => self.requests as f64,
        }
    }
}

/// Result of a windowed read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Aggregate {
    Value(f64),
    /// No samples in the window.
    Unknown,
}

impl Aggregate {
    pub fn value(&self) -> Option<f64> {
        match self {
            Aggregate::Value(v) => Some(*v),
            Aggregate::Unknown => None,
        }
    }
}

pub struct MetricsAggregator {
    retention: Duration,
    samples: Mutex<HashMap<InstanceId, VecDeque<MetricSample>>>,
}

impl MetricsAggregator {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn record(&self, sample: MetricSample) {
        let mut samples = self.samples.lock().expect("metric samples lock");
        let now = sample.at;
        let series = samples.entry(sample.instance_id.clone()).or_default();
        series.push_back(sample);
        evict(series, now, self.retention);
    }

    /// Mean of `metric` over all instances' samples in the last `window`.
    ///
    /// `window` is capped at the retention period.
    pub fn windowed_mean(&self, metric: LoadMetric, window: Duration) -> Aggregate {
        self.windowed_mean_at(metric, window, Instant::now())
    }

    pub fn windowed_mean_at(&self, metric: LoadMetric, window: Duration, now: Instant) -> Aggregate {
        let window = window.min(self.retention);
        let mut samples = self.samples.lock().expect("metric samples lock");

        let mut sum = 0.0;
        let mut count = 0usize;
        for series in samples.values_mut() {
            evict(series, now, self.retention);
            for sample in series.iter() {
                if now.saturating_duration_since(sample.at) <= window {
                    sum += sample.value(metric);
                    count += 1;
                }
            }
        }
        samples.retain(|_, series| !series.is_empty());

        if count == 0 {
            Aggregate::Unknown
        } else {
            Aggregate::Value(sum / count as f64)
        }
    }

    /// Most recent sample of one instance.
    pub fn latest(&self, instance_id: &str) -> Option<MetricSample> {
        let samples = self.samples.lock().expect("metric samples lock");
        samples.get(instance_id).and_then(|s| s.back().cloned())
    }

    pub fn forget(&self, instance_id: &str) {
        self.samples
            .lock()
            .expect("metric samples lock")
            .remove(instance_id);
    }

    /// Drop the series of every instance not in `keep`.
    pub fn retain_instances(&self, keep: &HashSet<&str>) {
        let mut samples = self.samples.lock().expect("metric samples lock");
        samples.retain(|id, _| {
            let kept = keep.contains(id.as_str());
            if !kept {
                debug!(instance = %id, "forgetting metric samples");
            }
            kept
        });
    }

    /// Total samples currently retained.
    pub fn sample_count(&self) -> usize {
        let samples = self.samples.lock().expect("metric samples lock");
        samples.values().map(VecDeque::len).sum()
    }
}

fn evict(series: &mut VecDeque<MetricSample>, now: Instant, retention: Duration) {
    while let Some(front) = series.front() {
        if now.saturating_duration_since(front.at) > retention {
            series.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, at: Instant, cpu: f64, requests: u64) -> MetricSample {
        MetricSample {
            instance_id: id.to_string(),
            at,
            cpu,
            requests,
        }
    }

    #[test]
    fn empty_window_is_unknown() {
        let agg = MetricsAggregator::new(Duration::from_secs(300));
        assert_eq!(
            agg.windowed_mean(LoadMetric::Cpu, Duration::from_secs(60)),
            Aggregate::Unknown
        );
    }

    #[test]
    fn mean_across_instances() {
        let agg = MetricsAggregator::new(Duration::from_secs(300));
        let now = Instant::now();
        agg.record(sample("i-1", now, 0.8, 10));
        agg.record(sample("i-2", now, 0.4, 30));

        let cpu = agg.windowed_mean_at(LoadMetric::Cpu, Duration::from_secs(60), now);
        assert!((cpu.value().unwrap() - 0.6).abs() < 1e-9);

        let rate = agg.windowed_mean_at(LoadMetric::RequestRate, Duration::from_secs(60), now);
        assert_eq!(rate, Aggregate::Value(20.0));
    }

    #[test]
    fn samples_outside_window_are_ignored() {
        let agg = MetricsAggregator::new(Duration::from_secs(300));
        let start = Instant::now();
        agg.record(sample("i-1", start, 0.1, 0));
        agg.record(sample("i-1", start + Duration::from_secs(100), 0.9, 0));

        let later = start + Duration::from_secs(120);
        let mean = agg.windowed_mean_at(LoadMetric::Cpu, Duration::from_secs(60), later);
        assert_eq!(mean, Aggregate::Value(0.9));
    }

    #[test]
    fn expired_samples_are_evicted_on_read() {
        let agg = MetricsAggregator::new(Duration::from_secs(60));
        let start = Instant::now();
        agg.record(sample("i-1", start, 0.5, 0));
        assert_eq!(agg.sample_count(), 1);

        let later = start + Duration::from_secs(61);
        let mean = agg.windowed_mean_at(LoadMetric::Cpu, Duration::from_secs(60), later);
        assert_eq!(mean, Aggregate::Unknown);
        assert_eq!(agg.sample_count(), 0);
    }

    #[test]
    fn expired_samples_are_evicted_on_write() {
        let agg = MetricsAggregator::new(Duration::from_secs(60));
        let start = Instant::now();
        agg.record(sample("i-1", start, 0.5, 0));
        agg.record(sample("i-1", start + Duration::from_secs(30), 0.5, 0));
        agg.record(sample("i-1", start + Duration::from_secs(90), 0.5, 0));
        assert_eq!(agg.sample_count(), 2);
    }

    #[test]
    fn window_is_capped_at_retention() {
        let agg = MetricsAggregator::new(Duration::from_secs(60));
        let start = Instant::now();
        agg.record(sample("i-1", start, 0.2, 0));

        let later = start + Duration::from_secs(90);
        let mean = agg.windowed_mean_at(LoadMetric::Cpu, Duration::from_secs(600), later);
        assert_eq!(mean, Aggregate::Unknown);
    }

    #[test]
    fn retain_instances_forgets_departed() {
        let agg = MetricsAggregator::new(Duration::from_secs(300));
        let now = Instant::now();
        agg.record(sample("i-1", now, 0.5, 0));
        agg.record(sample("i-2", now, 0.5, 0));

        agg.retain_instances(&HashSet::from(["i-2"]));
        assert!(agg.latest("i-1").is_none());
        assert!(agg.latest("i-2").is_some());

        agg.forget("i-2");
        assert_eq!(agg.sample_count(), 0);
    }
}
