//! fleet-metrics — load observation for the scaling controller.
//!
//! Keeps per-instance load samples in a bounded time window, polls
//! in-service instances for CPU utilization, and renders fleet gauges in
//! the Prometheus text format.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── LoadSource::cpu() ← HttpLoadSource (GET load_path → {"cpu": f})
//!   ├── ConnectionTracker::take_routed() → request count
//!   └── run() → periodic collection loop
//!
//! MetricsAggregator
//!   ├── record() ← MetricSample
//!   └── windowed_mean() → Aggregate::{Value, Unknown}
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod aggregator;
pub mod collector;
pub mod prometheus;

pub use aggregator::{Aggregate, MetricSample, MetricsAggregator};
pub use collector::{CollectError, HttpLoadSource, LoadSource, MetricsCollector};
pub use prometheus::{FleetGauges, render_prometheus};
