//! Shared types used across fleet crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A per-instance load signal the scaling controller can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadMetric {
    /// CPU utilization as a fraction (0.0–1.0).
    #[default]
    Cpu,
    /// Requests routed to the instance per collection interval.
    RequestRate,
}

impl LoadMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMetric::Cpu => "cpu",
            LoadMetric::RequestRate => "request_rate",
        }
    }
}

impl fmt::Display for LoadMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
