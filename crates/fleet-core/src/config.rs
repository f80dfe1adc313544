//! fleet.toml configuration parser.
//!
//! Durations are written as human strings (`"30s"`, `"500ms"`, `"2m"`)
//! and parsed with `humantime`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LoadMetric;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub fleet: FleetSection,
    pub health: HealthSection,
    pub scaling: ScalingSection,
    pub drain: DrainSection,
    pub router: RouterSection,
    pub metrics: MetricsSection,
    pub admin: AdminSection,
    pub store: StoreSection,
    pub provisioner: ProvisionerConfig,
    pub templates: Vec<TemplateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    pub min_size: u32,
    pub max_size: u32,
    /// The port the router expects every instance to serve on.
    pub router_port: u16,
    /// Launch template version to scale out from. Latest published when unset.
    pub template_version: Option<u32>,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            router_port: 80,
            template_version: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// Liveness path probed on each instance.
    pub path: String,
    #[serde(with = "human_duration")]
    pub interval: Duration,
    #[serde(with = "human_duration")]
    pub timeout: Duration,
    /// Consecutive successes before a verdict becomes `Healthy`.
    pub healthy_threshold: u32,
    /// Consecutive failures before a verdict becomes `Unhealthy`.
    pub unhealthy_threshold: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingSection {
    #[serde(with = "human_duration")]
    pub tick: Duration,
    pub metric: LoadMetric,
    /// Scale out when the windowed mean is above this value.
    pub scale_out_threshold: f64,
    /// Scale in when the windowed mean is below this value.
    pub scale_in_threshold: f64,
    #[serde(with = "human_duration")]
    pub cooldown: Duration,
    /// Maximum instances added or removed in one decision.
    pub max_step: u32,
    /// Width of the metric window the controller averages over.
    #[serde(with = "human_duration")]
    pub window: Duration,
}

impl Default for ScalingSection {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            metric: LoadMetric::Cpu,
            scale_out_threshold: 0.70,
            scale_in_threshold: 0.30,
            cooldown: Duration::from_secs(60),
            max_step: 2,
            window: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainSection {
    #[serde(with = "human_duration")]
    pub grace: Duration,
}

impl Default for DrainSection {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub listen: String,
    /// Accepted connections waiting for dispatch before new ones fail fast.
    pub buffer: usize,
    /// Concurrent forwarded connections.
    pub max_connections: usize,
    #[serde(with = "human_duration")]
    pub connect_timeout: Duration,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            buffer: 64,
            max_connections: 1024,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    #[serde(with = "human_duration")]
    pub interval: Duration,
    #[serde(with = "human_duration")]
    pub timeout: Duration,
    /// Path serving `{"cpu": <fraction>}` on each instance.
    pub load_path: String,
    /// How long samples are kept at most.
    #[serde(with = "human_duration")]
    pub retention: Duration,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            load_path: "/load".to_string(),
            retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    pub listen: String,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreSection {
    /// redb file. The store is in-memory when unset.
    pub path: Option<PathBuf>,
}

/// How instances are launched and terminated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionerConfig {
    /// Hand out hosts from a fixed pool, one instance per host.
    Static { hosts: Vec<String> },
    /// Call an external provisioning API.
    Http {
        base_url: String,
        #[serde(with = "human_duration", default = "default_http_timeout")]
        timeout: Duration,
    },
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        ProvisionerConfig::Static { hosts: Vec::new() }
    }
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateConfig {
    pub version: u32,
    pub app_port: u16,
    pub artifact: String,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints. Reports every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.fleet.max_size == 0 {
            problems.push("fleet.max_size must be at least 1".to_string());
        }
        if self.fleet.min_size > self.fleet.max_size {
            problems.push(format!(
                "fleet.min_size ({}) exceeds fleet.max_size ({})",
                self.fleet.min_size, self.fleet.max_size
            ));
        }
        if self.fleet.router_port == 0 {
            problems.push("fleet.router_port must be non-zero".to_string());
        }
        if !self.health.path.starts_with('/') {
            problems.push(format!("health.path must start with '/': {}", self.health.path));
        }
        if self.health.healthy_threshold == 0 || self.health.unhealthy_threshold == 0 {
            problems.push("health thresholds must be at least 1".to_string());
        }
        if self.scaling.scale_in_threshold >= self.scaling.scale_out_threshold {
            problems.push(format!(
                "scaling.scale_in_threshold ({}) must be below scaling.scale_out_threshold ({})",
                self.scaling.scale_in_threshold, self.scaling.scale_out_threshold
            ));
        }
        if self.scaling.max_step == 0 {
            problems.push("scaling.max_step must be at least 1".to_string());
        }
        if self.router.buffer == 0 || self.router.max_connections == 0 {
            problems.push("router.buffer and router.max_connections must be non-zero".to_string());
        }
        if self.metrics.window_exceeds(self.scaling.window) {
            problems.push(format!(
                "scaling.window ({}) exceeds metrics.retention ({})",
                humantime::format_duration(self.scaling.window),
                humantime::format_duration(self.metrics.retention)
            ));
        }
        for (name, d) in [
            ("health.interval", self.health.interval),
            ("health.timeout", self.health.timeout),
            ("scaling.tick", self.scaling.tick),
            ("metrics.interval", self.metrics.interval),
            ("metrics.timeout", self.metrics.timeout),
        ] {
            if d.is_zero() {
                problems.push(format!("{name} must be non-zero"));
            }
        }

        if self.templates.is_empty() {
            problems.push("at least one [[templates]] entry is required".to_string());
        }
        if let Some(v) = self.fleet.template_version
            && !self.templates.iter().any(|t| t.version == v)
        {
            problems.push(format!("fleet.template_version {v} is not a declared template"));
        }

        match &self.provisioner {
            ProvisionerConfig::Static { hosts } => {
                if (hosts.len() as u32) < self.fleet.min_size {
                    problems.push(format!(
                        "static provisioner has {} hosts, fewer than fleet.min_size ({})",
                        hosts.len(),
                        self.fleet.min_size
                    ));
                }
            }
            ProvisionerConfig::Http { base_url, .. } => {
                if !base_url.starts_with("http://") {
                    problems.push(format!("provisioner.base_url must be http://: {base_url}"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

impl MetricsSection {
    fn window_exceeds(&self, window: Duration) -> bool {
        window > self.retention
    }
}

/// serde adapter for `humantime` duration strings.
mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[provisioner]
kind = "static"
hosts = ["10.0.0.1", "10.0.0.2"]

[[templates]]
version = 1
app_port = 8080
artifact = "ami-0abc"
"#;

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = FleetConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.fleet.min_size, 2);
        assert_eq!(config.fleet.max_size, 10);
        assert_eq!(config.health.interval, Duration::from_secs(5));
        assert_eq!(config.scaling.cooldown, Duration::from_secs(60));
        assert_eq!(config.scaling.metric, LoadMetric::Cpu);
        assert_eq!(config.templates[0].app_port, 8080);
    }

    #[test]
    fn parse_human_durations() {
        let toml_str = format!(
            "{MINIMAL}\n[health]\ninterval = \"500ms\"\ntimeout = \"250ms\"\n[drain]\ngrace = \"2m\"\n"
        );
        let config = FleetConfig::from_toml(&toml_str).unwrap();
        assert_eq!(config.health.interval, Duration::from_millis(500));
        assert_eq!(config.health.timeout, Duration::from_millis(250));
        assert_eq!(config.drain.grace, Duration::from_secs(120));
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let toml_str = format!("{MINIMAL}\n[scaling]\ncooldown = \"soon\"\n");
        assert!(matches!(
            FleetConfig::from_toml(&toml_str),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn http_provisioner_section() {
        let toml_str = r#"
[provisioner]
kind = "http"
base_url = "http://provisioner.internal:7000"

[[templates]]
version = 3
app_port = 8080
artifact = "ami-0def"
"#;
        let config = FleetConfig::from_toml(toml_str).unwrap();
        assert_eq!(
            config.provisioner,
            ProvisionerConfig::Http {
                base_url: "http://provisioner.internal:7000".to_string(),
                timeout: Duration::from_secs(10),
            }
        );
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = FleetConfig::from_toml(MINIMAL).unwrap();
        config.fleet.min_size = 5;
        config.fleet.max_size = 3;
        config.scaling.scale_in_threshold = 0.8;
        config.scaling.max_step = 0;

        let err = config.validate().unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected Invalid");
        };
        assert!(problems.iter().any(|p| p.contains("min_size")));
        assert!(problems.iter().any(|p| p.contains("scale_in_threshold")));
        assert!(problems.iter().any(|p| p.contains("max_step")));
    }

    #[test]
    fn missing_templates_rejected() {
        let toml_str = r#"
[provisioner]
kind = "static"
hosts = ["a", "b"]
"#;
        assert!(matches!(
            FleetConfig::from_toml(toml_str),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_template_version_rejected() {
        let toml_str = format!("[fleet]\ntemplate_version = 9\n{MINIMAL}");
        let err = FleetConfig::from_toml(&toml_str).unwrap_err();
        assert!(err.to_string().contains("template_version 9"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = FleetConfig::from_toml(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reparsed = FleetConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.health.interval, config.health.interval);
        assert_eq!(reparsed.templates, config.templates);
    }
}
