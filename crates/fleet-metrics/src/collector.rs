//! Metrics collector — polls in-service instances for load.
//!
//! Every interval the collector asks each in-service instance for its CPU
//! utilization through a `LoadSource`, pairs it with the number of
//! connections the router sent to that instance since the previous round,
//! and records the sample in the `MetricsAggregator`. Each call is bounded
//! by a timeout; a failed or slow instance simply contributes no sample.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http_body_util::BodyExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use fleet_state::{ConnectionTracker, Instance, InstanceRegistry, InstanceState};

use crate::aggregator::{MetricSample, MetricsAggregator};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("load request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("non-2xx status {0}")]
    Status(u16),

    #[error("invalid load report: {0}")]
    Body(String),
}

/// Where CPU utilization comes from.
#[async_trait]
pub trait LoadSource: Send + Sync {
    /// CPU utilization fraction of one instance.
    async fn cpu(&self, instance: &Instance) -> Result<f64, CollectError>;
}

#[derive(Debug, Deserialize)]
struct LoadReport {
    cpu: f64,
}

/// Reads `{"cpu": <fraction>}` from `GET <path>` on the instance endpoint.
pub struct HttpLoadSource {
    path: String,
}

impl HttpLoadSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LoadSource for HttpLoadSource {
    async fn cpu(&self, instance: &Instance) -> Result<f64, CollectError> {
        let address = instance.endpoint.address();
        let uri = format!("http://{address}{}", self.path);

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| CollectError::Transport(e.to_string()))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| CollectError::Transport(e.to_string()))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address.as_str())
            .header("user-agent", "fleet-metrics/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| CollectError::Transport(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| CollectError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollectError::Status(resp.status().as_u16()));
        }
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| CollectError::Transport(e.to_string()))?
            .to_bytes();
        let report: LoadReport =
            serde_json::from_slice(&body).map_err(|e| CollectError::Body(e.to_string()))?;
        if !report.cpu.is_finite() {
            return Err(CollectError::Body(format!("cpu is not finite: {}", report.cpu)));
        }
        Ok(report.cpu.clamp(0.0, 1.0))
    }
}

pub struct MetricsCollector {
    registry: InstanceRegistry,
    tracker: ConnectionTracker,
    aggregator: Arc<MetricsAggregator>,
    source: Arc<dyn LoadSource>,
    interval: Duration,
    timeout: Duration,
}

impl MetricsCollector {
    pub fn new(
        registry: InstanceRegistry,
        tracker: ConnectionTracker,
        aggregator: Arc<MetricsAggregator>,
        source: Arc<dyn LoadSource>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            tracker,
            aggregator,
            source,
            interval,
            timeout,
        }
    }

    /// Run one collection round. Returns the number of samples recorded.
    pub async fn collect_once(&self) -> usize {
        let snapshot = self.registry.snapshot();
        // Only in-service instances count toward the fleet mean.
        let in_service: Vec<&Instance> = snapshot.in_state(InstanceState::InService).collect();
        let keep: HashSet<&str> = in_service.iter().map(|i| i.id.as_str()).collect();
        self.aggregator.retain_instances(&keep);

        let mut calls = JoinSet::new();
        for instance in in_service {
            let instance = instance.clone();
            let source = Arc::clone(&self.source);
            let timeout = self.timeout;
            calls.spawn(async move {
                let result = match tokio::time::timeout(timeout, source.cpu(&instance)).await {
                    Ok(result) => result,
                    Err(_) => Err(CollectError::Timeout),
                };
                (instance.id, result)
            });
        }

        let mut recorded = 0;
        while let Some(joined) = calls.join_next().await {
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "load collection task failed");
                    continue;
                }
            };
            match result {
                Ok(cpu) => {
                    let requests = self.tracker.take_routed(&id);
                    self.aggregator.record(MetricSample {
                        instance_id: id,
                        at: Instant::now(),
                        cpu,
                        requests,
                    });
                    recorded += 1;
                }
                Err(e) => debug!(instance = %id, error = %e, "load collection failed"),
            }
        }
        recorded
    }

    /// Run the collection loop until shutdown signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            timeout = ?self.timeout,
            "metrics collector started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let recorded = self.collect_once().await;
                    debug!(recorded, "metrics collection round finished");
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use fleet_core::LoadMetric;
    use fleet_state::{Endpoint, FleetStore, HealthVerdict};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::aggregator::Aggregate;

    /// Fixed CPU per host; hosts not in the map fail, "slow" never answers.
    struct FakeLoad(Mutex<HashMap<String, f64>>);

    #[async_trait]
    impl LoadSource for FakeLoad {
        async fn cpu(&self, instance: &Instance) -> Result<f64, CollectError> {
            if instance.endpoint.host == "slow" {
                std::future::pending::<()>().await;
            }
            let map = self.0.lock().unwrap();
            map.get(&instance.endpoint.host)
                .copied()
                .ok_or_else(|| CollectError::Transport("unreachable".into()))
        }
    }

    fn in_service(reg: &InstanceRegistry, host: &str) -> String {
        let id = reg.register(Endpoint::new(host, 8080), 1).unwrap();
        reg.set_health(&id, HealthVerdict::Healthy).unwrap();
        id
    }

    fn collector(
        reg: &InstanceRegistry,
        tracker: &ConnectionTracker,
        agg: &Arc<MetricsAggregator>,
        loads: &[(&str, f64)],
    ) -> MetricsCollector {
        let map = loads.iter().map(|(h, c)| (h.to_string(), *c)).collect();
        MetricsCollector::new(
            reg.clone(),
            tracker.clone(),
            Arc::clone(agg),
            Arc::new(FakeLoad(Mutex::new(map))),
            Duration::from_secs(10),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn collects_in_service_instances_only() {
        let reg = InstanceRegistry::new(FleetStore::open_in_memory().unwrap(), 10).unwrap();
        let tracker = ConnectionTracker::new();
        let agg = Arc::new(MetricsAggregator::new(Duration::from_secs(300)));

        let a = in_service(&reg, "a");
        in_service(&reg, "b");
        reg.register(Endpoint::new("pending", 8080), 1).unwrap();
        drop(tracker.counters(&a).enter());
        drop(tracker.counters(&a).enter());

        let c = collector(&reg, &tracker, &agg, &[("a", 0.9), ("b", 0.5), ("pending", 0.1)]);
        assert_eq!(c.collect_once().await, 2);

        let mean = agg.windowed_mean(LoadMetric::Cpu, Duration::from_secs(60));
        assert!((mean.value().unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(agg.latest(&a).unwrap().requests, 2);
        assert_eq!(tracker.take_routed(&a), 0);
    }

    #[tokio::test]
    async fn failed_and_slow_instances_contribute_nothing() {
        let reg = InstanceRegistry::new(FleetStore::open_in_memory().unwrap(), 10).unwrap();
        let tracker = ConnectionTracker::new();
        let agg = Arc::new(MetricsAggregator::new(Duration::from_secs(300)));
        in_service(&reg, "down");
        in_service(&reg, "slow");

        let c = collector(&reg, &tracker, &agg, &[]);
        assert_eq!(c.collect_once().await, 0);
        assert_eq!(
            agg.windowed_mean(LoadMetric::Cpu, Duration::from_secs(60)),
            Aggregate::Unknown
        );
    }

    #[tokio::test]
    async fn departed_instances_are_forgotten() {
        let reg = InstanceRegistry::new(FleetStore::open_in_memory().unwrap(), 10).unwrap();
        let tracker = ConnectionTracker::new();
        let agg = Arc::new(MetricsAggregator::new(Duration::from_secs(300)));
        let a = in_service(&reg, "a");

        let c = collector(&reg, &tracker, &agg, &[("a", 0.4)]);
        c.collect_once().await;
        assert!(agg.latest(&a).is_some());

        reg.set_state(&a, InstanceState::Draining).unwrap();
        c.collect_once().await;
        assert!(agg.latest(&a).is_none());
    }

    #[tokio::test]
    async fn unhealthy_instances_leave_the_mean() {
        let reg = InstanceRegistry::new(FleetStore::open_in_memory().unwrap(), 10).unwrap();
        let tracker = ConnectionTracker::new();
        let agg = Arc::new(MetricsAggregator::new(Duration::from_secs(300)));
        let hot = in_service(&reg, "hot");
        in_service(&reg, "cool");

        let c = collector(&reg, &tracker, &agg, &[("hot", 0.9), ("cool", 0.3)]);
        c.collect_once().await;
        let mean = agg.windowed_mean(LoadMetric::Cpu, Duration::from_secs(60));
        assert!((mean.value().unwrap() - 0.6).abs() < 1e-9);

        reg.set_health(&hot, HealthVerdict::Unhealthy).unwrap();
        assert_eq!(reg.get(&hot).unwrap().state, InstanceState::Unhealthy);
        c.collect_once().await;
        assert!(agg.latest(&hot).is_none());
        let mean = agg.windowed_mean(LoadMetric::Cpu, Duration::from_secs(60));
        assert!((mean.value().unwrap() - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn http_load_source_reads_cpu() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let body = r#"{"cpu":0.42}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
        });

        let reg = InstanceRegistry::new(FleetStore::open_in_memory().unwrap(), 10).unwrap();
        let id = reg.register(Endpoint::new("127.0.0.1", port), 1).unwrap();
        let instance = reg.get(&id).unwrap();

        let cpu = HttpLoadSource::new("/load").cpu(&instance).await.unwrap();
        assert!((cpu - 0.42).abs() < 1e-9);
    }
}
