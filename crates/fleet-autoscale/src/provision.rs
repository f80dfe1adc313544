//! Launch/terminate primitives behind the `Provisioner` trait.
//!
//! Both operations are fallible. `terminate` is idempotent by provider
//! reference: releasing something that is already gone succeeds.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use fleet_state::LaunchTemplate;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no capacity left in the host pool")]
    Exhausted,

    #[error("provisioning request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provisioner rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid provisioner response: {0}")]
    InvalidResponse(String),
}

/// A freshly launched machine, not yet registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    /// Address the application is reachable on.
    pub host: String,
    /// Opaque handle passed back to `terminate`.
    pub provider_ref: String,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start one instance from `template`.
    async fn launch(&self, template: &LaunchTemplate) -> Result<Launched, ProvisionError>;

    /// Release the instance behind `provider_ref`.
    async fn terminate(&self, provider_ref: &str) -> Result<(), ProvisionError>;
}

// ── Static pool ────────────────────────────────────────────────────

/// Hands out hosts from a fixed pool, one instance per host.
///
/// The provider reference is the host itself.
pub struct StaticPoolProvisioner {
    pool: Mutex<Pool>,
}

struct Pool {
    free: VecDeque<String>,
    leased: HashSet<String>,
}

impl StaticPoolProvisioner {
    pub fn new(hosts: impl IntoIterator<Item = String>) -> Self {
        let mut free = VecDeque::new();
        for host in hosts {
            if !free.contains(&host) {
                free.push_back(host);
            }
        }
        Self {
            pool: Mutex::new(Pool {
                free,
                leased: HashSet::new(),
            }),
        }
    }

    /// Mark hosts as leased, e.g. those of instances restored from the store.
    pub fn reserve<'a>(&self, refs: impl IntoIterator<Item = &'a str>) {
        let mut pool = self.pool.lock().expect("host pool lock");
        for host in refs {
            if let Some(pos) = pool.free.iter().position(|h| h == host) {
                pool.free.remove(pos);
                pool.leased.insert(host.to_string());
            }
        }
    }

    pub fn available(&self) -> usize {
        self.pool.lock().expect("host pool lock").free.len()
    }
}

#[async_trait]
impl Provisioner for StaticPoolProvisioner {
    async fn launch(&self, template: &LaunchTemplate) -> Result<Launched, ProvisionError> {
        let mut pool = self.pool.lock().expect("host pool lock");
        let host = pool.free.pop_front().ok_or(ProvisionError::Exhausted)?;
        pool.leased.insert(host.clone());
        debug!(%host, template_version = template.version, "host leased from pool");
        Ok(Launched {
            provider_ref: host.clone(),
            host,
        })
    }

    async fn terminate(&self, provider_ref: &str) -> Result<(), ProvisionError> {
        let mut pool = self.pool.lock().expect("host pool lock");
        if pool.leased.remove(provider_ref) {
            pool.free.push_back(provider_ref.to_string());
            debug!(host = %provider_ref, "host returned to pool");
        }
        Ok(())
    }
}

// ── HTTP provisioning API ──────────────────────────────────────────

#[derive(Debug, Serialize)]
struct LaunchRequest<'a> {
    template_version: u32,
    artifact: &'a str,
    app_port: u16,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    id: String,
    host: String,
}

/// Talks JSON to an external provisioning API.
///
/// `POST {base}/instances` launches, `DELETE {base}/instances/{id}`
/// terminates; a 404 on delete means the instance is already gone.
pub struct HttpProvisioner {
    base_url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpProvisioner {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProvisionError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") {
            return Err(ProvisionError::Transport(format!(
                "unsupported provisioner url: {base_url}"
            )));
        }
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            base_url,
            timeout,
            client,
        })
    }

    async fn send(
        &self,
        method: Method,
        uri: String,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), ProvisionError> {
        let mut builder = http::Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ProvisionError::Transport(e.to_string()))?;

        let exchange = async {
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| ProvisionError::Transport(e.to_string()))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ProvisionError::Transport(e.to_string()))?
                .to_bytes();
            Ok((status, body))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ProvisionError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn launch(&self, template: &LaunchTemplate) -> Result<Launched, ProvisionError> {
        let payload = serde_json::to_vec(&LaunchRequest {
            template_version: template.version,
            artifact: &template.artifact,
            app_port: template.app_port,
        })
        .map_err(|e| ProvisionError::Transport(e.to_string()))?;

        let (status, body) = self
            .send(Method::POST, format!("{}/instances", self.base_url), Some(payload))
            .await?;
        if !status.is_success() {
            return Err(ProvisionError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let launched: LaunchResponse = serde_json::from_slice(&body)
            .map_err(|e| ProvisionError::InvalidResponse(e.to_string()))?;
        info!(
            provider_ref = %launched.id,
            host = %launched.host,
            template_version = template.version,
            "instance launched"
        );
        Ok(Launched {
            host: launched.host,
            provider_ref: launched.id,
        })
    }

    async fn terminate(&self, provider_ref: &str) -> Result<(), ProvisionError> {
        let (status, body) = self
            .send(
                Method::DELETE,
                format!("{}/instances/{provider_ref}", self.base_url),
                None,
            )
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(%provider_ref, status = status.as_u16(), "instance terminated");
            return Ok(());
        }
        Err(ProvisionError::Rejected {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
