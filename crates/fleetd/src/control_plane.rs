//! Control plane assembly — builds every subsystem from `FleetConfig` and
//! runs them until Ctrl-C.
//!
//! The daemon:
//! 1. Opens the store (on disk, or in memory when no path is configured)
//! 2. Seeds the template catalog from `[[templates]]` and restores the registry
//! 3. Starts the health supervisor, router sync, metrics collector and
//!    scaling controller loops
//! 4. Serves client traffic on `router.listen` and the admin API on
//!    `admin.listen`

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use fleet_api::ApiState;
use fleet_autoscale::{
    Drainer, HttpProvisioner, Provisioner, ScalingController, ScalingPolicy, StaticPoolProvisioner,
};
use fleet_core::{FleetConfig, ProvisionerConfig};
use fleet_health::HealthSupervisor;
use fleet_metrics::{HttpLoadSource, MetricsAggregator, MetricsCollector};
use fleet_router::{ProxyAdapter, Router, RouterSync, TrafficFrontend};
use fleet_state::{
    ConnectionTracker, FleetStore, InstanceRegistry, LaunchTemplate, TemplateCatalog,
};

fn open_store(config: &FleetConfig) -> anyhow::Result<FleetStore> {
    match &config.store.path {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create store directory {}", parent.display()))?;
            }
            let store = FleetStore::open(path)?;
            info!(path = ?path, "fleet store opened");
            Ok(store)
        }
        None => {
            info!("no store path configured, state is kept in memory");
            Ok(FleetStore::open_in_memory()?)
        }
    }
}

/// Publish configured templates that the catalog does not know yet.
fn seed_templates(config: &FleetConfig, catalog: &TemplateCatalog) -> anyhow::Result<()> {
    for declared in &config.templates {
        let template = LaunchTemplate::from(declared);
        match catalog.get(template.version) {
            None => {
                catalog.publish(template)?;
            }
            Some(existing)
                if existing.app_port != template.app_port
                    || existing.artifact != template.artifact =>
            {
                warn!(
                    version = template.version,
                    "configured template differs from the published one; published versions are immutable"
                );
            }
            Some(_) => {}
        }
    }
    if let Some(version) = config.fleet.template_version {
        catalog.set_active(version)?;
    }
    Ok(())
}

fn build_provisioner(
    config: &FleetConfig,
    registry: &InstanceRegistry,
) -> anyhow::Result<Arc<dyn Provisioner>> {
    match &config.provisioner {
        ProvisionerConfig::Static { hosts } => {
            let pool = StaticPoolProvisioner::new(hosts.iter().cloned());
            let restored = registry.list();
            pool.reserve(restored.iter().filter_map(|i| i.provider_ref.as_deref()));
            info!(hosts = hosts.len(), available = pool.available(), "static host pool ready");
            Ok(Arc::new(pool))
        }
        ProvisionerConfig::Http { base_url, timeout } => {
            info!(%base_url, "http provisioner ready");
            Ok(Arc::new(HttpProvisioner::new(base_url.clone(), *timeout)?))
        }
    }
}

/// Run the control plane until Ctrl-C.
pub async fn run(config: FleetConfig) -> anyhow::Result<()> {
    info!(
        min_size = config.fleet.min_size,
        max_size = config.fleet.max_size,
        "fleet control plane starting"
    );

    // ── State ────────────────────────────────────────────────────
    let store = open_store(&config)?;
    let catalog = TemplateCatalog::open(store.clone())?;
    seed_templates(&config, &catalog)?;
    let registry = InstanceRegistry::new(store, config.fleet.max_size)?;
    let tracker = ConnectionTracker::new();
    info!(instances = registry.list().len(), "instance registry ready");

    // ── Subsystems ───────────────────────────────────────────────
    let supervisor = Arc::new(HealthSupervisor::new(registry.clone(), config.health.clone()));
    let router = Arc::new(Router::new());
    let sync = RouterSync::new(
        registry.clone(),
        catalog.clone(),
        tracker.clone(),
        Arc::clone(&router),
        config.fleet.router_port,
    );
    let adapter = Arc::new(ProxyAdapter::new(
        config.router.connect_timeout,
        supervisor.reporter(),
    ));

    let aggregator = Arc::new(MetricsAggregator::new(config.metrics.retention));
    let collector = MetricsCollector::new(
        registry.clone(),
        tracker.clone(),
        Arc::clone(&aggregator),
        Arc::new(HttpLoadSource::new(config.metrics.load_path.clone())),
        config.metrics.interval,
        config.metrics.timeout,
    );

    let provisioner = build_provisioner(&config, &registry)?;
    let drainer = Drainer::new(
        registry.clone(),
        tracker.clone(),
        Arc::clone(&provisioner),
        config.drain.grace,
    );
    let mut controller = ScalingController::new(
        registry.clone(),
        catalog.clone(),
        Arc::clone(&aggregator),
        provisioner,
        drainer,
        ScalingPolicy {
            min_size: config.fleet.min_size,
            max_size: config.fleet.max_size,
            scaling: config.scaling.clone(),
        },
    );

    // ── Background tasks ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_handle = {
        let supervisor = Arc::clone(&supervisor);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { supervisor.run(shutdown).await })
    };
    let sync_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { sync.run(shutdown).await })
    };
    let metrics_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { collector.run(shutdown).await })
    };
    let scaling_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { controller.run(shutdown).await })
    };

    // ── Traffic frontend ─────────────────────────────────────────
    let traffic_listener = tokio::net::TcpListener::bind(&config.router.listen)
        .await
        .with_context(|| format!("bind traffic listener {}", config.router.listen))?;
    let frontend = TrafficFrontend::new(
        Arc::clone(&router),
        adapter,
        config.router.buffer,
        config.router.max_connections,
    );
    let frontend_handle = tokio::spawn(frontend.serve(traffic_listener, shutdown_rx.clone()));

    // ── Admin API ────────────────────────────────────────────────
    let api = fleet_api::build_router(ApiState {
        registry,
        catalog,
        router,
        health: supervisor,
        aggregator,
        tracker,
        cpu_window: config.scaling.window,
    });
    let admin_listener = tokio::net::TcpListener::bind(&config.admin.listen)
        .await
        .with_context(|| format!("bind admin listener {}", config.admin.listen))?;
    info!(addr = %config.admin.listen, "admin API starting");

    let server = axum::serve(admin_listener, api).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // ── Clean up ─────────────────────────────────────────────────
    match frontend_handle.await {
        Ok(Err(e)) => warn!(error = %e, "traffic frontend stopped with error"),
        Err(e) => warn!(error = %e, "traffic frontend task failed"),
        Ok(Ok(())) => {}
    }
    let _ = health_handle.await;
    let _ = sync_handle.await;
    let _ = metrics_handle.await;
    let _ = scaling_handle.await;

    info!("fleet control plane stopped");
    Ok(())
}
