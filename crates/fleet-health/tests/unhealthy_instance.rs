//! One of three instances stops accepting connections: it must be marked
//! unhealthy on exactly the third consecutive failure and leave the
//! routable part of the fleet, while the others stay in service.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use fleet_core::config::HealthSection;
use fleet_health::HealthSupervisor;
use fleet_state::{Endpoint, FleetStore, HealthVerdict, InstanceRegistry, InstanceState};

async fn healthy_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            });
        }
    });
    (port, handle)
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn refusing_instance_is_marked_unhealthy_after_third_failure() {
    let registry = InstanceRegistry::new(FleetStore::open_in_memory().unwrap(), 10).unwrap();
    let config = HealthSection {
        path: "/healthz".to_string(),
        interval: Duration::from_millis(40),
        timeout: Duration::from_millis(200),
        healthy_threshold: 2,
        unhealthy_threshold: 3,
    };

    let mut servers = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (port, handle) = healthy_server().await;
        ids.push(registry.register(Endpoint::new("127.0.0.1", port), 1).unwrap());
        servers.push(handle);
    }

    let supervisor = std::sync::Arc::new(HealthSupervisor::new(registry.clone(), config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };

    wait_for(|| {
        registry
            .snapshot()
            .instances
            .iter()
            .all(|i| i.is_routable())
    })
    .await;

    let mut events = supervisor.subscribe();
    servers[1].abort();

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.instance_id == ids[1] {
                return event;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(event.previous, HealthVerdict::Healthy);
    assert_eq!(event.verdict, HealthVerdict::Unhealthy);
    assert_eq!(event.record.consecutive_failures, 3);

    let snapshot = registry.snapshot();
    let failed = snapshot.get(&ids[1]).unwrap();
    assert_eq!(failed.state, InstanceState::Unhealthy);
    assert!(!failed.is_routable());

    let routable: Vec<_> = snapshot
        .instances
        .iter()
        .filter(|i| i.is_routable())
        .map(|i| i.id.clone())
        .collect();
    assert_eq!(routable, vec![ids[0].clone(), ids[2].clone()]);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap();
    assert!(supervisor.active_monitors().is_empty());
}
