// End-to-end lock cycle scenarios over loopback TCP.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::ChainClient;
use crate::config::CoordinatorConfig;
use crate::coordinator::LockCycleCoordinator;
use crate::error::{CommError, Result};
use crate::node::NodeSettings;
use crate::relay_protocol::ForwardStatus;
use crate::rendezvous::{LoopbackRendezvous, RendezvousAddress, RendezvousProvider};
use crate::sink::MemorySink;
use crate::topology::TopologySnapshot;

/// Loopback publication, except that the listed calls never complete.
struct StallingProvider {
    calls: AtomicUsize,
    stall: HashSet<usize>,
}

impl StallingProvider {
    fn stalling(stall: impl IntoIterator<Item = usize>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            stall: stall.into_iter().collect(),
        })
    }
}

#[async_trait]
impl RendezvousProvider for StallingProvider {
    async fn publish(&self, local_endpoint: SocketAddr) -> Result<RendezvousAddress> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stall.contains(&call) {
            std::future::pending::<()>().await;
        }
        LoopbackRendezvous.publish(local_endpoint).await
    }

    async fn retract(&self, _address: &RendezvousAddress) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stalling"
    }
}

/// Fails the first `failures` publications, then hands out synthetic names.
struct FlakyProvider {
    calls: AtomicUsize,
    failures: usize,
}

#[async_trait]
impl RendezvousProvider for FlakyProvider {
    async fn publish(&self, local_endpoint: SocketAddr) -> Result<RendezvousAddress> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(CommError::ProviderUnavailable("control port refused".into()));
        }
        let address = format!("rv{}.test:{}", call, local_endpoint.port());
        Ok(RendezvousAddress {
            provider_handle: address.clone(),
            address,
        })
    }

    async fn retract(&self, _address: &RendezvousAddress) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

fn config(cohort_size: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        cohort_size,
        publish_timeout_secs: 1,
        ..CoordinatorConfig::default()
    }
}

async fn wait_for_epoch(coordinator: &LockCycleCoordinator, epoch: u64) -> Arc<TopologySnapshot> {
    let mut rx = coordinator.subscribe();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.epoch >= epoch {
                return snapshot;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("rotation did not happen in time")
}

#[tokio::test]
async fn stalled_publication_shortens_the_chain() {
    let provider = StallingProvider::stalling([1]);
    let coordinator = LockCycleCoordinator::with_parts(config(3), provider, NodeSettings::default());

    let report = coordinator.refresh(3).await.unwrap();
    assert_eq!(report.requested, 3);
    assert_eq!(report.published, 2);
    assert_eq!(report.excluded.len(), 1);
    assert!(report.excluded[0].reason.contains("timed out"));
    assert!(matches!(
        report.underflow(),
        Some(CommError::ChainUnderflow {
            requested: 3,
            published: 2
        })
    ));

    let topology = &coordinator.current_topology().topology;
    assert_eq!(topology.node_order.len(), 2);
    for id in &topology.node_order {
        assert!(topology.node_configs.contains_key(id));
    }
    assert!(!topology.node_configs.contains_key(&report.excluded[0].node_id));
}

#[tokio::test]
async fn consecutive_rotations_share_no_ids_or_addresses() {
    let coordinator = LockCycleCoordinator::with_parts(config(4), Arc::new(LoopbackRendezvous), NodeSettings::default());

    coordinator.rotate_now().await.unwrap();
    let first = coordinator.current_topology();
    coordinator.rotate_now().await.unwrap();
    let second = coordinator.current_topology();

    let ids = |s: &TopologySnapshot| s.topology.node_order.iter().cloned().collect::<HashSet<_>>();
    let addresses = |s: &TopologySnapshot| {
        s.topology
            .node_configs
            .values()
            .map(|d| d.address.clone())
            .collect::<HashSet<_>>()
    };
    assert!(ids(&first).is_disjoint(&ids(&second)));
    assert!(addresses(&first).is_disjoint(&addresses(&second)));
    second.topology.validate().unwrap();
}

#[tokio::test]
async fn client_round_trip_through_three_hops() {
    let sink = MemorySink::new();
    let settings = NodeSettings {
        sink: Arc::new(sink.clone()),
        connect_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(5),
        ..NodeSettings::default()
    };
    let coordinator = LockCycleCoordinator::with_parts(config(3), Arc::new(LoopbackRendezvous), settings);
    coordinator.start().await.unwrap();
    wait_for_epoch(&coordinator, 1).await;

    let client = ChainClient::direct();
    let payload = client.fetch_topology(&coordinator.address().await).await.unwrap();
    assert_eq!(payload.coordinator_address, coordinator.address().await);
    let topology = payload.chain_topology;
    assert_eq!(topology.len(), 3);

    let data = b"Hello Ghost-Comm!";
    let response = client
        .send_through_chain(&topology, data, Some("archive:7000"))
        .await
        .unwrap();
    assert_eq!(response.status, ForwardStatus::Forwarded);
    assert_eq!(response.forward_depth(), 2);

    let terminal = response.terminal();
    let expected = ChainClient::expected_output(&topology, data).unwrap();
    assert_eq!(terminal.status, ForwardStatus::FinalProcessed);
    assert_eq!(terminal.data.as_deref(), Some(expected.as_slice()));
    assert_eq!(sink.deliveries().await, vec![("archive:7000".to_string(), expected.clone())]);

    // without a destination the tail answers directly
    let output = client.process_remote(&topology, data, None).await.unwrap();
    assert_eq!(output, expected);

    coordinator.stop().await;
}

#[tokio::test]
async fn dead_hop_surfaces_as_forwarding_failure() {
    let settings = NodeSettings {
        connect_timeout: Duration::from_millis(500),
        response_timeout: Duration::from_secs(2),
        ..NodeSettings::default()
    };
    let coordinator = LockCycleCoordinator::with_parts(config(2), Arc::new(LoopbackRendezvous), settings);
    coordinator.rotate_now().await.unwrap();
    let mut topology = coordinator.current_topology().topology.clone();

    // point the second hop at a port nobody listens on
    let closed = crate::transport::bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
    let dead = closed.local_addr().unwrap().to_string();
    drop(closed);
    let second = topology.node_order[1].clone();
    if let Some(descriptor) = topology.node_configs.get_mut(&second) {
        descriptor.address = dead;
    }

    let response = ChainClient::direct()
        .send_through_chain(&topology, b"x", None)
        .await
        .unwrap();
    assert_eq!(response.status, ForwardStatus::Error);
    assert!(response.message.unwrap().contains("forwarding to"));
    coordinator.stop().await;
}

#[tokio::test]
async fn rotation_loop_survives_a_failed_cycle() {
    let mut config = config(2);
    config.rotation_interval_secs = 1;
    // the coordinator's publication, its retry and both nodes of the first
    // cycle fail
    let provider = Arc::new(FlakyProvider {
        calls: AtomicUsize::new(0),
        failures: 4,
    });
    let coordinator = LockCycleCoordinator::with_parts(config, provider, NodeSettings::default());
    let mut rx = coordinator.subscribe();
    let local = coordinator.start().await.unwrap();

    rx.changed().await.unwrap();
    let first = rx.borrow_and_update().clone();
    assert_eq!(first.epoch, 1);
    assert!(first.topology.is_empty());
    assert_eq!(first.topology.coordinator_address, local.to_string());

    let second = wait_for_epoch(&coordinator, 2).await;
    assert_eq!(second.topology.len(), 2);

    // the coordinator fell back to its direct address, then got published
    assert_ne!(coordinator.address().await, local.to_string());
    assert!(coordinator.address().await.starts_with("rv"));
    assert_eq!(second.topology.coordinator_address, coordinator.address().await);
    coordinator.stop().await;
}

#[tokio::test]
async fn rotation_loop_survives_a_refresh_error() {
    let mut config = config(2);
    config.rotation_interval_secs = 1;
    // no keywords: every refresh fails before any node is created
    config.keywords.clear();
    let coordinator = LockCycleCoordinator::with_parts(config, Arc::new(LoopbackRendezvous), NodeSettings::default());
    coordinator.start().await.unwrap();

    // each failed cycle still publishes an empty topology, so a second
    // epoch means the loop reached its next tick
    let snapshot = wait_for_epoch(&coordinator, 2).await;
    assert!(snapshot.topology.is_empty());
    assert!(coordinator.is_running().await);
    coordinator.stop().await;
}

#[tokio::test]
async fn coordinator_advertises_direct_address_without_provider() {
    let provider = Arc::new(FlakyProvider {
        calls: AtomicUsize::new(0),
        failures: usize::MAX,
    });
    let coordinator = LockCycleCoordinator::with_parts(config(1), provider, NodeSettings::default());
    let local = coordinator.start().await.unwrap();
    assert_eq!(coordinator.address().await, local.to_string());

    let snapshot = wait_for_epoch(&coordinator, 1).await;
    assert!(snapshot.topology.is_empty());
    assert_eq!(snapshot.topology.coordinator_address, local.to_string());

    // payloads are still served over the direct address
    let payload = ChainClient::direct().fetch_topology(&local.to_string()).await.unwrap();
    assert!(payload.chain_topology.is_empty());
    coordinator.stop().await;
}
