use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::CoordinatorConfig;
use crate::error::{CommError, Result};
use crate::node::{Node, NodeSettings};
use crate::payload::get_payload;
use crate::relay_protocol::{decode, encode, CoordinatorRequest, CoordinatorResponse};
use crate::rendezvous::{RendezvousAddress, RendezvousProvider};
use crate::topology::{ChainTopology, TopologyHolder, TopologySnapshot};
use crate::transform::HashAlgorithm;
use crate::transport::{bind_listener, spawn_server, FrameHandler, ServerHandle};

const PROCESS_DATA_REFUSAL: &str = "the coordinator does not process data; use the distributed nodes";

/// A node left out of a cohort, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedNode {
    pub node_id: String,
    pub reason: String,
}

/// Outcome of one lock cycle rotation.
#[derive(Debug, Clone)]
pub struct RotationReport {
    pub epoch: u64,
    pub requested: usize,
    pub published: usize,
    pub excluded: Vec<ExcludedNode>,
}

impl RotationReport {
    /// `ChainUnderflow` when fewer nodes published than were requested.
    pub fn underflow(&self) -> Option<CommError> {
        (self.published < self.requested).then_some(CommError::ChainUnderflow {
            requested: self.requested,
            published: self.published,
        })
    }
}

struct NodePlan {
    node_id: String,
    keyword: String,
    hashing_algorithm: HashAlgorithm,
}

#[derive(Default)]
struct Cohort {
    nodes: Vec<Node>,
}

impl Cohort {
    fn ids(&self) -> HashSet<String> {
        self.nodes.iter().map(|n| n.node_id().to_string()).collect()
    }

    fn addresses(&self) -> HashSet<String> {
        self.nodes
            .iter()
            .filter_map(|n| n.address().map(str::to_string))
            .collect()
    }

    async fn teardown(&mut self) {
        for mut node in self.nodes.drain(..) {
            node.stop().await;
        }
    }
}

/// The coordinator's own reachability.
#[derive(Default)]
struct OwnAddress {
    endpoint: Option<SocketAddr>,
    published: Option<RendezvousAddress>,
    advertised: String,
}

struct Shared {
    config: CoordinatorConfig,
    provider: Arc<dyn RendezvousProvider>,
    node_settings: NodeSettings,
    holder: TopologyHolder,
    cohort: Mutex<Cohort>,
    own: Mutex<OwnAddress>,
}

impl Shared {
    async fn advertised_address(&self) -> String {
        self.own.lock().await.advertised.clone()
    }

    async fn refresh(&self, count: usize) -> Result<RotationReport> {
        let mut cohort = self.cohort.lock().await;

        // The old cohort goes down before the new one is up; the chain is
        // unavailable in between.
        let retired_ids = cohort.ids();
        let retired_addresses = cohort.addresses();
        cohort.teardown().await;

        let plans = match self.plan_cohort(count, &retired_ids) {
            Ok(plans) => plans,
            Err(e) => {
                self.clear_topology().await;
                return Err(e);
            }
        };
        let mut excluded = Vec::new();
        let mut pending = JoinSet::new();
        let bind = SocketAddr::new(self.config.node_host, 0);
        let publish_timeout = self.config.publish_timeout();

        for plan in plans {
            let mut node = match Node::create(
                plan.node_id.clone(),
                plan.keyword,
                plan.hashing_algorithm,
                bind,
                self.node_settings.clone(),
            ) {
                Ok(node) => node,
                Err(e) => {
                    warn!(node_id = %plan.node_id, error = %e, "node creation failed");
                    excluded.push(ExcludedNode {
                        node_id: plan.node_id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let provider = self.provider.clone();
            pending.spawn(async move {
                let outcome = match node.start() {
                    Ok(()) => node.publish(provider, publish_timeout).await.map(str::to_string),
                    Err(e) => Err(e),
                };
                (node, outcome)
            });
        }

        let mut survivors = Vec::with_capacity(count);
        while let Some(joined) = pending.join_next().await {
            let (mut node, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "node provisioning task failed");
                    continue;
                }
            };
            let reason = match outcome {
                Ok(address) if retired_addresses.contains(&address) => {
                    format!("address {address} was used by the previous cohort")
                }
                Ok(_) => {
                    survivors.push(node);
                    continue;
                }
                Err(e) => e.to_string(),
            };
            warn!(node_id = %node.node_id(), %reason, "node excluded from cohort");
            node.stop().await;
            excluded.push(ExcludedNode {
                node_id: node.node_id().to_string(),
                reason,
            });
        }

        let mut node_order: Vec<String> = survivors.iter().map(|n| n.node_id().to_string()).collect();
        node_order.shuffle(&mut rand::thread_rng());
        let node_configs: BTreeMap<_, _> = survivors
            .iter()
            .filter_map(|n| n.descriptor().map(|d| (n.node_id().to_string(), d)))
            .collect();

        let topology = match ChainTopology::new(node_order, node_configs, self.advertised_address().await) {
            Ok(topology) => topology,
            Err(e) => {
                for mut node in survivors {
                    node.stop().await;
                }
                self.clear_topology().await;
                return Err(e);
            }
        };
        let published = topology.len();
        cohort.nodes = survivors;
        let epoch = self.holder.replace(topology);

        let report = RotationReport {
            epoch,
            requested: count,
            published,
            excluded,
        };
        match report.underflow() {
            Some(underflow) => warn!(epoch, error = %underflow, "lock cycle degraded"),
            None => info!(epoch, nodes = published, "lock cycle rotated"),
        }
        Ok(report)
    }

    /// Publish a topology with no nodes so readers never see torn-down ones.
    async fn clear_topology(&self) {
        let advertised = self.advertised_address().await;
        self.holder.replace(ChainTopology::empty(advertised));
    }

    /// Fresh ids and random processing parameters. Ids never repeat one
    /// from the cohort being retired.
    fn plan_cohort(&self, count: usize, retired: &HashSet<String>) -> Result<Vec<NodePlan>> {
        let mut rng = rand::thread_rng();
        let mut taken = HashSet::with_capacity(count);
        let mut plans = Vec::with_capacity(count);
        while plans.len() < count {
            let node_id = format!("node_{:016x}", rng.gen::<u64>());
            if retired.contains(&node_id) || !taken.insert(node_id.clone()) {
                continue;
            }
            let keyword = self
                .config
                .keywords
                .choose(&mut rng)
                .ok_or_else(|| CommError::Config("keywords pool is empty".into()))?;
            let hashing_algorithm = *self
                .config
                .hashing_algorithms
                .choose(&mut rng)
                .ok_or_else(|| CommError::Config("hashing_algorithms pool is empty".into()))?;
            plans.push(NodePlan {
                node_id,
                keyword: keyword.clone(),
                hashing_algorithm,
            });
        }
        Ok(plans)
    }

    /// Publish the coordinator endpoint, advertising the direct address
    /// when the provider fails.
    async fn publish_own_address(&self) {
        let endpoint = {
            let own = self.own.lock().await;
            match (own.endpoint, &own.published) {
                (Some(endpoint), None) => endpoint,
                _ => return,
            }
        };
        let timeout = self.config.publish_timeout();
        let attempt = tokio::time::timeout(timeout, self.provider.publish(endpoint))
            .await
            .map_err(|_| CommError::ProviderPublishTimeout(timeout))
            .and_then(|r| r);

        let mut own = self.own.lock().await;
        match attempt {
            Ok(address) => {
                info!(address = %address.address, "coordinator address published");
                own.advertised = address.address.clone();
                own.published = Some(address);
            }
            Err(e) => {
                own.advertised = endpoint.to_string();
                warn!(error = %e, fallback = %own.advertised, "coordinator publication failed, advertising direct address");
            }
        }
    }

    async fn retract_own_address(&self) {
        let mut own = self.own.lock().await;
        if let Some(address) = own.published.take() {
            if let Err(e) = self.provider.retract(&address).await {
                warn!(address = %address.address, error = %e, "coordinator retract failed");
            }
        }
        own.endpoint = None;
    }

    async fn rotate(&self) {
        self.publish_own_address().await;
        if let Err(e) = self.refresh(self.config.cohort_size).await {
            warn!(error = %e, "rotation failed");
        }
    }

    async fn respond(&self, request: CoordinatorRequest) -> CoordinatorResponse {
        match request {
            CoordinatorRequest::GetPayload { client_public_key } => {
                let snapshot = self.holder.current();
                let address = self.advertised_address().await;
                match get_payload(&snapshot.topology, &address, &client_public_key) {
                    Ok(payload) => {
                        debug!(epoch = snapshot.epoch, "payload served");
                        CoordinatorResponse::Payload(payload)
                    }
                    Err(e) => {
                        warn!(error = %e, "payload request rejected");
                        CoordinatorResponse::error(e.to_string())
                    }
                }
            }
            CoordinatorRequest::ProcessData { .. } => CoordinatorResponse::error(PROCESS_DATA_REFUSAL),
        }
    }
}

#[async_trait]
impl FrameHandler for Shared {
    async fn handle_frame(&self, frame: Vec<u8>) -> Vec<u8> {
        let response = match decode::<CoordinatorRequest>(&frame) {
            Ok(request) => self.respond(request).await,
            Err(e) => CoordinatorResponse::error(format!("unknown or malformed request: {e}")),
        };
        encode(&response).unwrap_or_else(|_| br#"{"status":"error","message":"response encoding failed"}"#.to_vec())
    }
}

struct Running {
    server: ServerHandle,
    cancel: CancellationToken,
    rotation: JoinHandle<()>,
}

/// Owns the current lock cycle: one live node cohort and the topology
/// built from it.
pub struct LockCycleCoordinator {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl LockCycleCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let provider = config.rendezvous.build();
        let connector = config.outbound.build();
        let node_settings = NodeSettings {
            sink: config.final_sink.build(connector.clone(), config.timeouts.response()),
            connector,
            connect_timeout: config.timeouts.connect(),
            response_timeout: config.timeouts.response(),
        };
        Self::with_parts(config, provider, node_settings)
    }

    pub fn with_parts(config: CoordinatorConfig, provider: Arc<dyn RendezvousProvider>, node_settings: NodeSettings) -> Self {
        let advertised = config.listen.to_string();
        Self {
            shared: Arc::new(Shared {
                holder: TopologyHolder::new(ChainTopology::empty(advertised.clone())),
                config,
                provider,
                node_settings,
                cohort: Mutex::new(Cohort::default()),
                own: Mutex::new(OwnAddress {
                    advertised,
                    ..OwnAddress::default()
                }),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Tear down the current cohort and build a new one of up to `count`
    /// nodes. A short chain is reported, not returned as an error.
    pub async fn refresh(&self, count: usize) -> Result<RotationReport> {
        self.shared.refresh(count).await
    }

    pub async fn rotate_now(&self) -> Result<RotationReport> {
        self.refresh(self.shared.config.cohort_size).await
    }

    pub fn current_topology(&self) -> Arc<TopologySnapshot> {
        self.shared.holder.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologySnapshot>> {
        self.shared.holder.subscribe()
    }

    /// The address clients should use to reach `get_payload`.
    pub async fn address(&self) -> String {
        self.shared.advertised_address().await
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Serve requests, publish the coordinator address and start the
    /// rotation task. The first rotation runs immediately.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.server.local_addr());
        }

        let listener = bind_listener(self.shared.config.listen)?;
        let handler: Arc<dyn FrameHandler> = self.shared.clone();
        let server = spawn_server(listener, handler, "coordinator")?;
        let local_addr = server.local_addr();
        {
            let mut own = self.shared.own.lock().await;
            own.endpoint = Some(local_addr);
            own.advertised = local_addr.to_string();
        }
        self.shared.publish_own_address().await;

        let cancel = CancellationToken::new();
        let rotation = tokio::spawn(
            rotation_loop(self.shared.clone(), cancel.clone()).instrument(info_span!("rotation")),
        );
        info!(listen = %local_addr, "coordinator started");

        *running = Some(Running {
            server,
            cancel,
            rotation,
        });
        Ok(local_addr)
    }

    /// Stop rotating and serving if started, then tear down the cohort and
    /// retract the coordinator address. Cohorts built on demand with
    /// [`LockCycleCoordinator::refresh`] are torn down too.
    pub async fn stop(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.cancel.cancel();
            if let Err(e) = running.rotation.await {
                warn!(error = %e, "rotation task ended abnormally");
            }
            running.server.shutdown().await;
        }

        self.shared.cohort.lock().await.teardown().await;
        self.shared.retract_own_address().await;
        self.shared.clear_topology().await;
        info!("coordinator stopped");
    }
}

async fn rotation_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.rotation_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("rotation loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }
        // A started rotation always runs to completion.
        shared.rotate().await;
    }
}
