use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{CommError, Result};
use crate::key_management::{seal, IdentityKeypair, PublicKey};
use crate::relay_protocol::{
    decode, encode, ForwardResponse, ForwardingEnvelope, HopLayer, RouteLayer,
};
use crate::rendezvous::{RendezvousAddress, RendezvousProvider};
use crate::sink::{FinalSink, LogSink};
use crate::topology::NodeDescriptor;
use crate::transform::{HashAlgorithm, ProcessingConfig};
use crate::transport::{bind_listener, exchange, spawn_server, Connector, FrameHandler, ServerHandle, TcpConnector};

/// Collaborators and deadlines a hop uses while handling traffic.
#[derive(Clone)]
pub struct NodeSettings {
    pub connector: Arc<dyn Connector>,
    pub sink: Arc<dyn FinalSink>,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            connector: Arc::new(TcpConnector),
            sink: Arc::new(LogSink),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for NodeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSettings")
            .field("connect_timeout", &self.connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

/// Who a node is for the lifetime of one lock cycle.
#[derive(Debug)]
pub struct NodeIdentity {
    pub node_id: String,
    keypair: IdentityKeypair,
}

impl NodeIdentity {
    pub fn generate(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            keypair: IdentityKeypair::generate(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }
}

/// The part of a node shared with its connection tasks.
struct Hop {
    identity: NodeIdentity,
    config: RwLock<ProcessingConfig>,
    settings: NodeSettings,
}

impl Hop {
    fn config(&self) -> ProcessingConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn process(&self, data: &[u8]) -> Vec<u8> {
        self.config().apply(data)
    }

    async fn handle_envelope(&self, envelope: ForwardingEnvelope) -> ForwardResponse {
        match self.try_handle(envelope).await {
            Ok(response) => response,
            Err(e) => {
                warn!(node_id = %self.identity.node_id, error = %e, "hop request failed");
                ForwardResponse::error(e.to_string())
            }
        }
    }

    async fn try_handle(&self, envelope: ForwardingEnvelope) -> Result<ForwardResponse> {
        let plaintext = self.identity.keypair.open(&envelope.this_hop_ciphertext)?;
        let layer: HopLayer = decode(&plaintext)
            .map_err(|e| CommError::MalformedEnvelope(format!("hop layer: {e}")))?;
        let route = self.resolve_route(&layer, &envelope)?;
        let processed = self.process(&layer.original_data);

        match (&route.next_hop_address, &route.next_hop_public_key) {
            (Some(address), Some(public_key)) => {
                let downstream = self.forward(processed, address, public_key, route.clone()).await?;
                Ok(ForwardResponse::forwarded(downstream))
            }
            _ => match &route.final_destination {
                Some(destination) => {
                    self.settings
                        .sink
                        .deliver(destination, &processed)
                        .await
                        .map_err(|e| CommError::forwarding(destination.as_str(), e))?;
                    debug!(node_id = %self.identity.node_id, "tail hop delivered");
                    Ok(ForwardResponse::final_processed(processed))
                }
                None => Ok(ForwardResponse::processed(processed)),
            },
        }
    }

    /// A route sealed to this hop wins over clear fields in the layer, which
    /// win over clear fields on the outer envelope.
    fn resolve_route(&self, layer: &HopLayer, envelope: &ForwardingEnvelope) -> Result<RouteLayer> {
        if let Some(sealed) = &layer.sealed_route {
            let plaintext = self.identity.keypair.open(sealed)?;
            let mut route: RouteLayer = decode(&plaintext)
                .map_err(|e| CommError::MalformedEnvelope(format!("sealed route: {e}")))?;
            if route.final_destination.is_none() {
                route.final_destination = layer.route.final_destination.clone();
            }
            return Ok(route);
        }
        if !layer.route.is_empty() {
            return Ok(layer.route.clone());
        }
        Ok(RouteLayer {
            next_hop_address: envelope.next_hop_address.clone(),
            next_hop_public_key: envelope.next_hop_public_key.clone(),
            final_destination: envelope.final_destination.clone(),
            onward_route: None,
        })
    }

    async fn forward(&self, processed: Vec<u8>, address: &str, public_key: &str, route: RouteLayer) -> Result<ForwardResponse> {
        let next_key = PublicKey::from_base64(public_key).map_err(|e| CommError::forwarding(address, e))?;

        // The onward route is sealed to the next hop; this hop only relays it.
        let next_layer = HopLayer {
            original_data: processed,
            route: RouteLayer {
                final_destination: route.final_destination,
                ..RouteLayer::default()
            },
            sealed_route: route.onward_route,
        };
        let sealed = seal(&encode(&next_layer)?, &next_key).map_err(|e| CommError::forwarding(address, e))?;
        let envelope = ForwardingEnvelope::sealed(sealed);

        debug!(node_id = %self.identity.node_id, next_hop = %address, "forwarding");
        let response = exchange(
            self.settings.connector.as_ref(),
            address,
            &encode(&envelope)?,
            self.settings.connect_timeout,
            self.settings.response_timeout,
        )
        .await?;
        decode(&response).map_err(|e| CommError::forwarding(address, format!("unreadable response: {e}")))
    }
}

#[async_trait]
impl FrameHandler for Hop {
    async fn handle_frame(&self, frame: Vec<u8>) -> Vec<u8> {
        let response = match decode::<ForwardingEnvelope>(&frame) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => {
                let err = CommError::MalformedEnvelope(e.to_string());
                warn!(node_id = %self.identity.node_id, error = %err, "rejecting frame");
                ForwardResponse::error(err.to_string())
            }
        };
        encode(&response).unwrap_or_else(|_| br#"{"status":"error","message":"response encoding failed"}"#.to_vec())
    }
}

/// One hop of the chain.
pub struct Node {
    hop: Arc<Hop>,
    listener: Option<TcpListener>,
    local_endpoint: Option<SocketAddr>,
    server: Option<ServerHandle>,
    rendezvous: Option<(RendezvousAddress, Arc<dyn RendezvousProvider>)>,
}

impl Node {
    /// A node with an identity but no listener, for in-process use.
    pub fn local(node_id: impl Into<String>, config: ProcessingConfig) -> Self {
        Self::with_settings(node_id, config, NodeSettings::default())
    }

    pub fn with_settings(node_id: impl Into<String>, config: ProcessingConfig, settings: NodeSettings) -> Self {
        Self {
            hop: Arc::new(Hop {
                identity: NodeIdentity::generate(node_id),
                config: RwLock::new(config),
                settings,
            }),
            listener: None,
            local_endpoint: None,
            server: None,
            rendezvous: None,
        }
    }

    /// Generate a fresh identity and bind the node's listening endpoint.
    /// Publication is a separate, best-effort step (see [`Node::publish`]).
    pub fn create(
        node_id: impl Into<String>,
        keyword: impl Into<String>,
        hashing_algorithm: HashAlgorithm,
        bind: SocketAddr,
        settings: NodeSettings,
    ) -> Result<Self> {
        let mut node = Self::with_settings(node_id, ProcessingConfig::new(keyword, hashing_algorithm), settings);
        let listener = bind_listener(bind)?;
        node.local_endpoint = Some(listener.local_addr()?);
        node.listener = Some(listener);
        Ok(node)
    }

    pub fn node_id(&self) -> &str {
        &self.hop.identity.node_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.hop.identity.public_key()
    }

    pub fn config(&self) -> ProcessingConfig {
        self.hop.config()
    }

    /// Swap the processing parameters; the identity is untouched.
    pub fn reconfigure(&self, config: ProcessingConfig) {
        *self
            .hop
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local_endpoint
    }

    pub fn address(&self) -> Option<&str> {
        self.rendezvous.as_ref().map(|(a, _)| a.address.as_str())
    }

    pub fn is_running(&self) -> bool {
        self.server.as_ref().is_some_and(ServerHandle::is_running)
    }

    /// Public metadata, present only once the node has a published address.
    pub fn descriptor(&self) -> Option<NodeDescriptor> {
        let address = self.address()?;
        let config = self.config();
        Some(NodeDescriptor {
            address: address.to_string(),
            public_key: self.public_key().to_base64(),
            keyword: config.keyword,
            hashing_algorithm: config.hashing_algorithm,
        })
    }

    pub fn process(&self, data: &[u8]) -> Vec<u8> {
        self.hop.process(data)
    }

    #[cfg(test)]
    pub(crate) fn open_sealed(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.hop.identity.keypair.open(sealed)
    }

    pub async fn handle_envelope(&self, envelope: ForwardingEnvelope) -> ForwardResponse {
        self.hop.handle_envelope(envelope).await
    }

    /// Entry point for raw wire frames.
    pub async fn handle_frame(&self, frame: Vec<u8>) -> Vec<u8> {
        self.hop.handle_frame(frame).await
    }

    /// Begin accepting connections. Idempotent once running.
    pub fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| CommError::Config(format!("node {} has no listener", self.node_id())))?;
        let handler: Arc<dyn FrameHandler> = self.hop.clone();
        let server = spawn_server(listener, handler, self.node_id())?;
        info!(node_id = %self.node_id(), endpoint = %server.local_addr(), "node started");
        self.server = Some(server);
        Ok(())
    }

    /// Publish the listening endpoint, waiting at most `timeout`.
    pub async fn publish(&mut self, provider: Arc<dyn RendezvousProvider>, timeout: Duration) -> Result<&str> {
        let endpoint = self
            .local_endpoint
            .ok_or_else(|| CommError::Config(format!("node {} has no listener", self.node_id())))?;
        let published = tokio::time::timeout(timeout, provider.publish(endpoint))
            .await
            .map_err(|_| CommError::ProviderPublishTimeout(timeout))??;
        info!(node_id = %self.node_id(), address = %published.address, provider = provider.name(), "node published");
        let (address, _) = self.rendezvous.insert((published, provider));
        Ok(address.address.as_str())
    }

    /// Close the listener and retract the published address. Provider
    /// errors are logged, never returned.
    pub async fn stop(&mut self) {
        self.listener = None;
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        if let Some((address, provider)) = self.rendezvous.take() {
            if let Err(e) = provider.retract(&address).await {
                warn!(node_id = %self.node_id(), address = %address.address, error = %e, "retract failed");
            }
        }
        debug!(node_id = %self.node_id(), "node stopped");
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id())
            .field("local_endpoint", &self.local_endpoint)
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
