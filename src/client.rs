use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::TimeoutConfig;
use crate::error::{CommError, Result};
use crate::key_management::{seal, IdentityKeypair, PublicKey};
use crate::payload::decrypt_payload;
use crate::proxy_chain::ProxyChain;
use crate::relay_protocol::{
    decode, encode, CoordinatorRequest, CoordinatorResponse, ForwardResponse, ForwardStatus, ForwardingEnvelope,
    HopLayer, LockCyclePayload, RouteLayer,
};
use crate::topology::ChainTopology;
use crate::transport::{exchange, Connector, TcpConnector};

/// An envelope ready to hand to the first hop.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub first_hop: String,
    pub envelope: ForwardingEnvelope,
}

/// Client side of a chain: fetches the current topology and pushes data
/// through it.
pub struct ChainClient {
    connector: Arc<dyn Connector>,
    keypair: IdentityKeypair,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl ChainClient {
    pub fn new(connector: Arc<dyn Connector>, timeouts: &TimeoutConfig) -> Self {
        Self {
            connector,
            keypair: IdentityKeypair::generate(),
            connect_timeout: timeouts.connect(),
            response_timeout: timeouts.response(),
        }
    }

    pub fn direct() -> Self {
        Self::new(Arc::new(TcpConnector), &TimeoutConfig::default())
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Ask the coordinator for the current lock cycle.
    pub async fn fetch_topology(&self, coordinator_address: &str) -> Result<LockCyclePayload> {
        let request = encode(&CoordinatorRequest::GetPayload {
            client_public_key: self.public_key().to_base64(),
        })?;
        let reply = exchange(
            self.connector.as_ref(),
            coordinator_address,
            &request,
            self.connect_timeout,
            self.response_timeout,
        )
        .await?;

        match decode::<CoordinatorResponse>(&reply)? {
            CoordinatorResponse::Payload(response) => {
                let payload = decrypt_payload(&self.keypair, &response)?;
                debug!(hops = payload.chain_topology.len(), "topology received");
                Ok(payload)
            }
            CoordinatorResponse::Error { message, .. } => Err(CommError::forwarding(coordinator_address, message)),
        }
    }

    /// Wrap `data` in one layer per hop. Each hop's route is sealed to that
    /// hop and carried inside the previous hop's layer.
    pub fn build_envelope(topology: &ChainTopology, data: &[u8], final_destination: Option<&str>) -> Result<PreparedRequest> {
        let hops: Vec<_> = topology.hops().map(|(_, descriptor)| descriptor).collect();
        let Some(first) = hops.first() else {
            return Err(CommError::InvalidTopology("chain has no nodes".into()));
        };

        let mut onward = None;
        let mut route = RouteLayer::default();
        for (i, hop) in hops.iter().enumerate().rev() {
            let next = hops.get(i + 1);
            route = RouteLayer {
                next_hop_address: next.map(|n| n.address.clone()),
                next_hop_public_key: next.map(|n| n.public_key.clone()),
                final_destination: final_destination.map(str::to_string),
                onward_route: onward.take(),
            };
            if i > 0 {
                onward = Some(seal(&encode(&route)?, &hop.public_key()?)?);
            }
        }

        let layer = HopLayer {
            original_data: data.to_vec(),
            route,
            sealed_route: None,
        };
        Ok(PreparedRequest {
            first_hop: first.address.clone(),
            envelope: ForwardingEnvelope::sealed(seal(&encode(&layer)?, &first.public_key()?)?),
        })
    }

    /// Send `data` through the chain and return the first hop's response.
    pub async fn send_through_chain(
        &self,
        topology: &ChainTopology,
        data: &[u8],
        final_destination: Option<&str>,
    ) -> Result<ForwardResponse> {
        let prepared = Self::build_envelope(topology, data, final_destination)?;
        let reply = exchange(
            self.connector.as_ref(),
            &prepared.first_hop,
            &encode(&prepared.envelope)?,
            self.connect_timeout,
            self.response_timeout,
        )
        .await?;
        Ok(decode(&reply)?)
    }

    /// Like [`ChainClient::send_through_chain`] but returns the tail's output.
    pub async fn process_remote(
        &self,
        topology: &ChainTopology,
        data: &[u8],
        final_destination: Option<&str>,
    ) -> Result<Vec<u8>> {
        let response = self.send_through_chain(topology, data, final_destination).await?;
        let terminal = response.terminal();
        match (terminal.status, &terminal.data) {
            (ForwardStatus::Error, _) => Err(CommError::ForwardingFailure {
                address: format!("hop {}", response.forward_depth()),
                reason: terminal.message.clone().unwrap_or_default(),
            }),
            (_, Some(data)) => Ok(data.clone()),
            (status, None) => Err(CommError::MalformedEnvelope(format!("{status:?} response without data"))),
        }
    }

    /// What the chain should output for `data`, computed locally.
    pub fn expected_output(topology: &ChainTopology, data: &[u8]) -> Result<Vec<u8>> {
        Ok(ProxyChain::from_topology(topology)?.process(data))
    }
}
