use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::debug;

use super::{RendezvousAddress, RendezvousProvider};
use crate::error::{CommError, Result};

/// Publishes the local endpoint itself. Used when no anonymity network is
/// available; offers no address hiding.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackRendezvous;

#[async_trait]
impl RendezvousProvider for LoopbackRendezvous {
    async fn publish(&self, local_endpoint: SocketAddr) -> Result<RendezvousAddress> {
        if local_endpoint.port() == 0 {
            return Err(CommError::ProviderUnavailable(
                "cannot publish an unbound endpoint".into(),
            ));
        }
        let address = local_endpoint.to_string();
        debug!(%address, "loopback address published");
        Ok(RendezvousAddress {
            provider_handle: address.clone(),
            address,
        })
    }

    async fn retract(&self, address: &RendezvousAddress) -> Result<()> {
        debug!(address = %address.address, "loopback address retracted");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}
