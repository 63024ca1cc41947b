use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;

mod loopback;
#[cfg(feature = "tor")]
mod tor_control;

pub use loopback::LoopbackRendezvous;
#[cfg(feature = "tor")]
pub use tor_control::{TorControlConfig, TorControlRendezvous};

/// A public address routed to a local endpoint, plus whatever the provider
/// needs to retract it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousAddress {
    pub address: String,
    pub provider_handle: String,
}

/// Publishes and retracts public addresses for local listeners.
///
/// `publish` resolves only once the address is reachable; callers bound it
/// with their own timeout.
#[async_trait]
pub trait RendezvousProvider: Send + Sync {
    async fn publish(&self, local_endpoint: SocketAddr) -> Result<RendezvousAddress>;

    async fn retract(&self, address: &RendezvousAddress) -> Result<()>;

    fn name(&self) -> &'static str;
}
