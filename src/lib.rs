//! Ghost-Comm: a rotating multi-hop proxy chain.
//!
//! A [`LockCycleCoordinator`] keeps one cohort of [`Node`]s alive per lock
//! cycle and hands clients the resulting [`ChainTopology`] through a
//! hybrid-encrypted payload. Clients wrap data in one sealed layer per hop;
//! each hop transforms the data and forwards it to the next.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod key_management;
pub mod logging;
pub mod node;
pub mod payload;
pub mod proxy_chain;
pub mod relay_protocol;
pub mod rendezvous;
pub mod sink;
pub mod topology;
pub mod transform;
pub mod transport;

#[cfg(test)]
mod lock_cycle_tests;

pub use client::ChainClient;
pub use config::CoordinatorConfig;
pub use coordinator::{LockCycleCoordinator, RotationReport};
pub use error::{CommError, Result};
pub use node::{Node, NodeSettings};
pub use proxy_chain::ProxyChain;
pub use topology::{ChainTopology, NodeDescriptor};
pub use transform::{transform, HashAlgorithm, ProcessingConfig};
