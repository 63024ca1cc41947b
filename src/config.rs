//! Coordinator configuration, read from TOML.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CommError, Result};
use crate::logging::LoggingConfig;
use crate::rendezvous::{LoopbackRendezvous, RendezvousProvider};
use crate::sink::{ConnectorSink, FinalSink, LogSink};
#[cfg(feature = "tor")]
use crate::rendezvous::{TorControlConfig, TorControlRendezvous};
use crate::transform::HashAlgorithm;
#[cfg(feature = "tor")]
use crate::transport::Socks5Connector;
use crate::transport::{Connector, TcpConnector};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Where the coordinator serves `get_payload`.
    pub listen: SocketAddr,

    /// Interface node listeners bind to. Ports are chosen by the OS.
    pub node_host: IpAddr,

    pub cohort_size: usize,
    pub rotation_interval_secs: u64,

    /// Per-node wait for rendezvous confirmation.
    pub publish_timeout_secs: u64,

    /// Candidate pools nodes draw their processing parameters from.
    pub keywords: Vec<String>,
    pub hashing_algorithms: Vec<HashAlgorithm>,

    pub timeouts: TimeoutConfig,
    pub rendezvous: RendezvousConfig,
    pub outbound: OutboundConfig,
    pub final_sink: FinalSinkConfig,
    pub logging: LoggingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            node_host: IpAddr::from([127, 0, 0, 1]),
            cohort_size: 6,
            rotation_interval_secs: 60,
            publish_timeout_secs: 20,
            keywords: (0..8).map(|i| format!("keyword_{i}")).collect(),
            hashing_algorithms: HashAlgorithm::ALL.to_vec(),
            timeouts: TimeoutConfig::default(),
            rendezvous: RendezvousConfig::default(),
            outbound: OutboundConfig::default(),
            final_sink: FinalSinkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CommError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| CommError::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cohort_size == 0 {
            return Err(CommError::Config("cohort_size must be at least 1".into()));
        }
        if self.keywords.is_empty() {
            return Err(CommError::Config("keywords pool is empty".into()));
        }
        if self.hashing_algorithms.is_empty() {
            return Err(CommError::Config("hashing_algorithms pool is empty".into()));
        }
        if self.rotation_interval_secs == 0 || self.publish_timeout_secs == 0 {
            return Err(CommError::Config(
                "rotation_interval_secs and publish_timeout_secs must be non-zero".into(),
            ));
        }
        if self.timeouts.connect_timeout_secs == 0 || self.timeouts.response_timeout_secs == 0 {
            return Err(CommError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_response_timeout() -> u64 {
    30
}

/// Which rendezvous provider publishes node and coordinator addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RendezvousConfig {
    #[default]
    Loopback,
    #[cfg(feature = "tor")]
    Tor(TorControlConfig),
}

impl RendezvousConfig {
    pub fn build(&self) -> Arc<dyn RendezvousProvider> {
        match self {
            RendezvousConfig::Loopback => Arc::new(LoopbackRendezvous),
            #[cfg(feature = "tor")]
            RendezvousConfig::Tor(config) => Arc::new(TorControlRendezvous::new(config.clone())),
        }
    }
}

/// How hops reach the next hop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutboundConfig {
    #[default]
    Direct,
    #[cfg(feature = "tor")]
    Socks5 {
        #[serde(default = "default_socks_proxy")]
        proxy_addr: SocketAddr,
    },
}

impl OutboundConfig {
    pub fn build(&self) -> Arc<dyn Connector> {
        match self {
            OutboundConfig::Direct => Arc::new(TcpConnector),
            #[cfg(feature = "tor")]
            OutboundConfig::Socks5 { proxy_addr } => Arc::new(Socks5Connector::new(*proxy_addr)),
        }
    }
}

/// What tail hops do with their output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FinalSinkConfig {
    /// Log the delivery and drop the data.
    #[default]
    Log,
    /// Send the data as one frame to `final_destination` through the
    /// outbound connector.
    Connect,
}

impl FinalSinkConfig {
    pub fn build(&self, connector: Arc<dyn Connector>, timeout: Duration) -> Arc<dyn FinalSink> {
        match self {
            FinalSinkConfig::Log => Arc::new(LogSink),
            FinalSinkConfig::Connect => Arc::new(ConnectorSink::new(connector, timeout)),
        }
    }
}

#[cfg(feature = "tor")]
fn default_socks_proxy() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9050))
}
