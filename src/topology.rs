use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{CommError, Result};
use crate::key_management::PublicKey;
use crate::transform::{HashAlgorithm, ProcessingConfig};

/// Public metadata of one hop, as published to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub address: String,
    pub public_key: String,
    pub keyword: String,
    pub hashing_algorithm: HashAlgorithm,
}

impl NodeDescriptor {
    pub fn processing_config(&self) -> ProcessingConfig {
        ProcessingConfig::new(self.keyword.clone(), self.hashing_algorithm)
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_base64(&self.public_key)
    }
}

/// Immutable snapshot of one lock cycle's chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTopology {
    pub node_order: Vec<String>,
    pub node_configs: BTreeMap<String, NodeDescriptor>,
    pub coordinator_address: String,
}

impl ChainTopology {
    /// Build a topology, rejecting any `node_order` that is not a permutation
    /// of the `node_configs` keys.
    pub fn new(
        node_order: Vec<String>,
        node_configs: BTreeMap<String, NodeDescriptor>,
        coordinator_address: impl Into<String>,
    ) -> Result<Self> {
        let topology = Self {
            node_order,
            node_configs,
            coordinator_address: coordinator_address.into(),
        };
        topology.validate()?;
        Ok(topology)
    }

    pub fn empty(coordinator_address: impl Into<String>) -> Self {
        Self {
            coordinator_address: coordinator_address.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_order.len() != self.node_configs.len() {
            return Err(CommError::InvalidTopology(format!(
                "{} ids in order, {} configs",
                self.node_order.len(),
                self.node_configs.len()
            )));
        }
        let mut seen = HashSet::with_capacity(self.node_order.len());
        for id in &self.node_order {
            if !seen.insert(id.as_str()) {
                return Err(CommError::InvalidTopology(format!("duplicate node id {id}")));
            }
            if !self.node_configs.contains_key(id) {
                return Err(CommError::InvalidTopology(format!("unknown node id {id}")));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.node_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_order.is_empty()
    }

    /// Hops in chain order.
    pub fn hops(&self) -> impl Iterator<Item = (&str, &NodeDescriptor)> {
        self.node_order
            .iter()
            .filter_map(|id| self.node_configs.get(id).map(|d| (id.as_str(), d)))
    }

    pub fn processing_configs(&self) -> BTreeMap<String, ProcessingConfig> {
        self.node_configs
            .iter()
            .map(|(id, d)| (id.clone(), d.processing_config()))
            .collect()
    }
}

/// A published topology tagged with the lock cycle that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub epoch: u64,
    pub topology: ChainTopology,
}

/// Holds the current topology. Readers get an `Arc` to a whole snapshot;
/// writers swap in a new one, never editing in place.
#[derive(Debug)]
pub struct TopologyHolder {
    tx: watch::Sender<Arc<TopologySnapshot>>,
}

impl TopologyHolder {
    pub fn new(initial: ChainTopology) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(TopologySnapshot {
            epoch: 0,
            topology: initial,
        }));
        Self { tx }
    }

    pub fn current(&self) -> Arc<TopologySnapshot> {
        self.tx.borrow().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.tx.borrow().epoch
    }

    /// Replace the snapshot wholesale; returns the new epoch.
    pub fn replace(&self, topology: ChainTopology) -> u64 {
        let epoch = self.epoch() + 1;
        self.tx.send_replace(Arc::new(TopologySnapshot { epoch, topology }));
        epoch
    }

    /// Receiver notified on every replacement.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologySnapshot>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(address: &str) -> NodeDescriptor {
        NodeDescriptor {
            address: address.to_string(),
            public_key: crate::key_management::IdentityKeypair::generate()
                .public_key()
                .to_base64(),
            keyword: "keyword_1".into(),
            hashing_algorithm: HashAlgorithm::Sha256,
        }
    }

    fn configs(ids: &[&str]) -> BTreeMap<String, NodeDescriptor> {
        ids.iter()
            .map(|id| (id.to_string(), descriptor(&format!("{id}.onion:80"))))
            .collect()
    }

    #[test]
    fn accepts_permutation() {
        let topology = ChainTopology::new(
            vec!["b".into(), "a".into()],
            configs(&["a", "b"]),
            "coord:8000",
        )
        .unwrap();
        let order: Vec<&str> = topology.hops().map(|(id, _)| id).collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn rejects_duplicates_missing_and_length_mismatch() {
        assert!(ChainTopology::new(vec!["a".into(), "a".into()], configs(&["a", "b"]), "c").is_err());
        assert!(ChainTopology::new(vec!["a".into(), "z".into()], configs(&["a", "b"]), "c").is_err());
        assert!(ChainTopology::new(vec!["a".into()], configs(&["a", "b"]), "c").is_err());
    }

    #[test]
    fn holder_swaps_whole_snapshots() {
        let holder = TopologyHolder::new(ChainTopology::empty("coord:1"));
        let before = holder.current();
        assert_eq!(before.epoch, 0);

        let next = ChainTopology::new(vec!["a".into()], configs(&["a"]), "coord:1").unwrap();
        assert_eq!(holder.replace(next.clone()), 1);

        // A reader holding the old snapshot still sees it intact.
        assert!(before.topology.is_empty());
        assert_eq!(holder.current().topology, next);
        assert_eq!(holder.epoch(), 1);
    }

    #[tokio::test]
    async fn subscribers_observe_replacement() {
        let holder = TopologyHolder::new(ChainTopology::empty("coord:1"));
        let mut rx = holder.subscribe();
        holder.replace(ChainTopology::new(vec!["a".into()], configs(&["a"]), "coord:1").unwrap());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().epoch, 1);
    }

    #[test]
    fn topology_json_shape() {
        let topology = ChainTopology::new(vec!["a".into()], configs(&["a"]), "coord:1").unwrap();
        let value = serde_json::to_value(&topology).unwrap();
        assert_eq!(value["node_order"][0], "a");
        assert_eq!(value["node_configs"]["a"]["hashing_algorithm"], "sha256");
        assert_eq!(value["coordinator_address"], "coord:1");
    }
}
