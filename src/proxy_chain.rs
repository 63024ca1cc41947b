use std::collections::BTreeMap;

use crate::error::{CommError, Result};
use crate::node::Node;
use crate::topology::ChainTopology;
use crate::transform::ProcessingConfig;

/// Runs the per-hop transforms in process, in chain order, with no network.
///
/// Used to check what a distributed chain should produce.
#[derive(Debug)]
pub struct ProxyChain {
    order: Vec<String>,
    nodes: BTreeMap<String, Node>,
}

impl ProxyChain {
    pub fn new(node_configs: &BTreeMap<String, ProcessingConfig>, node_order: &[String]) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for id in node_order {
            let config = node_configs
                .get(id)
                .ok_or_else(|| CommError::InvalidTopology(format!("no config for node {id}")))?;
            if nodes.insert(id.clone(), Node::local(id.clone(), config.clone())).is_some() {
                return Err(CommError::InvalidTopology(format!("duplicate node id {id}")));
            }
        }
        Ok(Self {
            order: node_order.to_vec(),
            nodes,
        })
    }

    pub fn from_topology(topology: &ChainTopology) -> Result<Self> {
        Self::new(&topology.processing_configs(), &topology.node_order)
    }

    pub fn node_order(&self) -> &[String] {
        &self.order
    }

    /// Left fold of each node's transform in chain order.
    pub fn process(&self, data: &[u8]) -> Vec<u8> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .fold(data.to_vec(), |acc, node| node.process(&acc))
    }

    pub fn configs(&self) -> BTreeMap<String, ProcessingConfig> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.config()))
            .collect()
    }

    /// Reconfigure the named nodes in place. Unknown ids are rejected before
    /// anything changes.
    pub fn update_configs(&mut self, new_configs: &BTreeMap<String, ProcessingConfig>) -> Result<()> {
        if let Some(unknown) = new_configs.keys().find(|id| !self.nodes.contains_key(*id)) {
            return Err(CommError::InvalidTopology(format!("unknown node id {unknown}")));
        }
        for (id, config) in new_configs {
            if let Some(node) = self.nodes.get(id) {
                node.reconfigure(config.clone());
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{transform, HashAlgorithm};

    fn chain_configs() -> (BTreeMap<String, ProcessingConfig>, Vec<String>) {
        let configs: BTreeMap<String, ProcessingConfig> = [
            ("node_a", "keyword_0", HashAlgorithm::Sha256),
            ("node_b", "keyword_3", HashAlgorithm::Sha512),
            ("node_c", "keyword_6", HashAlgorithm::Sha3_256),
        ]
        .into_iter()
        .map(|(id, kw, algo)| (id.to_string(), ProcessingConfig::new(kw, algo)))
        .collect();
        let order = vec!["node_c".to_string(), "node_a".to_string(), "node_b".to_string()];
        (configs, order)
    }

    #[test]
    fn process_is_left_fold_in_order() {
        let (configs, order) = chain_configs();
        let chain = ProxyChain::new(&configs, &order).unwrap();
        let data = b"Hello Ghost-Comm!";

        let mut manual = data.to_vec();
        for id in &order {
            let c = &configs[id];
            manual = transform(&manual, &c.keyword, c.hashing_algorithm);
        }
        assert_eq!(chain.process(data), manual);
    }

    #[test]
    fn order_matters() {
        let (configs, order) = chain_configs();
        let mut reversed = order.clone();
        reversed.reverse();
        let forward = ProxyChain::new(&configs, &order).unwrap();
        let backward = ProxyChain::new(&configs, &reversed).unwrap();
        assert_ne!(forward.process(b"x"), backward.process(b"x"));
    }

    #[test]
    fn update_configs_keeps_identities() {
        let (configs, order) = chain_configs();
        let mut chain = ProxyChain::new(&configs, &order).unwrap();
        let key_before = chain.node("node_a").unwrap().public_key();
        let output_before = chain.process(b"x");

        let update: BTreeMap<_, _> = [(
            "node_a".to_string(),
            ProcessingConfig::new("keyword_7", HashAlgorithm::Sha512),
        )]
        .into_iter()
        .collect();
        chain.update_configs(&update).unwrap();

        assert_eq!(chain.node("node_a").unwrap().public_key(), key_before);
        assert_eq!(chain.configs()["node_a"].keyword, "keyword_7");
        assert_ne!(chain.process(b"x"), output_before);
    }

    #[test]
    fn update_with_unknown_id_changes_nothing() {
        let (configs, order) = chain_configs();
        let mut chain = ProxyChain::new(&configs, &order).unwrap();
        let update: BTreeMap<_, _> = [
            ("node_a".to_string(), ProcessingConfig::new("keyword_7", HashAlgorithm::Sha512)),
            ("node_z".to_string(), ProcessingConfig::new("keyword_7", HashAlgorithm::Sha512)),
        ]
        .into_iter()
        .collect();
        assert!(chain.update_configs(&update).is_err());
        assert_eq!(chain.configs(), configs);
    }

    #[test]
    fn rejects_order_naming_missing_or_repeated_nodes() {
        let (configs, _) = chain_configs();
        assert!(ProxyChain::new(&configs, &["node_x".to_string()]).is_err());
        assert!(ProxyChain::new(&configs, &["node_a".to_string(), "node_a".to_string()]).is_err());
    }

    #[test]
    fn empty_chain_is_identity() {
        let chain = ProxyChain::new(&BTreeMap::new(), &[]).unwrap();
        assert_eq!(chain.process(b"unchanged"), b"unchanged");
    }
}
