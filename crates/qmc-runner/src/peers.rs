//! Known counterparts and their QKD links.

use std::collections::BTreeMap;

use qmc_crypto::PeerIdentity;

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::qkd::QkdProvider;

#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    pub identity: PeerIdentity,
    pub server_addr: String,
    pub qkd: QkdProvider,
}

/// Configured peers keyed by their encoded identity, in stable order.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: BTreeMap<String, PeerEndpoint>,
}

impl PeerDirectory {
    pub fn from_config(config: &RunnerConfig) -> Result<Self, RunnerError> {
        let mut directory = Self::default();
        for (peer_id, peer) in &config.peers {
            let identity = PeerIdentity::parse(peer_id)?;
            let qkd = QkdProvider::from_config(&peer.qkd, config.request_timeout())?;
            directory.insert(PeerEndpoint {
                identity,
                server_addr: peer.server_addr.trim_end_matches('/').to_string(),
                qkd,
            });
        }
        Ok(directory)
    }

    pub fn insert(&mut self, peer: PeerEndpoint) {
        self.peers.insert(peer.identity.as_str().to_string(), peer);
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerEndpoint> {
        self.peers.get(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEndpoint> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
