//! Application context shared by the servers, the rotation coordinator and
//! the supervisor.

use std::sync::Arc;

use qmc_crypto::{NodeKey, PeerIdentity};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::debug;

use crate::config::{RunnerConfig, SignatureRetention};
use crate::error::RunnerError;
use crate::exchange::PeerExchange;
use crate::peers::PeerDirectory;
use crate::qrng::PskGenerator;
use crate::recovery::PskRecovery;
use crate::retry::cancelled;
use crate::store::{FileStore, StoreError};
use crate::supervisor::{LivenessProbe, NodeSupervisor, RpcLivenessProbe};

/// Serializes every path that writes the PSK files or restarts the node.
pub type RotationLock = Arc<Mutex<()>>;

pub struct AppContext {
    pub config: RunnerConfig,
    pub local_identity: PeerIdentity,
    pub store: FileStore,
    pub generator: PskGenerator,
    pub exchange: PeerExchange,
    pub supervisor: Arc<NodeSupervisor>,
    pub rotation_lock: RotationLock,
    shutdown: watch::Sender<bool>,
}

impl AppContext {
    /// Build the context with the node's JSON-RPC liveness probe.
    pub fn new(config: RunnerConfig, node_command: Vec<String>) -> Result<Arc<Self>, RunnerError> {
        let probe = RpcLivenessProbe::new(&config.node_rpc_url, config.request_timeout())?;
        Self::with_probe(config, node_command, Arc::new(probe))
    }

    pub fn with_probe(
        config: RunnerConfig,
        node_command: Vec<String>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Result<Arc<Self>, RunnerError> {
        let local_identity = config.local_identity()?;
        let store = FileStore::from_config(&config);
        let generator = PskGenerator::from_config(&config)?;
        let peers = PeerDirectory::from_config(&config)?;
        let exchange = PeerExchange::from_config(&config, local_identity.clone(), peers)?;
        let supervisor = Arc::new(NodeSupervisor::from_config(&config, node_command, probe));
        let rotation_lock = RotationLock::default();
        let (shutdown, _) = watch::channel(false);

        supervisor.set_recovery_handler(Arc::new(PskRecovery::new(
            store.clone(),
            exchange.clone(),
            Arc::clone(&rotation_lock),
        )));

        Ok(Arc::new(Self {
            config,
            local_identity,
            store,
            generator,
            exchange,
            supervisor,
            rotation_lock,
            shutdown,
        }))
    }

    /// Receiver that flips to `true` once shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Take the rotation lock unless shutdown starts first.
    pub async fn lock_rotation(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<MutexGuard<'_, ()>, RunnerError> {
        lock_or_cancel(&self.rotation_lock, cancel).await
    }

    /// Load the node key, refusing a key that belongs to another peer.
    pub async fn load_signing_key(&self) -> Result<NodeKey, RunnerError> {
        let key = self.store.load_node_key().await?;
        let identity = key.peer_identity();
        if identity != self.local_identity {
            return Err(RunnerError::NodeKeyMismatch {
                expected: self.local_identity.to_string(),
                found: identity.to_string(),
            });
        }
        Ok(key)
    }

    /// Startup check of the node key. The node may not have written one yet.
    pub async fn check_node_key(&self) -> Result<(), RunnerError> {
        match self.load_signing_key().await {
            Ok(_) => Ok(()),
            Err(RunnerError::Store(StoreError::NotFound(path))) => {
                debug!("No node key at {} yet", path.display());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply the configured policy to the signature file after a restart.
    pub async fn apply_signature_retention(&self) -> Result<(), RunnerError> {
        apply_signature_retention(&self.store, self.config.signature_retention).await
    }
}

pub(crate) async fn lock_or_cancel<'a>(
    lock: &'a Mutex<()>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<MutexGuard<'a, ()>, RunnerError> {
    tokio::select! {
        guard = lock.lock() => Ok(guard),
        _ = cancelled(cancel) => Err(RunnerError::Cancelled),
    }
}

pub(crate) async fn apply_signature_retention(
    store: &FileStore,
    retention: SignatureRetention,
) -> Result<(), RunnerError> {
    match retention {
        SignatureRetention::DeleteAfterRestart => {
            debug!("Removing PSK signature");
            store.remove_signature().await?;
        }
        SignatureRetention::Keep => {}
    }
    Ok(())
}
