//! Getting the PSK back from peers when the node has none or lost its peers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::context::{lock_or_cancel, AppContext, RotationLock};
use crate::error::RunnerError;
use crate::exchange::{PeerExchange, ValidationMode};
use crate::store::FileStore;
use crate::supervisor::{NodeSupervisor, RecoveryHandler};

/// Recovery pass run by the supervisor's liveness loop: drop the local key,
/// agree on one with the peers, restart the node on it.
pub struct PskRecovery {
    store: FileStore,
    exchange: PeerExchange,
    lock: RotationLock,
}

impl PskRecovery {
    pub fn new(store: FileStore, exchange: PeerExchange, lock: RotationLock) -> Self {
        Self {
            store,
            exchange,
            lock,
        }
    }
}

#[async_trait]
impl RecoveryHandler for PskRecovery {
    async fn recover(
        &self,
        supervisor: Arc<NodeSupervisor>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), RunnerError> {
        let _guard = lock_or_cancel(&self.lock, &mut cancel).await?;
        warn!("Node lost its peers, fetching PSK from peers again");

        self.store.clear().await?;
        let psk = self
            .exchange
            .fetch_until_valid(ValidationMode::Bootstrap, &mut cancel)
            .await?;
        self.store.write_psk(psk.value(), psk.signature()).await?;

        supervisor.restart().await?;
        info!("Node recovered with a PSK agreed by its peers");
        Ok(())
    }
}

/// Obtain a PSK from the peers if none is stored yet.
pub async fn bootstrap_psk(ctx: &AppContext) -> Result<(), RunnerError> {
    let mut cancel = ctx.shutdown_signal();
    let _guard = ctx.lock_rotation(&mut cancel).await?;

    if ctx.store.psk_exists().await {
        return Ok(());
    }

    info!("No PSK at {}, bootstrapping from peers", ctx.store.psk_path().display());
    let psk = ctx
        .exchange
        .fetch_until_valid(ValidationMode::Bootstrap, &mut cancel)
        .await?;
    ctx.store.write_psk(psk.value(), psk.signature()).await?;
    info!("Bootstrapped PSK from peers");
    Ok(())
}
