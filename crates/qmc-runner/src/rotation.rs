//! Rotation rounds.
//!
//! A round either signs a fresh QRNG value (local signer) or waits until a
//! peer serves the value signed by the round's signer. The value is
//! persisted, the node keeps running on the old key for the rotation delay,
//! then it is restarted on the new one.
//!
//! A request for a newer block supersedes a round that is still waiting for
//! the lock or for its signer's value. Once persisted, a round runs to the
//! end.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::error::RunnerError;
use crate::exchange::ValidationMode;
use crate::psk::{Psk, RotationRequest};
use crate::retry::sleep_or_cancel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    Idle,
    Running,
    Persisted,
    Cooling,
    Restarted,
}

pub struct RotationCoordinator {
    ctx: Arc<AppContext>,
    state: watch::Sender<RotationState>,
    /// Highest block number requested so far.
    latest_block: watch::Sender<u64>,
}

impl RotationCoordinator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        let (state, _) = watch::channel(RotationState::Idle);
        let (latest_block, _) = watch::channel(0);
        Self {
            ctx,
            state,
            latest_block,
        }
    }

    pub fn state(&self) -> RotationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RotationState> {
        self.state.subscribe()
    }

    /// Run `request` on a background task.
    pub fn trigger(self: &Arc<Self>, request: RotationRequest) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let block = request.block_number;
            match coordinator.rotate(request).await {
                Ok(_) => info!("Rotation for block {} finished", block),
                Err(RunnerError::Cancelled) => info!("Rotation for block {} cancelled", block),
                Err(e @ RunnerError::Superseded { .. }) => warn!("{}", e),
                Err(e) => error!("Rotation for block {} failed: {}", block, e),
            }
        });
    }

    /// Run one full round while holding the rotation lock.
    ///
    /// Fails with [`RunnerError::Superseded`] if a newer block was requested
    /// before this round got the lock or its signer's value.
    pub async fn rotate(&self, request: RotationRequest) -> Result<Psk, RunnerError> {
        let block = request.block_number;
        self.latest_block.send_if_modified(|latest| {
            let newer = block > *latest;
            if newer {
                *latest = block;
            }
            newer
        });
        let mut superseded = self.latest_block.subscribe();
        let newer = *superseded.borrow_and_update();
        if newer > block {
            return Err(RunnerError::Superseded { block, newer });
        }

        let mut cancel = self.ctx.shutdown_signal();
        let _guard = tokio::select! {
            guard = self.ctx.lock_rotation(&mut cancel) => guard?,
            newer = superseded_by(&mut superseded, block) => {
                return Err(RunnerError::Superseded { block, newer });
            }
        };

        info!(
            "Rotating pre-shared key for block {} (local signer: {})",
            request.block_number, request.is_local_signer
        );
        self.state.send_replace(RotationState::Running);
        let result = self.run_round(&request, &mut cancel, &mut superseded).await;
        self.state.send_replace(RotationState::Idle);
        result
    }

    async fn run_round(
        &self,
        request: &RotationRequest,
        cancel: &mut watch::Receiver<bool>,
        superseded: &mut watch::Receiver<u64>,
    ) -> Result<Psk, RunnerError> {
        let block = request.block_number;
        let psk = if request.is_local_signer {
            let key = self.ctx.load_signing_key().await?;
            if request.signer_identity != self.ctx.local_identity {
                return Err(RunnerError::NodeKeyMismatch {
                    expected: request.signer_identity.to_string(),
                    found: self.ctx.local_identity.to_string(),
                });
            }
            let value = self.ctx.generator.generate().await;
            Psk::sign(&value, block, &key)?
        } else {
            let mode = ValidationMode::KnownSigner {
                signer: &request.signer_identity,
                block_number: block,
            };
            tokio::select! {
                psk = self.ctx.exchange.fetch_until_valid(mode, cancel) => psk?,
                newer = superseded_by(superseded, block) => {
                    return Err(RunnerError::Superseded { block, newer });
                }
            }
        };

        self.ctx.store.write_psk(psk.value(), psk.signature()).await?;
        self.state.send_replace(RotationState::Persisted);

        self.state.send_replace(RotationState::Cooling);
        sleep_or_cancel(self.ctx.config.key_rotation_time(), cancel).await?;

        self.ctx.supervisor.restart().await?;
        self.state.send_replace(RotationState::Restarted);

        self.ctx.apply_signature_retention().await?;
        Ok(psk)
    }

    /// Restart the node outside a round and apply the signature policy.
    pub async fn restart_node(&self) -> Result<(), RunnerError> {
        let mut cancel = self.ctx.shutdown_signal();
        let _guard = self.ctx.lock_rotation(&mut cancel).await?;
        self.ctx.supervisor.restart().await?;
        self.ctx.apply_signature_retention().await
    }
}

/// Resolve with the newer block number once one above `block` is requested.
async fn superseded_by(latest: &mut watch::Receiver<u64>, block: u64) -> u64 {
    let newer = latest.wait_for(|latest| *latest > block).await.map(|newer| *newer);
    match newer {
        Ok(newer) => newer,
        Err(_) => std::future::pending().await,
    }
}
