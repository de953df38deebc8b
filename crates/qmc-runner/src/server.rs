use std::future::IntoFuture;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{create_local_router, create_peer_router, ApiState};
use crate::context::AppContext;
use crate::retry::cancelled;

/// Runs the local control server and the peer-facing server until shutdown.
pub struct RunnerServer {
    state: ApiState,
}

impl RunnerServer {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            state: ApiState::new(ctx),
        }
    }

    pub fn state(&self) -> &ApiState {
        &self.state
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let ctx = &self.state.ctx;
        let local = TcpListener::bind(ctx.config.local_server_addr).await?;
        info!("Local server listening on {}", local.local_addr()?);
        let external = TcpListener::bind(ctx.config.external_server_addr).await?;
        info!("Peer server listening on {}", external.local_addr()?);

        let local = axum::serve(local, create_local_router(self.state.clone()))
            .with_graceful_shutdown(Self::wait_for_shutdown(ctx.shutdown_signal()));
        let external = axum::serve(external, create_peer_router(self.state.clone()))
            .with_graceful_shutdown(Self::wait_for_shutdown(ctx.shutdown_signal()));

        tokio::try_join!(local.into_future(), external.into_future())?;
        info!("Servers stopped");
        Ok(())
    }

    /// Start shutdown on SIGTERM or SIGINT.
    pub fn shutdown_on_signal(ctx: Arc<AppContext>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown = ctx.shutdown_signal();
            tokio::select! {
                signal = termination_signal() => {
                    info!("Received {}, stopping runner", signal);
                    ctx.shutdown();
                }
                _ = cancelled(&mut shutdown) => {}
            }
        })
    }

    async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
        cancelled(&mut shutdown).await;
    }
}

#[cfg(unix)]
async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = tokio::signal::ctrl_c() => "SIGINT",
        },
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::error::RunnerError;
    use crate::supervisor::LivenessProbe;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct IdleProbe;

    #[async_trait]
    impl LivenessProbe for IdleProbe {
        async fn connected_peers(&self) -> Result<usize, RunnerError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_servers_stop_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = RunnerConfig {
            local_peer_id: "12D3KooWKzWKFojk7A1Hw23dpiQRbLs6HrXFf4EGLsN4oZ1WsWCc".to_string(),
            local_server_addr: "127.0.0.1:0".parse().unwrap(),
            external_server_addr: "127.0.0.1:0".parse().unwrap(),
            psk_file_path: dir.path().join("psk"),
            psk_sig_file_path: dir.path().join("psk_sig"),
            node_key_file_path: dir.path().join(".node_key"),
            node_logs_path: dir.path().join("node.log"),
            ..Default::default()
        };
        let ctx = AppContext::with_probe(config, vec!["true".to_string()], Arc::new(IdleProbe)).unwrap();

        let signals = RunnerServer::shutdown_on_signal(Arc::clone(&ctx));
        let server = tokio::spawn({
            let server = RunnerServer::new(Arc::clone(&ctx));
            async move { server.run().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.is_finished());

        ctx.shutdown();
        tokio::time::timeout(Duration::from_secs(5), signals).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
