//! Managed node process supervision.
//!
//! The supervisor is the only owner of the node's process handle. It pipes
//! the node's output into a log file, restarts the node on request and runs
//! a liveness loop that hands control to a [`RecoveryHandler`] when the node
//! loses its peers.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::retry::cancelled;

/// How long to wait for output copiers once the node has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("node command is empty")]
    EmptyCommand,
    #[error("failed to spawn node: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("cannot open node log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("node is not running")]
    NotRunning,
    #[error("node is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    NotStarted,
    Running,
    Terminated,
}

/// Reports how many peers the node is connected to.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn connected_peers(&self) -> Result<usize, RunnerError>;
}

/// Brings an unhealthy node back. Implementations end by restarting the
/// node through the supervisor they are handed.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn recover(
        &self,
        supervisor: Arc<NodeSupervisor>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), RunnerError>;
}

/// Liveness via the node's `system_peers` JSON-RPC method.
pub struct RpcLivenessProbe {
    client: reqwest::Client,
    url: String,
}

impl RpcLivenessProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RunnerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl LivenessProbe for RpcLivenessProbe {
    async fn connected_peers(&self) -> Result<usize, RunnerError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "system_peers",
            "params": [],
        });
        let response: serde_json::Value = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.get("error") {
            return Err(RunnerError::NodeRpc(err.to_string()));
        }
        response
            .get("result")
            .and_then(|r| r.as_array())
            .map(|peers| peers.len())
            .ok_or_else(|| RunnerError::NodeRpc("system_peers result is not an array".to_string()))
    }
}

/// The OS process of a running node and the tasks tied to it.
pub struct NodeProcessHandle {
    pid: Option<u32>,
    command: Vec<String>,
    kill: watch::Sender<bool>,
    reaper: JoinHandle<Option<ExitStatus>>,
    recovery_cancel: watch::Sender<bool>,
}

impl NodeProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

struct State {
    status: NodeStatus,
    process: Option<NodeProcessHandle>,
}

pub struct NodeSupervisor {
    command: Vec<String>,
    log_path: PathBuf,
    settle: Duration,
    grace: Duration,
    liveness_interval: Duration,
    probe: Arc<dyn LivenessProbe>,
    recovery: OnceLock<Arc<dyn RecoveryHandler>>,
    state: Mutex<State>,
}

impl NodeSupervisor {
    pub fn new(
        command: Vec<String>,
        log_path: impl Into<PathBuf>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            command,
            log_path: log_path.into(),
            settle: Duration::from_secs(1),
            grace: Duration::from_secs(10),
            liveness_interval: Duration::from_secs(30),
            probe,
            recovery: OnceLock::new(),
            state: Mutex::new(State {
                status: NodeStatus::NotStarted,
                process: None,
            }),
        }
    }

    /// Node command line from the configuration: `node_command` followed
    /// by the runner's own arguments.
    pub fn from_config(
        config: &RunnerConfig,
        node_command: Vec<String>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        let mut command = node_command;
        command.extend(config.node_args());
        Self::new(command, &config.node_logs_path, probe).with_timings(
            config.restart_settle(),
            config.terminate_grace(),
            config.liveness_interval(),
        )
    }

    pub fn with_timings(mut self, settle: Duration, grace: Duration, liveness_interval: Duration) -> Self {
        self.settle = settle;
        self.grace = grace;
        self.liveness_interval = liveness_interval;
        self
    }

    /// Install the handler the liveness loop calls. Only the first call has
    /// an effect.
    pub fn set_recovery_handler(&self, handler: Arc<dyn RecoveryHandler>) {
        if self.recovery.set(handler).is_err() {
            warn!("Recovery handler already installed");
        }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub async fn status(&self) -> NodeStatus {
        self.state.lock().await.status
    }

    pub async fn pid(&self) -> Option<u32> {
        self.state.lock().await.process.as_ref().and_then(|p| p.pid)
    }

    /// Whether the node process exists and has not exited.
    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .process
            .as_ref()
            .is_some_and(|p| !p.reaper.is_finished())
    }

    /// Launch the node and its liveness loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        if state.process.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        self.spawn_locked(&mut state)
    }

    /// Stop the node: SIGTERM, then a kill once the grace period runs out.
    pub async fn terminate(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        self.terminate_locked(&mut state).await
    }

    /// Terminate, wait for the settle delay, start again.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        info!("Restarting node...");
        self.terminate_locked(&mut state).await?;
        tokio::time::sleep(self.settle).await;
        self.spawn_locked(&mut state)
    }

    fn spawn_locked(self: &Arc<Self>, state: &mut State) -> Result<(), SupervisorError> {
        let (program, args) = self.command.split_first().ok_or(SupervisorError::EmptyCommand)?;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| SupervisorError::Log {
                path: self.log_path.clone(),
                source,
            })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so signals reach whatever the node spawns.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id();
        info!("Started node (pid {:?}): {}", pid, self.command.join(" "));

        let (kill_tx, kill_rx) = watch::channel(false);
        let log = Arc::new(Mutex::new(tokio::fs::File::from_std(log)));
        let mut copiers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            copiers.push(tokio::spawn(copy_output(stdout, Arc::clone(&log))));
        }
        if let Some(stderr) = child.stderr.take() {
            copiers.push(tokio::spawn(copy_output(stderr, Arc::clone(&log))));
        }
        let reaper = tokio::spawn(reap(child, pid, copiers, kill_rx));

        let (recovery_tx, recovery_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(self).liveness_loop(recovery_rx));

        state.process = Some(NodeProcessHandle {
            pid,
            command: self.command.clone(),
            kill: kill_tx,
            reaper,
            recovery_cancel: recovery_tx,
        });
        state.status = NodeStatus::Running;
        Ok(())
    }

    async fn terminate_locked(&self, state: &mut State) -> Result<(), SupervisorError> {
        let mut process = state.process.take().ok_or(SupervisorError::NotRunning)?;
        let _ = process.recovery_cancel.send(true);

        if !process.reaper.is_finished() {
            send_terminate(&process);
        }

        let exit = match tokio::time::timeout(self.grace, &mut process.reaper).await {
            Ok(result) => result.ok().flatten(),
            Err(_) => {
                warn!("Node did not stop within {:?}, killing it", self.grace);
                let _ = process.kill.send(true);
                process.reaper.await.ok().flatten()
            }
        };
        info!("Node terminated ({:?})", exit);

        state.status = NodeStatus::Terminated;
        Ok(())
    }

    async fn liveness_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.liveness_interval, self.liveness_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancelled(&mut cancel) => {
                    debug!("Liveness loop stopped");
                    return;
                }
            }

            let probe = tokio::select! {
                probe = self.probe.connected_peers() => probe,
                _ = cancelled(&mut cancel) => return,
            };
            match probe {
                Ok(0) => warn!("Node has no connected peers, starting recovery"),
                Ok(peers) => {
                    debug!("Node has {} connected peers", peers);
                    continue;
                }
                Err(e) => warn!("Node liveness check failed ({}), starting recovery", e),
            }

            let Some(handler) = self.recovery.get() else {
                warn!("No recovery handler installed");
                continue;
            };
            match handler.recover(Arc::clone(&self), cancel.clone()).await {
                // The restart installed a fresh loop.
                Ok(()) => return,
                Err(RunnerError::Cancelled) => return,
                Err(e) => error!("Recovery failed: {}", e),
            }
        }
    }
}

fn send_terminate(process: &NodeProcessHandle) {
    #[cfg(unix)]
    if let Some(pid) = process.pid {
        signal_group(pid, libc::SIGTERM);
        return;
    }
    let _ = process.kill.send(true);
}

/// Send `signal` to the node's process group.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory safety requirements.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(
            "Signal {} to node group {} failed: {}",
            signal,
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

/// Wait for the node to exit, or kill it when asked, then drain output.
async fn reap(
    mut child: Child,
    pid: Option<u32>,
    copiers: Vec<JoinHandle<()>>,
    mut kill: watch::Receiver<bool>,
) -> Option<ExitStatus> {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancelled(&mut kill) => {
            #[cfg(unix)]
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGKILL);
            }
            #[cfg(not(unix))]
            let _ = pid;
            if let Err(e) = child.start_kill() {
                debug!("Failed to kill node: {}", e);
            }
            child.wait().await
        }
    };

    for mut copier in copiers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut copier).await.is_err() {
            copier.abort();
        }
    }

    match status {
        Ok(status) => {
            info!("Node exited with {}", status);
            Some(status)
        }
        Err(e) => {
            error!("Failed to wait for node: {}", e);
            None
        }
    }
}

async fn copy_output<R>(stream: R, log: Arc<Mutex<tokio::fs::File>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(target: "node", "{}", line);
                let mut log = log.lock().await;
                if let Err(e) = log.write_all(format!("{}\n", line).as_bytes()).await {
                    warn!("Failed to write node log: {}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read node output: {}", e);
                break;
            }
        }
    }
    let _ = log.lock().await.flush().await;
}
