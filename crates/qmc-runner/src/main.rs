use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use qmc_runner::recovery::bootstrap_psk;
use qmc_runner::supervisor::NodeStatus;
use qmc_runner::{AppContext, RunnerConfig, RunnerServer};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "qmc-runner")]
#[command(about = "QMC runner - PSK rotation and node supervision")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "QMC_RUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Node command line, after `--`
    #[arg(last = true, required = true)]
    node_command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Configuration first: it names the runner's log file.
    let config = RunnerConfig::load(args.config.as_deref())?;
    let _log_guard = qmc_runner::logging::init(&args.log_level, config.runner_logs_path.as_deref())?;

    info!("Starting qmc-runner as {}", config.local_peer_id);

    let ctx = AppContext::new(config, args.node_command)?;
    let signals = RunnerServer::shutdown_on_signal(Arc::clone(&ctx));
    let result = run(&ctx).await;

    // The node never outlives the runner.
    ctx.shutdown();
    signals.abort();
    if ctx.supervisor.status().await == NodeStatus::Running {
        if let Err(e) = ctx.supervisor.terminate().await {
            warn!("Failed to terminate node: {}", e);
        }
    }

    if let Err(e) = &result {
        error!("qmc-runner stopped: {:#}", e);
    }
    result
}

async fn run(ctx: &Arc<AppContext>) -> anyhow::Result<()> {
    let server = RunnerServer::new(Arc::clone(ctx));

    ctx.check_node_key().await?;
    bootstrap_psk(ctx).await?;
    ctx.supervisor.start().await?;
    server.run().await
}
