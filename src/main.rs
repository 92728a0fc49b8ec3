//! ProxyFarm - control plane and relay for a fleet of multi-uplink proxy nodes
//!
//! `proxyfarm controller` dials every configured agent and relays public entry
//! ports to their uplinks. `proxyfarm agent` runs on the node itself.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxyfarm_control::{
    AgentRuntime, Controller, DesiredStateSource, LogForwardLayer, MockUplinkDriver,
    StaticDesiredState,
};
use proxyfarm_crypto::SharedSecret;
use proxyfarm_relay::{ActivityKind, RelayManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{default_path, AgentFile, ControllerFile};

#[derive(Parser, Debug)]
#[command(name = "proxyfarm")]
#[command(about = "Secure control plane and TCP relay for proxy farm nodes", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller: agent sessions plus entry port relays
    Controller {
        /// Controller config file (default: ~/.proxyfarm/controller.yaml)
        #[arg(short, long, env = "PROXYFARM_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Run a node agent with the mock uplink driver
    Agent {
        /// Agent config file (default: ~/.proxyfarm/agent.yaml)
        #[arg(short, long, env = "PROXYFARM_CONFIG")]
        config: Option<PathBuf>,

        /// Agent id used when the config file has to be created
        #[arg(long, env = "PROXYFARM_AGENT_ID", default_value = "worker_1")]
        agent_id: String,

        /// Override the listen address from the config file
        #[arg(long)]
        listen: Option<String>,
    },
    /// Print a new random shared key
    Keygen,
    /// Store the shared key in the agent config
    SetKey {
        /// Shared key, as printed by `keygen`
        #[arg(long, env = "PROXYFARM_SHARED_KEY")]
        key: String,

        /// Agent config file (default: ~/.proxyfarm/agent.yaml)
        #[arg(short, long, env = "PROXYFARM_CONFIG")]
        config: Option<PathBuf>,

        /// Agent id used when the config file has to be created
        #[arg(long, env = "PROXYFARM_AGENT_ID", default_value = "worker_1")]
        agent_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Controller { config } => {
            init_logging(&cli.log_level, None)?;
            let path = resolve_path(config, "controller.yaml")?;
            run_controller(&path).await
        }
        Commands::Agent {
            config,
            agent_id,
            listen,
        } => {
            let (forward, logs) = LogForwardLayer::new();
            init_logging(&cli.log_level, Some(forward))?;
            let path = resolve_path(config, "agent.yaml")?;
            run_agent(&path, &agent_id, listen, logs).await
        }
        Commands::Keygen => {
            println!("{}", SharedSecret::generate());
            Ok(())
        }
        Commands::SetKey {
            key,
            config,
            agent_id,
        } => {
            init_logging(&cli.log_level, None)?;
            let path = resolve_path(config, "agent.yaml")?;
            AgentFile::set_shared_key(&path, &agent_id, key.trim())?;
            println!("Shared key saved to {}", path.display());
            Ok(())
        }
    }
}

fn init_logging(log_level: &str, forward: Option<LogForwardLayer>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(forward)
        .init();

    Ok(())
}

fn resolve_path(explicit: Option<PathBuf>, file_name: &str) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => default_path(file_name),
    }
}

async fn run_controller(path: &Path) -> Result<()> {
    let file = ControllerFile::load(path)?;
    info!(
        agents = file.agents.len(),
        key_schedule = %file.key_schedule,
        "Starting controller with {:?}",
        path
    );

    let desired = Arc::new(StaticDesiredState::new(file.agents.clone()));
    let controller = Controller::new(file.controller_config(), desired.clone());
    let relays = Arc::new(RelayManager::new(file.relay_config()));
    let shutdown = CancellationToken::new();

    spawn_observers(&controller, &relays);

    controller
        .refresh()
        .await
        .context("Failed to read desired state")?;
    apply_bindings(desired.as_ref(), &relays).await;

    let controller_task = tokio::spawn(Arc::clone(&controller).run());
    let reconcile_task = tokio::spawn(reconcile(
        path.to_path_buf(),
        desired,
        Arc::clone(&relays),
        Duration::from_secs(file.refresh_interval_seconds.max(1)),
        shutdown.clone(),
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }

    shutdown.cancel();
    controller.shutdown();
    relays.stop_all();
    let _ = reconcile_task.await;
    let _ = controller_task.await;

    info!("Controller stopped");
    Ok(())
}

/// Re-read the config file and keep relays in line with it
async fn reconcile(
    path: PathBuf,
    desired: Arc<StaticDesiredState>,
    relays: Arc<RelayManager>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; startup already applied the file
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        match ControllerFile::load(&path) {
            Ok(file) => desired.replace(file.agents),
            Err(e) => warn!("Keeping previous desired state: {:#}", e),
        }
        apply_bindings(desired.as_ref(), &relays).await;
    }
}

async fn apply_bindings(desired: &dyn DesiredStateSource, relays: &RelayManager) {
    let bindings = match desired.list_active_bindings().await {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!("Failed to list relay bindings: {}", e);
            return;
        }
    };

    for (binding, e) in relays.sync(&bindings) {
        warn!(entry_port = binding.entry_port, "Relay binding {} not applied: {}", binding, e);
    }
}

fn spawn_observers(controller: &Arc<Controller>, relays: &Arc<RelayManager>) {
    let mut states = controller.subscribe_state();
    tokio::spawn(async move {
        loop {
            match states.recv().await {
                Ok(change) => info!(
                    agent_id = %change.agent_id,
                    status = %change.status,
                    uplinks = change.uplinks.len(),
                    "Agent state changed"
                ),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} agent state changes", n),
                Err(RecvError::Closed) => return,
            }
        }
    });

    let mut logs = controller.subscribe_logs();
    tokio::spawn(async move {
        loop {
            match logs.recv().await {
                Ok(entry) => info!(
                    agent_id = %entry.agent_id,
                    level = %entry.level,
                    at = %entry.timestamp,
                    "[agent] {}",
                    entry.msg
                ),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} agent log lines", n),
                Err(RecvError::Closed) => return,
            }
        }
    });

    let mut activity = relays.subscribe();
    tokio::spawn(async move {
        loop {
            match activity.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    match event.kind {
                        ActivityKind::BindFailed | ActivityKind::UpstreamFailed => {
                            warn!(entry_port = event.entry_port, "Relay activity: {}", json)
                        }
                        _ => debug!(entry_port = event.entry_port, "Relay activity: {}", json),
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Dropped {} relay activity events", n),
                Err(RecvError::Closed) => return,
            }
        }
    });
}

async fn run_agent(
    path: &Path,
    agent_id: &str,
    listen: Option<String>,
    logs: tokio::sync::mpsc::UnboundedReceiver<proxyfarm_proto::LogPayload>,
) -> Result<()> {
    let file = AgentFile::load_or_create(path, agent_id)?;
    let listen = listen.unwrap_or_else(|| file.listen.clone());

    let driver = Arc::new(MockUplinkDriver::new());
    let runtime = Arc::new(AgentRuntime::new(file.agent_config(), driver));
    tokio::spawn(AgentRuntime::forward_logs(runtime.link(), logs));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind agent listener on {}", listen))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, shutting down agent...");
        signal.cancel();
    });

    runtime
        .serve(listener, shutdown)
        .await
        .context("Agent stopped with an error")?;

    info!("Agent stopped");
    Ok(())
}
