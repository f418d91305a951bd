//! SATOSHI TRACER: UTXO provenance tracing with circular-pattern detection.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! connects the chain data provider and either serves the HTTP API or runs
//! a single trace, printing its events as JSON lines.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use satoshi_tracer::chain::{self, ChainDataProvider};
use satoshi_tracer::config::AppConfig;
use satoshi_tracer::patterns::AddressList;
use satoshi_tracer::server::{self, ServerState};
use satoshi_tracer::session::SessionManager;
use satoshi_tracer::types::{EventPayload, OutputRef, SessionStatus};

#[derive(Debug, Parser)]
#[command(name = "satoshi-tracer", version, about = "Trace the provenance of a Bitcoin output")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve {
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Trace one output and print every event as a JSON line.
    Trace {
        /// Root output as `<txid>:<vout>`.
        root: String,
        #[arg(long)]
        depth: Option<u32>,
        #[arg(long)]
        cutoff: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cfg = if std::path::Path::new(&cli.config).exists() {
        AppConfig::load(&cli.config)?
    } else {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(|k| std::env::var(k).ok())?;
        cfg
    };

    init_logging();
    info!(
        config = %cli.config,
        provider = ?cfg.provider.kind,
        depth_limit = cfg.tracer.default_depth_limit,
        "Satoshi Tracer starting up"
    );

    // -- Initialise components -------------------------------------------

    let provider = chain::build_provider(&cfg.provider, cfg.tracer.cache_max_entries).await?;
    let health = provider.health().await;
    if health.healthy {
        info!(provider = %health.provider, detail = %health.detail, "Chain data provider ready");
    } else {
        warn!(
            provider = %health.provider,
            detail = %health.detail,
            "Chain data provider unhealthy, traces will mark branches unresolved"
        );
    }

    let reputation = AddressList::load(
        cfg.risk.known_mixers_path.as_deref(),
        cfg.risk.allowlist_path.as_deref(),
    )?;
    info!(entries = reputation.len(), "Address reputation lists loaded");

    let manager = Arc::new(SessionManager::new(
        provider.clone(),
        Arc::new(reputation),
        cfg.risk.weights.clone(),
        cfg.tracer.engine_config(),
        cfg.tracer.session_config(),
    ));

    match cli.command {
        Command::Serve { port } => run_server(&cfg, manager, provider, port).await,
        Command::Trace { root, depth, cutoff } => run_trace(manager, &root, depth, cutoff).await,
    }
}

async fn run_server(
    cfg: &AppConfig,
    manager: Arc<SessionManager>,
    provider: Arc<dyn ChainDataProvider>,
    port: Option<u16>,
) -> Result<()> {
    if !cfg.server.enabled {
        bail!("server is disabled in configuration");
    }
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, port.unwrap_or(cfg.server.port))
        .parse()
        .context("Invalid server listen address")?;

    let state = Arc::new(ServerState::new(manager.clone(), provider));
    let shutdown_manager = manager.clone();
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received.");
        shutdown_manager.cancel_all();
    };

    server::serve(state, addr, shutdown).await?;
    info!(sessions = manager.list().len(), "Satoshi Tracer shut down cleanly.");
    Ok(())
}

async fn run_trace(
    manager: Arc<SessionManager>,
    root: &str,
    depth: Option<u32>,
    cutoff: Option<f64>,
) -> Result<()> {
    let root: OutputRef = root.parse()?;
    let (id, mut events) = manager.start_attached(root, depth, cutoff)?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut final_status = SessionStatus::Pending;
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let EventPayload::SessionTerminal { status, .. } = &event.payload {
                    final_status = *status;
                }
                println!("{}", serde_json::to_string(&event)?);
            }
            _ = &mut shutdown, if !interrupted => {
                info!(session = %id, "Interrupted, cancelling trace");
                interrupted = true;
                manager.cancel(id)?;
            }
        }
    }

    match final_status {
        SessionStatus::Completed | SessionStatus::Cancelled => Ok(()),
        other => bail!("trace {id} ended with status {other}"),
    }
}

/// Initialise the `tracing` subscriber. Logs go to stderr so that `trace`
/// output on stdout stays machine-readable.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("satoshi_tracer=info"));

    let json_logging = std::env::var("TRACER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
