use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use statsync::catalog::parse_stamp;
use statsync::config::Config;
use statsync::snapshot::Epoch;
use statsync::{agent, catalog};

/// Storage cluster iostats reconciler and delta-metrics collector.
#[derive(Parser)]
#[command(name = "statsync", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Recompute and export metrics for one epoch, then exit.
    Replay {
        /// Cluster name from the configuration file.
        #[arg(long)]
        cluster: String,
        /// Epoch as unix seconds or a dump stamp (yymmdd_HHMMSS, UTC).
        #[arg(long, value_parser = parse_epoch)]
        epoch: Epoch,
    },
}

fn parse_epoch(raw: &str) -> std::result::Result<Epoch, String> {
    if let Ok(secs) = raw.parse::<Epoch>() {
        return Ok(secs);
    }
    parse_stamp(raw).ok_or_else(|| {
        format!(
            "expected unix seconds or a stamp like {}",
            catalog::format_stamp(1_710_497_700).unwrap_or_default()
        )
    })
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("statsync {}", version::full());
        return Ok(());
    }

    // Config is required for everything else.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Replay { cluster, epoch }) => rt
            .block_on(agent::replay(&cfg, &cluster, epoch))
            .map(|_| ()),
        _ => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                clusters = cfg.clusters.len(),
                "starting statsync",
            );
            rt.block_on(run(cfg))
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    wait_for_signal().await?;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("statsync stopped");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
