//! trove-server binary
//!
//! ## Usage
//!
//! ```bash
//! # Index ~/Music, serve on the default socket
//! trove-server --root ~/Music
//!
//! # Explicit config file and socket
//! trove-server --config ./trove.toml --socket /tmp/trove.sock
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use trove_kernel::IndexConfig;
use trove_kernel::config::default_config_path;
use trove_server::TroveServer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Live-query media index server.
#[derive(Debug, Parser)]
#[command(name = "trove-server", version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/trove/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Unix socket to listen on
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Index database (`:memory:` for a throwaway index)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Local directory to index; repeatable
    #[arg(long = "root", value_name = "DIR")]
    roots: Vec<PathBuf>,

    /// Grace window before a vanished path is deleted
    #[arg(long, value_name = "MS")]
    deletion_grace_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args.config.or_else(default_config_path);
    let mut config = IndexConfig::load_or_default(config_path.as_deref())?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(grace) = args.deletion_grace_ms {
        config.deletion_grace_ms = grace;
    }
    config
        .roots
        .extend(args.roots.into_iter().map(|r| std::path::absolute(&r).unwrap_or(r)));

    tracing::info!(
        db = %config.db_path.display(),
        roots = config.roots.len(),
        "starting trove server"
    );
    let server = TroveServer::bind(config).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "no signal handler, running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await
}
