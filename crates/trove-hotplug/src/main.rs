//! trove-hotplug: report removable volumes to a trove server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use trove_hotplug::{MonitorConfig, run_monitor};

#[derive(Parser, Debug)]
#[command(name = "trove-hotplug", about = "Report removable volumes to a trove server")]
struct Args {
    /// Server socket to report to.
    #[arg(short, long)]
    socket: PathBuf,

    /// Mount prefix under which volumes count as removable (repeatable).
    #[arg(long = "prefix")]
    prefixes: Vec<PathBuf>,

    /// Mount table to poll.
    #[arg(long)]
    mountinfo: Option<PathBuf>,

    /// Poll interval in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = MonitorConfig::default();
    if !args.prefixes.is_empty() {
        config.prefixes = args.prefixes;
    }
    if let Some(path) = args.mountinfo {
        config.mountinfo_path = path;
    }
    if let Some(ms) = args.interval_ms {
        config.poll_interval = Duration::from_millis(ms.max(1));
    }

    let session = trove_client::connect(&args.socket).await?;
    tracing::info!(socket = %args.socket.display(), prefixes = ?config.prefixes, "hotplug monitor started");

    run_monitor(&session, config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    session.close().await;
    Ok(())
}
