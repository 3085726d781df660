use anyhow::{Context, Result};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use knb_monitor::protocol::DEFAULT_PORT;
use knb_monitor::{serve, AgentState, ScriptRecorder};

/// Per-node perf collection agent for kubenetbench
#[derive(Debug, Parser)]
#[command(name = "knb-monitor", version)]
struct Args {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding perf-record.sh, perf-collect.sh and system_info.sh
    #[arg(long, default_value = "/scripts")]
    scripts_dir: PathBuf,

    /// Where perf-collect.sh leaves its archives
    #[arg(long, default_value = "/tmp")]
    archive_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    info!("knb-monitor starting (scripts: {})", args.scripts_dir.display());

    let recorder = Arc::new(ScriptRecorder::new(args.scripts_dir, args.archive_dir));
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    serve(addr, AgentState::new(recorder))
        .await
        .context("collection agent failed")?;

    Ok(())
}
