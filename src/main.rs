//! hostmesh worker - child process entry point.
//!
//! Started by a parent node. Reads its punch payload from stdin, adopts the
//! transport named there, completes the handshake and serves until the
//! parent goes away. Transport flags are passed by the parent so both ends
//! of the channel agree.

use clap::Parser;
use hostmesh::dispatch::FactoryRegistry;
use hostmesh::ipc::WireFormat;
use hostmesh::launcher::PunchPayload;
use hostmesh::Config;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;

#[derive(Debug, Parser)]
#[command(name = "hostmesh-worker", version, about = "Process-tree worker node")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "HOSTMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON logs on stderr.
    #[arg(long)]
    json_logs: bool,

    #[arg(long)]
    wire_format: Option<WireFormat>,

    #[arg(long)]
    max_frame_bytes: Option<u32>,

    /// Keep-alive interval in milliseconds; 0 disables keep-alives.
    #[arg(long)]
    keepalive_ms: Option<u64>,

    #[arg(long)]
    keepalive_misses: Option<u32>,

    /// Extra arguments from the creation request, ignored by the worker.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    rest: Vec<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if self.json_logs {
            config.observability.json_logs = true;
        }
        if let Some(format) = self.wire_format {
            config.node.wire_format = format;
        }
        if let Some(max) = self.max_frame_bytes {
            config.channel.max_frame_bytes = max;
        }
        if let Some(ms) = self.keepalive_ms {
            config.channel.keepalive_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(misses) = self.keepalive_misses {
            config.channel.keepalive_misses = misses;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    // Initialize observability
    hostmesh::observability::init_tracing_with(&config.observability);

    let mut text = String::new();
    tokio::io::stdin().read_to_string(&mut text).await?;
    let punch = PunchPayload::parse(&text)?;
    if !args.rest.is_empty() {
        tracing::debug!("Ignoring extra worker arguments: {:?}", args.rest);
    }

    tracing::info!(
        "hostmesh worker {} starting (os_pid={}, parent os_pid={})",
        punch.process_id,
        std::process::id(),
        punch.parent_pid
    );
    hostmesh::worker::run_worker(config, punch, FactoryRegistry::with_builtins()).await?;
    tracing::info!("hostmesh worker exiting");
    Ok(())
}
