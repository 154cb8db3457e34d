use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use fleetsync::cli::DaemonOpts;
use fleetsync::fleet::Fleet;
use fleetsync::logger::{Logger, NoopLogger, TextLogger};
use fleetsync::progress::CargoProgress;
use fleetsync::remote::HttpShellClient;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down fleetsyncd (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = DaemonOpts::parse();
    let mut cfg = opts.common.load()?;
    if let Some(port) = opts.api_port {
        cfg.api_port = port;
    }

    println!("Starting fleetsync daemon:");
    println!("  State: {}", cfg.state_dir().display());
    println!("  Node API port: {}", cfg.api_port);
    println!(
        "  Polling: every {}s, booting nodes every {}s",
        cfg.poll_interval().as_secs(),
        cfg.booting_poll_interval().as_secs()
    );

    // A daemon has no terminal to draw a spinner on unless asked for one
    let logger: Arc<dyn Logger> = match (&cfg.log_file, cfg.verbose) {
        (Some(path), _) => Arc::new(
            TextLogger::new(path).with_context(|| format!("Failed to open log file {}", path.display()))?,
        ),
        (None, true) => Arc::new(CargoProgress::new(true)),
        (None, false) => Arc::new(NoopLogger),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let client = Arc::new(HttpShellClient::new(cfg.api_port));
        let fleet = Fleet::open(&cfg, client, logger).context("Failed to load node registry")?;
        println!("  Nodes: {}", fleet.nodes().len());
        for handle in fleet.start() {
            handle.await.context("background task stopped")?;
        }
        Ok::<(), anyhow::Error>(())
    })
}
