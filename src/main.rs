//! fleetsync - one-shot commands against the display fleet
//!
//! Every invocation starts from an empty file cache: nodes are probed, the
//! ready ones reconciled, then the command runs and queued transfers are
//! drained before exit.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use std::sync::Arc;

use fleetsync::cli::{CliOpts, Command, NodeCommand};
use fleetsync::config::FleetConfig;
use fleetsync::fleet::Fleet;
use fleetsync::flight::TaskState;
use fleetsync::log::TransferLog;
use fleetsync::logger::{Logger, TeeLogger, TextLogger};
use fleetsync::model::{split_dir, NodeId};
use fleetsync::progress::CargoProgress;
use fleetsync::queue::TaskOutcome;
use fleetsync::remote::{HttpShellClient, MemoryFleet};
use fleetsync::url::parse_node_address;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = CliOpts::parse();
    let cfg = opts.common.load()?;

    let progress = Arc::new(CargoProgress::new(cfg.verbose));
    let logger: Arc<dyn Logger> = match &cfg.log_file {
        Some(path) => match TextLogger::new(path) {
            Ok(text) => Arc::new(TeeLogger(vec![progress.clone() as Arc<dyn Logger>, Arc::new(text)])),
            Err(e) => {
                eprintln!("Cannot open log file {}: {e}", path.display());
                progress.clone()
            }
        },
        None => progress.clone(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let fleet = if opts.memory {
        demo_fleet(&cfg, logger)?
    } else {
        let client = Arc::new(HttpShellClient::new(cfg.api_port));
        Fleet::open(&cfg, client, logger).context("Failed to load node registry")?
    };
    rt.block_on(run(opts.command, &cfg, fleet, progress))
}

/// Three in-process nodes with a few files; nothing is written to disk
fn demo_fleet(cfg: &FleetConfig, logger: Arc<dyn Logger>) -> Result<Fleet> {
    let mem = Arc::new(MemoryFleet::new());
    let cfg = FleetConfig {
        state_dir: None,
        ..cfg.clone()
    };
    let fleet = Fleet::new(&cfg, mem.clone(), logger);
    for (i, name) in ["Foyer", "Mensa", "Aula"].iter().enumerate() {
        let address = format!("demo-{}", i + 1);
        mem.add_node(&address);
        fleet.register_node(&address, None, name, None)?;
    }
    mem.put_file("demo-1", "/", "welcome.png", vec![0x89u8; 2048], "image/png");
    mem.put_file("demo-1", "/docs/", "plan.pdf", vec![0x25u8; 4096], "application/pdf");
    mem.put_file("demo-2", "/docs/", "plan.pdf", vec![0x25u8; 4096], "application/pdf");
    mem.put_file("demo-3", "/", "loop.mp4", vec![0u8; 65536], "video/mp4");
    Ok(fleet)
}

async fn run(command: Command, cfg: &FleetConfig, fleet: Fleet, progress: Arc<CargoProgress>) -> Result<()> {
    match command {
        Command::Nodes(cmd) => {
            progress.finish(0, 0);
            nodes_command(&fleet, cfg, cmd)
        }
        Command::Ping => {
            progress.set_status("Probing");
            let results = fleet.poll().await;
            progress.finish(0, 0);
            for r in results {
                if let Some(node) = fleet.store().node(&r.node_id) {
                    println!("{:<20} {:<24} {}", node.display_name, node.address, r.current);
                }
            }
            Ok(())
        }
        Command::Ls { path, nodes } => {
            warm_up(&fleet, &progress).await;
            let ids = resolve_nodes(&fleet, &nodes)?;
            progress.finish(0, 0);
            for record in fleet.browse(&path, &ids) {
                let key = record.key();
                let holders: Vec<String> = fleet
                    .placement_dates(&key)
                    .into_iter()
                    .map(|(name, _)| name)
                    .collect();
                if record.is_dir() {
                    println!("{:>12}  {}/  [{}]", "-", record.name, holders.join(", "));
                } else {
                    println!("{:>12}  {}  [{}]", record.size, record.name, holders.join(", "));
                }
            }
            Ok(())
        }
        Command::Refresh { path } => {
            warm_up(&fleet, &progress).await;
            let reports = fleet.refresh(&path).await;
            progress.finish(0, 0);
            for report in reports {
                let name = fleet
                    .store()
                    .node(&report.node_id)
                    .map(|n| n.display_name)
                    .unwrap_or(report.node_id);
                if report.skipped {
                    println!("{name:<20} busy, skipped");
                    continue;
                }
                println!(
                    "{:<20} {} dir(s) changed, +{} -{}",
                    name,
                    report.changed_paths.len(),
                    report.added,
                    report.removed
                );
                for path in &report.failed_paths {
                    eprintln!("  could not read {path}");
                }
            }
            Ok(())
        }
        Command::Upload { file, dest, nodes } => {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow::anyhow!("not a file: {}", file.display()))?;
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            warm_up(&fleet, &progress).await;
            let ids = resolve_nodes(&fleet, &nodes)?;
            let key = fleet.submit_upload(&dest, &name, Bytes::from(data), &ids)?;
            println!("Queued {key}");
            finish(&fleet, &progress).await
        }
        Command::Sync { target, nodes } => {
            let (path, name) = split_dir(&target).ok_or_else(|| anyhow::anyhow!("cannot sync the root"))?;
            warm_up(&fleet, &progress).await;
            let ids = resolve_nodes(&fleet, &nodes)?;
            let record = fleet
                .store()
                .files_named(&path, &name)
                .into_iter()
                .find(|r| {
                    let key = r.key();
                    ids.iter().any(|id| fleet.store().placement(id, &key).is_some())
                })
                .ok_or_else(|| anyhow::anyhow!("{target} is on none of the given nodes"))?;
            let submission = fleet.submit_sync(&record.key(), &ids).await?;
            for (key, holders) in &submission.collisions {
                eprintln!("Skipped {key}: different content on {}", holders.join(", "));
            }
            for key in &submission.conflicts {
                eprintln!("Skipped {key}: already queued");
            }
            finish(&fleet, &progress).await
        }
        Command::Delete { node, targets } => {
            warm_up(&fleet, &progress).await;
            let node = fleet
                .find_node(&node)
                .ok_or_else(|| anyhow::anyhow!("unknown node {node}"))?;
            let mut dir: Option<String> = None;
            let mut names = Vec::new();
            for target in &targets {
                let (path, name) = split_dir(target).ok_or_else(|| anyhow::anyhow!("cannot delete the root"))?;
                if dir.as_deref().is_some_and(|d| d != path) {
                    bail!("all targets must share one directory");
                }
                dir = Some(path);
                names.push(name);
            }
            let dir = dir.unwrap_or_else(|| "/".to_string());
            let diff = fleet.delete(&node.id, &dir, names).await?;
            progress.finish(0, 0);
            println!("Removed {} entries from {}", diff.removed.len(), node.display_name);
            Ok(())
        }
        Command::Log => {
            progress.finish(0, 0);
            let log = TransferLog::new(&cfg.state_dir());
            for entry in log.read_log()? {
                println!(
                    "{} {:<6} {:<16} {} -> {} ok, {} failed",
                    entry.timestamp,
                    entry.kind,
                    format!("{:?}", entry.status),
                    entry.file,
                    entry.completed.len(),
                    entry.failed.len()
                );
            }
            Ok(())
        }
    }
}

fn nodes_command(fleet: &Fleet, cfg: &FleetConfig, cmd: NodeCommand) -> Result<()> {
    match cmd {
        NodeCommand::List => {
            for node in fleet.nodes() {
                println!(
                    "{:<20} {:<24} group {} #{}  {}",
                    node.display_name, node.address, node.group_id, node.position, node.id
                );
            }
        }
        NodeCommand::Add { address, name, hardware_id, group } => {
            if parse_node_address(&address, cfg.api_port).is_none() {
                bail!("invalid node address: {address}");
            }
            let node = fleet.register_node(&address, hardware_id, &name, group)?;
            println!("Added {} ({})", node.display_name, node.id);
        }
        NodeCommand::Edit { node, address, name, hardware_id } => {
            let current = fleet
                .find_node(&node)
                .ok_or_else(|| anyhow::anyhow!("unknown node {node}"))?;
            let address = address.unwrap_or(current.address);
            if parse_node_address(&address, cfg.api_port).is_none() {
                bail!("invalid node address: {address}");
            }
            let name = name.unwrap_or(current.display_name);
            let hardware_id = hardware_id.or(current.hardware_id);
            let node = fleet.edit_node(&current.id, &address, hardware_id, &name)?;
            println!("Updated {} ({})", node.display_name, node.id);
        }
        NodeCommand::Remove { node } => {
            let current = fleet
                .find_node(&node)
                .ok_or_else(|| anyhow::anyhow!("unknown node {node}"))?;
            fleet.remove_node(&current.id)?;
            println!("Removed {}", current.display_name);
        }
    }
    Ok(())
}

/// Probe all nodes and wait for the reconciliation of every ready one
async fn warm_up(fleet: &Fleet, progress: &CargoProgress) {
    progress.set_status("Scanning");
    for result in fleet.poll().await {
        if let Some(pass) = result.reconcile {
            let _ = pass.await;
        }
    }
}

/// Empty list means every registered node
fn resolve_nodes(fleet: &Fleet, wanted: &[String]) -> Result<Vec<NodeId>> {
    if wanted.is_empty() {
        return Ok(fleet.nodes().into_iter().map(|n| n.id).collect());
    }
    wanted
        .iter()
        .map(|w| {
            fleet
                .find_node(w)
                .map(|n| n.id)
                .ok_or_else(|| anyhow::anyhow!("unknown node {w}"))
        })
        .collect()
}

async fn finish(fleet: &Fleet, progress: &CargoProgress) -> Result<()> {
    progress.set_status("Transferring");
    let outcomes = fleet.drain().await;
    fleet.reconciler().wait_thumbnails().await;
    let failed = outcomes.iter().filter(|o| o.state == TaskState::Failed).count();
    progress.finish(outcomes.len() - failed, failed);
    for outcome in &outcomes {
        report(fleet, outcome);
    }
    if failed > 0 {
        bail!("{failed} transfer(s) failed");
    }
    Ok(())
}

fn report(fleet: &Fleet, outcome: &TaskOutcome) {
    let name = |id: &str| {
        fleet
            .store()
            .node(id)
            .map(|n| n.display_name)
            .unwrap_or_else(|| id.to_string())
    };
    for id in &outcome.completed {
        println!("  ok      {} on {}", outcome.key, name(id));
    }
    for (id, err) in &outcome.failed {
        eprintln!("  failed  {} on {}: {err}", outcome.key, name(id));
    }
}
