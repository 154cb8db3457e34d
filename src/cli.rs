//! Shared CLI helpers and small reusable Clap fragments

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{config_path, load_config, FleetConfig};
use crate::error::Result;

/// Options every binary accepts
#[derive(Clone, Debug, Args)]
pub struct CommonOpts {
    /// Config file (defaults to ~/.config/fleetsync/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the node registry and transfer log
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Append plain-text event lines to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// Show every node and file event
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl CommonOpts {
    /// Config file merged with flags; flags win
    pub fn load(&self) -> Result<FleetConfig> {
        let path = self.config.clone().unwrap_or_else(config_path);
        let mut cfg = load_config(&path)?;
        if self.state_dir.is_some() {
            cfg.state_dir = self.state_dir.clone();
        }
        if self.log_file.is_some() {
            cfg.log_file = self.log_file.clone();
        }
        cfg.verbose |= self.verbose;
        Ok(cfg)
    }
}

/// Background poller and transfer worker
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Fleetsync daemon: liveness polling and transfer queue")]
pub struct DaemonOpts {
    #[command(flatten)]
    pub common: CommonOpts,

    /// Override the node API port
    #[arg(long)]
    pub api_port: Option<u16>,
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Fleetsync - keep files in sync across display nodes")]
pub struct CliOpts {
    #[command(flatten)]
    pub common: CommonOpts,

    /// Run against three in-process demo nodes instead of the registry
    #[arg(long, global = true)]
    pub memory: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Manage the node registry
    #[command(subcommand)]
    Nodes(NodeCommand),

    /// Probe every node and print its state
    Ping,

    /// Reconcile a directory and list what each node holds
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Restrict to these nodes (id or name); all when omitted
        #[arg(short, long = "node")]
        nodes: Vec<String>,
    },

    /// Reconcile a directory on every ready node and print what changed
    Refresh {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Upload a local file into a directory on the given nodes
    Upload {
        file: PathBuf,
        #[arg(default_value = "/")]
        dest: String,
        #[arg(short, long = "node", required = true)]
        nodes: Vec<String>,
    },

    /// Copy a file or directory so every given node holds it
    Sync {
        /// Remote path, e.g. /docs/plan.pdf
        target: String,
        #[arg(short, long = "node", required = true)]
        nodes: Vec<String>,
    },

    /// Delete files or directories from one node
    Delete {
        #[arg(short, long)]
        node: String,
        /// Remote paths in the same directory
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Print the transfer log
    Log,
}

#[derive(Clone, Debug, Subcommand)]
pub enum NodeCommand {
    List,
    Add {
        address: String,
        name: String,
        #[arg(long)]
        hardware_id: Option<String>,
        #[arg(long)]
        group: Option<String>,
    },
    Edit {
        /// Node id or current name
        node: String,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        hardware_id: Option<String>,
    },
    Remove {
        node: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("config.toml");
        std::fs::write(&cfg_path, "verbose = false\napi_port = 9000\n").unwrap();
        let opts = CliOpts::parse_from([
            "fleetsync",
            "--config",
            cfg_path.to_str().unwrap(),
            "--state-dir",
            "/tmp/fs-state",
            "-v",
            "ping",
        ]);
        let cfg = opts.common.load().unwrap();
        assert!(cfg.verbose);
        assert_eq!(cfg.api_port, 9000);
        assert_eq!(cfg.state_dir, Some(PathBuf::from("/tmp/fs-state")));
        assert!(matches!(opts.command, Command::Ping));
        assert!(!opts.memory);
    }

    #[test]
    fn sync_requires_nodes() {
        assert!(CliOpts::try_parse_from(["fleetsync", "sync", "/a.txt"]).is_err());
        let opts = CliOpts::try_parse_from(["fleetsync", "sync", "/a.txt", "-n", "A", "-n", "B"]).unwrap();
        match opts.command {
            Command::Sync { target, nodes } => {
                assert_eq!(target, "/a.txt");
                assert_eq!(nodes, vec!["A", "B"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
