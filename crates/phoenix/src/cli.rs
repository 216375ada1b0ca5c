//! Command-line interface definition

use clap::Parser;
use phoenix_core::manifest::{DEFAULT_GLOBAL_CONFIG_PATH, DEFAULT_LXC_CONFIG_PATH};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "phoenix",
    version,
    about = "Declarative LXC fleet orchestrator for Proxmox hosts",
    long_about = "Reconciles containers declared in the Phoenix manifest toward their goal \
                  state: existing, configured, running, customized by their declared features, \
                  finalized as named snapshots when marked as templates."
)]
pub struct Cli {
    /// Container ID to reconcile
    #[arg(
        value_name = "CTID",
        required_unless_present = "all",
        conflicts_with = "all"
    )]
    pub ctid: Option<u32>,

    /// Reconcile every CTID in the manifest, ascending (templates first)
    #[arg(long)]
    pub all: bool,

    /// Log mutating commands without executing them (same as DRY_RUN=1)
    #[arg(long)]
    pub dry_run: bool,

    /// Reconcile non-template CTIDs concurrently once all templates are final
    #[arg(long, requires = "all")]
    pub parallel: bool,

    /// Path to the global settings file
    #[arg(long, value_name = "PATH")]
    pub global_config: Option<PathBuf>,

    /// Path to the LXC configs file
    #[arg(long, value_name = "PATH")]
    pub lxc_config: Option<PathBuf>,
}

impl Cli {
    /// Flag, then `PHOENIX_GLOBAL_CONFIG`, then the well-known default.
    pub fn global_config_path(&self) -> PathBuf {
        self.global_config.clone().unwrap_or_else(|| {
            std::env::var("PHOENIX_GLOBAL_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_GLOBAL_CONFIG_PATH))
        })
    }

    /// Flag, then `PHOENIX_LXC_CONFIG`, then the well-known default.
    pub fn lxc_config_path(&self) -> PathBuf {
        self.lxc_config.clone().unwrap_or_else(|| {
            std::env::var("PHOENIX_LXC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_LXC_CONFIG_PATH))
        })
    }

    pub fn dry_run_enabled(&self) -> bool {
        self.dry_run || env_truthy("DRY_RUN")
    }
}

/// `1`, `true` or `yes`, case-insensitive.
pub fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}
