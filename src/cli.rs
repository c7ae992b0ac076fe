use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::types::ModulePath;

/// modhost - install, remove, and inspect host modules
#[derive(Parser, Debug)]
#[command(name = "modhost")]
#[command(about = "Dependency-ordered installer for host feature modules")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Module install/uninstall actions and package installs/removals are
    /// skipped and logged. Discovery, package queries, and service probes
    /// still run so the preview is realistic. Registry writes go to an
    /// in-memory copy.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Debug-level logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (default: $MODHOST_CONFIG or /etc/modhost/modhost.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding <category>/<module> sources
    #[arg(long, global = true)]
    pub modules_root: Option<PathBuf>,

    /// Directory holding registry records
    #[arg(long, global = true)]
    pub registry_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Install a module and its dependencies (all modules if omitted)
    Install {
        /// Module path, e.g. sensors/temp
        module: Option<ModulePath>,
    },
    /// Run uninstall actions; registry records are kept as `removed`
    Uninstall {
        module: Option<ModulePath>,
    },
    /// Uninstall and irreversibly erase records, config, logs, and packages
    Purge {
        module: Option<ModulePath>,

        /// Confirmation token; prompted for on stdin when omitted
        #[arg(long, value_name = "TOKEN")]
        confirm: Option<String>,
    },
    /// Show registry state merged with live service state
    Status {
        module: Option<ModulePath>,

        /// Also run each module's own status action
        #[arg(long)]
        live: bool,
    },
}

impl Commands {
    pub fn module(&self) -> Option<&ModulePath> {
        match self {
            Self::Install { module }
            | Self::Uninstall { module }
            | Self::Purge { module, .. }
            | Self::Status { module, .. } => module.as_ref(),
        }
    }
}
