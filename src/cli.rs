use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::optimize::OptimizeConfig;

#[derive(Parser)]
#[command(name = "deploy-tune")]
#[command(version)]
#[command(about = "Inspect versioned tuning definitions for deployed components")]
pub struct Args {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Parse an optimize document and list its stages and entrances
    Check {
        /// Path to a YAML or TOML optimize document
        file: PathBuf,
    },
    /// Show which file the version-aware search picks for a component
    Search {
        /// Directory containing `optimize/`
        #[arg(long, env = "DEPLOY_TUNE_HOME")]
        home: PathBuf,
        /// Component name, e.g. oceanbase
        component: String,
        /// Deployed component version, e.g. 4.2.1.0
        version: String,
        /// File name to look for, e.g. optimizer.yaml
        file: String,
    },
}

/// One line per (component, stage, type) with its item count.
pub fn describe_config(config: &OptimizeConfig) -> Vec<String> {
    let mut lines = Vec::new();
    for component in config.components() {
        for stage in config.stages(component) {
            let decls = config.declarations(component, stage);
            if decls.is_empty() {
                lines.push(format!("{}/{}: (empty)", component, stage));
            }
            for decl in decls {
                lines.push(format!("{}/{}: {} x{}", component, stage, decl.kind, decl.items.len()));
            }
        }
    }
    lines
}
