pub mod build;
pub mod compile_rules;
pub mod groups;
pub mod output;
pub mod probe;
pub mod run;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "meshflux")]
#[command(about = "Build, probe and supervise tunnel engine configurations", long_about = None)]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse, normalize and print compiled routing rules
    CompileRules(compile_rules::CompileRulesArgs),
    /// Generate the engine document from the shared directory
    Build(build::BuildArgs),
    /// Run the reachability preflight for one selector group
    Probe(probe::ProbeArgs),
    /// Inspect or drive groups of a running engine over its control socket
    Groups(groups::GroupsArgs),
    /// Start the engine under supervision with hot reload
    Run(run::RunArgs),
}

/// Output format shared by subcommands
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Human,
    Json,
}

/// Shared data directory argument.
#[derive(clap::Args, Debug, Clone)]
pub struct DirArgs {
    /// Shared data directory (template, rules, preferences, assets)
    #[arg(long = "dir", env = "MF_SHARED_DIR")]
    pub dir: PathBuf,
    /// Cache directory for the generated document (default: <dir>/cache)
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<PathBuf>,
}

impl DirArgs {
    pub fn shared_dir(&self) -> crate::config_loader::SharedDir {
        let dir = crate::config_loader::SharedDir::new(&self.dir);
        match &self.cache_dir {
            Some(cache) => dir.with_cache(cache),
            None => dir,
        }
    }
}
