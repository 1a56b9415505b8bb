//! `meshflux build --dir <shared>`

use crate::cli::output::emit;
use crate::cli::{DirArgs, Format};
use crate::config_loader::SharedDirProvider;
use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use mf_config::rules::compile;
use mf_config::{RoutingMode, RuleSource};
use mf_core::PreflightConfig;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

#[derive(ClapArgs, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub dir: DirArgs,
    /// Probe selector defaults and repair unreachable ones
    #[arg(long)]
    pub preflight: bool,
    /// Profile whose preferred outbound is applied
    #[arg(long)]
    pub profile: Option<String>,
    /// Rewrite routing for rule or global mode
    #[arg(long, value_parser = clap::value_parser!(RoutingMode))]
    pub mode: Option<RoutingMode>,
    /// Use this rule file instead of the shared directory's
    #[arg(long)]
    pub rules: Option<PathBuf>,
    /// Write the document here instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
    #[arg(long, default_value_t = 1500)]
    pub probe_timeout_ms: u64,
    #[arg(long, default_value_t = 4000)]
    pub budget_ms: u64,
    #[arg(long, value_enum, default_value_t = Format::Human)]
    pub format: Format,
}

pub async fn run(args: BuildArgs) -> Result<()> {
    let dir = args.dir.shared_dir();
    let preflight = PreflightConfig {
        per_probe_timeout: Duration::from_millis(args.probe_timeout_ms),
        total_budget: Duration::from_millis(args.budget_ms),
    };
    let orchestrator = dir.orchestrator(args.mode, preflight);
    let provider = SharedDirProvider::new(dir, orchestrator, args.profile.clone());

    if let Some(path) = &args.rules {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let rules = compile(&RuleSource::from_path_and_content(path, content))?;
        provider.set_rules_override(Some(rules));
    }

    let built = provider.build_with(args.preflight).await?;

    let Some(out) = &args.out else {
        println!("{}", built.content);
        return Ok(());
    };
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(out, &built.content).with_context(|| format!("write {}", out.display()))?;

    let report = json!({
        "ok": true,
        "out": out,
        "patches": built.patches,
        "splice": built.splice,
        "preflight": built.preflight,
    });
    emit(
        args.format,
        || {
            let mut text = format!("wrote {} ({} bytes)", out.display(), built.content.len());
            for p in &built.patches {
                text.push_str(&format!("\n  {p}"));
            }
            text
        },
        &report,
    );
    Ok(())
}
