//! `meshflux probe --dir <shared> --group <tag>`

use crate::cli::output::emit;
use crate::cli::{DirArgs, Format};
use anyhow::{anyhow, Result};
use clap::Args as ClapArgs;
use mf_config::{Template, PRIMARY_OUTBOUND};
use mf_core::{Preflight, PreflightConfig};
use std::time::Duration;

#[derive(ClapArgs, Debug)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub dir: DirArgs,
    /// Selector group to probe
    #[arg(long, default_value = PRIMARY_OUTBOUND)]
    pub group: String,
    #[arg(long, default_value_t = 1500)]
    pub probe_timeout_ms: u64,
    #[arg(long, default_value_t = 4000)]
    pub budget_ms: u64,
    #[arg(long, value_enum, default_value_t = Format::Human)]
    pub format: Format,
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    let dir = args.dir.shared_dir();
    let template = Template::parse(&dir.read_template()?)?;
    let group = template
        .selector_group(&args.group)
        .ok_or_else(|| anyhow!("no selector group `{}` in template", args.group))?;
    let candidates = template.candidates_of(&group);

    let preflight = Preflight::tcp(PreflightConfig {
        per_probe_timeout: Duration::from_millis(args.probe_timeout_ms),
        total_budget: Duration::from_millis(args.budget_ms),
    });
    let outcome = preflight.verify_or_repair(&group, &candidates).await?;

    emit(
        args.format,
        || {
            let mut text = match (&outcome.previous, outcome.repaired()) {
                (Some(prev), true) => format!(
                    "{}: default {prev} unreachable, use {} ({} ms)",
                    outcome.group, outcome.selected, outcome.rtt_ms
                ),
                _ => format!(
                    "{}: {} reachable ({} ms)",
                    outcome.group, outcome.selected, outcome.rtt_ms
                ),
            };
            for r in &outcome.results {
                let rtt = r
                    .rtt_ms
                    .map_or_else(|| "unreachable".to_string(), |ms| format!("{ms} ms"));
                text.push_str(&format!("\n  {:<16} {rtt}", r.tag));
            }
            text
        },
        &outcome,
    );
    Ok(())
}
