//! `meshflux compile-rules <file>`

use crate::cli::output::emit;
use crate::cli::Format;
use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use mf_config::rules::compile;
use mf_config::{RuleSource, PRIMARY_OUTBOUND};
use serde_json::Value;
use std::path::PathBuf;

#[derive(ClapArgs, Debug)]
pub struct CompileRulesArgs {
    /// Rule file; `.json` is parsed as JSON, anything else as text
    pub file: PathBuf,
    /// Outbound tag the compiled rules route to
    #[arg(long, default_value = PRIMARY_OUTBOUND)]
    pub outbound: String,
    #[arg(long, value_enum, default_value_t = Format::Json)]
    pub format: Format,
}

pub fn run(args: CompileRulesArgs) -> Result<()> {
    let content = std::fs::read_to_string(&args.file)
        .with_context(|| format!("read {}", args.file.display()))?;
    let source = RuleSource::from_path_and_content(&args.file, content);
    let rules = compile(&source)?;
    let compiled: Vec<Value> = rules
        .to_engine_rules(&args.outbound)
        .iter()
        .map(|r| r.to_value())
        .collect();

    emit(
        args.format,
        || {
            let mut out = format!(
                "{} entries -> {} engine rules (outbound {})",
                rules.len(),
                compiled.len(),
                args.outbound
            );
            for rule in &compiled {
                out.push('\n');
                out.push_str(&rule.to_string());
            }
            out
        },
        &compiled,
    );
    Ok(())
}
