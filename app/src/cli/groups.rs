//! `meshflux groups --socket <path>`: read group state, trigger tests, switch selectors.

use crate::cli::output::emit;
use crate::cli::Format;
use anyhow::Result;
use clap::Args as ClapArgs;
use mf_core::{ConnectPolicy, ControlClient, GroupSnapshot};
use mf_types::ControlError;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(ClapArgs, Debug)]
pub struct GroupsArgs {
    /// Engine control socket (`command.sock` in the engine working directory)
    #[arg(long)]
    pub socket: PathBuf,
    /// Trigger a URL test on this group and wait for fresh delays
    #[arg(long)]
    pub test: Option<String>,
    /// Switch a selector: `<group>=<outbound>`
    #[arg(long, value_parser = parse_selection)]
    pub select: Option<(String, String)>,
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
    /// Connection attempts while the control server comes up
    #[arg(long, default_value_t = 24)]
    pub attempts: u32,
    #[arg(long, value_enum, default_value_t = Format::Human)]
    pub format: Format,
}

fn parse_selection(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((g, o)) if !g.trim().is_empty() && !o.trim().is_empty() => {
            Ok((g.trim().to_string(), o.trim().to_string()))
        }
        _ => Err(format!("expected <group>=<outbound>, got {s:?}")),
    }
}

fn render(snapshot: &GroupSnapshot) -> String {
    let mut out = String::new();
    for g in &snapshot.groups {
        out.push_str(&format!(
            "{} [{}] selected={}\n",
            g.tag,
            g.kind,
            g.selected.as_deref().unwrap_or("-")
        ));
        for item in &g.items {
            let delay = match item.delay_ms {
                Some(d) if d > 0 => format!("{d} ms"),
                _ => "-".to_string(),
            };
            out.push_str(&format!("  {:<16} {delay}\n", item.tag));
        }
    }
    out.trim_end().to_string()
}

#[cfg(unix)]
pub async fn run(args: GroupsArgs) -> Result<()> {
    use mf_core::UnixCommandChannel;

    let timeout = Duration::from_millis(args.timeout_ms);
    let policy = ConnectPolicy {
        attempts: args.attempts.max(1),
        ..ConnectPolicy::default()
    };
    let client = ControlClient::new(Arc::new(UnixCommandChannel::new(&args.socket)), policy);
    let session = client.connect().await?;

    if let Some((group, outbound)) = &args.select {
        session.select_outbound(group, outbound).await?;
        tracing::info!(group = %group, outbound = %outbound, "selector switch sent");
    }

    if let Some(group) = &args.test {
        match session.run_test(group, timeout).await {
            Ok(delays) => {
                emit(
                    args.format,
                    || {
                        delays
                            .iter()
                            .map(|(tag, d)| format!("{tag:<16} {d} ms"))
                            .collect::<Vec<_>>()
                            .join("\n")
                    },
                    &json!({"group": group, "delays": delays}),
                );
            }
            // Recoverable: the engine may still publish results.
            Err(ControlError::Timeout { .. }) => {
                let last = session.latest_groups().unwrap_or_default();
                emit(
                    args.format,
                    || format!("test triggered, no result yet\n{}", render(&last)),
                    &json!({"group": group, "pending": true, "last_known": last}),
                );
            }
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }

    let snapshot = session.snapshot_groups(timeout).await?;
    emit(args.format, || render(&snapshot), &snapshot);
    Ok(())
}

#[cfg(not(unix))]
pub async fn run(_args: GroupsArgs) -> Result<()> {
    anyhow::bail!("control socket is only supported on unix")
}
