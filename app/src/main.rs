//! meshflux: entrypoint
//! - logging init (MF_LOG_LEVEL / MF_LOG_FORMAT)
//! - subcommand dispatch
//! - classified error output with exit codes

use app::cli::{self, output::emit_error, Commands, Format};
use app::logging;
use clap::Parser;
use mf_core::SupervisorError;
use mf_types::{ControlError, ErrorKind, OrchestratorError, RuleError};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Args::parse();
    if let Err(e) = logging::init_logging() {
        eprintln!("logging: {e:#}");
    }

    let format = match &args.command {
        Commands::CompileRules(a) => a.format,
        Commands::Build(a) => a.format,
        Commands::Probe(a) => a.format,
        Commands::Groups(a) => a.format,
        Commands::Run(_) => Format::Human,
    };

    let result = match args.command {
        Commands::CompileRules(a) => cli::compile_rules::run(a),
        Commands::Build(a) => cli::build::run(a).await,
        Commands::Probe(a) => cli::probe::run(a).await,
        Commands::Groups(a) => cli::groups::run(a).await,
        Commands::Run(a) => cli::run::run(a).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let (kind, hint) = classify(&e);
            emit_error(format, kind, &format!("{e:#}"), hint);
            ExitCode::from(exit_code(kind))
        }
    }
}

/// Map the error chain onto the stable taxonomy.
fn classify(e: &anyhow::Error) -> (ErrorKind, Option<&'static str>) {
    for cause in e.chain() {
        if let Some(err) = cause.downcast_ref::<OrchestratorError>() {
            return (err.kind(), err.hint());
        }
        if let Some(err) = cause.downcast_ref::<SupervisorError>() {
            let hint = match err {
                SupervisorError::Build(b) => b.hint(),
                _ => None,
            };
            return (err.kind(), hint);
        }
        if let Some(err) = cause.downcast_ref::<mf_types::PreflightError>() {
            return (err.kind(), Some("switch to another egress node or provider"));
        }
        if let Some(err) = cause.downcast_ref::<RuleError>() {
            return (err.kind(), Some("fix the routing rules file and save it again"));
        }
        if let Some(err) = cause.downcast_ref::<ControlError>() {
            return (err.kind(), Some("is the engine running?"));
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return (ErrorKind::Io, None);
        }
    }
    (ErrorKind::Io, None)
}

fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::InvalidFormat | ErrorKind::InvalidRuleType | ErrorKind::TemplateInvalid => 2,
        ErrorKind::NoReachableEgress => 3,
        ErrorKind::Timeout | ErrorKind::NotRunning | ErrorKind::Connect | ErrorKind::Protocol => 4,
        _ => 1,
    }
}
