use crate::cli::Format;
use mf_types::{ErrorKind, ErrorPayload};
use serde::Serialize;

/// Unified output adapter for CLI commands
pub fn emit<T: Serialize>(fmt: Format, human: impl FnOnce() -> String, json: &T) {
    match fmt {
        Format::Human => println!("{}", human()),
        Format::Json => println!(
            "{}",
            serde_json::to_string_pretty(json).unwrap_or_else(|_| "{}".into())
        ),
    }
}

/// Print a classified error on stderr in the chosen format.
pub fn emit_error(fmt: Format, kind: ErrorKind, msg: &str, hint: Option<&str>) {
    match fmt {
        Format::Human => {
            eprintln!("error[{kind}]: {msg}");
            if let Some(hint) = hint {
                eprintln!("hint: {hint}");
            }
        }
        Format::Json => {
            let mut payload = ErrorPayload::new(kind, msg);
            payload.hint = hint.map(str::to_string);
            eprintln!(
                "{}",
                serde_json::to_string(&payload).unwrap_or_else(|_| "{}".into())
            );
        }
    }
}
