//! mf-types: cross-crate stable contracts (error kinds, typed errors).
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub mod errors;

pub use errors::{
    ControlError, EngineError, OrchestratorError, PreflightError, RuleError, WatchError,
};

/// Stable error classification used by logs, CLI output and host messages.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    // ----- Rule compilation -----
    InvalidFormat,
    InvalidRuleType,
    // ----- Config build -----
    TemplateInvalid,
    NoReachableEgress,
    // ----- Control channel -----
    Timeout,
    NotRunning,
    Connect,
    Protocol,
    // ----- Runtime -----
    WatchUnavailable,
    EngineFailed,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        use ErrorKind::*;
        match self {
            InvalidFormat => "InvalidFormat",
            InvalidRuleType => "InvalidRuleType",
            TemplateInvalid => "TemplateInvalid",
            NoReachableEgress => "NoReachableEgress",
            Timeout => "Timeout",
            NotRunning => "NotRunning",
            Connect => "Connect",
            Protocol => "Protocol",
            WatchUnavailable => "WatchUnavailable",
            EngineFailed => "EngineFailed",
            Io => "Io",
        }
    }

    /// Whether the caller may keep the engine running and retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::NotRunning | ErrorKind::WatchUnavailable
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload shape used by JSON CLI output and host message replies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
