//! Typed errors shared across the workspace.
//!
//! `anyhow` is NOT used in library crates; only typed errors here. The binary
//! wraps these with context at its boundary.

use crate::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Dynamic routing rule parsing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// Structured input could not be read as the expected JSON shape.
    #[error("{0}")]
    InvalidFormat(String),

    /// An explicit type token that maps to no known rule type.
    #[error("unknown rule type: {0}")]
    InvalidRuleType(String),
}

impl RuleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Self::InvalidRuleType(_) => ErrorKind::InvalidRuleType,
        }
    }
}

/// Reachability preflight failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreflightError {
    #[error("no candidate egress is reachable in group `{group}` ({tried} tried in {elapsed:?})")]
    NoReachableEgress {
        group: String,
        tried: usize,
        elapsed: Duration,
    },
}

impl PreflightError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NoReachableEgress
    }
}

/// Configuration build errors. All of them abort the current build attempt.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Rules(#[from] RuleError),

    #[error("invalid base template: {0}")]
    TemplateInvalid(String),

    #[error(transparent)]
    NoReachableEgress(#[from] PreflightError),

    #[error("serialize generated config: {0}")]
    Serialize(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rules(e) => e.kind(),
            Self::TemplateInvalid(_) => ErrorKind::TemplateInvalid,
            Self::NoReachableEgress(e) => e.kind(),
            Self::Serialize(_) => ErrorKind::TemplateInvalid,
        }
    }

    /// Suggestion shown next to the message in user-facing surfaces.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoReachableEgress(_) => Some("switch to another egress node or provider"),
            Self::Rules(_) => Some("fix the routing rules file and save it again"),
            _ => None,
        }
    }
}

/// Control channel errors. All are recoverable from the caller's point of view.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("engine is not running")]
    NotRunning,

    #[error("connect control channel: {0}")]
    Connect(String),

    #[error("control protocol error: {0}")]
    Protocol(String),
}

impl ControlError {
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotRunning => ErrorKind::NotRunning,
            Self::Connect(_) => ErrorKind::Connect,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

/// Engine lifecycle errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("start engine: {0}")]
    Start(String),

    #[error("stop engine: {0}")]
    Stop(String),

    #[error("engine is not running")]
    NotRunning,

    #[error("build config: {0}")]
    Build(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotRunning => ErrorKind::NotRunning,
            _ => ErrorKind::EngineFailed,
        }
    }
}

/// Filesystem watch errors. Non-fatal: the system keeps running without hot reload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("watcher unavailable: {0}")]
    Unavailable(String),
}

impl WatchError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::WatchUnavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_type_error_names_token() {
        let e = RuleError::InvalidRuleType("weird".into());
        assert_eq!(e.to_string(), "unknown rule type: weird");
        assert_eq!(e.kind(), ErrorKind::InvalidRuleType);
    }

    #[test]
    fn no_reachable_egress_message_is_actionable() {
        let e: OrchestratorError = PreflightError::NoReachableEgress {
            group: "proxy".into(),
            tried: 3,
            elapsed: Duration::from_millis(1200),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::NoReachableEgress);
        assert!(e.to_string().contains("no candidate egress is reachable"));
        assert!(e.hint().is_some());
    }

    #[test]
    fn control_timeout_class() {
        let e = ControlError::timeout("url_test proxy", Duration::from_secs(5));
        assert_eq!(e.kind(), ErrorKind::Timeout);
        assert!(e.kind().is_recoverable());
    }
}
