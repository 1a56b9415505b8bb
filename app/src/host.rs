//! Host messages: newline-delimited JSON commands from the embedding process.
//!
//! `{"action":"reload"}` and
//! `{"action":"update_rules","format":"json"|"text","content":"..."}` both end
//! in a debounced reload. Replies are `{"ok":true}` or
//! `{"ok":false,"kind":"...","error":"..."}`.

use crate::config_loader::{RulesFormat, SharedDir};
use mf_config::rules::compile;
use mf_config::RuleSource;
use mf_core::Debouncer;
use mf_types::ErrorKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HostMessage {
    Reload,
    UpdateRules { format: RulesFormat, content: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostReply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            kind: None,
            error: None,
        }
    }

    pub fn err(kind: ErrorKind, error: impl ToString) -> Self {
        Self {
            ok: false,
            kind: Some(kind),
            error: Some(error.to_string()),
        }
    }
}

pub struct HostFrontend {
    dir: SharedDir,
    reload: Debouncer,
}

impl HostFrontend {
    pub fn new(dir: SharedDir, debounce: Duration, reload: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            dir,
            reload: Debouncer::new(debounce, reload),
        }
    }

    pub fn handle(&self, msg: HostMessage) -> HostReply {
        match msg {
            HostMessage::Reload => {
                self.reload.schedule();
                HostReply::ok()
            }
            HostMessage::UpdateRules { format, content } => {
                let source = match format {
                    RulesFormat::Json => RuleSource::Json(content),
                    RulesFormat::Text => RuleSource::Text(content),
                };
                // Reject before touching the file the running engine was built from.
                if let Err(e) = compile(&source) {
                    tracing::warn!(error = %e, "host rules rejected");
                    return HostReply::err(e.kind(), e);
                }
                let content = match &source {
                    RuleSource::Json(c) | RuleSource::Text(c) => c,
                };
                match self.dir.write_rules(format, content) {
                    Ok(path) => {
                        tracing::info!(path = %path.display(), "rules updated by host");
                        self.reload.schedule();
                        HostReply::ok()
                    }
                    Err(e) => HostReply::err(ErrorKind::Io, e),
                }
            }
        }
    }

    pub fn handle_line(&self, line: &str) -> HostReply {
        match serde_json::from_str::<HostMessage>(line) {
            Ok(msg) => self.handle(msg),
            Err(e) => HostReply::err(ErrorKind::Protocol, format!("bad host message: {e}")),
        }
    }

    /// Serve host messages from stdin until EOF, one reply line per message.
    pub async fn serve_stdin(self: Arc<Self>) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "host channel read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let reply = self.handle_line(&line);
            let mut out = serde_json::to_vec(&reply).unwrap_or_else(|_| b"{\"ok\":false}".to_vec());
            out.push(b'\n');
            if stdout.write_all(&out).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
        tracing::debug!("host channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frontend(dir: &std::path::Path) -> (HostFrontend, Arc<AtomicUsize>) {
        let n = Arc::new(AtomicUsize::new(0));
        let m = Arc::clone(&n);
        let f = HostFrontend::new(SharedDir::new(dir), Duration::from_millis(50), move || {
            m.fetch_add(1, Ordering::SeqCst);
        });
        (f, n)
    }

    #[test]
    fn messages_decode() {
        let m: HostMessage = serde_json::from_str(r#"{"action":"reload"}"#).unwrap();
        assert_eq!(m, HostMessage::Reload);
        let m: HostMessage =
            serde_json::from_str(r#"{"action":"update_rules","format":"text","content":"a.com"}"#)
                .unwrap();
        assert_eq!(
            m,
            HostMessage::UpdateRules {
                format: RulesFormat::Text,
                content: "a.com".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn update_rules_writes_file_and_reloads_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (f, n) = frontend(tmp.path());
        let reply = f.handle_line(r#"{"action":"update_rules","format":"json","content":"{\"domain\":[\"x.com\"]}"}"#);
        assert_eq!(reply, HostReply::ok());
        assert_eq!(f.handle_line(r#"{"action":"reload"}"#), HostReply::ok());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(n.load(Ordering::SeqCst), 1);
        let written = std::fs::read_to_string(tmp.path().join("routing_rules.json")).unwrap();
        assert!(written.contains("x.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_rules_are_rejected_without_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let (f, n) = frontend(tmp.path());
        let reply = f.handle(HostMessage::UpdateRules {
            format: RulesFormat::Json,
            content: "[1, 2".into(),
        });
        assert!(!reply.ok);
        assert_eq!(reply.kind, Some(ErrorKind::InvalidFormat));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(n.load(Ordering::SeqCst), 0);
        assert!(!tmp.path().join("routing_rules.json").exists());

        let reply = f.handle_line("not json");
        assert_eq!(reply.kind, Some(ErrorKind::Protocol));
    }

    #[test]
    fn reply_shape() {
        assert_eq!(serde_json::to_string(&HostReply::ok()).unwrap(), r#"{"ok":true}"#);
    }
}
