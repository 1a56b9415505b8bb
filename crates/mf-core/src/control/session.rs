//! One connected control session.

use super::{
    Command, CommandSink, ConnectionInfo, ConnectionState, GroupSnapshot, LogFrame, PushFrame,
    StatusFrame,
};
use mf_types::ControlError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const LOG_BUFFER: usize = 256;

#[derive(Default)]
struct Latest {
    status: Option<StatusFrame>,
    connections: Option<Vec<ConnectionInfo>>,
}

/// A live session. Push frames are consumed by a background reader; reads
/// return the latest state it has seen.
pub struct Session {
    sink: tokio::sync::Mutex<Box<dyn CommandSink>>,
    groups: watch::Receiver<Option<GroupSnapshot>>,
    latest: Arc<Mutex<Latest>>,
    logs: broadcast::Sender<LogFrame>,
    reader: JoinHandle<()>,
    state: Arc<Mutex<ConnectionState>>,
}

impl Session {
    pub(super) fn spawn(
        sink: Box<dyn CommandSink>,
        mut frames: mpsc::Receiver<PushFrame>,
        state: Arc<Mutex<ConnectionState>>,
    ) -> Self {
        let (groups_tx, groups) = watch::channel(None);
        let latest = Arc::new(Mutex::new(Latest::default()));
        let (logs, _) = broadcast::channel(LOG_BUFFER);

        let reader_latest = Arc::clone(&latest);
        let reader_logs = logs.clone();
        let reader_state = Arc::clone(&state);
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                match frame {
                    PushFrame::Groups { groups } => {
                        groups_tx.send_replace(Some(GroupSnapshot { groups }));
                    }
                    PushFrame::Log(log) => {
                        // No subscribers is fine.
                        let _ = reader_logs.send(log);
                    }
                    PushFrame::Status(status) => reader_latest.lock().status = Some(status),
                    PushFrame::Connections { connections } => {
                        reader_latest.lock().connections = Some(connections);
                    }
                }
            }
            tracing::debug!("control session closed by engine");
            *reader_state.lock() = ConnectionState::Disconnected;
        });

        Self {
            sink: tokio::sync::Mutex::new(sink),
            groups,
            latest,
            logs,
            reader,
            state,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Wait for the first group state, or return the latest one.
    ///
    /// # Errors
    /// `Timeout` when no group frame arrives in time, `NotRunning` when the
    /// session closed before any arrived.
    pub async fn snapshot_groups(&self, timeout: Duration) -> Result<GroupSnapshot, ControlError> {
        let mut rx = self.groups.clone();
        let wait = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(snapshot) = current {
                    return Ok(snapshot);
                }
                rx.changed().await.map_err(|_| ControlError::NotRunning)?;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ControlError::timeout("snapshot groups", timeout))?
    }

    /// Trigger a URL test on `group` and wait until pushed state shows a test
    /// newer than the pre-trigger baseline.
    ///
    /// The baseline is the first group state pushed on this session, so the
    /// engine's initial push is never mistaken for a fresh result. Returns
    /// `tag -> delay_ms` for the group.
    ///
    /// # Errors
    /// `Timeout` means "triggered, no observable result yet"; the engine may
    /// still publish results later. When no group state arrives within
    /// `timeout` at all, nothing is triggered. `NotRunning` when the session
    /// is gone.
    pub async fn run_test(
        &self,
        group: &str,
        timeout: Duration,
    ) -> Result<BTreeMap<String, u32>, ControlError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let baseline = self
            .snapshot_groups(timeout)
            .await?
            .group(group)
            .map(|g| g.latest_test())
            .unwrap_or(0);
        let mut rx = self.groups.clone();
        rx.borrow_and_update();

        self.send(Command::UrlTest {
            group: group.to_string(),
        })
        .await?;
        tracing::debug!(group, baseline, "url test triggered");

        let wait = async move {
            loop {
                rx.changed().await.map_err(|_| ControlError::NotRunning)?;
                let advanced = rx
                    .borrow_and_update()
                    .as_ref()
                    .and_then(|s| s.group(group))
                    .filter(|g| g.latest_test() > baseline)
                    .map(|g| g.delays());
                if let Some(delays) = advanced {
                    return Ok(delays);
                }
            }
        };
        match tokio::time::timeout_at(deadline, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::info!(group, "url test triggered, no result yet");
                Err(ControlError::timeout(format!("url test {group}"), timeout))
            }
        }
    }

    /// Switch a selector group; the new selection shows up in pushed state.
    pub async fn select_outbound(&self, group: &str, outbound: &str) -> Result<(), ControlError> {
        self.send(Command::SelectOutbound {
            group: group.to_string(),
            outbound: outbound.to_string(),
        })
        .await
    }

    async fn send(&self, command: Command) -> Result<(), ControlError> {
        if !self.is_open() {
            return Err(ControlError::NotRunning);
        }
        self.sink.lock().await.send(command).await
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogFrame> {
        self.logs.subscribe()
    }

    pub fn latest_groups(&self) -> Option<GroupSnapshot> {
        self.groups.borrow().clone()
    }

    pub fn latest_status(&self) -> Option<StatusFrame> {
        self.latest.lock().status.clone()
    }

    pub fn latest_connections(&self) -> Option<Vec<ConnectionInfo>> {
        self.latest.lock().connections.clone()
    }

    /// Drop the session; pushed state is discarded with it.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
        *self.state.lock() = ConnectionState::Disconnected;
    }
}
