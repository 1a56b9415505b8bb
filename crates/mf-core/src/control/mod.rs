//! Control channel client for a running engine.
//! 引擎控制通道客户端
//!
//! The engine pushes frames (groups, logs, status, connections) over a
//! session; commands such as `url_test` only *trigger* work and their effect
//! shows up later in pushed group state. There is no request/response
//! correlation: every read is "latest known state".
//!
//! `Disconnected` -> `Connecting` (retry with linear backoff) -> `Connected` -> `Disconnected`

mod session;
#[cfg(unix)]
mod unix;

pub use session::Session;
#[cfg(unix)]
pub use unix::{UnixCommandChannel, COMMAND_SOCKET};

use crate::engine::EngineStatus;
use async_trait::async_trait;
use mf_types::ControlError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// One candidate inside a group as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupItem {
    pub tag: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Last measured delay in milliseconds; `None` or 0 when never tested.
    #[serde(default)]
    pub delay_ms: Option<u32>,
    /// Unix milliseconds of the last test.
    #[serde(default)]
    pub last_test: Option<u64>,
}

/// Live state of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    pub tag: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub selected: Option<String>,
    #[serde(default)]
    pub selectable: bool,
    #[serde(default)]
    pub items: Vec<GroupItem>,
}

impl GroupState {
    /// Newest test timestamp across all items.
    pub fn latest_test(&self) -> u64 {
        self.items
            .iter()
            .filter_map(|i| i.last_test)
            .max()
            .unwrap_or(0)
    }

    /// `tag -> delay` for items that have a measured delay.
    pub fn delays(&self) -> BTreeMap<String, u32> {
        self.items
            .iter()
            .filter_map(|i| match i.delay_ms {
                Some(d) if d > 0 => Some((i.tag.clone(), d)),
                _ => None,
            })
            .collect()
    }
}

/// All groups as of the latest `groups` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub groups: Vec<GroupState>,
}

impl GroupSnapshot {
    pub fn group(&self, tag: &str) -> Option<&GroupState> {
        self.groups.iter().find(|g| g.tag == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFrame {
    #[serde(default)]
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub goroutines: u32,
    #[serde(default)]
    pub connections_in: u32,
    #[serde(default)]
    pub connections_out: u32,
    #[serde(default)]
    pub uplink_total: u64,
    #[serde(default)]
    pub downlink_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    #[serde(default)]
    pub inbound: String,
    #[serde(default)]
    pub outbound: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
}

/// Frames pushed by the engine, delivered in engine order per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    Groups { groups: Vec<GroupState> },
    Log(LogFrame),
    Status(StatusFrame),
    Connections { connections: Vec<ConnectionInfo> },
}

/// Trigger-style commands; results arrive as push frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    UrlTest { group: String },
    SelectOutbound { group: String, outbound: String },
}

/// Write half of an open session.
#[async_trait]
pub trait CommandSink: Send {
    async fn send(&mut self, command: Command) -> Result<(), ControlError>;
}

/// Transport that can open a session with the engine's control server.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn open(&self) -> Result<(Box<dyn CommandSink>, mpsc::Receiver<PushFrame>), ControlError>;
}

/// Fixed attempt count with linearly growing delay (`base + step * attempt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub step: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 24,
            base: Duration::from_millis(100),
            step: Duration::from_millis(50),
        }
    }
}

impl ConnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base + self.step * attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct ControlClient {
    channel: Arc<dyn CommandChannel>,
    policy: ConnectPolicy,
    engine_status: Option<watch::Receiver<EngineStatus>>,
    state: Arc<Mutex<ConnectionState>>,
}

impl ControlClient {
    pub fn new(channel: Arc<dyn CommandChannel>, policy: ConnectPolicy) -> Self {
        Self {
            channel,
            policy,
            engine_status: None,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
        }
    }

    /// Refuse to connect while the supervisor reports a stopped engine.
    pub fn with_engine_status(mut self, status: watch::Receiver<EngineStatus>) -> Self {
        self.engine_status = Some(status);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Open a session, retrying while the engine's control server comes up.
    ///
    /// # Errors
    /// `NotRunning` when the engine is stopped, the last transport error after
    /// all attempts otherwise.
    pub async fn connect(&self) -> Result<Session, ControlError> {
        *self.state.lock() = ConnectionState::Connecting;
        let mut last_err = ControlError::NotRunning;
        for attempt in 0..self.policy.attempts {
            if let Some(status) = &self.engine_status {
                if *status.borrow() == EngineStatus::Stopped {
                    *self.state.lock() = ConnectionState::Disconnected;
                    return Err(ControlError::NotRunning);
                }
            }
            match self.channel.open().await {
                Ok((sink, frames)) => {
                    tracing::debug!(attempt, "control channel connected");
                    *self.state.lock() = ConnectionState::Connected;
                    return Ok(Session::spawn(sink, frames, Arc::clone(&self.state)));
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "control channel not ready");
                    last_err = e;
                }
            }
            if attempt + 1 < self.policy.attempts {
                tokio::time::sleep(self.policy.delay(attempt)).await;
            }
        }
        *self.state.lock() = ConnectionState::Disconnected;
        Err(last_err)
    }
}
