//! Engine supervisor: one serial queue for every configuration-affecting operation.
//!
//! Start, reload, sleep/wake and shutdown go through a single mpsc event loop,
//! so two reconfigurations never overlap and the engine sees configs in the
//! order they were generated.

use crate::engine::{BoxService, EngineFactory, EngineStatus};
use crate::orchestrator::BuiltConfig;
use async_trait::async_trait;
use mf_types::{EngineError, ErrorKind, OrchestratorError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Build(#[from] OrchestratorError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("supervisor is shut down")]
    Closed,
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Build(e) => e.kind(),
            Self::Engine(e) => e.kind(),
            Self::Closed => ErrorKind::NotRunning,
        }
    }
}

/// Why a configuration is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildReason {
    /// First start: the reachability preflight runs.
    Start,
    /// Hot reload of a running engine: no preflight.
    Reload,
}

/// Produces a fresh configuration on demand, inside the supervisor queue.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn build(&self, reason: BuildReason) -> Result<BuiltConfig, OrchestratorError>;

    /// Called after an engine instance is serving `built`.
    fn applied(&self, _built: &BuiltConfig) {}
}

/// Messages sent to the supervisor event loop
#[derive(Debug)]
enum SupervisorMsg {
    Start,
    Reload { reason: String },
    Sleep,
    Wake,
    Shutdown,
}

type Reply = oneshot::Sender<Result<(), SupervisorError>>;

struct Running {
    service: Box<dyn BoxService>,
    config: BuiltConfig,
}

struct State {
    provider: Arc<dyn ConfigProvider>,
    factory: Arc<dyn EngineFactory>,
    status: watch::Sender<EngineStatus>,
    running: Option<Running>,
}

/// Cheap, cloneable handle to the supervisor queue.
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::Sender<(SupervisorMsg, Option<Reply>)>,
    status: watch::Receiver<EngineStatus>,
}

pub struct SupervisorTask {
    handle: JoinHandle<()>,
}

impl SupervisorTask {
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "supervisor task join failed");
        }
    }
}

impl Supervisor {
    /// Spawn the event loop. The engine is not started until [`Supervisor::start`].
    pub fn spawn(
        provider: Arc<dyn ConfigProvider>,
        factory: Arc<dyn EngineFactory>,
    ) -> (Self, SupervisorTask) {
        let (tx, mut rx) = mpsc::channel::<(SupervisorMsg, Option<Reply>)>(32);
        let (status_tx, status) = watch::channel(EngineStatus::Stopped);
        let mut state = State {
            provider,
            factory,
            status: status_tx,
            running: None,
        };

        let handle = tokio::spawn(async move {
            while let Some((msg, reply)) = rx.recv().await {
                let shutdown = matches!(msg, SupervisorMsg::Shutdown);
                let result = match msg {
                    SupervisorMsg::Start => state.handle_start().await,
                    SupervisorMsg::Reload { reason } => state.handle_reload(&reason).await,
                    SupervisorMsg::Sleep => state.handle_sleep().await,
                    SupervisorMsg::Wake => state.handle_wake().await,
                    SupervisorMsg::Shutdown => state.handle_shutdown().await,
                };
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, kind = %e.kind(), "supervisor operation failed");
                        }
                    }
                }
                if shutdown {
                    break;
                }
            }
            tracing::debug!("supervisor loop exited");
        });

        (Self { tx, status }, SupervisorTask { handle })
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    async fn call(&self, msg: SupervisorMsg) -> Result<(), SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((msg, Some(reply_tx)))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        reply_rx.await.map_err(|_| SupervisorError::Closed)?
    }

    /// Build with preflight and start the engine.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.call(SupervisorMsg::Start).await
    }

    /// Rebuild and swap the running instance; waits for the outcome.
    pub async fn reload(&self, reason: impl Into<String>) -> Result<(), SupervisorError> {
        self.call(SupervisorMsg::Reload {
            reason: reason.into(),
        })
        .await
    }

    /// Queue a reload without waiting (watcher callbacks, signal handlers).
    pub fn request_reload(&self, reason: impl Into<String>) -> Result<(), SupervisorError> {
        self.tx
            .try_send((
                SupervisorMsg::Reload {
                    reason: reason.into(),
                },
                None,
            ))
            .map_err(|_| SupervisorError::Closed)
    }

    pub async fn sleep(&self) -> Result<(), SupervisorError> {
        self.call(SupervisorMsg::Sleep).await
    }

    pub async fn wake(&self) -> Result<(), SupervisorError> {
        self.call(SupervisorMsg::Wake).await
    }

    /// Stop the engine and end the event loop.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.call(SupervisorMsg::Shutdown).await
    }
}

impl State {
    fn set_status(&self, status: EngineStatus) {
        self.status.send_replace(status);
    }

    /// `State` is not `Sync`; no `&State` may live across this await.
    async fn launch(
        factory: &Arc<dyn EngineFactory>,
        config: &BuiltConfig,
    ) -> Result<Box<dyn BoxService>, EngineError> {
        let mut service = factory.create(&config.content)?;
        service.start().await?;
        Ok(service)
    }

    async fn handle_start(&mut self) -> Result<(), SupervisorError> {
        if self.running.is_some() {
            tracing::debug!("start requested while running; ignored");
            return Ok(());
        }
        self.set_status(EngineStatus::Starting);
        let built = match self.provider.build(BuildReason::Start).await {
            Ok(built) => built,
            Err(e) => {
                self.set_status(EngineStatus::Stopped);
                return Err(e.into());
            }
        };
        match Self::launch(&self.factory, &built).await {
            Ok(service) => {
                self.provider.applied(&built);
                self.running = Some(Running {
                    service,
                    config: built,
                });
                self.set_status(EngineStatus::Running);
                tracing::info!("engine started");
                Ok(())
            }
            Err(e) => {
                self.set_status(EngineStatus::Stopped);
                Err(e.into())
            }
        }
    }

    /// Close old, start new. On failure the previous config is restarted
    /// best effort so the observable engine stays what it was.
    async fn handle_reload(&mut self, reason: &str) -> Result<(), SupervisorError> {
        if self.running.is_none() {
            tracing::debug!(reason, "reload requested while stopped; ignored");
            return Ok(());
        }
        let built = match self.provider.build(BuildReason::Reload).await {
            Ok(built) => built,
            Err(e) => {
                tracing::warn!(reason, error = %e, "rebuild failed; keeping running engine");
                return Err(e.into());
            }
        };

        let Some(mut previous) = self.running.take() else {
            return Ok(());
        };
        self.set_status(EngineStatus::Swapping);
        if let Err(e) = previous.service.close().await {
            tracing::warn!(error = %e, "closing previous engine failed");
        }

        match Self::launch(&self.factory, &built).await {
            Ok(service) => {
                self.provider.applied(&built);
                self.running = Some(Running {
                    service,
                    config: built,
                });
                self.set_status(EngineStatus::Running);
                tracing::info!(reason, "engine reloaded");
                Ok(())
            }
            Err(e) => {
                tracing::error!(reason, error = %e, "new engine failed to start; restoring previous config");
                match Self::launch(&self.factory, &previous.config).await {
                    Ok(service) => {
                        self.running = Some(Running {
                            service,
                            config: previous.config,
                        });
                        self.set_status(EngineStatus::Running);
                    }
                    Err(rollback) => {
                        tracing::error!(error = %rollback, "restoring previous engine failed");
                        self.set_status(EngineStatus::Stopped);
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn handle_sleep(&mut self) -> Result<(), SupervisorError> {
        let running = self.running.as_mut().ok_or(EngineError::NotRunning)?;
        running.service.pause().await?;
        self.set_status(EngineStatus::Paused);
        Ok(())
    }

    async fn handle_wake(&mut self) -> Result<(), SupervisorError> {
        let running = self.running.as_mut().ok_or(EngineError::NotRunning)?;
        running.service.wake().await?;
        self.set_status(EngineStatus::Running);
        Ok(())
    }

    async fn handle_shutdown(&mut self) -> Result<(), SupervisorError> {
        let result = match self.running.take() {
            Some(mut running) => running.service.close().await.map_err(Into::into),
            None => Ok(()),
        };
        self.set_status(EngineStatus::Stopped);
        tracing::info!("engine stopped");
        result
    }
}
