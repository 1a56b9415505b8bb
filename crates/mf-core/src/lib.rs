//! Runtime half of meshflux: preflight, orchestration, engine supervision
//! meshflux 运行时：连通性预检、配置编排、引擎监管
//!
//! ## Strategic Workflow / 战略工作流
//! `RuleChangeWatcher` (debounced) -> `Supervisor` queue -> `ConfigProvider::build`
//! (`ConfigOrchestrator`, with `Preflight` on start) -> `EngineFactory` swap
//!
//! `ControlClient` talks to the running engine independently of the queue and
//! refuses to connect while the supervisor reports a stopped engine.

pub mod control;
pub mod engine;
pub mod orchestrator;
pub mod preflight;
pub mod supervisor;
pub mod watcher;

pub use control::{
    Command, CommandChannel, CommandSink, ConnectPolicy, ConnectionState, ControlClient,
    GroupSnapshot, GroupState, PushFrame, Session,
};
#[cfg(unix)]
pub use control::{UnixCommandChannel, COMMAND_SOCKET};
pub use engine::{
    BoxService, EngineFactory, EngineStatus, ProcessEngine, ProcessEngineConfig,
    ProcessEngineFactory,
};
pub use orchestrator::{BuildInput, BuiltConfig, ConfigOrchestrator};
pub use preflight::{
    Preflight, PreflightConfig, PreflightOutcome, Prober, ReachabilityResult, TcpProber,
};
pub use supervisor::{BuildReason, ConfigProvider, Supervisor, SupervisorError, SupervisorTask};
pub use watcher::{Debouncer, RuleChangeWatcher, WatchConfig};
