//! Engine instance abstraction.
//!
//! The tunneling engine is a black box: it receives a JSON document and
//! exposes start/close/pause/wake. [`ProcessEngine`] drives an external
//! binary; tests plug in their own [`EngineFactory`].

use async_trait::async_trait;
use mf_types::EngineError;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Lifecycle state published by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Stopped,
    Starting,
    Running,
    /// Old instance closed, new one not yet serving. Control queries see "not running".
    Swapping,
    Paused,
}

impl EngineStatus {
    /// Whether control-channel traffic may be served.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// One running engine instance.
#[async_trait]
pub trait BoxService: Send {
    async fn start(&mut self) -> Result<(), EngineError>;
    async fn close(&mut self) -> Result<(), EngineError>;
    async fn pause(&mut self) -> Result<(), EngineError>;
    async fn wake(&mut self) -> Result<(), EngineError>;
}

/// Creates engine instances from a generated configuration document.
pub trait EngineFactory: Send + Sync {
    fn create(&self, config: &str) -> Result<Box<dyn BoxService>, EngineError>;
}

/// How to launch the external engine binary.
#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    pub binary: PathBuf,
    /// Arguments before the config path, e.g. `["run", "-c"]`.
    pub args: Vec<String>,
    /// Working directory; the engine creates its control socket here.
    pub work_dir: PathBuf,
    /// The process must survive this long to count as started.
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
}

impl ProcessEngineConfig {
    pub fn new(binary: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: vec!["run".into(), "-c".into()],
            work_dir: work_dir.into(),
            startup_grace: Duration::from_millis(300),
            stop_timeout: Duration::from_secs(3),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.work_dir.join("engine_config.json")
    }
}

pub struct ProcessEngineFactory {
    config: ProcessEngineConfig,
}

impl ProcessEngineFactory {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(&self, config: &str) -> Result<Box<dyn BoxService>, EngineError> {
        std::fs::create_dir_all(&self.config.work_dir)
            .map_err(|e| EngineError::Build(format!("create {}: {e}", self.config.work_dir.display())))?;
        let path = self.config.config_path();
        std::fs::write(&path, config)
            .map_err(|e| EngineError::Build(format!("write {}: {e}", path.display())))?;
        Ok(Box::new(ProcessEngine {
            config: self.config.clone(),
            child: None,
        }))
    }
}

/// External engine process (`<binary> run -c <work_dir>/engine_config.json`).
pub struct ProcessEngine {
    config: ProcessEngineConfig,
    child: Option<Child>,
}

impl ProcessEngine {
    fn pid(&self) -> Result<u32, EngineError> {
        self.child
            .as_ref()
            .and_then(Child::id)
            .ok_or(EngineError::NotRunning)
    }

    #[cfg(unix)]
    fn signal(&self, sig: libc::c_int) -> Result<(), EngineError> {
        let pid = self.pid()?;
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| EngineError::Start(format!("pid {pid} out of range")))?;
        // SAFETY: kill(2) with a pid we spawned; no memory is shared.
        let rc = unsafe { libc::kill(pid, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(EngineError::Start(format!(
                "signal {sig} to {pid}: {}",
                std::io::Error::last_os_error()
            )))
        }
    }
}

#[async_trait]
impl BoxService for ProcessEngine {
    async fn start(&mut self) -> Result<(), EngineError> {
        let path = self.config.config_path();
        let mut child = Command::new(&self.config.binary)
            .args(&self.config.args)
            .arg(&path)
            .current_dir(&self.config.work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Start(format!("spawn {}: {e}", self.config.binary.display())))?;

        match tokio::time::timeout(self.config.startup_grace, child.wait()).await {
            Ok(Ok(status)) => Err(EngineError::Start(format!("engine exited during startup: {status}"))),
            Ok(Err(e)) => Err(EngineError::Start(format!("wait engine: {e}"))),
            Err(_) => {
                tracing::info!(pid = child.id(), binary = %self.config.binary.display(), "engine process started");
                self.child = Some(child);
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        child
            .start_kill()
            .map_err(|e| EngineError::Stop(format!("kill engine: {e}")))?;
        match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "engine process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::Stop(format!("wait engine: {e}"))),
            Err(_) => Err(EngineError::Stop("engine did not exit in time".into())),
        }
    }

    async fn pause(&mut self) -> Result<(), EngineError> {
        #[cfg(unix)]
        {
            self.signal(libc::SIGSTOP)
        }
        #[cfg(not(unix))]
        {
            self.pid().map(|_| ())
        }
    }

    async fn wake(&mut self) -> Result<(), EngineError> {
        #[cfg(unix)]
        {
            self.signal(libc::SIGCONT)
        }
        #[cfg(not(unix))]
        {
            self.pid().map(|_| ())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn factory(binary: &str, args: &[&str], dir: &std::path::Path) -> ProcessEngineFactory {
        let mut cfg = ProcessEngineConfig::new(binary, dir);
        cfg.args = args.iter().map(|s| s.to_string()).collect();
        cfg.startup_grace = Duration::from_millis(150);
        ProcessEngineFactory::new(cfg)
    }

    #[tokio::test]
    async fn create_writes_config_into_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory("sleep", &[], dir.path());
        let _svc = f.create(r#"{"route":{}}"#).unwrap();
        let written = std::fs::read_to_string(dir.path().join("engine_config.json")).unwrap();
        assert_eq!(written, r#"{"route":{}}"#);
    }

    #[tokio::test]
    async fn early_exit_is_start_error() {
        let dir = tempfile::tempdir().unwrap();
        // `false <path>` exits immediately with status 1.
        let f = factory("false", &[], dir.path());
        let mut svc = f.create("{}").unwrap();
        assert!(matches!(svc.start().await, Err(EngineError::Start(_))));
    }

    #[tokio::test]
    async fn long_running_process_starts_pauses_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -c 'sleep 30' <path>`: the config path becomes $0.
        let f = factory("sh", &["-c", "sleep 30"], dir.path());
        let mut svc = f.create("{}").unwrap();
        svc.start().await.unwrap();
        svc.pause().await.unwrap();
        svc.wake().await.unwrap();
        svc.close().await.unwrap();
        assert!(matches!(svc.pause().await, Err(EngineError::NotRunning)));
    }
}
