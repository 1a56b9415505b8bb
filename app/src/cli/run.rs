//! `meshflux run`: supervised engine with hot reload.
//! 受监管运行
//!
//! 1. Build with preflight and start the engine (fatal on failure).
//! 2. Watch the rule files; changes queue a debounced reload.
//! 3. SIGHUP reloads, Ctrl+C / SIGTERM stop the engine and exit.
//! 4. With `--host-stdin`, host messages are served on stdin/stdout.
//!
//! `CLI Args` -> `Supervisor::start` -> `Event Loop (Watch/Signal/Host)` -> `Shutdown`

use crate::cli::DirArgs;
use crate::config_loader::SharedDirProvider;
use crate::host::HostFrontend;
use anyhow::Result;
use clap::Args as ClapArgs;
use mf_config::rules::{RULES_JSON_FILE, RULES_TEXT_FILE};
use mf_config::RoutingMode;
use mf_core::{
    PreflightConfig, ProcessEngineConfig, ProcessEngineFactory, RuleChangeWatcher, Supervisor,
    WatchConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub dir: DirArgs,
    /// Engine binary, started as `<engine> run -c <config>`
    #[arg(long, env = "MF_ENGINE", default_value = "sing-box")]
    pub engine: PathBuf,
    /// Engine working directory (default: <dir>/engine)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
    #[arg(long)]
    pub profile: Option<String>,
    #[arg(long, value_parser = clap::value_parser!(RoutingMode))]
    pub mode: Option<RoutingMode>,
    /// Do not watch rule files
    #[arg(long)]
    pub no_watch: bool,
    /// Serve host messages on stdin, replies on stdout
    #[arg(long)]
    pub host_stdin: bool,
    #[arg(long, default_value_t = 500)]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunSignal {
    Reload,
    Terminate,
}

#[cfg(unix)]
struct Signals {
    term: Option<tokio::signal::unix::Signal>,
    hup: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        let term = signal(SignalKind::terminate())
            .map_err(|e| warn!(error = %e, "install signal handler failed: SIGTERM"))
            .ok();
        let hup = signal(SignalKind::hangup())
            .map_err(|e| warn!(error = %e, "install signal handler failed: SIGHUP"))
            .ok();
        Self { term, hup }
    }

    async fn next(&mut self) -> RunSignal {
        async fn recv(sig: Option<&mut tokio::signal::unix::Signal>) {
            match sig {
                Some(sig) => {
                    sig.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => RunSignal::Terminate,
            () = recv(self.term.as_mut()) => RunSignal::Terminate,
            () = recv(self.hup.as_mut()) => RunSignal::Reload,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Self {
        Self
    }

    async fn next(&mut self) -> RunSignal {
        let _ = tokio::signal::ctrl_c().await;
        RunSignal::Terminate
    }
}

pub async fn run(args: RunArgs) -> Result<()> {
    let dir = args.dir.shared_dir();
    let work_dir = args
        .work_dir
        .clone()
        .unwrap_or_else(|| dir.root().join("engine"));
    std::fs::create_dir_all(&work_dir)?;

    let orchestrator = dir.orchestrator(args.mode, PreflightConfig::default());
    let provider = Arc::new(SharedDirProvider::new(
        dir.clone(),
        orchestrator,
        args.profile.clone(),
    ));
    let factory = Arc::new(ProcessEngineFactory::new(ProcessEngineConfig::new(
        &args.engine,
        &work_dir,
    )));
    let (supervisor, task) = Supervisor::spawn(provider, factory);

    // Install before starting so an early SIGHUP is not lost.
    let mut signals = Signals::install();

    if let Err(e) = supervisor.start().await {
        let _ = supervisor.shutdown().await;
        task.join().await;
        return Err(e.into());
    }
    info!(dir = %dir.root().display(), engine = %args.engine.display(), "meshflux running");

    let debounce = Duration::from_millis(args.debounce_ms);
    let _watcher = if args.no_watch {
        None
    } else {
        let sup = supervisor.clone();
        let config = WatchConfig {
            debounce,
            file_names: vec![RULES_JSON_FILE.to_string(), RULES_TEXT_FILE.to_string()],
        };
        match RuleChangeWatcher::start(dir.root(), config, move || {
            if let Err(e) = sup.request_reload("rules changed") {
                warn!(error = %e, "failed to queue reload");
            }
        }) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "rule watcher unavailable; hot reload disabled");
                None
            }
        }
    };

    let host = args.host_stdin.then(|| {
        let sup = supervisor.clone();
        let frontend = Arc::new(HostFrontend::new(dir.clone(), debounce, move || {
            if let Err(e) = sup.request_reload("host message") {
                warn!(error = %e, "failed to queue reload");
            }
        }));
        tokio::spawn(frontend.serve_stdin())
    });

    loop {
        match signals.next().await {
            RunSignal::Reload => {
                info!("SIGHUP received; reloading");
                if let Err(e) = supervisor.reload("signal").await {
                    warn!(error = %e, kind = %e.kind(), "reload failed; previous engine kept");
                }
            }
            RunSignal::Terminate => break,
        }
    }

    info!("shutting down");
    if let Some(host) = host {
        host.abort();
    }
    let result = supervisor.shutdown().await;
    task.join().await;
    result.map_err(Into::into)
}
