//! Rule file change watcher with debounce.
//! 规则文件变更监听（防抖）
//!
//! Filesystem events (write, delete, rename, attribute change) each reschedule
//! one pending callback; only the callback that survives the debounce window
//! fires. Failing to start the watcher is non-fatal for callers.

use mf_types::WatchError;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    pub debounce: Duration,
    /// Only events touching these file names count; empty means any file.
    pub file_names: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            file_names: Vec::new(),
        }
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Single-slot pending task: scheduling cancels whatever was pending.
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
    callback: Callback,
}

impl Debouncer {
    pub fn new(delay: Duration, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
            callback: Arc::new(callback),
        }
    }

    /// (Re)arm the timer. Must be called inside a tokio runtime.
    pub fn schedule(&self) {
        let callback = Arc::clone(&self.callback);
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        if let Some(previous) = self.pending.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(pending) = self.pending.lock().take() {
            pending.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Watches the rule source location until stopped or dropped.
pub struct RuleChangeWatcher {
    _watcher: RecommendedWatcher,
    dispatch: JoinHandle<()>,
    debouncer: Arc<Debouncer>,
}

impl RuleChangeWatcher {
    /// Start watching `location` (a directory, or a file whose parent is watched).
    ///
    /// # Errors
    /// [`WatchError::Unavailable`] when the location does not exist or the
    /// platform watcher cannot be created.
    pub fn start(
        location: &Path,
        config: WatchConfig,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, WatchError> {
        let (dir, mut names) = if location.is_dir() {
            (location.to_path_buf(), Vec::new())
        } else {
            let parent = location
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            (parent, location.file_name().map(OsString::from).into_iter().collect())
        };
        names.extend(config.file_names.iter().map(OsString::from));

        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let filter = names.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) if counts_as_change(&event.kind) => {
                    for path in event.paths {
                        if filter.is_empty()
                            || path.file_name().is_some_and(|n| filter.iter().any(|f| f == n))
                        {
                            let _ = tx.send(path);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "rule watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| WatchError::Unavailable(format!("create watcher: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::Unavailable(format!("watch {}: {e}", dir.display())))?;

        let debouncer = Arc::new(Debouncer::new(config.debounce, on_change));
        let dispatch_debouncer = Arc::clone(&debouncer);
        let dispatch = tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                tracing::debug!(path = %path.display(), "rule source changed");
                dispatch_debouncer.schedule();
            }
        });

        tracing::info!(dir = %dir.display(), debounce_ms = config.debounce.as_millis() as u64, "rule watcher started");
        Ok(Self {
            _watcher: watcher,
            dispatch,
            debouncer,
        })
    }

    /// Stop watching and drop any pending callback.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for RuleChangeWatcher {
    fn drop(&mut self) {
        self.dispatch.abort();
        self.debouncer.cancel();
    }
}

fn counts_as_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
