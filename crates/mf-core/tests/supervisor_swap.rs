// crates/mf-core/tests/supervisor_swap.rs
//! Serial reconfiguration: swap, rollback, sleep/wake.

use async_trait::async_trait;
use mf_config::SpliceReport;
use mf_core::{
    BuildReason, BuiltConfig, ConfigProvider, EngineStatus, Supervisor, SupervisorError,
};
use mf_test_utils::{EngineEvent, RecordingFactory};
use mf_types::{ErrorKind, OrchestratorError};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Numbers every build so tests can tell configs apart.
#[derive(Default)]
struct CountingProvider {
    builds: AtomicUsize,
    fail_next: AtomicBool,
    reasons: Mutex<Vec<BuildReason>>,
    applied: Mutex<Vec<String>>,
}

#[async_trait]
impl ConfigProvider for CountingProvider {
    async fn build(&self, reason: BuildReason) -> Result<BuiltConfig, OrchestratorError> {
        self.reasons.lock().push(reason);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(OrchestratorError::TemplateInvalid("broken".into()));
        }
        let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        let document = json!({"generation": n});
        Ok(BuiltConfig {
            content: document.to_string(),
            document,
            patches: Vec::new(),
            splice: SpliceReport::default(),
            preflight: Vec::new(),
        })
    }

    fn applied(&self, built: &BuiltConfig) {
        self.applied.lock().push(built.content.clone());
    }
}

fn generation(n: usize) -> String {
    json!({"generation": n}).to_string()
}

fn setup() -> (Supervisor, Arc<CountingProvider>, RecordingFactory) {
    let provider = Arc::new(CountingProvider::default());
    let factory = RecordingFactory::new();
    let (sup, _task) = Supervisor::spawn(provider.clone(), Arc::new(factory.clone()));
    (sup, provider, factory)
}

#[tokio::test]
async fn start_then_reload_swaps_instances_in_order() {
    let (sup, provider, factory) = setup();
    assert_eq!(sup.status(), EngineStatus::Stopped);

    sup.start().await.unwrap();
    assert_eq!(sup.status(), EngineStatus::Running);
    sup.reload("rules changed").await.unwrap();

    assert_eq!(
        *provider.reasons.lock(),
        vec![BuildReason::Start, BuildReason::Reload]
    );
    assert_eq!(
        factory.events(),
        vec![
            EngineEvent::Created { id: 1, config: generation(1) },
            EngineEvent::Started { id: 1 },
            EngineEvent::Closed { id: 1 },
            EngineEvent::Created { id: 2, config: generation(2) },
            EngineEvent::Started { id: 2 },
        ]
    );
    assert_eq!(*provider.applied.lock(), vec![generation(1), generation(2)]);
    assert_eq!(sup.status(), EngineStatus::Running);
}

#[tokio::test]
async fn failed_rebuild_keeps_running_instance() {
    let (sup, provider, factory) = setup();
    sup.start().await.unwrap();

    provider.fail_next.store(true, Ordering::SeqCst);
    let err = sup.reload("bad template").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplateInvalid);
    assert!(!factory
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::Closed { .. })));
    assert_eq!(sup.status(), EngineStatus::Running);
}

#[tokio::test]
async fn failed_start_of_new_config_restores_previous() {
    let (sup, _provider, factory) = setup();
    sup.start().await.unwrap();

    let rejected = generation(2);
    factory.fail_start_when(move |cfg| cfg == rejected);
    let err = sup.reload("engine rejects").await.unwrap_err();
    assert!(matches!(err, SupervisorError::Engine(_)));

    assert_eq!(factory.started_configs(), vec![generation(1), generation(1)]);
    assert_eq!(sup.status(), EngineStatus::Running);
}

#[tokio::test]
async fn reload_while_stopped_is_ignored() {
    let (sup, provider, factory) = setup();
    sup.reload("early edit").await.unwrap();
    assert!(provider.reasons.lock().is_empty());
    assert!(factory.events().is_empty());
}

#[tokio::test]
async fn sleep_and_wake_track_status() {
    let (sup, _provider, factory) = setup();
    let err = sup.sleep().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);

    sup.start().await.unwrap();
    let mut status = sup.subscribe_status();
    sup.sleep().await.unwrap();
    assert_eq!(*status.borrow_and_update(), EngineStatus::Paused);
    sup.wake().await.unwrap();
    assert_eq!(sup.status(), EngineStatus::Running);
    assert!(factory.events().contains(&EngineEvent::Paused { id: 1 }));
    assert!(factory.events().contains(&EngineEvent::Woken { id: 1 }));
}

#[tokio::test]
async fn shutdown_closes_engine_and_ends_queue() {
    let (sup, _provider, factory) = setup();
    sup.start().await.unwrap();
    sup.shutdown().await.unwrap();
    assert_eq!(sup.status(), EngineStatus::Stopped);
    assert_eq!(factory.events().last(), Some(&EngineEvent::Closed { id: 1 }));

    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Closed));
}

#[tokio::test]
async fn queued_reloads_run_one_at_a_time() {
    let (sup, provider, factory) = setup();
    sup.start().await.unwrap();
    sup.request_reload("watcher").unwrap();
    sup.request_reload("watcher").unwrap();
    // A synchronous call queues behind both and observes their effects.
    sup.reload("manual").await.unwrap();

    assert_eq!(provider.builds.load(Ordering::SeqCst), 4);
    let events = factory.events();
    let mut live = 0i32;
    for e in &events {
        match e {
            EngineEvent::Started { .. } => live += 1,
            EngineEvent::Closed { .. } => live -= 1,
            _ => {}
        }
        assert!(live <= 1, "two instances overlapped: {events:?}");
    }
}
