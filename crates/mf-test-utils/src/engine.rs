//! Engine factory that records lifecycle calls instead of running anything.

use async_trait::async_trait;
use mf_core::engine::{BoxService, EngineFactory};
use mf_types::EngineError;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Created { id: usize, config: String },
    Started { id: usize },
    Closed { id: usize },
    Paused { id: usize },
    Woken { id: usize },
}

type StartFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<EngineEvent>>,
    next_id: Mutex<usize>,
    fail_start: Mutex<Option<StartFilter>>,
}

#[derive(Clone, Default)]
pub struct RecordingFactory {
    shared: Arc<Shared>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `start` fail for every config the predicate matches.
    pub fn fail_start_when(&self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) {
        *self.shared.fail_start.lock() = Some(Box::new(predicate));
    }

    pub fn clear_failures(&self) {
        self.shared.fail_start.lock().take();
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.shared.events.lock().clone()
    }

    /// Configs of every instance that reached `Started`, in order.
    pub fn started_configs(&self) -> Vec<String> {
        let events = self.events();
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Started { id } => events.iter().find_map(|c| match c {
                    EngineEvent::Created { id: cid, config } if cid == id => Some(config.clone()),
                    _ => None,
                }),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: EngineEvent) {
        self.shared.events.lock().push(event);
    }
}

impl EngineFactory for RecordingFactory {
    fn create(&self, config: &str) -> Result<Box<dyn BoxService>, EngineError> {
        let id = {
            let mut next = self.shared.next_id.lock();
            *next += 1;
            *next
        };
        self.record(EngineEvent::Created {
            id,
            config: config.to_string(),
        });
        Ok(Box::new(RecordingEngine {
            id,
            config: config.to_string(),
            factory: self.clone(),
        }))
    }
}

struct RecordingEngine {
    id: usize,
    config: String,
    factory: RecordingFactory,
}

#[async_trait]
impl BoxService for RecordingEngine {
    async fn start(&mut self) -> Result<(), EngineError> {
        let fail = self
            .factory
            .shared
            .fail_start
            .lock()
            .as_ref()
            .is_some_and(|f| f(&self.config));
        if fail {
            return Err(EngineError::Start(format!("instance {} refused config", self.id)));
        }
        self.factory.record(EngineEvent::Started { id: self.id });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.factory.record(EngineEvent::Closed { id: self.id });
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), EngineError> {
        self.factory.record(EngineEvent::Paused { id: self.id });
        Ok(())
    }

    async fn wake(&mut self) -> Result<(), EngineError> {
        self.factory.record(EngineEvent::Woken { id: self.id });
        Ok(())
    }
}
