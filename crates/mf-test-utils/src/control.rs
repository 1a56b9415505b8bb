//! In-memory control channel.
//! 内存控制通道
//!
//! Frames queued with [`MemoryChannel::push`] reach the open session in
//! order. Commands are recorded; an optional responder turns a command into
//! follow-up frames, the way an engine publishes URL test results.

use async_trait::async_trait;
use mf_core::control::{Command, CommandChannel, CommandSink, PushFrame};
use mf_types::ControlError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type Responder = Box<dyn Fn(&Command) -> Vec<PushFrame> + Send + Sync>;

#[derive(Default)]
struct Inner {
    commands: Mutex<Vec<Command>>,
    frames: Mutex<Option<mpsc::Sender<PushFrame>>>,
    initial: Mutex<Vec<PushFrame>>,
    responder: Mutex<Option<Responder>>,
    failing_opens: AtomicU32,
    opens: AtomicU32,
}

impl Inner {
    fn deliver(&self, frames: Vec<PushFrame>) {
        let Some(tx) = self.frames.lock().clone() else {
            return;
        };
        for frame in frames {
            let _ = tx.try_send(frame);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames every new session receives first.
    pub fn with_initial(self, frames: Vec<PushFrame>) -> Self {
        *self.inner.initial.lock() = frames;
        self
    }

    /// Produce frames in reaction to each command.
    pub fn with_responder(
        self,
        responder: impl Fn(&Command) -> Vec<PushFrame> + Send + Sync + 'static,
    ) -> Self {
        *self.inner.responder.lock() = Some(Box::new(responder));
        self
    }

    /// The next `n` opens fail with a connect error.
    pub fn fail_opens(self, n: u32) -> Self {
        self.inner.failing_opens.store(n, Ordering::SeqCst);
        self
    }

    /// Push a frame to the current session, if any.
    pub fn push(&self, frame: PushFrame) {
        self.inner.deliver(vec![frame]);
    }

    /// End the current session from the engine side.
    pub fn disconnect(&self) {
        self.inner.frames.lock().take();
    }

    pub fn commands(&self) -> Vec<Command> {
        self.inner.commands.lock().clone()
    }

    pub fn opens(&self) -> u32 {
        self.inner.opens.load(Ordering::SeqCst)
    }
}

struct MemorySink {
    inner: Arc<Inner>,
}

#[async_trait]
impl CommandSink for MemorySink {
    async fn send(&mut self, command: Command) -> Result<(), ControlError> {
        self.inner.commands.lock().push(command.clone());
        let frames = self
            .inner
            .responder
            .lock()
            .as_ref()
            .map(|r| r(&command))
            .unwrap_or_default();
        self.inner.deliver(frames);
        Ok(())
    }
}

#[async_trait]
impl CommandChannel for MemoryChannel {
    async fn open(&self) -> Result<(Box<dyn CommandSink>, mpsc::Receiver<PushFrame>), ControlError> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self.inner.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(ControlError::Connect("memory channel not ready".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        for frame in self.inner.initial.lock().iter().cloned() {
            let _ = tx.try_send(frame);
        }
        *self.inner.frames.lock() = Some(tx);
        Ok((
            Box::new(MemorySink {
                inner: Arc::clone(&self.inner),
            }),
            rx,
        ))
    }
}
