//! Background producers and their lifecycle handles

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use modelwatch_types::{Event, WatchKey};

/// Where an emitter delivers its events
#[derive(Clone)]
pub struct EventSink {
    emit: Arc<dyn Fn(Event) + Send + Sync>,
}

impl EventSink {
    pub fn new(emit: impl Fn(Event) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: Event) {
        (self.emit)(event)
    }

    /// Sink that silently drops everything once `cancel` fires
    fn guarded(self, cancel: CancellationToken) -> Self {
        Self::new(move |event| {
            if !cancel.is_cancelled() {
                self.emit(event);
            }
        })
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

/// A long-running producer of events for one key.
///
/// Implementations must return promptly once `cancel` fires.
#[async_trait]
pub trait Emitter: Send + 'static {
    async fn run(self, sink: EventSink, cancel: CancellationToken);
}

/// Lifecycle of a spawned emitter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Owner-side handle of a spawned emitter.
///
/// Dropping the handle stops the emitter.
pub struct WatcherHandle {
    key: WatchKey,
    cancel: CancellationToken,
    state: Arc<watch::Sender<WatcherState>>,
}

impl WatcherHandle {
    /// Spawn `emitter` onto the runtime
    pub fn spawn<E: Emitter>(key: WatchKey, emitter: E, sink: EventSink) -> Self {
        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(WatcherState::Starting);
        let state = Arc::new(state);

        let sink = sink.guarded(cancel.clone());
        {
            let cancel = cancel.clone();
            let state = Arc::clone(&state);
            let key = key.clone();
            tokio::spawn(async move {
                state.send_if_modified(|s| {
                    if *s == WatcherState::Starting {
                        *s = WatcherState::Running;
                        true
                    } else {
                        false
                    }
                });
                debug!(%key, "Watcher started");
                emitter.run(sink, cancel).await;
                state.send_replace(WatcherState::Stopped);
                debug!(%key, "Watcher stopped");
            });
        }

        Self { key, cancel, state }
    }

    /// Request a cooperative stop; nothing new is emitted after this returns
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.state.send_if_modified(|s| {
            if *s == WatcherState::Stopped {
                false
            } else {
                *s = WatcherState::Stopping;
                true
            }
        });
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Resolves once the emitter task has returned
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx.wait_for(|s| *s == WatcherState::Stopped).await;
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
