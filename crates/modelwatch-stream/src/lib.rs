//! Watch fan-out and event streaming for modelwatch
//!
//! Streaming connections register a bounded [`ClientChannel`] under a
//! [`WatchKey`] with the [`ConnectionRegistry`]. The registry starts the
//! emitter for that key (a list-then-watch [`ResourceWatcher`] or a
//! [`LogPoller`]) and routes its events back into the channels as
//! event-stream frames. The last channel to leave stops the emitter.

mod channel;
mod config;
mod emitter;
mod error;
mod factory;
pub mod frame;
mod poller;
mod registry;
mod session;
mod snapshot;
mod watcher;

pub use channel::{ChannelId, ChannelReceiver, ClientChannel, PushError, channel};
pub use config::{StreamConfig, WatchStrategy};
pub use emitter::{Emitter, EventSink, WatcherHandle, WatcherState};
pub use error::StreamError;
pub use factory::WatcherFactory;
pub use poller::LogPoller;
pub use registry::{ConnectionRegistry, EntryStats};
pub use session::Session;
pub use watcher::{ResourceWatcher, WatchTarget};

// Re-export types that are used in our public API
pub use modelwatch_types::{Event, EventType, WatchKey};
