use std::time::Duration;

use bytes::Bytes;
use futures::Stream;

use modelwatch_types::WatchKey;

use crate::channel::{ChannelId, ChannelReceiver, channel};
use crate::factory::WatcherFactory;
use crate::registry::ConnectionRegistry;
use crate::StreamError;

/// One streaming connection: a registered channel plus its heartbeat clock.
///
/// Dropping the session unregisters its channel.
pub struct Session {
    registry: ConnectionRegistry,
    key: WatchKey,
    receiver: ChannelReceiver,
    heartbeat: Duration,
}

impl Session {
    /// Validate the request, then register a fresh channel for `key`.
    ///
    /// Nothing is registered when validation fails.
    pub fn open(
        registry: &ConnectionRegistry,
        factory: &WatcherFactory,
        key: WatchKey,
    ) -> Result<Self, StreamError> {
        let config = factory.config();
        if let WatchKey::Logs { components, .. } = &key {
            config.check_components(components)?;
        }

        let (tx, receiver) = channel(config.channel_capacity);
        registry.register_watch(key.clone(), tx, |sink| factory.spawn(&key, sink));

        Ok(Self {
            registry: registry.clone(),
            key,
            receiver,
            heartbeat: config.heartbeat,
        })
    }

    pub fn key(&self) -> &WatchKey {
        &self.key
    }

    pub fn id(&self) -> ChannelId {
        self.receiver.id()
    }

    /// Next frame to write, a heartbeat when idle, `None` once the
    /// registry has let go of the channel
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        self.receiver.next_frame(self.heartbeat).await
    }

    /// Frames as a stream; dropping the stream ends the session
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        futures::stream::unfold(self, |mut session| async move {
            let frame = session.next_frame().await?;
            Some((frame, session))
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.unregister_watch(&self.key, self.receiver.id());
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("channel", &self.receiver.id())
            .finish()
    }
}
