//! Connection registry: which channels watch which key, and who feeds them
//!
//! A key has an entry exactly while at least one channel is registered for
//! it, and an entry always owns at least one running watcher. All map
//! mutations happen under one mutex; frames are pushed and watchers are
//! stopped after it is released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use modelwatch_types::{Event, EventType, WatchKey};

use crate::channel::{ChannelId, ClientChannel};
use crate::config::WatchStrategy;
use crate::emitter::{EventSink, WatcherHandle};
use crate::frame;
use crate::snapshot::Snapshot;

/// Which channels of an entry an event is meant for
#[derive(Clone, Copy, Debug)]
enum Route {
    /// Every channel of the key
    All,
    /// Every channel, but only while the entry is the one the watcher was
    /// started for
    Shared { generation: u64 },
    /// The one channel a dedicated watcher serves
    Channel(ChannelId),
}

enum Watchers {
    Dedicated(HashMap<ChannelId, WatcherHandle>),
    Shared {
        handle: WatcherHandle,
        snapshot: Snapshot,
    },
}

struct RegistryEntry {
    generation: u64,
    channels: HashMap<ChannelId, ClientChannel>,
    /// Channels that have not yet been sent a full snapshot
    awaiting_initial: HashSet<ChannelId>,
    watchers: Watchers,
}

impl RegistryEntry {
    fn watcher_count(&self) -> usize {
        match &self.watchers {
            Watchers::Dedicated(handles) => handles.len(),
            Watchers::Shared { .. } => 1,
        }
    }

    /// Remove a channel, returning the watcher that only served it
    fn detach(&mut self, id: ChannelId) -> Option<WatcherHandle> {
        self.channels.remove(&id)?;
        self.awaiting_initial.remove(&id);
        match &mut self.watchers {
            Watchers::Dedicated(handles) => handles.remove(&id),
            Watchers::Shared { .. } => None,
        }
    }

    fn into_watchers(self) -> Vec<WatcherHandle> {
        match self.watchers {
            Watchers::Dedicated(handles) => handles.into_values().collect(),
            Watchers::Shared { handle, .. } => vec![handle],
        }
    }

    fn replay_frame(&self) -> Option<Bytes> {
        let Watchers::Shared { snapshot, .. } = &self.watchers else {
            return None;
        };
        let event = snapshot.replay()?;
        match frame::encode(&event) {
            Ok(frame) => Some(frame),
            Err(err) => {
                error!(error = %err, "Failed to serialize snapshot replay");
                None
            }
        }
    }

    /// Decide which channels get which frame, updating the snapshot and
    /// the set of channels still waiting for a full snapshot.
    fn route(&mut self, route: Route, event: &Event, frame: &Bytes) -> Vec<(ClientChannel, Bytes)> {
        let is_change = event.event_type.is_change();
        let completes_sync = matches!(event.event_type, EventType::Initial | EventType::Update);

        let ids: Vec<ChannelId> = match route {
            Route::Channel(id) if self.channels.contains_key(&id) => vec![id],
            Route::Channel(_) => return Vec::new(),
            Route::Shared { generation } if generation != self.generation => return Vec::new(),
            Route::Shared { .. } | Route::All => {
                if let Watchers::Shared { snapshot, .. } = &mut self.watchers {
                    snapshot.apply(event);
                }
                self.channels.keys().copied().collect()
            }
        };

        let replay = if is_change && ids.iter().any(|id| self.awaiting_initial.contains(id)) {
            self.replay_frame()
        } else {
            None
        };

        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(channel) = self.channels.get(&id) else {
                continue;
            };
            if is_change && self.awaiting_initial.contains(&id) {
                // a late joiner gets the current state instead of a delta
                if let Some(replay) = &replay {
                    targets.push((channel.clone(), replay.clone()));
                    self.awaiting_initial.remove(&id);
                }
                continue;
            }
            if completes_sync {
                self.awaiting_initial.remove(&id);
            }
            targets.push((channel.clone(), frame.clone()));
        }
        targets
    }
}

/// Per-key counters reported by [`ConnectionRegistry::stats`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryStats {
    pub key: WatchKey,
    pub channels: usize,
    pub watchers: usize,
}

struct Inner {
    strategy: WatchStrategy,
    entries: Mutex<HashMap<WatchKey, RegistryEntry>>,
    next_generation: AtomicU64,
}

impl Inner {
    fn deliver(&self, key: &WatchKey, route: Route, event: Event) {
        let frame = match frame::encode(&event) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%key, event_type = event.event_type.as_str(), error = %err, "Failed to serialize event");
                return;
            }
        };

        let targets = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.route(route, &event, &frame)
        };

        let mut dead = Vec::new();
        for (channel, frame) in targets {
            if let Err(reason) = channel.try_push(frame) {
                warn!(
                    %key,
                    channel = %channel.id(),
                    event_type = event.event_type.as_str(),
                    ?reason,
                    "Dropping message and evicting channel"
                );
                dead.push(channel.id());
            }
        }

        if !dead.is_empty() {
            self.evict(key, &dead);
        }
    }

    fn evict(&self, key: &WatchKey, dead: &[ChannelId]) {
        let stopped = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            let mut stopped: Vec<WatcherHandle> =
                dead.iter().filter_map(|id| entry.detach(*id)).collect();
            if entry.channels.is_empty() {
                stopped.extend(Self::teardown(&mut entries, key));
            }
            stopped
        };
        stop_all(stopped);
    }

    fn teardown(entries: &mut HashMap<WatchKey, RegistryEntry>, key: &WatchKey) -> Vec<WatcherHandle> {
        match entries.remove(key) {
            Some(entry) => {
                info!(%key, "Removing watch entry");
                entry.into_watchers()
            }
            None => Vec::new(),
        }
    }

    fn sink(self: &Arc<Self>, key: WatchKey, route: Route) -> EventSink {
        let inner: Weak<Self> = Arc::downgrade(self);
        EventSink::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                inner.deliver(&key, route, event);
            }
        })
    }
}

fn stop_all(handles: Vec<WatcherHandle>) {
    for handle in handles {
        handle.stop();
    }
}

/// Tracks, per [`WatchKey`], the registered client channels and the
/// watchers serving them.
///
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(strategy: WatchStrategy) -> Self {
        Self {
            inner: Arc::new(Inner {
                strategy,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Add `channel` to the entry for `key`, starting a watcher when the
    /// strategy calls for one.
    ///
    /// `factory` runs under the registry lock and must only schedule work;
    /// the sink it receives routes events back through the registry.
    pub fn register_watch<F>(&self, key: WatchKey, channel: ClientChannel, factory: F)
    where
        F: FnOnce(EventSink) -> WatcherHandle,
    {
        let id = channel.id();
        let mut entries = self.inner.entries.lock();

        if let Some(entry) = entries.get_mut(&key) {
            if let Watchers::Dedicated(handles) = &mut entry.watchers {
                let handle = factory(self.inner.sink(key.clone(), Route::Channel(id)));
                handles.insert(id, handle);
                entry.awaiting_initial.insert(id);
            } else {
                let replayed = entry
                    .replay_frame()
                    .is_some_and(|replay| channel.try_push(replay).is_ok());
                if !replayed {
                    entry.awaiting_initial.insert(id);
                }
            }
            entry.channels.insert(id, channel);
            info!(%key, channel = %id, channels = entry.channels.len(), "Channel joined watch");
            return;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let watchers = match self.inner.strategy {
            WatchStrategy::Dedicated => {
                let handle = factory(self.inner.sink(key.clone(), Route::Channel(id)));
                Watchers::Dedicated(HashMap::from([(id, handle)]))
            }
            WatchStrategy::Shared => Watchers::Shared {
                handle: factory(self.inner.sink(key.clone(), Route::Shared { generation })),
                snapshot: Snapshot::for_key(&key),
            },
        };

        info!(%key, channel = %id, strategy = %self.inner.strategy, "Creating watch entry");
        entries.insert(
            key,
            RegistryEntry {
                generation,
                channels: HashMap::from([(id, channel)]),
                awaiting_initial: HashSet::from([id]),
                watchers,
            },
        );
    }

    /// Remove a channel; the last channel out tears the entry down.
    ///
    /// Unknown keys and channels are ignored.
    pub fn unregister_watch(&self, key: &WatchKey, channel: ChannelId) {
        let stopped = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            if !entry.channels.contains_key(&channel) {
                return;
            }
            let mut stopped: Vec<WatcherHandle> = entry.detach(channel).into_iter().collect();
            info!(%key, %channel, channels = entry.channels.len(), "Channel left watch");
            if entry.channels.is_empty() {
                stopped.extend(Inner::teardown(&mut entries, key));
            }
            stopped
        };
        stop_all(stopped);
    }

    /// Serialize `event` once and push it to every channel of `key`.
    ///
    /// Channels that are full or closed are evicted. A key without
    /// channels is a no-op.
    pub fn broadcast(&self, key: &WatchKey, event: &Event) {
        self.inner.deliver(key, Route::All, event.clone());
    }

    pub fn contains(&self, key: &WatchKey) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn channel_count(&self, key: &WatchKey) -> usize {
        self.inner
            .entries
            .lock()
            .get(key)
            .map_or(0, |entry| entry.channels.len())
    }

    pub fn watcher_count(&self, key: &WatchKey) -> usize {
        self.inner
            .entries
            .lock()
            .get(key)
            .map_or(0, RegistryEntry::watcher_count)
    }

    pub fn stats(&self) -> Vec<EntryStats> {
        let mut stats: Vec<EntryStats> = self
            .inner
            .entries
            .lock()
            .iter()
            .map(|(key, entry)| EntryStats {
                key: key.clone(),
                channels: entry.channels.len(),
                watchers: entry.watcher_count(),
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Drop every entry, closing all channels and stopping all watchers
    pub fn shutdown(&self) {
        let entries: Vec<RegistryEntry> = self.inner.entries.lock().drain().map(|(_, e)| e).collect();
        if entries.is_empty() {
            return;
        }
        info!(entries = entries.len(), "Shutting down connection registry");
        stop_all(entries.into_iter().flat_map(RegistryEntry::into_watchers).collect());
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("strategy", &self.inner.strategy)
            .field("entries", &self.inner.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelReceiver, channel};
    use crate::emitter::Emitter;
    use async_trait::async_trait;
    use modelwatch_types::Payload;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Emitter forwarding whatever the test sends it
    struct Relay(mpsc::UnboundedReceiver<Event>);

    #[async_trait]
    impl Emitter for Relay {
        async fn run(mut self, sink: EventSink, cancel: CancellationToken) {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = self.0.recv() => match event {
                        Some(event) => sink.emit(event),
                        None => cancel.cancelled().await,
                    },
                }
            }
        }
    }

    struct Spawned {
        events: mpsc::UnboundedSender<Event>,
        stopped: std::pin::Pin<Box<dyn Future<Output = ()> + Send>>,
    }

    /// Factory spawning a relay; the test keeps the feeding end
    fn relay(key: &WatchKey, spawned: &mut Vec<Spawned>) -> impl FnOnce(EventSink) -> WatcherHandle {
        let key = key.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        move |sink| {
            let handle = WatcherHandle::spawn(key, Relay(rx), sink);
            spawned.push(Spawned {
                events: tx,
                stopped: Box::pin(handle.stopped()),
            });
            handle
        }
    }

    fn obj(name: &str, rv: &str) -> Value {
        json!({"metadata": {"name": name, "namespace": "ns", "resourceVersion": rv}})
    }

    fn decode(frame: &Bytes) -> Event {
        let text = std::str::from_utf8(frame).unwrap();
        let json = text.strip_prefix("data: ").unwrap().trim_end();
        serde_json::from_str(json).unwrap()
    }

    fn drain(rx: &mut ChannelReceiver) -> Vec<Event> {
        std::iter::from_fn(|| rx.try_recv()).map(|f| decode(&f)).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchers_exist_iff_channels_registered() {
        let registry = ConnectionRegistry::new(WatchStrategy::Dedicated);
        let key = WatchKey::collection("ns");
        let mut spawned = Vec::new();

        let (a, _rx_a) = channel(8);
        let (b, _rx_b) = channel(8);
        let (a_id, b_id) = (a.id(), b.id());
        registry.register_watch(key.clone(), a, relay(&key, &mut spawned));
        registry.register_watch(key.clone(), b, relay(&key, &mut spawned));
        assert_eq!(registry.channel_count(&key), 2);
        assert_eq!(registry.watcher_count(&key), 2);

        registry.unregister_watch(&key, a_id);
        assert!(registry.contains(&key));
        assert_eq!(registry.watcher_count(&key), 1);
        let first = spawned.remove(0);
        first.stopped.await;

        registry.unregister_watch(&key, b_id);
        assert!(!registry.contains(&key));
        assert!(registry.stats().is_empty());
        spawned.remove(0).stopped.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_watcher_outlives_all_but_last_channel() {
        let registry = ConnectionRegistry::new(WatchStrategy::Shared);
        let key = WatchKey::collection("ns");
        let mut spawned = Vec::new();

        let (a, _rx_a) = channel(8);
        let (b, _rx_b) = channel(8);
        let (a_id, b_id) = (a.id(), b.id());
        registry.register_watch(key.clone(), a, relay(&key, &mut spawned));
        registry.register_watch(key.clone(), b, relay(&key, &mut spawned));
        assert_eq!(spawned.len(), 1);
        assert_eq!(
            registry.stats(),
            vec![EntryStats {
                key: key.clone(),
                channels: 2,
                watchers: 1
            }]
        );

        registry.unregister_watch(&key, a_id);
        settle().await;
        assert!(!spawned[0].events.is_closed());

        registry.unregister_watch(&key, b_id);
        assert!(!registry.contains(&key));
        spawned.remove(0).stopped.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedicated_watchers_feed_only_their_channel() {
        let registry = ConnectionRegistry::new(WatchStrategy::Dedicated);
        let key = WatchKey::collection("ns");
        let mut spawned = Vec::new();

        let (a, mut rx_a) = channel(8);
        let (b, mut rx_b) = channel(8);
        registry.register_watch(key.clone(), a, relay(&key, &mut spawned));
        registry.register_watch(key.clone(), b, relay(&key, &mut spawned));

        spawned[0].events.send(Event::initial_items(vec![], None)).unwrap();
        spawned[0].events.send(Event::change(EventType::Added, obj("x", "5"))).unwrap();
        settle().await;

        let types: Vec<_> = drain(&mut rx_a).into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::Initial, EventType::Added]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_without_channels_is_noop() {
        let registry = ConnectionRegistry::new(WatchStrategy::Dedicated);
        registry.broadcast(&WatchKey::collection("nobody"), &Event::error("ignored"));
        assert!(registry.stats().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_one_delivers_one_and_drops_one() {
        let registry = ConnectionRegistry::new(WatchStrategy::Dedicated);
        let key = WatchKey::collection("ns");
        let mut spawned = Vec::new();

        let (tx, mut rx) = channel(1);
        registry.register_watch(key.clone(), tx, relay(&key, &mut spawned));

        registry.broadcast(&key, &Event::initial_items(vec![], Some("1".to_string())));
        registry.broadcast(&key, &Event::initial_items(vec![], Some("2".to_string())));

        let delivered = drain(&mut rx);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].cursor.as_deref(), Some("1"));

        // the overflowing channel was evicted, which ends its stream
        assert!(!registry.contains(&key));
        assert_eq!(rx.recv().await, None);
        spawned.remove(0).stopped.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_unregister_is_noop() {
        let registry = ConnectionRegistry::new(WatchStrategy::Dedicated);
        let key = WatchKey::single("ns", "flowers");
        let mut spawned = Vec::new();

        let (a, _rx_a) = channel(8);
        let (b, _rx_b) = channel(8);
        let a_id = a.id();
        registry.register_watch(key.clone(), a, relay(&key, &mut spawned));
        registry.register_watch(key.clone(), b, relay(&key, &mut spawned));

        registry.unregister_watch(&key, a_id);
        registry.unregister_watch(&key, a_id);
        assert_eq!(registry.channel_count(&key), 1);
        assert_eq!(registry.watcher_count(&key), 1);

        registry.unregister_watch(&WatchKey::collection("elsewhere"), a_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_before_initial_is_withheld() {
        let registry = ConnectionRegistry::new(WatchStrategy::Dedicated);
        let key = WatchKey::collection("ns");
        let mut spawned = Vec::new();

        let (tx, mut rx) = channel(8);
        registry.register_watch(key.clone(), tx, relay(&key, &mut spawned));

        registry.broadcast(&key, &Event::change(EventType::Added, obj("x", "5")));
        registry.broadcast(&key, &Event::error("transient"));
        registry.broadcast(&key, &Event::initial_items(vec![obj("x", "5")], Some("5".to_string())));
        registry.broadcast(&key, &Event::change(EventType::Modified, obj("x", "6")));

        let types: Vec<_> = drain(&mut rx).into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::Error, EventType::Initial, EventType::Modified]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_late_joiner_gets_snapshot_first() {
        let registry = ConnectionRegistry::new(WatchStrategy::Shared);
        let key = WatchKey::collection("ns");
        let mut spawned = Vec::new();

        let (a, mut rx_a) = channel(8);
        registry.register_watch(key.clone(), a, relay(&key, &mut spawned));
        let feed = spawned[0].events.clone();
        feed.send(Event::initial_items(vec![obj("x", "1")], Some("1".to_string()))).unwrap();
        feed.send(Event::change(EventType::Added, obj("y", "2"))).unwrap();
        settle().await;

        let (b, mut rx_b) = channel(8);
        registry.register_watch(key.clone(), b, relay(&key, &mut spawned));
        assert_eq!(spawned.len(), 1);

        feed.send(Event::change(EventType::Modified, obj("x", "3"))).unwrap();
        settle().await;

        let a_types: Vec<_> = drain(&mut rx_a).into_iter().map(|e| e.event_type).collect();
        assert_eq!(a_types, vec![EventType::Initial, EventType::Added, EventType::Modified]);

        let b_events = drain(&mut rx_b);
        assert_eq!(b_events.len(), 2);
        assert_eq!(b_events[0].event_type, EventType::Initial);
        assert_eq!(b_events[0].cursor.as_deref(), Some("2"));
        assert_eq!(
            b_events[0].payload,
            Payload::Items(vec![obj("x", "1"), obj("y", "2")])
        );
        assert_eq!(b_events[1].event_type, EventType::Modified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_joiner_waits_for_first_snapshot() {
        let registry = ConnectionRegistry::new(WatchStrategy::Shared);
        let key = WatchKey::collection("ns");
        let mut spawned = Vec::new();

        let (a, mut rx_a) = channel(8);
        let (b, mut rx_b) = channel(8);
        registry.register_watch(key.clone(), a, relay(&key, &mut spawned));
        registry.register_watch(key.clone(), b, relay(&key, &mut spawned));
        assert!(drain(&mut rx_b).is_empty());

        let feed = spawned[0].events.clone();
        feed.send(Event::initial_items(vec![], Some("1".to_string()))).unwrap();
        settle().await;

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b)[0].event_type, EventType::Initial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_shared_sink_cannot_reach_new_entry() {
        let registry = ConnectionRegistry::new(WatchStrategy::Shared);
        let key = WatchKey::collection("ns");

        let mut stale_sink = None;
        let (a, _rx_a) = channel(8);
        let a_id = a.id();
        let stale_key = key.clone();
        registry.register_watch(key.clone(), a, |sink| {
            stale_sink = Some(sink.clone());
            WatcherHandle::spawn(stale_key, Relay(mpsc::unbounded_channel().1), sink)
        });
        registry.unregister_watch(&key, a_id);

        let mut spawned = Vec::new();
        let (b, mut rx_b) = channel(8);
        registry.register_watch(key.clone(), b, relay(&key, &mut spawned));

        stale_sink
            .unwrap()
            .emit(Event::initial_items(vec![], Some("old".to_string())));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let registry = ConnectionRegistry::new(WatchStrategy::Dedicated);
        let mut spawned = Vec::new();
        let mut receivers = Vec::new();
        for key in [WatchKey::collection("a"), WatchKey::single("b", "flowers")] {
            let (tx, rx) = channel(8);
            registry.register_watch(key.clone(), tx, relay(&key, &mut spawned));
            receivers.push(rx);
        }
        let handle_states: Vec<_> = spawned.into_iter().map(|s| s.stopped).collect();

        registry.shutdown();
        assert!(registry.stats().is_empty());
        for mut rx in receivers {
            assert_eq!(rx.recv().await, None);
        }
        for stopped in handle_states {
            stopped.await;
        }
    }
}
