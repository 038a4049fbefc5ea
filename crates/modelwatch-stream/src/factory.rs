use std::sync::Arc;

use modelwatch_k8s::{ClusterApi, ResourceKind};
use modelwatch_types::WatchKey;

use crate::StreamConfig;
use crate::emitter::{EventSink, WatcherHandle};
use crate::poller::LogPoller;
use crate::watcher::{ResourceWatcher, WatchTarget};

/// Builds the emitter that serves a given key
#[derive(Clone)]
pub struct WatcherFactory {
    api: Arc<dyn ClusterApi>,
    isvc_kind: ResourceKind,
    config: StreamConfig,
}

impl WatcherFactory {
    pub fn new(api: Arc<dyn ClusterApi>, isvc_kind: ResourceKind, config: StreamConfig) -> Self {
        Self {
            api,
            isvc_kind,
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Spawn the watcher or poller for `key`; never awaits
    pub fn spawn(&self, key: &WatchKey, sink: EventSink) -> WatcherHandle {
        let api = Arc::clone(&self.api);
        match key {
            WatchKey::Collection { namespace } => {
                let watcher = ResourceWatcher::new(
                    api,
                    self.isvc_kind.clone(),
                    namespace,
                    WatchTarget::Collection,
                    &self.config,
                );
                WatcherHandle::spawn(key.clone(), watcher, sink)
            }
            WatchKey::Single { namespace, name } => {
                let watcher = ResourceWatcher::new(
                    api,
                    self.isvc_kind.clone(),
                    namespace,
                    WatchTarget::Single { name: name.clone() },
                    &self.config,
                );
                WatcherHandle::spawn(key.clone(), watcher, sink)
            }
            WatchKey::Events { namespace, name } => {
                let watcher = ResourceWatcher::new(
                    api,
                    ResourceKind::event(),
                    namespace,
                    WatchTarget::Events { name: name.clone() },
                    &self.config,
                );
                WatcherHandle::spawn(key.clone(), watcher, sink)
            }
            WatchKey::Logs {
                namespace,
                name,
                components,
            } => {
                let poller = LogPoller::new(
                    api,
                    self.isvc_kind.clone(),
                    namespace,
                    name,
                    components.clone(),
                    &self.config,
                );
                WatcherHandle::spawn(key.clone(), poller, sink)
            }
        }
    }
}

impl std::fmt::Debug for WatcherFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherFactory")
            .field("isvc_kind", &self.isvc_kind)
            .field("config", &self.config)
            .finish()
    }
}
