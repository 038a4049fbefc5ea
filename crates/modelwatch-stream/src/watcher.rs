//! List-then-watch emitter for InferenceServices and their events

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use modelwatch_k8s::{ApiError, ClusterApi, ListSelector, ResourceKind, WatchNotification, isvc};
use modelwatch_types::{Event, EventType, resource_version};

use crate::StreamConfig;
use crate::emitter::{Emitter, EventSink};
use crate::error::error_message;

/// What a [`ResourceWatcher`] lists and watches within its namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchTarget {
    /// Every object of the kind
    Collection,
    /// One object by name
    Single { name: String },
    /// Cluster events whose involved object is the named InferenceService
    Events { name: String },
}

#[derive(Debug)]
enum Phase {
    FetchingInitial,
    Streaming { cursor: String },
    RetryBackoff,
}

/// How one watch call ended
#[derive(Debug)]
enum StreamEnd {
    /// Server-side timeout; resume from the last seen cursor
    TimedOut { cursor: String },
    /// The cursor is no longer retained upstream; relist
    Expired(String),
    Failed(ApiError),
    Cancelled,
}

/// Emitter implementing list-then-watch with timeout resume and error backoff.
///
/// Phases: `FetchingInitial -> Streaming -> RetryBackoff -> FetchingInitial`.
/// A natural end of the watch call re-opens it from the last cursor without
/// another INITIAL; a failure reports ERROR and resyncs after the backoff.
pub struct ResourceWatcher {
    api: Arc<dyn ClusterApi>,
    kind: ResourceKind,
    namespace: String,
    target: WatchTarget,
    watch_timeout_secs: u32,
    watch_deadline: Duration,
    request_timeout: Duration,
    retry_backoff: Duration,
}

impl ResourceWatcher {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        kind: ResourceKind,
        namespace: impl Into<String>,
        target: WatchTarget,
        config: &StreamConfig,
    ) -> Self {
        Self {
            api,
            kind,
            namespace: namespace.into(),
            target,
            watch_timeout_secs: config.watch_timeout_secs(),
            watch_deadline: config.watch_deadline(),
            request_timeout: config.request_timeout,
            retry_backoff: config.retry_backoff,
        }
    }

    fn selector(&self) -> ListSelector {
        match &self.target {
            WatchTarget::Collection => ListSelector::none(),
            WatchTarget::Single { name } => ListSelector::by_name(name),
            WatchTarget::Events { name } => ListSelector::involving("InferenceService", name),
        }
    }

    /// Attach computed fields to InferenceService objects
    fn decorate(&self, obj: Value) -> Value {
        match self.target {
            WatchTarget::Events { .. } => obj,
            _ => isvc::with_deployment_mode(obj),
        }
    }

    /// One list (or get); returns the INITIAL event and the cursor to watch from
    async fn fetch_initial(&self) -> Result<(Event, String), ApiError> {
        tokio::time::timeout(self.request_timeout, self.fetch_initial_unbounded())
            .await
            .map_err(|_| ApiError::TimedOut(self.request_timeout))?
    }

    async fn fetch_initial_unbounded(&self) -> Result<(Event, String), ApiError> {
        match &self.target {
            WatchTarget::Single { name } => {
                let obj = self.api.get(&self.kind, &self.namespace, name).await?;
                let cursor = resource_version(&obj).unwrap_or("0").to_string();
                let obj = self.decorate(obj);
                Ok((Event::initial_object(obj, Some(cursor.clone())), cursor))
            }
            WatchTarget::Collection | WatchTarget::Events { .. } => {
                let list = self
                    .api
                    .list(&self.kind, &self.namespace, &self.selector())
                    .await?;
                let cursor = list.cursor.clone().unwrap_or_else(|| "0".to_string());
                let items = list.items.into_iter().map(|o| self.decorate(o)).collect();
                Ok((Event::initial_items(items, list.cursor), cursor))
            }
        }
    }

    /// Run one watch call from `cursor`, emitting every change
    async fn stream(&self, sink: &EventSink, cancel: &CancellationToken, mut cursor: String) -> StreamEnd {
        debug!(
            kind = %self.kind.kind,
            namespace = %self.namespace,
            %cursor,
            "Opening watch"
        );

        let selector = self.selector();
        let deadline = tokio::time::sleep(self.watch_deadline);
        tokio::pin!(deadline);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            _ = &mut deadline => return self.overdue(cursor),
            opened = self.api.watch(
                &self.kind,
                &self.namespace,
                &selector,
                &cursor,
                self.watch_timeout_secs,
            ) => opened,
        };
        let mut changes = match opened {
            Ok(changes) => changes,
            Err(ApiError::Expired(msg)) => return StreamEnd::Expired(msg),
            Err(err) => return StreamEnd::Failed(err),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                _ = &mut deadline => return self.overdue(cursor),
                next = changes.next() => next,
            };

            let (event_type, obj) = match next {
                None => return StreamEnd::TimedOut { cursor },
                Some(Err(ApiError::Expired(msg))) => return StreamEnd::Expired(msg),
                Some(Err(err)) => return StreamEnd::Failed(err),
                Some(Ok(WatchNotification::Bookmark(newer))) => {
                    cursor = newer;
                    continue;
                }
                Some(Ok(WatchNotification::Added(obj))) => (EventType::Added, obj),
                Some(Ok(WatchNotification::Modified(obj))) => (EventType::Modified, obj),
                Some(Ok(WatchNotification::Deleted(obj))) => (EventType::Deleted, obj),
            };

            if let Some(rv) = resource_version(&obj) {
                cursor = rv.to_string();
            }
            sink.emit(Event::change(event_type, self.decorate(obj)));
        }
    }

    /// The server kept a watch open past its timeout; resume like a normal end
    fn overdue(&self, cursor: String) -> StreamEnd {
        debug!(
            kind = %self.kind.kind,
            namespace = %self.namespace,
            deadline = ?self.watch_deadline,
            "Watch outlived its deadline, reopening"
        );
        StreamEnd::TimedOut { cursor }
    }
}

#[async_trait]
impl Emitter for ResourceWatcher {
    async fn run(self, sink: EventSink, cancel: CancellationToken) {
        info!(
            kind = %self.kind.kind,
            namespace = %self.namespace,
            target = ?self.target,
            "Starting resource watch"
        );

        let mut phase = Phase::FetchingInitial;
        loop {
            phase = match phase {
                Phase::FetchingInitial => {
                    let fetched = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        fetched = self.fetch_initial() => fetched,
                    };
                    match fetched {
                        Ok((initial, cursor)) => {
                            sink.emit(initial);
                            Phase::Streaming { cursor }
                        }
                        Err(err) => {
                            warn!(
                                kind = %self.kind.kind,
                                namespace = %self.namespace,
                                error = %err,
                                "Initial fetch failed, retrying"
                            );
                            sink.emit(Event::error(error_message(&err)));
                            Phase::RetryBackoff
                        }
                    }
                }
                Phase::Streaming { cursor } => match self.stream(&sink, &cancel, cursor).await {
                    StreamEnd::TimedOut { cursor } => Phase::Streaming { cursor },
                    StreamEnd::Expired(msg) => {
                        info!(namespace = %self.namespace, reason = %msg, "Watch cursor expired, relisting");
                        Phase::FetchingInitial
                    }
                    StreamEnd::Failed(err) => {
                        warn!(
                            kind = %self.kind.kind,
                            namespace = %self.namespace,
                            error = %err,
                            "Watch failed, retrying"
                        );
                        sink.emit(Event::error(error_message(&err)));
                        Phase::RetryBackoff
                    }
                    StreamEnd::Cancelled => break,
                },
                Phase::RetryBackoff => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_backoff) => Phase::FetchingInitial,
                    }
                }
            };
        }

        info!(kind = %self.kind.kind, namespace = %self.namespace, "Resource watch stopped");
    }
}
