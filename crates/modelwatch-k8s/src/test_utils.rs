//! In-memory [`ClusterApi`] for tests.
//!
//! Objects written through [`FakeCluster::apply`] and [`FakeCluster::remove`]
//! are delivered to open watches whose kind, namespace and selector match.
//! Scripted watch sessions and injected failures let tests drive the
//! error paths deterministically.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use modelwatch_types::PodSummary;

use crate::{ApiError, ClusterApi, ListSelector, ObjectList, ResourceKind, WatchNotification, WatchStream};

/// One item of a scripted watch session
#[derive(Clone, Debug)]
pub enum ScriptedItem {
    Notify(WatchNotification),
    Fail { code: u16, message: String },
}

struct LiveWatch {
    plural: String,
    namespace: String,
    selector: ListSelector,
    tx: mpsc::UnboundedSender<Result<WatchNotification, ApiError>>,
}

#[derive(Default)]
struct State {
    /// (plural, namespace, name) -> object
    objects: BTreeMap<(String, String, String), Value>,
    pods: Vec<(String, PodSummary)>,
    logs: HashMap<(String, String), String>,
    scripted_watches: VecDeque<Vec<ScriptedItem>>,
    live_watches: Vec<LiveWatch>,
    failing_lists: usize,
    failing_gets: usize,
    failing_watch_opens: usize,
    failing_pod_lists: usize,
    stalling_lists: usize,
    stalled_pods: Vec<(String, String)>,
    watch_cursors: Vec<String>,
    log_tails: Vec<Option<i64>>,
}

/// Scripted, in-memory cluster
pub struct FakeCluster {
    state: Mutex<State>,
    revision: AtomicU64,
    lists: AtomicUsize,
    gets: AtomicUsize,
    pod_lists: AtomicUsize,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(code: u16) -> ApiError {
    ApiError::Status {
        code,
        message: "injected failure".to_string(),
    }
}

/// Field selectors of the form `a.b=value,c=value`
fn fields_match(obj: &Value, fields: &str) -> bool {
    fields.split(',').filter(|t| !t.is_empty()).all(|term| {
        let Some((path, expected)) = term.split_once('=') else {
            return false;
        };
        let pointer = format!("/{}", path.replace('.', "/"));
        obj.pointer(&pointer).and_then(Value::as_str) == Some(expected)
    })
}

/// Label selectors of the form `k=v,k2` (equality and existence only)
fn labels_match(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|t| !t.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

fn object_labels(obj: &Value) -> BTreeMap<String, String> {
    obj.pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn selector_matches(selector: &ListSelector, obj: &Value) -> bool {
    selector.fields.as_deref().is_none_or(|f| fields_match(obj, f))
        && selector
            .labels
            .as_deref()
            .is_none_or(|l| labels_match(&object_labels(obj), l))
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            revision: AtomicU64::new(100),
            lists: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            pod_lists: AtomicUsize::new(0),
        }
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn current_revision(&self) -> String {
        self.revision.load(Ordering::SeqCst).to_string()
    }

    /// Create or update an object, notifying matching live watches
    pub fn apply(&self, kind: &ResourceKind, namespace: &str, mut obj: Value) -> Value {
        let name = obj
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("namespace".to_string(), Value::String(namespace.to_string()));
            meta.insert(
                "resourceVersion".to_string(),
                Value::String(self.next_revision()),
            );
        }

        let mut state = self.state.lock();
        let key = (kind.plural.clone(), namespace.to_string(), name);
        let existed = state.objects.insert(key, obj.clone()).is_some();
        let notification = if existed {
            WatchNotification::Modified(obj.clone())
        } else {
            WatchNotification::Added(obj.clone())
        };
        Self::notify(&mut state, kind, namespace, &obj, notification);
        obj
    }

    /// Delete an object, notifying matching live watches
    pub fn remove(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        let mut state = self.state.lock();
        let key = (kind.plural.clone(), namespace.to_string(), name.to_string());
        let obj = state.objects.remove(&key)?;
        Self::notify(
            &mut state,
            kind,
            namespace,
            &obj,
            WatchNotification::Deleted(obj.clone()),
        );
        Some(obj)
    }

    fn notify(
        state: &mut State,
        kind: &ResourceKind,
        namespace: &str,
        obj: &Value,
        notification: WatchNotification,
    ) {
        state.live_watches.retain(|watch| {
            if watch.plural != kind.plural
                || watch.namespace != namespace
                || !selector_matches(&watch.selector, obj)
            {
                return !watch.tx.is_closed();
            }
            watch.tx.send(Ok(notification.clone())).is_ok()
        });
    }

    /// End every open live watch as if its server-side timeout expired
    pub fn expire_live_watches(&self) {
        self.state.lock().live_watches.clear();
    }

    /// Fail every open live watch with the given status
    pub fn break_live_watches(&self, code: u16, message: &str) {
        let mut state = self.state.lock();
        for watch in state.live_watches.drain(..) {
            let _ = watch.tx.send(Err(ApiError::from_status(code, message)));
        }
    }

    /// Queue a watch session; the next `watch` call replays it and then ends
    pub fn script_watch(&self, items: Vec<ScriptedItem>) {
        self.state.lock().scripted_watches.push_back(items);
    }

    pub fn fail_next_lists(&self, count: usize) {
        self.state.lock().failing_lists = count;
    }

    pub fn fail_next_gets(&self, count: usize) {
        self.state.lock().failing_gets = count;
    }

    pub fn fail_next_watch_opens(&self, count: usize) {
        self.state.lock().failing_watch_opens = count;
    }

    pub fn fail_next_pod_lists(&self, count: usize) {
        self.state.lock().failing_pod_lists = count;
    }

    /// The next `count` lists never answer
    pub fn stall_next_lists(&self, count: usize) {
        self.state.lock().stalling_lists = count;
    }

    /// Log reads for this pod never answer
    pub fn stall_pod_logs(&self, namespace: &str, pod: &str) {
        self.state
            .lock()
            .stalled_pods
            .push((namespace.to_string(), pod.to_string()));
    }

    pub fn add_pod(&self, namespace: &str, pod: PodSummary) {
        self.state.lock().pods.push((namespace.to_string(), pod));
    }

    pub fn set_logs(&self, namespace: &str, pod: &str, text: &str) {
        self.state
            .lock()
            .logs
            .insert((namespace.to_string(), pod.to_string()), text.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn pod_list_calls(&self) -> usize {
        self.pod_lists.load(Ordering::SeqCst)
    }

    /// `tail_lines` passed to `pod_logs`, in call order
    pub fn log_tails(&self) -> Vec<Option<i64>> {
        self.state.lock().log_tails.clone()
    }

    /// Cursors passed to `watch`, in call order
    pub fn watch_cursors(&self) -> Vec<String> {
        self.state.lock().watch_cursors.clone()
    }

    /// Live watches still held open by a consumer
    pub fn open_watches(&self) -> usize {
        let mut state = self.state.lock();
        state.live_watches.retain(|w| !w.tx.is_closed());
        state.live_watches.len()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<ObjectList, ApiError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let stalled = {
            let mut state = self.state.lock();
            let stalled = state.stalling_lists > 0;
            state.stalling_lists = state.stalling_lists.saturating_sub(1);
            stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(injected(500));
        }

        let items = state
            .objects
            .iter()
            .filter(|((plural, ns, _), obj)| {
                plural == &kind.plural && ns == namespace && selector_matches(selector, obj)
            })
            .map(|(_, obj)| obj.clone())
            .collect();

        Ok(ObjectList {
            items,
            cursor: Some(self.current_revision()),
        })
    }

    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, ApiError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(injected(500));
        }

        let key = (kind.plural.clone(), namespace.to_string(), name.to_string());
        state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                kind: kind.plural.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &ListSelector,
        from_cursor: &str,
        _timeout_secs: u32,
    ) -> Result<WatchStream, ApiError> {
        let mut state = self.state.lock();
        state.watch_cursors.push(from_cursor.to_string());
        if state.failing_watch_opens > 0 {
            state.failing_watch_opens -= 1;
            return Err(injected(503));
        }

        if let Some(script) = state.scripted_watches.pop_front() {
            let items = script.into_iter().map(|item| match item {
                ScriptedItem::Notify(n) => Ok(n),
                ScriptedItem::Fail { code, message } => Err(ApiError::from_status(code, message)),
            });
            return Ok(futures::stream::iter(items).boxed());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.live_watches.push(LiveWatch {
            plural: kind.plural.clone(),
            namespace: namespace.to_string(),
            selector: selector.clone(),
            tx,
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, ApiError> {
        self.pod_lists.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.failing_pod_lists > 0 {
            state.failing_pod_lists -= 1;
            return Err(injected(500));
        }

        Ok(state
            .pods
            .iter()
            .filter(|(ns, pod)| ns == namespace && labels_match(&pod.labels, label_selector))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
        tail_lines: Option<i64>,
    ) -> Result<String, ApiError> {
        let key = (namespace.to_string(), pod.to_string());
        let (stalled, text) = {
            let mut state = self.state.lock();
            state.log_tails.push(tail_lines);
            (state.stalled_pods.contains(&key), state.logs.get(&key).cloned())
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let text = text.ok_or_else(|| ApiError::NotFound {
            kind: "pod".to_string(),
            namespace: namespace.to_string(),
            name: pod.to_string(),
        })?;
        Ok(match tail_lines.and_then(|n| usize::try_from(n).ok()) {
            Some(n) => {
                let lines: Vec<&str> = text.lines().collect();
                lines[lines.len().saturating_sub(n)..].join("\n")
            }
            None => text,
        })
    }
}
