//! Periodic pod-log poller

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use modelwatch_k8s::{ApiError, ClusterApi, ResourceKind, pods};
use modelwatch_types::{ComponentLogs, Event, PodLogs};

use crate::StreamConfig;
use crate::emitter::{Emitter, EventSink};
use crate::error::error_message;

/// Emitter that re-reads component logs on a fixed period and publishes
/// them as a full-replacement UPDATE.
pub struct LogPoller {
    api: Arc<dyn ClusterApi>,
    isvc_kind: ResourceKind,
    namespace: String,
    name: String,
    components: Vec<String>,
    container: String,
    tail_lines: Option<i64>,
    interval: Duration,
    idle_interval: Duration,
    error_backoff: Duration,
    timeout: Duration,
}

impl LogPoller {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        isvc_kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        components: Vec<String>,
        config: &StreamConfig,
    ) -> Self {
        Self {
            api,
            isvc_kind,
            namespace: namespace.into(),
            name: name.into(),
            components,
            container: config.log_container.clone(),
            tail_lines: config.log_tail_lines,
            interval: config.log_poll_interval,
            idle_interval: config.log_idle_interval,
            error_backoff: config.log_error_backoff,
            timeout: config.request_timeout,
        }
    }

    /// One poll cycle, bounded by the request timeout
    async fn poll_once(&self) -> Result<ComponentLogs, ApiError> {
        tokio::time::timeout(self.timeout, self.read_logs())
            .await
            .map_err(|_| ApiError::TimedOut(self.timeout))?
    }

    /// Resolve pods per component and read their logs
    async fn read_logs(&self) -> Result<ComponentLogs, ApiError> {
        let isvc = self
            .api
            .get(&self.isvc_kind, &self.namespace, &self.name)
            .await?;
        let component_pods = pods::component_pods(self.api.as_ref(), &isvc, &self.components).await?;

        let mut logs = ComponentLogs::new();
        for (component, pod_names) in component_pods {
            let mut entries = Vec::with_capacity(pod_names.len());
            for pod in pod_names {
                let result = self
                    .api
                    .pod_logs(&self.namespace, &pod, &self.container, self.tail_lines)
                    .await;
                match result {
                    Ok(text) => entries.push(PodLogs::from_text(pod, &text)),
                    Err(err) => {
                        warn!(pod = %pod, namespace = %self.namespace, error = %err, "Failed to read pod logs");
                    }
                }
            }
            logs.insert(component, entries);
        }
        Ok(logs)
    }
}

#[async_trait]
impl Emitter for LogPoller {
    async fn run(self, sink: EventSink, cancel: CancellationToken) {
        info!(
            namespace = %self.namespace,
            name = %self.name,
            components = ?self.components,
            "Starting log poller"
        );

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.poll_once() => polled,
            };

            let wait = match polled {
                Ok(logs) => {
                    // nothing scheduled yet, check back less often
                    let wait = if logs.is_empty() {
                        self.idle_interval
                    } else {
                        self.interval
                    };
                    sink.emit(Event::update(logs));
                    wait
                }
                Err(err) => {
                    warn!(
                        namespace = %self.namespace,
                        name = %self.name,
                        error = %err,
                        "Log poll failed, backing off"
                    );
                    sink.emit(Event::error(error_message(&err)));
                    self.error_backoff
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(namespace = %self.namespace, name = %self.name, "Log poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::WatcherHandle;
    use crate::emitter::testing::collecting_sink;
    use modelwatch_k8s::pods::{COMPONENT_LABEL, RAW_ISVC_LABEL};
    use modelwatch_k8s::test_utils::FakeCluster;
    use modelwatch_types::{EventType, Payload, PodSummary, WatchKey};
    use serde_json::json;

    fn isvc_kind() -> ResourceKind {
        ResourceKind::inference_service("v1beta1")
    }

    fn types(events: &[Event]) -> Vec<EventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    fn raw_isvc(fake: &FakeCluster) {
        fake.apply(
            &isvc_kind(),
            "ns",
            json!({
                "metadata": {
                    "name": "flowers",
                    "annotations": {"serving.kserve.io/deploymentMode": "RawDeployment"}
                }
            }),
        );
    }

    fn predictor_pod(fake: &FakeCluster, name: &str) {
        fake.add_pod(
            "ns",
            PodSummary::new(name)
                .with_label(RAW_ISVC_LABEL, "flowers")
                .with_label(COMPONENT_LABEL, "predictor"),
        );
    }

    fn spawn(fake: &Arc<FakeCluster>, components: &[&str]) -> (WatcherHandle, Arc<parking_lot::Mutex<Vec<Event>>>) {
        spawn_with(fake, components, &StreamConfig::default())
    }

    fn spawn_with(
        fake: &Arc<FakeCluster>,
        components: &[&str],
        config: &StreamConfig,
    ) -> (WatcherHandle, Arc<parking_lot::Mutex<Vec<Event>>>) {
        let components: Vec<String> = components.iter().map(|c| c.to_string()).collect();
        let poller = LogPoller::new(
            fake.clone(),
            isvc_kind(),
            "ns",
            "flowers",
            components.clone(),
            config,
        );
        let (sink, events) = collecting_sink();
        let handle = WatcherHandle::spawn(WatchKey::logs("ns", "flowers", components), poller, sink);
        (handle, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_carries_logs_per_component() {
        let fake = Arc::new(FakeCluster::new());
        raw_isvc(&fake);
        predictor_pod(&fake, "flowers-predictor-1");
        predictor_pod(&fake, "flowers-predictor-2");
        fake.set_logs("ns", "flowers-predictor-1", "loading model\nready");

        let (handle, events) = spawn(&fake, &["predictor"]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Update);
        let Payload::Logs(logs) = &events[0].payload else {
            panic!("expected logs payload");
        };
        // the second pod has no logs and is skipped
        assert_eq!(
            logs["predictor"],
            vec![PodLogs::from_text("flowers-predictor-1", "loading model\nready")]
        );
        drop(events);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval() {
        let fake = Arc::new(FakeCluster::new());
        raw_isvc(&fake);
        predictor_pod(&fake, "flowers-predictor-1");
        fake.set_logs("ns", "flowers-predictor-1", "ready");

        let (handle, events) = spawn(&fake, &["predictor"]);
        tokio::time::sleep(Duration::from_millis(6100)).await;

        let events = events.lock();
        assert_eq!(types(&events), vec![EventType::Update; 3]);
        drop(events);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pods_polls_on_idle_interval() {
        let fake = Arc::new(FakeCluster::new());
        raw_isvc(&fake);

        let (handle, events) = spawn(&fake, &["predictor"]);
        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(events.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = events.lock();
        assert_eq!(types(&events), vec![EventType::Update; 2]);
        for event in events.iter() {
            assert_eq!(event.payload, Payload::Logs(ComponentLogs::new()));
        }
        drop(events);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_log_read_times_out_and_retries() {
        let fake = Arc::new(FakeCluster::new());
        raw_isvc(&fake);
        predictor_pod(&fake, "flowers-predictor-1");
        fake.stall_pod_logs("ns", "flowers-predictor-1");

        let (handle, events) = spawn(&fake, &["predictor"]);
        tokio::time::sleep(Duration::from_millis(9900)).await;
        assert!(events.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        {
            let events = events.lock();
            assert_eq!(types(&events), vec![EventType::Error]);
            assert_eq!(
                events[0].payload,
                Payload::Message("cluster api did not respond within 10s".to_string())
            );
        }

        // 5s backoff plus another 10s attempt
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(types(&events.lock()), vec![EventType::Error; 2]);
        assert_eq!(fake.pod_list_calls(), 2);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_only_log_tail() {
        let fake = Arc::new(FakeCluster::new());
        raw_isvc(&fake);
        predictor_pod(&fake, "flowers-predictor-1");
        fake.set_logs("ns", "flowers-predictor-1", "starting\nloading model\nready");

        let config = StreamConfig {
            log_tail_lines: Some(2),
            ..Default::default()
        };
        let (handle, events) = spawn_with(&fake, &["predictor"], &config);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = events.lock();
        let Payload::Logs(logs) = &events[0].payload else {
            panic!("expected logs payload");
        };
        assert_eq!(
            logs["predictor"],
            vec![PodLogs::from_text("flowers-predictor-1", "loading model\nready")]
        );
        assert_eq!(fake.log_tails(), vec![Some(2)]);
        drop(events);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_backs_off_then_recovers() {
        let fake = Arc::new(FakeCluster::new());
        raw_isvc(&fake);
        fake.fail_next_pod_lists(1);

        let (handle, events) = spawn(&fake, &["predictor"]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(events.lock()[0].event_type, EventType::Error);

        // still inside the error backoff
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(events.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let types: Vec<_> = events.lock().iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::Error, EventType::Update]);
        assert_eq!(fake.pod_list_calls(), 2);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_isvc_reports_not_found() {
        let fake = Arc::new(FakeCluster::new());
        let (handle, events) = spawn(&fake, &["predictor"]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = events.lock();
        let Payload::Message(message) = &events[0].payload else {
            panic!("expected message payload");
        };
        assert!(message.starts_with("Resource not found: "));
        drop(events);
        handle.stop();
    }
}
