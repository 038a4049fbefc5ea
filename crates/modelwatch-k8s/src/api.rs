use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use modelwatch_types::PodSummary;

use crate::ApiError;

/// Group/version/kind of a watched resource plus its URL plural
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl ResourceKind {
    pub const ISVC_GROUP: &'static str = "serving.kserve.io";
    pub const ISVC_DEFAULT_VERSION: &'static str = "v1beta1";

    /// InferenceService at the configured version; unknown versions fall back to v1beta1
    pub fn inference_service(version: &str) -> Self {
        let version = match version {
            "v1alpha2" | "v1beta1" => version,
            _ => Self::ISVC_DEFAULT_VERSION,
        };
        Self {
            group: Self::ISVC_GROUP.to_string(),
            version: version.to_string(),
            kind: "InferenceService".to_string(),
            plural: "inferenceservices".to_string(),
        }
    }

    /// Core v1 Event
    pub fn event() -> Self {
        Self {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Event".to_string(),
            plural: "events".to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Label and field selectors for list and watch calls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListSelector {
    pub labels: Option<String>,
    pub fields: Option<String>,
}

impl ListSelector {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fields(fields: impl Into<String>) -> Self {
        Self {
            labels: None,
            fields: Some(fields.into()),
        }
    }

    pub fn labels(labels: impl Into<String>) -> Self {
        Self {
            labels: Some(labels.into()),
            fields: None,
        }
    }

    /// Selector matching a single object by name
    pub fn by_name(name: &str) -> Self {
        Self::fields(format!("metadata.name={}", name))
    }

    /// Selector matching events that involve one object
    pub fn involving(kind: &str, name: &str) -> Self {
        Self::fields(format!(
            "involvedObject.kind={},involvedObject.name={}",
            kind, name
        ))
    }
}

/// Result of a list call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectList {
    pub items: Vec<Value>,
    /// Collection resourceVersion, usable as a watch start point
    pub cursor: Option<String>,
}

/// One change reported by a watch call
#[derive(Clone, Debug, PartialEq)]
pub enum WatchNotification {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    /// Progress marker carrying only a newer cursor
    Bookmark(String),
}

pub type WatchStream = BoxStream<'static, Result<WatchNotification, ApiError>>;

/// The primitives the streaming layer is built on.
///
/// `watch` ends its stream when the server-side timeout expires; callers
/// treat that as a natural end, not a failure.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<ObjectList, ApiError>;

    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str)
    -> Result<Value, ApiError>;

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &ListSelector,
        from_cursor: &str,
        timeout_secs: u32,
    ) -> Result<WatchStream, ApiError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, ApiError>;

    /// Container log text; `tail_lines` keeps only the last lines
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<String, ApiError>;
}
