//! Shared types for modelwatch
//!
//! This crate contains the data model shared by the cluster client, the
//! streaming subsystem and the HTTP endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Watch Targets
// ============================================================================

/// Identifies one logical watch target.
///
/// Equal keys always resolve to the same registry entry, so the component
/// list of a log key is kept sorted and de-duplicated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchKey {
    /// Every InferenceService in a namespace
    Collection { namespace: String },
    /// One InferenceService
    Single { namespace: String, name: String },
    /// Cluster events involving one InferenceService
    Events { namespace: String, name: String },
    /// Pod logs for a set of InferenceService components
    Logs {
        namespace: String,
        name: String,
        components: Vec<String>,
    },
}

impl WatchKey {
    pub fn collection(namespace: impl Into<String>) -> Self {
        Self::Collection {
            namespace: namespace.into(),
        }
    }

    pub fn single(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Single {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn events(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Events {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build a log key; component order and duplicates do not matter
    pub fn logs<I, S>(namespace: impl Into<String>, name: impl Into<String>, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut components: Vec<String> = components.into_iter().map(Into::into).collect();
        components.sort();
        components.dedup();
        Self::Logs {
            namespace: namespace.into(),
            name: name.into(),
            components,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::Collection { namespace }
            | Self::Single { namespace, .. }
            | Self::Events { namespace, .. }
            | Self::Logs { namespace, .. } => namespace,
        }
    }

    /// Resource name, absent for collection keys
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Collection { .. } => None,
            Self::Single { name, .. } | Self::Events { name, .. } | Self::Logs { name, .. } => {
                Some(name)
            }
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection { namespace } => write!(f, "ns:{}", namespace),
            Self::Single { namespace, name } => write!(f, "single:{}:{}", namespace, name),
            Self::Events { namespace, name } => write!(f, "events:{}:{}", namespace, name),
            Self::Logs {
                namespace,
                name,
                components,
            } => write!(f, "logs:{}:{}:{}", namespace, name, components.join(",")),
        }
    }
}

// ============================================================================
// Resource Types
// ============================================================================

/// How an InferenceService is deployed, derived from its annotations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeploymentMode {
    /// Knative-backed (the KServe default)
    #[default]
    Serverless,
    /// Plain Deployments, a.k.a. "Standard"
    RawDeployment,
    /// Pods managed by the modelmesh controller
    ModelMesh,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serverless => "Serverless",
            Self::RawDeployment => "RawDeployment",
            Self::ModelMesh => "ModelMesh",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal pod view used for log discovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl PodSummary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Log lines of one pod
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodLogs {
    #[serde(rename = "podName")]
    pub pod_name: String,
    pub logs: Vec<String>,
}

impl PodLogs {
    /// Split raw log text into lines
    pub fn from_text(pod_name: impl Into<String>, text: &str) -> Self {
        Self {
            pod_name: pod_name.into(),
            logs: text.split('\n').map(str::to_string).collect(),
        }
    }
}

/// Log lines per component
pub type ComponentLogs = BTreeMap<String, Vec<PodLogs>>;

/// Read `metadata.resourceVersion` from a raw object
pub fn resource_version(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

/// Read `metadata.namespace/metadata.name` from a raw object
pub fn object_ref(obj: &Value) -> Option<String> {
    let name = obj.pointer("/metadata/name").and_then(Value::as_str)?;
    let namespace = obj
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(format!("{}/{}", namespace, name))
}

// ============================================================================
// Event Types
// ============================================================================

/// Kind of a streamed event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Full snapshot, always first on a fresh subscription
    Initial,
    Added,
    Modified,
    Deleted,
    /// Upstream failure, reported as data
    Error,
    /// Full replacement payload from a poller
    Update,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
            Self::Update => "UPDATE",
        }
    }

    /// Incremental change to a previously sent snapshot
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }
}

/// Event body; the variant name becomes the JSON key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Object(Value),
    Items(Vec<Value>),
    Logs(ComponentLogs),
    Message(String),
}

/// One message delivered to streaming clients
///
/// Serializes as `{"type": "...", "<payload-key>": ..., "resourceVersion": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(flatten)]
    pub payload: Payload,

    /// Opaque resume point, present where the upstream provides one
    #[serde(
        rename = "resourceVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cursor: Option<String>,
}

impl Event {
    /// Snapshot of a collection
    pub fn initial_items(items: Vec<Value>, cursor: Option<String>) -> Self {
        Self {
            event_type: EventType::Initial,
            payload: Payload::Items(items),
            cursor,
        }
    }

    /// Snapshot of a single object
    pub fn initial_object(object: Value, cursor: Option<String>) -> Self {
        Self {
            event_type: EventType::Initial,
            payload: Payload::Object(object),
            cursor,
        }
    }

    /// ADDED / MODIFIED / DELETED
    pub fn change(event_type: EventType, object: Value) -> Self {
        let cursor = resource_version(&object).map(str::to_string);
        Self {
            event_type,
            payload: Payload::Object(object),
            cursor,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Error,
            payload: Payload::Message(message.into()),
            cursor: None,
        }
    }

    pub fn update(logs: ComponentLogs) -> Self {
        Self {
            event_type: EventType::Update,
            payload: Payload::Logs(logs),
            cursor: None,
        }
    }
}
