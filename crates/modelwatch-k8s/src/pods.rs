//! Resolve which pods back each InferenceService component

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::info;

use modelwatch_types::DeploymentMode;

use crate::isvc;
use crate::{ApiError, ClusterApi};

pub const KNATIVE_REVISION_LABEL: &str = "serving.knative.dev/revision";
pub const RAW_ISVC_LABEL: &str = "serving.kubeflow.org/inferenceservice";
pub const COMPONENT_LABEL: &str = "component";
pub const MODELMESH_SELECTOR: &str = "app.kubernetes.io/managed-by=modelmesh-controller";

/// Pod names per component
pub type ComponentPods = BTreeMap<String, Vec<String>>;

/// Find the pods serving the requested components, choosing the discovery
/// rule from the InferenceService's deployment mode.
///
/// An empty map means nothing is running yet and is not an error.
pub async fn component_pods(
    api: &dyn ClusterApi,
    isvc: &Value,
    components: &[String],
) -> Result<ComponentPods, ApiError> {
    if components.is_empty() {
        return Ok(ComponentPods::new());
    }

    let pods = match isvc::deployment_mode(isvc) {
        DeploymentMode::ModelMesh => modelmesh_pods(api, isvc, components).await?,
        DeploymentMode::RawDeployment => raw_pods(api, isvc, components).await?,
        DeploymentMode::Serverless => revision_pods(api, isvc, components).await?,
    };

    if pods.is_empty() {
        info!(
            name = isvc::name(isvc),
            namespace = isvc::namespace(isvc),
            "No pods found for inference service"
        );
    }

    Ok(pods)
}

/// RawDeployment: pods carry the InferenceService name and a `component` label
async fn raw_pods(
    api: &dyn ClusterApi,
    isvc: &Value,
    components: &[String],
) -> Result<ComponentPods, ApiError> {
    let selector = format!("{}={}", RAW_ISVC_LABEL, isvc::name(isvc));
    let pods = api.list_pods(isvc::namespace(isvc), &selector).await?;

    let mut result = ComponentPods::new();
    for pod in pods {
        let component = pod.label(COMPONENT_LABEL).unwrap_or_default();
        if !components.iter().any(|c| c == component) {
            continue;
        }
        result
            .entry(component.to_string())
            .or_default()
            .push(pod.name);
    }
    Ok(result)
}

/// Serverless: map each component's latest ready Knative revision to its pods
async fn revision_pods(
    api: &dyn ClusterApi,
    isvc: &Value,
    components: &[String],
) -> Result<ComponentPods, ApiError> {
    let revisions: BTreeMap<&str, &str> = components
        .iter()
        .filter_map(|component| {
            isvc::latest_ready_revision(isvc, component).map(|rev| (rev, component.as_str()))
        })
        .collect();

    if revisions.is_empty() {
        info!(
            name = isvc::name(isvc),
            "No revisions found for the inference service's components"
        );
        return Ok(ComponentPods::new());
    }

    let pods = api
        .list_pods(isvc::namespace(isvc), KNATIVE_REVISION_LABEL)
        .await?;

    let mut result = ComponentPods::new();
    for pod in pods {
        let Some(component) = pod
            .label(KNATIVE_REVISION_LABEL)
            .and_then(|rev| revisions.get(rev))
        else {
            continue;
        };
        result
            .entry(component.to_string())
            .or_default()
            .push(pod.name);
    }
    Ok(result)
}

/// ModelMesh: every requested component is served by the shared runtime pods
async fn modelmesh_pods(
    api: &dyn ClusterApi,
    isvc: &Value,
    components: &[String],
) -> Result<ComponentPods, ApiError> {
    let pods = api
        .list_pods(isvc::namespace(isvc), MODELMESH_SELECTOR)
        .await?;
    if pods.is_empty() {
        return Ok(ComponentPods::new());
    }

    let names: Vec<String> = pods.into_iter().map(|p| p.name).collect();
    Ok(components
        .iter()
        .map(|component| (component.clone(), names.clone()))
        .collect())
}
