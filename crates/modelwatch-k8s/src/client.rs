//! kube-rs backed implementation of [`ClusterApi`]

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::{
    ApiResource, DynamicObject, GroupVersionKind, ListParams, LogParams, WatchEvent, WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde_json::Value;
use tracing::debug;

use modelwatch_types::PodSummary;

use crate::{ApiError, ClusterApi, ListSelector, ObjectList, ResourceKind, WatchNotification, WatchStream};

/// The API server rejects watch timeouts at or above this many seconds
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct KubeClusterApi {
    client: kube::Client,
}

impl KubeClusterApi {
    /// Connect using a named kubeconfig context, or infer the configuration
    /// (in-cluster service account first, then the current context)
    pub async fn connect(context: Option<&str>) -> Result<Self> {
        let config = match context {
            Some(context_name) => {
                let kubeconfig = Kubeconfig::read()
                    .context("Failed to read kubeconfig. Is kubectl configured?")?;
                kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &KubeConfigOptions {
                        context: Some(context_name.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .context(format!(
                    "Failed to create config for context: {}",
                    context_name
                ))?
            }
            None => kube::Config::infer()
                .await
                .context("Failed to infer cluster configuration")?,
        };

        let client = kube::Client::try_from(config).context("Failed to create kube client")?;

        Ok(Self { client })
    }

    fn dynamic_api(&self, kind: &ResourceKind, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, &kind.plural);
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

fn list_params(selector: &ListSelector) -> ListParams {
    let mut params = ListParams::default();
    if let Some(labels) = &selector.labels {
        params = params.labels(labels);
    }
    if let Some(fields) = &selector.fields {
        params = params.fields(fields);
    }
    params
}

fn watch_params(selector: &ListSelector, timeout_secs: u32) -> WatchParams {
    let mut params = WatchParams::default().timeout(timeout_secs.clamp(1, MAX_WATCH_TIMEOUT_SECS));
    if let Some(labels) = &selector.labels {
        params = params.labels(labels);
    }
    if let Some(fields) = &selector.fields {
        params = params.fields(fields);
    }
    params
}

fn notification(event: kube::Result<WatchEvent<DynamicObject>>) -> Result<WatchNotification, ApiError> {
    match event? {
        WatchEvent::Added(obj) => Ok(WatchNotification::Added(serde_json::to_value(obj)?)),
        WatchEvent::Modified(obj) => Ok(WatchNotification::Modified(serde_json::to_value(obj)?)),
        WatchEvent::Deleted(obj) => Ok(WatchNotification::Deleted(serde_json::to_value(obj)?)),
        WatchEvent::Bookmark(bookmark) => {
            Ok(WatchNotification::Bookmark(bookmark.metadata.resource_version))
        }
        WatchEvent::Error(err) => Err(ApiError::from_status(err.code, err.message)),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<ObjectList, ApiError> {
        let list = self
            .dynamic_api(kind, namespace)
            .list(&list_params(selector))
            .await?;

        let items = list
            .items
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()?;

        Ok(ObjectList {
            items,
            cursor: list.metadata.resource_version,
        })
    }

    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, ApiError> {
        let obj = self
            .dynamic_api(kind, namespace)
            .get(name)
            .await
            .map_err(|e| ApiError::from_kube(e, &kind.plural, namespace, name))?;

        Ok(serde_json::to_value(obj)?)
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &ListSelector,
        from_cursor: &str,
        timeout_secs: u32,
    ) -> Result<WatchStream, ApiError> {
        debug!(kind = %kind.plural, namespace, cursor = from_cursor, "Opening watch");
        let stream = self
            .dynamic_api(kind, namespace)
            .watch(&watch_params(selector, timeout_secs), from_cursor)
            .await?;

        Ok(stream.map(notification).boxed())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, ApiError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await?;

        Ok(list
            .items
            .into_iter()
            .map(|pod| PodSummary {
                name: pod.metadata.name.unwrap_or_default(),
                labels: pod.metadata.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<String, ApiError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines,
            ..Default::default()
        };

        pods.logs(pod, &params)
            .await
            .map_err(|e| ApiError::from_kube(e, "pod", namespace, pod))
    }
}
