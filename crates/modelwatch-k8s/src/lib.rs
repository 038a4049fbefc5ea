//! Kubernetes client for modelwatch
//!
//! This crate provides the cluster primitives the streaming layer consumes:
//! list, get and watch of InferenceServices and Events, pod discovery per
//! InferenceService component, and pod log retrieval.

mod api;
mod client;
mod error;
pub mod isvc;
pub mod pods;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use api::{ClusterApi, ListSelector, ObjectList, ResourceKind, WatchNotification, WatchStream};
pub use client::KubeClusterApi;
pub use error::ApiError;

// Re-export types that are used in our public API
pub use modelwatch_types::{DeploymentMode, PodSummary};
