use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;

use crate::infrastructure::k8s::types::KubernetesError;

/// ConfigMap operations bound to a single namespace.
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    /// Returns `None` when the ConfigMap does not exist.
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, Report<KubernetesError>>;

    async fn create(&self, config_map: &ConfigMap) -> Result<ConfigMap, Report<KubernetesError>>;

    /// Replaces the ConfigMap. A stale `resourceVersion` yields
    /// [`KubernetesError::Conflict`].
    async fn update(&self, config_map: &ConfigMap) -> Result<ConfigMap, Report<KubernetesError>>;
}

/// Read access to the current state of pods.
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Returns `None` when the pod does not exist.
    async fn get(&self, namespace: &str, name: &str)
        -> Result<Option<Pod>, Report<KubernetesError>>;
}
