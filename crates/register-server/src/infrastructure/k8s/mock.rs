//! In-memory adapters implementing the Kubernetes capability traits
//!
//! Used by unit tests and by the integration tests under `tests/`. Failure
//! injection mirrors the errors the API adapters can surface.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ContainerPort;
use k8s_openapi::api::core::v1::ContainerState;
use k8s_openapi::api::core::v1::ContainerStateRunning;
use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::traits::ConfigMapStore;
use super::traits::PodStore;
use super::types::KubernetesError;

/// ConfigMaps held in memory, with optimistic concurrency on `update`.
#[derive(Default)]
pub struct InMemoryConfigMaps {
    objects: DashMap<String, ConfigMap>,
    revision: AtomicU64,
    pending_conflicts: AtomicUsize,
    pending_update_failures: AtomicUsize,
    fail_gets: AtomicBool,
    update_calls: AtomicUsize,
}

impl InMemoryConfigMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a ConfigMap with the given data.
    pub fn insert(&self, name: &str, data: BTreeMap<String, String>) {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(self.next_revision()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        self.objects.insert(name.to_string(), config_map);
    }

    pub fn data(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.objects
            .get(name)
            .map(|entry| entry.value().data.clone().unwrap_or_default())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    /// The next `count` updates fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// The next `count` updates fail with an API error.
    pub fn fail_updates(&self, count: usize) {
        self.pending_update_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_gets(&self, enabled: bool) {
        self.fail_gets.store(enabled, Ordering::SeqCst);
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn name_of(config_map: &ConfigMap) -> Result<String, Report<KubernetesError>> {
    config_map.metadata.name.clone().ok_or_else(|| {
        Report::new(KubernetesError::InvalidObject {
            message: "ConfigMap without a name".to_string(),
        })
    })
}

#[async_trait]
impl ConfigMapStore for InMemoryConfigMaps {
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, Report<KubernetesError>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(Report::new(KubernetesError::ApiRequest {
                message: format!("injected get failure for {name}"),
            }));
        }
        Ok(self.objects.get(name).map(|entry| entry.value().clone()))
    }

    async fn create(&self, config_map: &ConfigMap) -> Result<ConfigMap, Report<KubernetesError>> {
        let name = name_of(config_map)?;
        if self.objects.contains_key(&name) {
            return Err(Report::new(KubernetesError::Conflict {
                kind: "ConfigMap".to_string(),
                name,
            }));
        }
        let mut created = config_map.clone();
        created.metadata.resource_version = Some(self.next_revision());
        self.objects.insert(name, created.clone());
        Ok(created)
    }

    async fn update(&self, config_map: &ConfigMap) -> Result<ConfigMap, Report<KubernetesError>> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let name = name_of(config_map)?;
        if Self::take_one(&self.pending_update_failures) {
            return Err(Report::new(KubernetesError::ApiRequest {
                message: format!("injected update failure for {name}"),
            }));
        }
        if Self::take_one(&self.pending_conflicts) {
            return Err(Report::new(KubernetesError::Conflict {
                kind: "ConfigMap".to_string(),
                name,
            }));
        }

        let Some(mut stored) = self.objects.get_mut(&name) else {
            return Err(Report::new(KubernetesError::NotFound {
                kind: "ConfigMap".to_string(),
                name,
                namespace: String::new(),
            }));
        };
        if stored.metadata.resource_version != config_map.metadata.resource_version {
            return Err(Report::new(KubernetesError::Conflict {
                kind: "ConfigMap".to_string(),
                name,
            }));
        }
        let mut updated = config_map.clone();
        updated.metadata.resource_version = Some(self.next_revision());
        *stored = updated.clone();
        Ok(updated)
    }
}

/// Pods held in memory, keyed by namespace and name.
#[derive(Default)]
pub struct InMemoryPods {
    pods: DashMap<(String, String), Pod>,
    fail_lookups: AtomicBool,
}

impl InMemoryPods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pod: Pod) {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods.insert((namespace, name), pod);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.pods.remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn set_fail_lookups(&self, enabled: bool) {
        self.fail_lookups.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl PodStore for InMemoryPods {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Pod>, Report<KubernetesError>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(Report::new(KubernetesError::ApiRequest {
                message: format!("injected lookup failure for {namespace}/{name}"),
            }));
        }
        Ok(self
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone()))
    }
}

/// Describes a pod carrying the default discovery labels.
#[derive(Debug, Clone)]
pub struct PodFixture {
    pub namespace: String,
    pub name: String,
    pub ip: String,
    pub service: String,
    pub version: String,
    pub metrics_port: String,
    pub container_port: i32,
    pub ready: bool,
    pub resource_version: String,
}

impl PodFixture {
    pub fn new(namespace: &str, name: &str, ip: &str, service: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ip: ip.to_string(),
            service: service.to_string(),
            version: "v1".to_string(),
            metrics_port: "9000".to_string(),
            container_port: 8080,
            ready: true,
            resource_version: "1".to_string(),
        }
    }

    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn port(mut self, port: i32) -> Self {
        self.container_port = port;
        self
    }

    pub fn resource_version(mut self, version: &str) -> Self {
        self.resource_version = version.to_string();
        self
    }

    pub fn build(self) -> Pod {
        let labels = BTreeMap::from([
            ("choerodon.io/service".to_string(), self.service),
            ("choerodon.io/version".to_string(), self.version),
            ("choerodon.io/metrics-port".to_string(), self.metrics_port),
        ]);
        let state = self.ready.then(|| ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        });

        Pod {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                labels: Some(labels),
                resource_version: Some(self.resource_version),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ports: Some(vec![ContainerPort {
                        container_port: self.container_port,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some(self.ip),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    ready: self.ready,
                    state,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }
}
