//! ConfigMap monitoring
//!
//! Service configuration ConfigMaps carry a feature annotation. When their
//! content changes, every running instance of the owning service is asked
//! to refresh. The registry ConfigMap is left to the registry watcher.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use error_stack::Report;
use futures::future::join_all;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use sha2::Digest;
use sha2::Sha256;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::ConfigMonitorConfig;
use crate::domain::ApplicationRepository;
use crate::infrastructure::k8s::types::KubernetesError;
use crate::infrastructure::notifier::RefreshNotifier;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// SHA-256 over the data entries in key order.
pub fn fingerprint(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

fn object_key(config_map: &ConfigMap) -> Option<(String, String)> {
    let name = config_map.metadata.name.clone()?;
    let namespace = config_map
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    Some((namespace, name))
}

pub struct ConfigChangeHandler {
    config: ConfigMonitorConfig,
    repository: Arc<ApplicationRepository>,
    notifier: Arc<dyn RefreshNotifier>,
    /// `namespace/name` -> data fingerprint
    fingerprints: DashMap<String, String>,
}

impl ConfigChangeHandler {
    pub fn new(
        config: ConfigMonitorConfig,
        repository: Arc<ApplicationRepository>,
        notifier: Arc<dyn RefreshNotifier>,
    ) -> Self {
        Self {
            config,
            repository,
            notifier,
            fingerprints: DashMap::new(),
        }
    }

    pub async fn handle(&self, event: Event<ConfigMap>) {
        match event {
            Event::Applied(config_map) => self.observe(&config_map).await,
            Event::Deleted(config_map) => {
                if let Some((namespace, name)) = object_key(&config_map) {
                    if self.fingerprints.remove(&format!("{namespace}/{name}")).is_some() {
                        info!(namespace = %namespace, name = %name, "stopped monitoring deleted ConfigMap");
                    }
                }
            }
            Event::Restarted(config_maps) => {
                let mut listed = HashSet::with_capacity(config_maps.len());
                for config_map in &config_maps {
                    if let Some((namespace, name)) = object_key(config_map) {
                        listed.insert(format!("{namespace}/{name}"));
                    }
                    self.observe(config_map).await;
                }
                self.fingerprints.retain(|key, _| listed.contains(key));
            }
        }
    }

    fn is_registry(&self, namespace: &str, name: &str) -> bool {
        namespace == self.config.server_namespace && name == self.config.registry_name
    }

    fn is_tracked(&self, namespace: &str, config_map: &ConfigMap) -> bool {
        let monitored = self.config.namespaces.is_empty()
            || self.config.namespaces.iter().any(|ns| ns == namespace);
        monitored
            && config_map
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(&self.config.feature_annotation))
                .is_some_and(|value| *value == self.config.feature_value)
    }

    async fn observe(&self, config_map: &ConfigMap) {
        let Some((namespace, name)) = object_key(config_map) else {
            return;
        };
        if self.is_registry(&namespace, &name) || !self.is_tracked(&namespace, config_map) {
            return;
        }
        let empty = BTreeMap::new();
        let data = config_map.data.as_ref().unwrap_or(&empty);

        let key = format!("{namespace}/{name}");
        let digest = fingerprint(data);
        match self.fingerprints.insert(key.clone(), digest.clone()) {
            None => info!(config_map = %key, "ConfigMap is being monitored"),
            Some(previous) if previous == digest => {}
            Some(_) => {
                info!(config_map = %key, "ConfigMap content changed");
                self.notify_services(&name).await;
            }
        }
    }

    /// The route ConfigMap belongs to the gateways, every other ConfigMap to
    /// the service of the same name.
    async fn notify_services(&self, config_map_name: &str) {
        let services = if config_map_name == self.config.route_config_map {
            self.config.gateway_names.clone()
        } else {
            vec![config_map_name.to_string()]
        };

        let instances: Vec<_> = services
            .iter()
            .flat_map(|service| self.repository.get_instances_by_service(service))
            .collect();
        if instances.is_empty() {
            debug!(?services, "no running instances to notify");
            return;
        }

        let results = join_all(instances.iter().map(|instance| self.notifier.notify(instance))).await;
        for (instance, result) in instances.iter().zip(results) {
            match result {
                Ok(()) => info!(instance_id = %instance.instance_id, "config refresh notified"),
                Err(e) => warn!(instance_id = %instance.instance_id, "config refresh failed: {e:?}"),
            }
        }
    }
}

/// Watches ConfigMaps in every namespace.
pub struct ConfigMapWatcher {
    client: Client,
    handler: ConfigChangeHandler,
}

impl ConfigMapWatcher {
    pub fn new(client: Client, handler: ConfigChangeHandler) -> Self {
        Self { client, handler }
    }

    /// Runs until `cancellation_token` fires.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::WatchFailed`] if the watch stream terminates
    #[tracing::instrument(skip(self, cancellation_token))]
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting ConfigMap watcher");
        let api: Api<ConfigMap> = Api::all(self.client.clone());
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("ConfigMap watcher shutdown requested");
                    return Ok(());
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(event)) => self.handler.handle(event).await,
                        Some(Err(e)) => {
                            error!("ConfigMap watch failed: {e}");
                            select! {
                                _ = cancellation_token.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(RETRY_DELAY) => {}
                            }
                        }
                        None => {
                            return Err(Report::new(KubernetesError::WatchFailed {
                                resource: "configmaps".to_string(),
                                message: "watch stream ended".to_string(),
                            }));
                        }
                    }
                }
            }
        }
    }
}
