//! Replica synchronisation over the registry ConfigMap
//!
//! Every replica writes custom registrations to the same ConfigMap. Watching
//! it keeps the in-memory custom table of this replica in step with writes
//! made by the others.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::RegistrationService;
use crate::infrastructure::k8s::types::KubernetesError;

const RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct RegistrySyncHandler {
    registry_name: String,
    registration: Arc<RegistrationService>,
}

impl RegistrySyncHandler {
    pub fn new(registry_name: impl Into<String>, registration: Arc<RegistrationService>) -> Self {
        Self {
            registry_name: registry_name.into(),
            registration,
        }
    }

    pub fn handle(&self, event: Event<ConfigMap>) {
        match event {
            Event::Applied(config_map) => self.sync(&config_map),
            Event::Restarted(config_maps) => {
                for config_map in &config_maps {
                    self.sync(config_map);
                }
            }
            // the next archive write recreates it; memory stays authoritative until then
            Event::Deleted(_) => warn!(name = %self.registry_name, "registry ConfigMap deleted"),
        }
    }

    fn sync(&self, config_map: &ConfigMap) {
        if config_map.metadata.name.as_deref() != Some(self.registry_name.as_str()) {
            return;
        }
        let empty = BTreeMap::new();
        let data = config_map.data.as_ref().unwrap_or(&empty);
        debug!(entries = data.len(), "registry ConfigMap changed, syncing custom instances");
        self.registration.sync_from_archive(data);
    }
}

/// Watches the single registry ConfigMap in the server namespace.
pub struct RegistryWatcher {
    client: Client,
    namespace: String,
    handler: RegistrySyncHandler,
}

impl RegistryWatcher {
    pub fn new(client: Client, namespace: impl Into<String>, handler: RegistrySyncHandler) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            handler,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn registry_name(&self) -> &str {
        &self.handler.registry_name
    }

    /// Runs until `cancellation_token` fires.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::WatchFailed`] if the watch stream terminates
    #[tracing::instrument(skip(self, cancellation_token), fields(namespace = %self.namespace))]
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!(name = %self.registry_name(), "Starting registry ConfigMap watcher");
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.registry_name()));
        let mut stream = watcher(api, config).default_backoff().boxed();

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Registry ConfigMap watcher shutdown requested");
                    return Ok(());
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(event)) => self.handler.handle(event),
                        Some(Err(e)) => {
                            error!("Registry ConfigMap watch failed: {e}");
                            select! {
                                _ = cancellation_token.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(RETRY_DELAY) => {}
                            }
                        }
                        None => {
                            return Err(Report::new(KubernetesError::WatchFailed {
                                resource: "configmaps".to_string(),
                                message: "registry watch stream ended".to_string(),
                            }));
                        }
                    }
                }
            }
        }
    }
}
