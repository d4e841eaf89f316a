//! Level-triggered pod reconciliation
//!
//! Watch events only enqueue `namespace/name` keys. Workers re-read the pod
//! from the lister on every pass and converge the repository on what they
//! find, so duplicate or reordered events are harmless.

use core::error::Error;
use std::collections::HashSet;
use std::sync::Arc;

use api_types::Instance;
use api_types::InstanceStatus;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::now_millis;
use super::ApplicationRepository;
use super::RegistryArchive;
use crate::config::DiscoveryLabels;
use crate::infrastructure::k8s::pod_info::assess_pod;
use crate::infrastructure::k8s::pod_info::split_key;
use crate::infrastructure::k8s::pod_info::PodAssessment;
use crate::infrastructure::k8s::PodStore;
use crate::infrastructure::work_queue::WorkQueue;

#[derive(Debug, derive_more::Display)]
pub enum ReconcileError {
    #[display("Failed to look up pod {key}")]
    Lookup { key: String },
    #[display("Failed to update registry archive for pod {key}")]
    Persistence { key: String },
}

impl Error for ReconcileError {}

pub struct PodReconciler {
    repository: Arc<ApplicationRepository>,
    archive: Arc<RegistryArchive>,
    pods: Arc<dyn PodStore>,
    queue: Arc<WorkQueue<String>>,
    labels: DiscoveryLabels,
    namespaces: HashSet<String>,
    max_retries: u32,
}

impl PodReconciler {
    /// An empty `namespaces` set monitors every namespace.
    pub fn new(
        repository: Arc<ApplicationRepository>,
        archive: Arc<RegistryArchive>,
        pods: Arc<dyn PodStore>,
        labels: DiscoveryLabels,
        namespaces: impl IntoIterator<Item = String>,
        max_retries: u32,
    ) -> Self {
        Self {
            repository,
            archive,
            pods,
            queue: Arc::new(WorkQueue::new()),
            labels,
            namespaces: namespaces.into_iter().collect(),
            max_retries,
        }
    }

    /// Queue fed by the pod watcher.
    pub fn queue(&self) -> Arc<WorkQueue<String>> {
        self.queue.clone()
    }

    fn is_monitored(&self, namespace: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.contains(namespace)
    }

    /// Runs `workers` reconcile loops until `cancellation_token` fires, then
    /// drains the queue and waits for the workers.
    #[tracing::instrument(skip(self, cancellation_token))]
    pub async fn run(self: Arc<Self>, workers: usize, cancellation_token: CancellationToken) {
        info!("Starting pod reconciler");
        let handles: Vec<_> = (0..workers.max(1))
            .map(|worker| {
                let reconciler = self.clone();
                tokio::spawn(async move { reconciler.run_worker(worker).await })
            })
            .collect();

        cancellation_token.cancelled().await;
        info!("Pod reconciler shutdown requested");
        self.queue.shutdown().await;

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Reconcile worker failed: {e}");
            }
        }
        info!("Pod reconciler stopped");
    }

    async fn run_worker(&self, worker: usize) {
        debug!(worker, "reconcile worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key).await;
        }
        debug!(worker, "reconcile worker stopped");
    }

    async fn process(&self, key: &str) {
        let key = key.to_string();
        match self.reconcile(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(e) => {
                let retries = self.queue.num_requeues(&key);
                if retries < self.max_retries {
                    warn!(key = %key, retries, "reconcile failed, requeueing: {e:?}");
                    self.queue.add_rate_limited(key);
                } else {
                    error!(key = %key, retries, "reconcile failed, giving up: {e:?}");
                    self.queue.forget(&key);
                }
            }
        }
    }

    /// Converges the registry on the current state of the pod behind `key`.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Lookup`] if the pod cannot be read
    /// - [`ReconcileError::Persistence`] if a stale archive entry cannot be removed
    pub async fn reconcile(&self, key: &str) -> Result<(), Report<ReconcileError>> {
        let Some((namespace, name)) = split_key(key) else {
            warn!(key, "ignoring malformed pod key");
            return Ok(());
        };
        if !self.is_monitored(namespace) {
            return Ok(());
        }

        let pod = self
            .pods
            .get(namespace, name)
            .await
            .change_context_lazy(|| ReconcileError::Lookup {
                key: key.to_string(),
            })?;
        let Some(pod) = pod else {
            return self.remove(key).await;
        };

        match assess_pod(&pod, &self.labels, now_millis()) {
            PodAssessment::Ignore(reason) => {
                debug!(key, reason, "pod not eligible for registration");
                Ok(())
            }
            PodAssessment::Register(instance) => {
                let instance_id = instance.instance_id.clone();
                if self.repository.register(*instance, key) {
                    info!(key, instance_id = %instance_id, status = %InstanceStatus::Up, "instance registered");
                }
                Ok(())
            }
            PodAssessment::Remove => self.remove(key).await,
        }
    }

    /// Drops the pod instance and every custom record tied to the pod. The
    /// archive entries go first; when that write fails nothing is removed.
    async fn remove(&self, key: &str) -> Result<(), Report<ReconcileError>> {
        let mut custom_ids = self.repository.custom_ids_linked_to(key);
        if let Some(instance_id) = self.repository.origin(key) {
            if self.repository.custom_instance(&instance_id).is_some()
                && !custom_ids.contains(&instance_id)
            {
                custom_ids.push(instance_id);
            }
        }

        if !custom_ids.is_empty() {
            let archive_keys: Vec<String> = custom_ids
                .iter()
                .map(|id| Instance::config_map_key(id))
                .collect();
            self.archive
                .apply(&[], &archive_keys)
                .await
                .change_context_lazy(|| ReconcileError::Persistence {
                    key: key.to_string(),
                })?;
            for instance_id in &custom_ids {
                self.repository.remove_custom_instance(instance_id);
                debug!(key, instance_id = %instance_id, "custom record of removed pod dropped");
            }
        }

        if let Some(mut instance) = self.repository.delete_instance(key) {
            instance.status = InstanceStatus::Down;
            info!(key, instance_id = %instance.instance_id, status = %instance.status, "instance deregistered");
        }
        Ok(())
    }
}
