use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::ApplicationRepository;
use crate::infrastructure::k8s::pod_info::pod_key;
use crate::infrastructure::k8s::types::KubernetesError;
use crate::infrastructure::work_queue::WorkQueue;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Turns pod watch events into reconcile keys.
pub struct PodEventHandler {
    queue: Arc<WorkQueue<String>>,
    repository: Arc<ApplicationRepository>,
    /// last resourceVersion enqueued per key
    seen_versions: DashMap<String, String>,
}

impl PodEventHandler {
    pub fn new(queue: Arc<WorkQueue<String>>, repository: Arc<ApplicationRepository>) -> Self {
        Self {
            queue,
            repository,
            seen_versions: DashMap::new(),
        }
    }

    pub async fn handle(&self, event: Event<Pod>) {
        match event {
            Event::Applied(pod) => {
                let Some(key) = pod_key(&pod) else {
                    return;
                };
                if let Some(version) = pod.metadata.resource_version.clone() {
                    let previous = self.seen_versions.insert(key.clone(), version.clone());
                    if previous.as_ref() == Some(&version) {
                        debug!(key = %key, "resourceVersion unchanged, skipping");
                        return;
                    }
                }
                self.queue.add(key).await;
            }
            Event::Deleted(pod) => {
                let Some(key) = pod_key(&pod) else {
                    return;
                };
                self.seen_versions.remove(&key);
                self.queue.add(key).await;
            }
            Event::Restarted(pods) => {
                self.seen_versions.clear();
                let mut keys = HashSet::with_capacity(pods.len());
                for pod in &pods {
                    let Some(key) = pod_key(pod) else {
                        continue;
                    };
                    if let Some(version) = pod.metadata.resource_version.clone() {
                        self.seen_versions.insert(key.clone(), version);
                    }
                    keys.insert(key);
                }
                // registered pods that vanished while the watch was down
                keys.extend(self.repository.pod_origin_keys());

                info!(pods = pods.len(), keys = keys.len(), "pod list refreshed");
                for key in keys {
                    self.queue.add(key).await;
                }
            }
        }
    }
}

/// Watches pods in every namespace and keeps the lister cache filled.
pub struct PodWatcher {
    client: Client,
    writer: Mutex<Option<Writer<Pod>>>,
    handler: PodEventHandler,
}

impl PodWatcher {
    pub fn new(client: Client, writer: Writer<Pod>, handler: PodEventHandler) -> Self {
        Self {
            client,
            writer: Mutex::new(Some(writer)),
            handler,
        }
    }

    /// Start watching pods for changes.
    ///
    /// Runs until `cancellation_token` fires. Stream errors are logged and
    /// the watch resumes after a delay.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::WatchFailed`] if the watcher was already started
    #[tracing::instrument(skip(self, cancellation_token))]
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        let Some(writer) = self.writer.lock().await.take() else {
            return Err(Report::new(KubernetesError::WatchFailed {
                resource: "pods".to_string(),
                message: "pod watcher already started".to_string(),
            }));
        };

        info!("Starting pod watcher");
        let api: Api<Pod> = Api::all(self.client.clone());
        let events = watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = reflector(writer, events).boxed();

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod watcher shutdown requested");
                    break;
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(event)) => self.handler.handle(event).await,
                        Some(Err(e)) => {
                            error!("Pod watch failed: {e}");
                            select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = tokio::time::sleep(RETRY_DELAY) => {}
                            }
                        }
                        None => {
                            warn!("Pod watch stream ended unexpectedly");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
