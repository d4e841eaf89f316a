use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::reflector::Store;
use kube::Api;
use kube::Client;

use crate::infrastructure::k8s::traits::PodStore;
use crate::infrastructure::k8s::types::KubernetesError;

/// Pod lister backed by the watcher's reflector cache.
#[derive(Clone)]
pub struct CachedPods {
    store: Store<Pod>,
}

impl CachedPods {
    pub fn new(store: Store<Pod>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PodStore for CachedPods {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Pod>, Report<KubernetesError>> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(self.store.get(&key).map(|pod| pod.as_ref().clone()))
    }
}

/// Pod lookups that always hit the API server.
///
/// Used during start-up recovery, before the watcher cache is populated.
#[derive(Clone)]
pub struct ApiPods {
    client: Client,
}

impl ApiPods {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodStore for ApiPods {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Pod>, Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(|e| {
            Report::new(KubernetesError::ApiRequest {
                message: format!("get Pod {namespace}/{name}"),
            })
            .attach_printable(format!("Kubernetes API error: {e}"))
        })
    }
}
