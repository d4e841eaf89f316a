use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::PostParams;
use kube::Api;
use kube::Client;

use crate::infrastructure::k8s::traits::ConfigMapStore;
use crate::infrastructure::k8s::types::KubernetesError;

const KIND: &str = "ConfigMap";

/// [`ConfigMapStore`] backed by the Kubernetes API.
pub struct KubeConfigMaps {
    api: Api<ConfigMap>,
    namespace: String,
}

impl KubeConfigMaps {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    fn map_error(&self, err: kube::Error, name: &str, verb: &str) -> Report<KubernetesError> {
        let context = match &err {
            kube::Error::Api(response) if response.code == 409 => KubernetesError::Conflict {
                kind: KIND.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(response) if response.code == 404 => KubernetesError::NotFound {
                kind: KIND.to_string(),
                name: name.to_string(),
                namespace: self.namespace.clone(),
            },
            _ => KubernetesError::ApiRequest {
                message: format!("{verb} {KIND} {}/{name}", self.namespace),
            },
        };
        Report::new(context).attach_printable(format!("Kubernetes API error: {err}"))
    }
}

fn object_name(config_map: &ConfigMap) -> Result<&str, Report<KubernetesError>> {
    config_map.metadata.name.as_deref().ok_or_else(|| {
        Report::new(KubernetesError::InvalidObject {
            message: "ConfigMap without a name".to_string(),
        })
    })
}

#[async_trait]
impl ConfigMapStore for KubeConfigMaps {
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, Report<KubernetesError>> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| self.map_error(e, name, "get"))
    }

    async fn create(&self, config_map: &ConfigMap) -> Result<ConfigMap, Report<KubernetesError>> {
        let name = object_name(config_map)?;
        self.api
            .create(&PostParams::default(), config_map)
            .await
            .map_err(|e| self.map_error(e, name, "create"))
    }

    async fn update(&self, config_map: &ConfigMap) -> Result<ConfigMap, Report<KubernetesError>> {
        let name = object_name(config_map)?;
        self.api
            .replace(name, &PostParams::default(), config_map)
            .await
            .map_err(|e| self.map_error(e, name, "update"))
    }
}
