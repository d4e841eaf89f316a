pub mod cli;
pub mod server;

pub use cli::*;
pub use server::*;

/// Pod labels that mark a pod as a discovery target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLabels {
    pub service: String,
    pub version: String,
    pub metrics_port: String,
    pub context_path: String,
}

impl Default for DiscoveryLabels {
    fn default() -> Self {
        Self {
            service: "choerodon.io/service".to_string(),
            version: "choerodon.io/version".to_string(),
            metrics_port: "choerodon.io/metrics-port".to_string(),
            context_path: "choerodon.io/context-path".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Empty means every namespace.
    pub service_namespaces: Vec<String>,
    pub server_namespace: String,
    pub registry_name: String,
    pub reconcile_workers: usize,
    pub max_reconcile_retries: u32,
}

#[derive(Debug, Clone)]
pub struct ConfigMonitorConfig {
    pub server_namespace: String,
    pub registry_name: String,
    pub namespaces: Vec<String>,
    pub feature_annotation: String,
    pub feature_value: String,
    pub route_config_map: String,
    pub gateway_names: Vec<String>,
}

impl Default for ConfigMonitorConfig {
    fn default() -> Self {
        Self {
            server_namespace: "default".to_string(),
            registry_name: "register-server".to_string(),
            namespaces: Vec::new(),
            feature_annotation: "choerodon.io/feature".to_string(),
            feature_value: "spring-cloud-config".to_string(),
            route_config_map: "zuul-route".to_string(),
            gateway_names: vec!["api-gateway".to_string(), "gateway-helper".to_string()],
        }
    }
}
