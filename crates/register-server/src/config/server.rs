use std::path::PathBuf;

use clap::Parser;

use crate::config::ConfigMonitorConfig;
use crate::config::DiscoveryLabels;
use crate::config::RegistryConfig;

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the kubeconfig file. Defaults to in-cluster config or ~/.kube/config"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "REGISTER_SERVICE_NAMESPACE",
        value_delimiter = ',',
        required = true,
        help = "Namespaces whose pods are registered (comma separated)"
    )]
    pub register_service_namespace: Vec<String>,

    #[arg(
        long,
        env = "REGISTER_SERVER_NAMESPACE",
        default_value = "default",
        help = "Namespace holding the registry ConfigMap"
    )]
    pub register_server_namespace: String,

    #[arg(
        long,
        env = "REGISTER_SERVER_NAME",
        default_value = "register-server",
        help = "Name of the registry ConfigMap"
    )]
    pub register_server_name: String,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:8000",
        help = "Address the Eureka API listens on"
    )]
    pub api_listen_addr: String,

    #[arg(long, default_value_t = 2, help = "Number of pod reconcile workers")]
    pub reconcile_workers: usize,

    #[arg(
        long,
        default_value_t = 15,
        help = "Retries of a failing pod reconcile before the key is dropped"
    )]
    pub max_reconcile_retries: u32,

    #[arg(long, default_value = "choerodon.io/service", help = "Pod label naming the service")]
    pub service_label: String,

    #[arg(long, default_value = "choerodon.io/version", help = "Pod label holding the service version")]
    pub version_label: String,

    #[arg(
        long,
        default_value = "choerodon.io/metrics-port",
        help = "Pod label holding the management port"
    )]
    pub metrics_port_label: String,

    #[arg(
        long,
        default_value = "choerodon.io/context-path",
        help = "Pod label holding the servlet context path"
    )]
    pub context_path_label: String,

    #[arg(
        long,
        env = "ENABLE_CONFIG_MONITOR",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Watch ConfigMaps to sync replicas and push config refreshes"
    )]
    pub enable_config_monitor: bool,

    #[arg(
        long,
        default_value = "choerodon.io/feature",
        help = "Annotation marking service configuration ConfigMaps"
    )]
    pub config_feature_annotation: String,

    #[arg(
        long,
        default_value = "spring-cloud-config",
        help = "Annotation value marking service configuration ConfigMaps"
    )]
    pub config_feature_value: String,

    #[arg(long, default_value = "zuul-route", help = "ConfigMap holding the gateway routes")]
    pub route_config_map: String,

    #[arg(
        long,
        env = "GATEWAY_NAMES",
        value_delimiter = ',',
        default_value = "api-gateway,gateway-helper",
        help = "Services refreshed when the route ConfigMap changes (comma separated)"
    )]
    pub gateway_names: Vec<String>,

    #[arg(
        long,
        env = "NOTIFY_AUTHORIZATION",
        help = "Authorization header sent with config refresh requests"
    )]
    pub notify_authorization: Option<String>,

    #[arg(
        long,
        env = "REGISTER_SERVER_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,
}

impl From<&ServerArgs> for DiscoveryLabels {
    fn from(args: &ServerArgs) -> Self {
        Self {
            service: args.service_label.clone(),
            version: args.version_label.clone(),
            metrics_port: args.metrics_port_label.clone(),
            context_path: args.context_path_label.clone(),
        }
    }
}

impl From<&ServerArgs> for RegistryConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            service_namespaces: normalize_list(&args.register_service_namespace),
            server_namespace: args.register_server_namespace.clone(),
            registry_name: args.register_server_name.clone(),
            reconcile_workers: args.reconcile_workers.max(1),
            max_reconcile_retries: args.max_reconcile_retries,
        }
    }
}

impl From<&ServerArgs> for ConfigMonitorConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            server_namespace: args.register_server_namespace.clone(),
            registry_name: args.register_server_name.clone(),
            namespaces: normalize_list(&args.register_service_namespace),
            feature_annotation: args.config_feature_annotation.clone(),
            feature_value: args.config_feature_value.clone(),
            route_config_map: args.route_config_map.clone(),
            gateway_names: normalize_list(&args.gateway_names),
        }
    }
}

fn normalize_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::Cli;
    use crate::config::Commands;

    fn parse(args: &[&str]) -> ServerArgs {
        let cli = Cli::try_parse_from(args).expect("arguments should parse");
        match cli.command {
            Commands::Serve(args) => *args,
        }
    }

    #[test]
    fn defaults_match_registry_conventions() {
        let args = parse(&[
            "register-server",
            "serve",
            "--register-service-namespace",
            "prod, staging,",
        ]);

        let registry = RegistryConfig::from(&args);
        assert_eq!(
            registry.service_namespaces,
            vec!["prod".to_string(), "staging".to_string()]
        );
        assert_eq!(registry.server_namespace, "default");
        assert_eq!(registry.registry_name, "register-server");
        assert_eq!(registry.reconcile_workers, 2);
        assert_eq!(registry.max_reconcile_retries, 15);

        assert_eq!(DiscoveryLabels::from(&args), DiscoveryLabels::default());
        assert_eq!(
            ConfigMonitorConfig::from(&args).gateway_names,
            vec!["api-gateway".to_string(), "gateway-helper".to_string()]
        );
        assert!(args.enable_config_monitor);
        assert_eq!(args.api_listen_addr, "0.0.0.0:8000");
    }

    #[test]
    fn config_monitor_can_be_disabled() {
        let args = parse(&[
            "register-server",
            "serve",
            "--register-service-namespace",
            "prod",
            "--enable-config-monitor",
            "false",
        ]);
        assert!(!args.enable_config_monitor);
    }
}
