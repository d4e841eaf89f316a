use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector;
use kube::Client;

use crate::api::ApiServer;
use crate::app::core::Application;
use crate::app::services::ApplicationServices;
use crate::config::ConfigMonitorConfig;
use crate::config::DiscoveryLabels;
use crate::config::RegistryConfig;
use crate::config::ServerArgs;
use crate::domain::ApplicationRepository;
use crate::domain::PodReconciler;
use crate::domain::RegistrationService;
use crate::domain::RegistryArchive;
use crate::infrastructure::k8s::ApiPods;
use crate::infrastructure::k8s::CachedPods;
use crate::infrastructure::k8s::ConfigChangeHandler;
use crate::infrastructure::k8s::ConfigMapWatcher;
use crate::infrastructure::k8s::KubeConfigMaps;
use crate::infrastructure::k8s::PodEventHandler;
use crate::infrastructure::k8s::PodWatcher;
use crate::infrastructure::k8s::RegistrySyncHandler;
use crate::infrastructure::k8s::RegistryWatcher;
use crate::infrastructure::kube_client::init_kube_client;
use crate::infrastructure::notifier::HttpRefreshNotifier;

/// Application builder
pub struct ApplicationBuilder {
    server_args: ServerArgs,
}

impl ApplicationBuilder {
    pub fn new(server_args: ServerArgs) -> Self {
        Self { server_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let client = init_kube_client(self.server_args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;

        let services = self.create_services(client)?;

        tracing::info!("Application components built");
        Ok(Application::new(services, self.server_args))
    }

    fn create_services(&self, client: Client) -> Result<ApplicationServices> {
        let registry = RegistryConfig::from(&self.server_args);
        let labels = DiscoveryLabels::from(&self.server_args);

        let repository = Arc::new(ApplicationRepository::new());
        let config_maps = Arc::new(KubeConfigMaps::new(
            client.clone(),
            &registry.server_namespace,
        ));
        let archive = Arc::new(RegistryArchive::new(
            config_maps,
            registry.registry_name.clone(),
        ));

        // Recovery runs before the pod cache is filled, so it reads the API.
        let registration = Arc::new(RegistrationService::new(
            repository.clone(),
            archive.clone(),
            Arc::new(ApiPods::new(client.clone())),
        ));

        let (pod_store, pod_writer) = reflector::store::<Pod>();
        let reconciler = Arc::new(PodReconciler::new(
            repository.clone(),
            archive,
            Arc::new(CachedPods::new(pod_store)),
            labels,
            registry.service_namespaces.clone(),
            registry.max_reconcile_retries,
        ));

        let pod_watcher = Arc::new(PodWatcher::new(
            client.clone(),
            pod_writer,
            PodEventHandler::new(reconciler.queue(), repository.clone()),
        ));

        // Replica sync runs whether or not config monitoring is enabled.
        let registry_watcher = Arc::new(RegistryWatcher::new(
            client.clone(),
            registry.server_namespace.clone(),
            RegistrySyncHandler::new(registry.registry_name.clone(), registration.clone()),
        ));

        let config_watcher = if self.server_args.enable_config_monitor {
            let notifier = HttpRefreshNotifier::new(self.server_args.notify_authorization.clone())
                .map_err(|e| anyhow::anyhow!("Failed to create refresh notifier: {e:?}"))?;
            let handler = ConfigChangeHandler::new(
                ConfigMonitorConfig::from(&self.server_args),
                repository.clone(),
                Arc::new(notifier),
            );
            Some(Arc::new(ConfigMapWatcher::new(client, handler)))
        } else {
            tracing::info!("Config monitoring disabled");
            None
        };

        let api_server = Arc::new(ApiServer::new(
            repository.clone(),
            registration.clone(),
            self.server_args.api_listen_addr.clone(),
        ));

        Ok(ApplicationServices {
            repository,
            registration,
            reconciler,
            pod_watcher,
            registry_watcher,
            config_watcher,
            api_server,
        })
    }
}
