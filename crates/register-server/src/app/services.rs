use std::sync::Arc;

use crate::api::ApiServer;
use crate::domain::ApplicationRepository;
use crate::domain::PodReconciler;
use crate::domain::RegistrationService;
use crate::infrastructure::k8s::ConfigMapWatcher;
use crate::infrastructure::k8s::PodWatcher;
use crate::infrastructure::k8s::RegistryWatcher;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub repository: Arc<ApplicationRepository>,
    pub registration: Arc<RegistrationService>,
    pub reconciler: Arc<PodReconciler>,
    pub pod_watcher: Arc<PodWatcher>,
    pub registry_watcher: Arc<RegistryWatcher>,
    /// Absent when config monitoring is disabled.
    pub config_watcher: Option<Arc<ConfigMapWatcher>>,
    pub api_server: Arc<ApiServer>,
}
