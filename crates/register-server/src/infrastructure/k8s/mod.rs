pub mod config_map;
pub mod config_watcher;
pub mod mock;
pub mod pod_info;
pub mod pod_watcher;
pub mod pods;
pub mod registry_watcher;
pub mod traits;
pub mod types;

pub use config_map::KubeConfigMaps;
pub use config_watcher::ConfigChangeHandler;
pub use config_watcher::ConfigMapWatcher;
pub use pod_watcher::PodEventHandler;
pub use pod_watcher::PodWatcher;
pub use pods::ApiPods;
pub use pods::CachedPods;
pub use registry_watcher::RegistrySyncHandler;
pub use registry_watcher::RegistryWatcher;
pub use traits::ConfigMapStore;
pub use traits::PodStore;
pub use types::KubernetesError;
