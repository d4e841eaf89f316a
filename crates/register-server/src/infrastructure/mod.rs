pub mod k8s;
pub mod kube_client;
pub mod notifier;
pub mod work_queue;
