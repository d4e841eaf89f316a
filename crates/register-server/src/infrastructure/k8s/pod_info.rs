use std::collections::BTreeMap;

use api_types::DataCenterInfo;
use api_types::Instance;
use api_types::InstanceStatus;
use api_types::LeaseInfo;
use api_types::Port;
use api_types::ACTION_ADDED;
use api_types::METADATA_CONTEXT_PATH;
use api_types::METADATA_POD_SELF_LINK;
use api_types::METADATA_PROVISIONER;
use api_types::METADATA_VERSION;
use api_types::PROVISIONER_POD;
use k8s_openapi::api::core::v1::Pod;

use crate::config::DiscoveryLabels;

const COUNTRY_ID: u64 = 8;
const SECURE_PORT: i32 = 443;

/// What the current state of a pod means for the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum PodAssessment {
    /// Not a discovery target (yet); leave the registry alone.
    Ignore(&'static str),
    /// Ready and running.
    Register(Box<Instance>),
    /// Known but not serving; drop whatever is registered for it.
    Remove,
}

/// `namespace/name` key of a pod, as used by the work queue and origin index.
pub fn pod_key(pod: &Pod) -> Option<String> {
    let name = pod.metadata.name.as_deref()?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    Some(format!("{namespace}/{name}"))
}

/// Splits a `namespace/name` key. Returns `None` for malformed keys.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}

/// Decides from live pod state whether it should be registered.
pub fn assess_pod(pod: &Pod, labels: &DiscoveryLabels, now: u64) -> PodAssessment {
    let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
    let (Some(service), Some(version), Some(metrics_port)) = (
        pod_labels.get(&labels.service),
        pod_labels.get(&labels.version),
        pod_labels.get(&labels.metrics_port),
    ) else {
        return PodAssessment::Ignore("missing discovery labels");
    };

    let status = pod.status.as_ref();
    let Some(first_status) = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
    else {
        return PodAssessment::Ignore("no container statuses yet");
    };

    let running = first_status
        .state
        .as_ref()
        .and_then(|state| state.running.as_ref())
        .is_some();
    let first_container = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first());

    let (true, true, Some(container)) = (first_status.ready, running, first_container) else {
        return PodAssessment::Remove;
    };

    let Some(ip) = status.and_then(|s| s.pod_ip.as_deref()).filter(|ip| !ip.is_empty()) else {
        return PodAssessment::Ignore("pod has no IP yet");
    };

    let port = container
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .map(|p| p.container_port)
        .unwrap_or(0);

    let mut metadata = BTreeMap::from([
        (METADATA_PROVISIONER.to_string(), PROVISIONER_POD.to_string()),
        (METADATA_VERSION.to_string(), version.clone()),
    ]);
    if let Some(link) = pod_key(pod) {
        metadata.insert(METADATA_POD_SELF_LINK.to_string(), link);
    }
    if let Some(context_path) = pod_labels.get(&labels.context_path) {
        metadata.insert(METADATA_CONTEXT_PATH.to_string(), context_path.clone());
    }

    let instance = Instance {
        instance_id: Instance::instance_id_for(ip, service, port),
        host_name: ip.to_string(),
        app: service.clone(),
        ip_addr: ip.to_string(),
        status: InstanceStatus::Up,
        overridden_status: InstanceStatus::Unknown,
        port: Port::enabled(port),
        secure_port: Port::disabled(SECURE_PORT),
        country_id: COUNTRY_ID,
        data_center_info: DataCenterInfo::own(),
        lease_info: LeaseInfo::started_at(now),
        metadata,
        home_page_url: format!("http://{ip}:{port}/"),
        status_page_url: format!("http://{ip}:{metrics_port}/actuator/info"),
        health_check_url: format!("http://{ip}:{metrics_port}/actuator/health"),
        vip_address: service.clone(),
        secure_vip_address: service.clone(),
        is_coordinating_discovery_server: true,
        last_updated_timestamp: now,
        last_dirty_timestamp: now,
        action_type: ACTION_ADDED.to_string(),
    };

    PodAssessment::Register(Box::new(instance))
}
