//! Concurrent in-memory registry of pod-derived and custom instances

use std::collections::HashMap;
use std::sync::Arc;

use api_types::Application;
use api_types::ApplicationResources;
use api_types::Instance;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Origin keys of custom registrations start with this prefix.
pub const CUSTOM_ORIGIN_PREFIX: &str = "custom/";

pub fn custom_origin_key(instance_id: &str) -> String {
    format!("{CUSTOM_ORIGIN_PREFIX}{instance_id}")
}

pub fn is_custom_origin(origin_key: &str) -> bool {
    origin_key.starts_with(CUSTOM_ORIGIN_PREFIX)
}

/// Registry tables shared by the reconciler, the registration service and
/// the HTTP handlers. Reads merge on clones; stored records are never
/// mutated in place.
#[derive(Debug, Clone, Default)]
pub struct ApplicationRepository {
    /// instance id -> pod-derived instance
    instances: Arc<DashMap<String, Instance>>,
    /// instance id -> custom registration or overlay
    custom_instances: Arc<DashMap<String, Instance>>,
    /// origin key (`namespace/name` or `custom/<id>`) -> instance id
    origins: Arc<DashMap<String, String>>,
    /// legacy application table, only read
    applications: Arc<DashMap<String, Application>>,
}

impl ApplicationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pod-derived instance under `origin_key`.
    ///
    /// Returns `false` without touching the stored instance when the origin
    /// key is already known.
    pub fn register(&self, instance: Instance, origin_key: &str) -> bool {
        match self.origins.entry(origin_key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let instance_id = instance.instance_id.clone();
                self.instances.insert(instance_id.clone(), instance);
                vacant.insert(instance_id);
                true
            }
        }
    }

    /// Removes whatever `origin_key` resolves to and returns it.
    ///
    /// Dropping a pod also drops the custom overlay registered for the same
    /// instance id.
    pub fn delete_instance(&self, origin_key: &str) -> Option<Instance> {
        let Some((_, instance_id)) = self.origins.remove(origin_key) else {
            debug!(origin_key, "origin key not registered, nothing to delete");
            return None;
        };

        if is_custom_origin(origin_key) {
            return self
                .custom_instances
                .remove(&instance_id)
                .map(|(_, instance)| instance);
        }

        self.remove_custom_instance(&instance_id);
        self.instances
            .remove(&instance_id)
            .map(|(_, instance)| instance)
    }

    /// Every visible instance, grouped by application.
    pub fn get_application_resources(&self) -> ApplicationResources {
        let mut applications = group_by_app(self.merged_instances());
        applications.extend(self.applications.iter().map(|entry| entry.value().clone()));
        ApplicationResources::new(applications)
    }

    /// UP instances of one service.
    pub fn get_instances_by_service(&self, service: &str) -> Vec<Instance> {
        let legacy = self
            .applications
            .get(service)
            .map(|app| app.instances.clone())
            .unwrap_or_default();

        self.merged_instances()
            .into_iter()
            .chain(legacy)
            .filter(|instance| instance.app == service && instance.is_up())
            .collect()
    }

    pub fn get_instance_ips_by_service(&self, service: &str) -> Vec<String> {
        self.get_instances_by_service(service)
            .into_iter()
            .map(|instance| instance.home_page_url)
            .collect()
    }

    /// Looks the instance up in the legacy table; a default instance when
    /// absent.
    pub fn renew(&self, app: &str, instance_id: &str) -> Instance {
        self.applications
            .get(app)
            .and_then(|application| {
                application
                    .instances
                    .iter()
                    .find(|instance| instance.instance_id == instance_id)
                    .cloned()
            })
            .unwrap_or_default()
    }

    pub fn put_application(&self, application: Application) {
        self.applications
            .insert(application.name.clone(), application);
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.value().clone())
    }

    pub fn custom_instance(&self, instance_id: &str) -> Option<Instance> {
        self.custom_instances
            .get(instance_id)
            .map(|entry| entry.value().clone())
    }

    /// Stores a custom record and records its `custom/<id>` origin key.
    pub fn store_custom_instance(&self, instance: Instance) {
        let instance_id = instance.instance_id.clone();
        self.origins
            .insert(custom_origin_key(&instance_id), instance_id.clone());
        self.custom_instances.insert(instance_id, instance);
    }

    pub fn remove_custom_instance(&self, instance_id: &str) -> Option<Instance> {
        self.origins
            .remove_if(&custom_origin_key(instance_id), |_, id| id == instance_id);
        self.custom_instances
            .remove(instance_id)
            .map(|(_, instance)| instance)
    }

    pub fn origin(&self, origin_key: &str) -> Option<String> {
        self.origins
            .get(origin_key)
            .map(|entry| entry.value().clone())
    }

    pub fn custom_instance_ids(&self) -> Vec<String> {
        self.custom_instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Ids of custom records whose `pod-self-link` names `pod_key`.
    ///
    /// Records restored at start-up carry the link even when their pod never
    /// registered in this process.
    pub fn custom_ids_linked_to(&self, pod_key: &str) -> Vec<String> {
        self.custom_instances
            .iter()
            .filter(|entry| entry.value().pod_self_link() == Some(pod_key))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Origin keys of every registered pod.
    pub fn pod_origin_keys(&self) -> Vec<String> {
        self.origins
            .iter()
            .filter(|entry| !is_custom_origin(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn merged_instances(&self) -> Vec<Instance> {
        let mut merged: Vec<Instance> = self
            .instances
            .iter()
            .map(|entry| {
                let mut instance = entry.value().clone();
                if let Some(custom) = self.custom_instances.get(entry.key()) {
                    instance.overlay(custom.value());
                }
                instance
            })
            .collect();

        merged.extend(
            self.custom_instances
                .iter()
                .filter(|entry| !self.instances.contains_key(entry.key()))
                .map(|entry| entry.value().clone()),
        );
        merged
    }
}

fn group_by_app(instances: Vec<Instance>) -> Vec<Application> {
    let mut applications: Vec<Application> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for instance in instances {
        match positions.get(&instance.app) {
            Some(&index) => applications[index].instances.push(instance),
            None => {
                positions.insert(instance.app.clone(), applications.len());
                applications.push(Application {
                    name: instance.app.clone(),
                    instances: vec![instance],
                });
            }
        }
    }
    applications
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use api_types::InstanceStatus;
    use api_types::Port;
    use api_types::METADATA_VERSION;
    use similar_asserts::assert_eq;

    use super::*;

    fn instance(ip: &str, app: &str, port: i32) -> Instance {
        let mut instance = Instance {
            ip_addr: ip.to_string(),
            app: app.to_string(),
            port: Port::enabled(port),
            home_page_url: format!("http://{ip}:{port}/"),
            ..Default::default()
        };
        instance.assign_instance_id();
        instance
    }

    #[test]
    fn registration_is_idempotent_per_origin_key() {
        let repository = ApplicationRepository::new();
        let first = instance("10.0.0.5", "orders", 8080);
        let mut second = first.clone();
        second.status = InstanceStatus::Down;

        assert!(repository.register(first.clone(), "prod/orders-0"));
        assert!(!repository.register(second, "prod/orders-0"));

        assert_eq!(repository.instance(&first.instance_id), Some(first));
        assert_eq!(repository.pod_origin_keys(), vec!["prod/orders-0".to_string()]);
    }

    #[test]
    fn deleted_instance_is_no_longer_served() {
        let repository = ApplicationRepository::new();
        let orders = instance("10.0.0.5", "orders", 8080);
        repository.register(orders.clone(), "prod/orders-0");

        let removed = repository.delete_instance("prod/orders-0");

        assert_eq!(removed, Some(orders));
        assert!(repository.get_instances_by_service("orders").is_empty());
        assert_eq!(repository.delete_instance("prod/orders-0"), None);
    }

    #[test]
    fn custom_overlay_wins_over_pod_record() {
        let repository = ApplicationRepository::new();
        let mut pod = instance("10.0.0.5", "foo", 8080);
        pod.metadata
            .insert(METADATA_VERSION.to_string(), "v1".to_string());
        repository.register(pod.clone(), "prod/foo-0");

        let mut custom = pod.clone();
        custom.status = InstanceStatus::Down;
        custom.metadata = BTreeMap::from([
            ("k".to_string(), "v".to_string()),
            (METADATA_VERSION.to_string(), "v9".to_string()),
        ]);
        repository.store_custom_instance(custom);

        let resources = repository.get_application_resources();
        let merged = resources
            .find_instance(&pod.instance_id)
            .expect("merged instance should be served");
        assert_eq!(merged.status, InstanceStatus::Down);
        assert_eq!(merged.metadata.get("k").map(String::as_str), Some("v"));
        assert_eq!(
            merged.metadata.get(METADATA_VERSION).map(String::as_str),
            Some("v1")
        );
        assert_eq!(resources.applications.applications.len(), 1);
        // stored pod record untouched
        assert_eq!(repository.instance(&pod.instance_id), Some(pod));
    }

    #[test]
    fn pure_custom_instance_gets_its_own_application() {
        let repository = ApplicationRepository::new();
        repository.register(instance("10.0.0.5", "orders", 8080), "prod/orders-0");
        repository.store_custom_instance(instance("192.168.1.9", "legacy-erp", 7000));

        let resources = repository.get_application_resources();
        let erp = resources
            .application("legacy-erp")
            .expect("custom app should be listed");
        assert_eq!(erp.instances.len(), 1);
        assert_eq!(erp.instances[0].instance_id, "192.168.1.9:legacy-erp:7000");
    }

    #[test]
    fn instances_by_service_only_returns_up() {
        let repository = ApplicationRepository::new();
        repository.register(instance("10.0.0.5", "orders", 8080), "prod/orders-0");
        repository.register(instance("10.0.0.6", "orders", 8080), "prod/orders-1");
        let mut down = instance("10.0.0.6", "orders", 8080);
        down.status = InstanceStatus::Down;
        repository.store_custom_instance(down);

        assert_eq!(
            repository.get_instance_ips_by_service("orders"),
            vec!["http://10.0.0.5:8080/".to_string()]
        );
    }

    #[test]
    fn deleting_pod_drops_its_overlay() {
        let repository = ApplicationRepository::new();
        let pod = instance("10.0.0.5", "orders", 8080);
        repository.register(pod.clone(), "prod/orders-0");
        repository.store_custom_instance(pod.clone());

        repository.delete_instance("prod/orders-0");

        assert_eq!(repository.custom_instance(&pod.instance_id), None);
        assert_eq!(repository.origin(&custom_origin_key(&pod.instance_id)), None);
        assert!(repository.get_application_resources().applications.applications.is_empty());
    }

    #[test]
    fn custom_origin_delete_leaves_pod_record() {
        let repository = ApplicationRepository::new();
        let pod = instance("10.0.0.5", "orders", 8080);
        repository.register(pod.clone(), "prod/orders-0");
        repository.store_custom_instance(pod.clone());

        let removed = repository.delete_instance(&custom_origin_key(&pod.instance_id));

        assert!(removed.is_some());
        assert_eq!(repository.instance(&pod.instance_id), Some(pod));
    }

    #[test]
    fn renew_reads_legacy_table() {
        let repository = ApplicationRepository::new();
        let legacy = instance("10.1.0.1", "billing", 9090);
        repository.put_application(Application {
            name: "billing".to_string(),
            instances: vec![legacy.clone()],
        });

        assert_eq!(repository.renew("billing", &legacy.instance_id), legacy);
        assert_eq!(repository.renew("billing", "missing"), Instance::default());
        assert_eq!(repository.get_instances_by_service("billing"), vec![legacy]);
    }
}
