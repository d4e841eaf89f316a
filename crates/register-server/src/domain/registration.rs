//! Out-of-band registrations pushed over HTTP
//!
//! Every mutation is written to the [`RegistryArchive`] first and applied to
//! the [`ApplicationRepository`] only once the write succeeded, so memory
//! never runs ahead of the durable record.

use core::error::Error;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use api_types::Instance;
use api_types::MetadataBatch;
use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::archive;
use super::archive::ArchiveError;
use super::now_millis;
use super::repository::custom_origin_key;
use super::ApplicationRepository;
use super::RegistryArchive;
use crate::infrastructure::k8s::pod_info::split_key;
use crate::infrastructure::k8s::PodStore;

#[derive(Debug, derive_more::Display)]
pub enum RegistrationError {
    #[display("Invalid registration payload: {message}")]
    InvalidPayload { message: String },
    #[display("Failed to persist registry state")]
    Persistence,
    #[display("Failed to serialize instance {instance_id}")]
    Serialization { instance_id: String },
}

impl Error for RegistrationError {}

fn persistence_error(report: Report<ArchiveError>) -> Report<RegistrationError> {
    let context = match report.current_context() {
        ArchiveError::Serialization { instance_id } => RegistrationError::Serialization {
            instance_id: instance_id.clone(),
        },
        ArchiveError::Read { .. } | ArchiveError::Write { .. } => RegistrationError::Persistence,
    };
    report.change_context(context)
}

/// Outcome of start-up recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub restored: usize,
    pub removed: usize,
}

pub struct RegistrationService {
    repository: Arc<ApplicationRepository>,
    archive: Arc<RegistryArchive>,
    pods: Arc<dyn PodStore>,
}

impl RegistrationService {
    pub fn new(
        repository: Arc<ApplicationRepository>,
        archive: Arc<RegistryArchive>,
        pods: Arc<dyn PodStore>,
    ) -> Self {
        Self {
            repository,
            archive,
            pods,
        }
    }

    /// Registers `instance` under `app_name`.
    ///
    /// Returns `Ok(None)` when the declared port is zero; such payloads are
    /// dropped without touching any state.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::InvalidPayload`] if the payload has no address
    /// - [`RegistrationError::Persistence`] if the archive cannot be written
    #[tracing::instrument(skip(self, instance), fields(ip = %instance.ip_addr, port = instance.port.port))]
    pub async fn register(
        &self,
        app_name: &str,
        mut instance: Instance,
    ) -> Result<Option<Instance>, Report<RegistrationError>> {
        if instance.port.port == 0 {
            debug!("ignoring registration with port 0");
            return Ok(None);
        }
        if instance.ip_addr.is_empty() || app_name.is_empty() {
            return Err(Report::new(RegistrationError::InvalidPayload {
                message: "ipAddr and application name are required".to_string(),
            }));
        }

        instance.app = app_name.to_string();
        instance.assign_instance_id();
        let resolved = self.resolve(instance, now_millis());

        self.archive.put(&resolved).await.map_err(persistence_error)?;
        self.repository.store_custom_instance(resolved.clone());

        info!(instance_id = %resolved.instance_id, status = %resolved.status, "custom instance registered");
        Ok(Some(resolved))
    }

    /// Drops a custom registration. The archive entry goes first; when that
    /// fails the in-memory record is kept.
    pub async fn delete(
        &self,
        instance_id: &str,
    ) -> Result<Option<Instance>, Report<RegistrationError>> {
        self.archive
            .remove(instance_id)
            .await
            .map_err(persistence_error)?;

        let removed = self
            .repository
            .delete_instance(&custom_origin_key(instance_id));
        match &removed {
            Some(_) => info!(instance_id, "custom instance deleted"),
            None => debug!(instance_id, "no custom instance to delete"),
        }
        Ok(removed)
    }

    /// Patches metadata of several instances with one archive write.
    ///
    /// Empty values delete a key; protected keys are never changed. Unknown
    /// instance ids are skipped.
    pub async fn update_metadata(
        &self,
        batch: &MetadataBatch,
    ) -> Result<Vec<Instance>, Report<RegistrationError>> {
        let mut updated = Vec::with_capacity(batch.len());
        for (instance_id, patch) in batch {
            let Some(mut instance) = self
                .repository
                .custom_instance(instance_id)
                .or_else(|| self.repository.instance(instance_id))
            else {
                warn!(instance_id = %instance_id, "metadata update for unknown instance");
                continue;
            };
            let changed = instance.patch_metadata(patch);
            debug!(instance_id = %instance_id, changed, "metadata patched");
            updated.push(instance);
        }

        self.archive
            .apply(&updated, &[])
            .await
            .map_err(persistence_error)?;
        for instance in &updated {
            self.repository.store_custom_instance(instance.clone());
        }
        Ok(updated)
    }

    /// Restores custom registrations from the archive at start-up.
    ///
    /// Records pointing at pods that no longer exist are dropped from the
    /// archive instead of being restored.
    #[tracing::instrument(skip(self), fields(archive = %self.archive.name()))]
    pub async fn init_from_config_map(&self) -> Result<RecoverySummary, Report<RegistrationError>> {
        let data = self
            .archive
            .ensure_exists()
            .await
            .map_err(persistence_error)?;

        let now = now_millis();
        let mut restored = Vec::new();
        let mut stale_keys = Vec::new();

        for (key, value) in &data {
            let mut instance = match archive::decode(value) {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable registry entry");
                    continue;
                }
            };

            if let Some(link) = instance.pod_self_link() {
                if !self.pod_exists(link).await {
                    info!(key = %key, pod = %link, "dropping registry entry of vanished pod");
                    stale_keys.push(key.clone());
                    continue;
                }
            }
            if instance.port.port == 0 || instance.ip_addr.is_empty() {
                warn!(key = %key, "skipping registry entry without an address");
                continue;
            }

            if instance.instance_id.is_empty() {
                instance.assign_instance_id();
            }
            if Instance::config_map_key(&instance.instance_id) != *key {
                stale_keys.push(key.clone());
            }
            restored.push(self.resolve(instance, now));
        }

        self.archive
            .apply(&restored, &stale_keys)
            .await
            .map_err(persistence_error)?;

        let summary = RecoverySummary {
            restored: restored.len(),
            removed: stale_keys.len(),
        };
        for instance in restored {
            self.repository.store_custom_instance(instance);
        }
        info!(
            restored = summary.restored,
            removed = summary.removed,
            "custom registrations recovered"
        );
        Ok(summary)
    }

    /// Re-derives the custom table from archive content written elsewhere.
    pub fn sync_from_archive(&self, data: &BTreeMap<String, String>) {
        let mut present = HashSet::with_capacity(data.len());
        for (key, value) in data {
            match archive::decode(value) {
                Ok(instance) if !instance.instance_id.is_empty() => {
                    present.insert(instance.instance_id.clone());
                    self.repository.store_custom_instance(instance);
                }
                Ok(_) => warn!(key = %key, "registry entry without instance id"),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable registry entry"),
            }
        }

        for instance_id in self.repository.custom_instance_ids() {
            if !present.contains(&instance_id) {
                debug!(instance_id = %instance_id, "custom instance removed by another replica");
                self.repository.remove_custom_instance(&instance_id);
            }
        }
    }

    /// Builds the record to store for an incoming registration.
    fn resolve(&self, incoming: Instance, now: u64) -> Instance {
        if let Some(mut pod) = self.repository.instance(&incoming.instance_id) {
            pod.merge_unprotected_metadata(&incoming.metadata);
            pod.status = incoming.status;
            return pod;
        }

        let mut instance = incoming;
        if let Some(existing) = self.repository.custom_instance(&instance.instance_id) {
            instance.lease_info.registration_timestamp =
                existing.lease_info.registration_timestamp;
        }
        instance.fill_custom_defaults(now);
        instance
    }

    /// Lookup failures count as "exists": a record is only dropped when the
    /// cluster confirms the pod is gone.
    async fn pod_exists(&self, link: &str) -> bool {
        let Some((namespace, name)) = split_key(link) else {
            return false;
        };
        match self.pods.get(namespace, name).await {
            Ok(pod) => pod.is_some(),
            Err(e) => {
                warn!(pod = %link, error = ?e, "pod lookup failed, keeping registry entry");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use api_types::InstanceStatus;
    use api_types::Port;
    use api_types::METADATA_POD_SELF_LINK;
    use api_types::METADATA_PROVISIONER;
    use api_types::METADATA_VERSION;
    use api_types::PROVISIONER_CUSTOM;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::k8s::mock::InMemoryConfigMaps;
    use crate::infrastructure::k8s::mock::InMemoryPods;
    use crate::infrastructure::k8s::mock::PodFixture;

    const NAME: &str = "register-server";

    struct Fixture {
        config_maps: Arc<InMemoryConfigMaps>,
        pods: Arc<InMemoryPods>,
        repository: Arc<ApplicationRepository>,
        service: RegistrationService,
    }

    fn fixture() -> Fixture {
        let config_maps = Arc::new(InMemoryConfigMaps::new());
        let pods = Arc::new(InMemoryPods::new());
        let repository = Arc::new(ApplicationRepository::new());
        let archive = Arc::new(RegistryArchive::new(config_maps.clone(), NAME));
        let service = RegistrationService::new(repository.clone(), archive, pods.clone());
        Fixture {
            config_maps,
            pods,
            repository,
            service,
        }
    }

    fn payload(ip: &str, port: i32) -> Instance {
        Instance {
            ip_addr: ip.to_string(),
            port: Port::enabled(port),
            ..Default::default()
        }
    }

    fn pod_instance(ip: &str, app: &str, port: i32, link: &str) -> Instance {
        let mut instance = payload(ip, port);
        instance.app = app.to_string();
        instance.assign_instance_id();
        instance.metadata = BTreeMap::from([
            (METADATA_PROVISIONER.to_string(), "pod".to_string()),
            (METADATA_POD_SELF_LINK.to_string(), link.to_string()),
            (METADATA_VERSION.to_string(), "v1".to_string()),
        ]);
        instance
    }

    #[test(tokio::test)]
    async fn zero_port_is_ignored() {
        let f = fixture();

        let result = f
            .service
            .register("orders", payload("10.0.0.5", 0))
            .await
            .expect("should not fail");

        assert_eq!(result, None);
        assert!(!f.config_maps.contains(NAME));
    }

    #[test(tokio::test)]
    async fn brand_new_registration_is_defaulted_and_archived() {
        let f = fixture();

        let stored = f
            .service
            .register("legacy-erp", payload("192.168.1.9", 7000))
            .await
            .expect("should register")
            .expect("should not be ignored");

        assert_eq!(stored.instance_id, "192.168.1.9:legacy-erp:7000");
        assert_eq!(stored.provisioner(), Some(PROVISIONER_CUSTOM));
        assert_eq!(stored.home_page_url, "http://192.168.1.9:7000/");
        assert_eq!(
            f.repository.origin("custom/192.168.1.9:legacy-erp:7000"),
            Some(stored.instance_id.clone())
        );
        let data = f.config_maps.data(NAME).expect("archive should exist");
        let archived = archive::decode(&data["192.168.1.9-legacy-erp-7000"]).expect("valid json");
        assert_eq!(archived, stored);
    }

    #[test(tokio::test)]
    async fn repeat_registration_keeps_registration_timestamp() {
        let f = fixture();
        let first = f
            .service
            .register("legacy-erp", payload("192.168.1.9", 7000))
            .await
            .expect("should register")
            .expect("stored");

        let mut again = payload("192.168.1.9", 7000);
        again.status = InstanceStatus::Down;
        again.lease_info.registration_timestamp = 1;
        let second = f
            .service
            .register("legacy-erp", again)
            .await
            .expect("should register")
            .expect("stored");

        assert_eq!(
            second.lease_info.registration_timestamp,
            first.lease_info.registration_timestamp
        );
        assert_eq!(second.status, InstanceStatus::Down);
    }

    #[test(tokio::test)]
    async fn registration_over_pod_keeps_protected_metadata() {
        let f = fixture();
        let pod = pod_instance("10.0.0.5", "orders", 8080, "prod/orders-0");
        f.repository.register(pod.clone(), "prod/orders-0");

        let mut incoming = payload("10.0.0.5", 8080);
        incoming.status = InstanceStatus::OutOfService;
        incoming.metadata = BTreeMap::from([
            (METADATA_VERSION.to_string(), "v2".to_string()),
            ("zone".to_string(), "b".to_string()),
        ]);
        let stored = f
            .service
            .register("orders", incoming)
            .await
            .expect("should register")
            .expect("stored");

        assert_eq!(stored.status, InstanceStatus::OutOfService);
        assert_eq!(stored.metadata.get(METADATA_VERSION).map(String::as_str), Some("v1"));
        assert_eq!(stored.metadata.get("zone").map(String::as_str), Some("b"));
        assert_eq!(stored.home_page_url, pod.home_page_url);
        // pod record is untouched
        assert_eq!(f.repository.instance(&pod.instance_id), Some(pod));
    }

    #[test(tokio::test)]
    async fn failed_archive_write_leaves_memory_untouched() {
        let f = fixture();
        f.config_maps.insert(NAME, BTreeMap::new());
        f.config_maps.fail_updates(1);

        let err = f
            .service
            .register("orders", payload("10.0.0.5", 8080))
            .await
            .expect_err("should fail");

        assert!(matches!(err.current_context(), RegistrationError::Persistence));
        assert_eq!(f.repository.custom_instance("10.0.0.5:orders:8080"), None);
    }

    #[test(tokio::test)]
    async fn delete_removes_archive_entry_then_memory() {
        let f = fixture();
        f.service
            .register("orders", payload("10.0.0.5", 8080))
            .await
            .expect("should register");

        f.config_maps.fail_updates(1);
        f.service
            .delete("10.0.0.5:orders:8080")
            .await
            .expect_err("archive failure should abort");
        assert!(f.repository.custom_instance("10.0.0.5:orders:8080").is_some());

        let removed = f
            .service
            .delete("10.0.0.5:orders:8080")
            .await
            .expect("should delete");
        assert!(removed.is_some());
        assert!(f.repository.get_instances_by_service("orders").is_empty());
        assert!(f.config_maps.data(NAME).unwrap_or_default().is_empty());
    }

    #[test(tokio::test)]
    async fn metadata_batch_skips_protected_keys_and_writes_once() {
        let f = fixture();
        let pod = pod_instance("10.0.0.5", "orders", 8080, "prod/orders-0");
        f.repository.register(pod.clone(), "prod/orders-0");
        f.service
            .register("legacy-erp", payload("192.168.1.9", 7000))
            .await
            .expect("should register");
        let writes_before = f.config_maps.update_calls();

        let batch = MetadataBatch::from([
            (
                pod.instance_id.clone(),
                BTreeMap::from([
                    (METADATA_VERSION.to_string(), "v2".to_string()),
                    (METADATA_POD_SELF_LINK.to_string(), "x/y".to_string()),
                    ("weight".to_string(), "5".to_string()),
                ]),
            ),
            (
                "192.168.1.9:legacy-erp:7000".to_string(),
                BTreeMap::from([("weight".to_string(), "1".to_string())]),
            ),
            ("missing:app:1".to_string(), BTreeMap::new()),
        ]);
        let updated = f
            .service
            .update_metadata(&batch)
            .await
            .expect("should update");

        assert_eq!(updated.len(), 2);
        assert_eq!(f.config_maps.update_calls(), writes_before + 1);
        let overlay = f
            .repository
            .custom_instance(&pod.instance_id)
            .expect("overlay stored");
        assert_eq!(overlay.metadata.get(METADATA_VERSION).map(String::as_str), Some("v1"));
        assert_eq!(overlay.pod_self_link(), Some("prod/orders-0"));
        assert_eq!(overlay.metadata.get("weight").map(String::as_str), Some("5"));
        assert_eq!(f.repository.instance(&pod.instance_id), Some(pod));
    }

    #[test(tokio::test)]
    async fn recovery_creates_missing_archive() {
        let f = fixture();

        let summary = f
            .service
            .init_from_config_map()
            .await
            .expect("should recover");

        assert_eq!(summary, RecoverySummary::default());
        assert!(f.config_maps.contains(NAME));
    }

    #[test(tokio::test)]
    async fn recovery_skips_records_of_vanished_pods() {
        let f = fixture();
        f.pods
            .insert(PodFixture::new("prod", "orders-0", "10.0.0.5", "orders").build());

        let alive = pod_instance("10.0.0.5", "orders", 8080, "prod/orders-0");
        let gone = pod_instance("10.0.0.6", "orders", 8080, "prod/orders-1");
        let broken = pod_instance("10.0.0.7", "orders", 8080, "not-a-link");
        let mut custom = payload("192.168.1.9", 7000);
        custom.app = "legacy-erp".to_string();
        custom.assign_instance_id();

        let data = [&alive, &gone, &broken, &custom]
            .into_iter()
            .map(|i| archive::encode(i).expect("should encode"))
            .chain([("garbage".to_string(), "{not json".to_string())])
            .collect();
        f.config_maps.insert(NAME, data);

        let summary = f
            .service
            .init_from_config_map()
            .await
            .expect("should recover");

        assert_eq!(summary, RecoverySummary { restored: 2, removed: 2 });
        assert!(f.repository.custom_instance(&alive.instance_id).is_some());
        assert!(f.repository.custom_instance(&custom.instance_id).is_some());
        assert!(f.repository.custom_instance(&gone.instance_id).is_none());
        let remaining = f.config_maps.data(NAME).expect("archive exists");
        assert!(!remaining.contains_key("10.0.0.6-orders-8080"));
        assert!(!remaining.contains_key("10.0.0.7-orders-8080"));
        assert!(remaining.contains_key("10.0.0.5-orders-8080"));
        assert!(remaining.contains_key("garbage"));
    }

    #[test(tokio::test)]
    async fn recovery_keeps_records_when_pod_lookup_fails() {
        let f = fixture();
        let record = pod_instance("10.0.0.5", "orders", 8080, "prod/orders-0");
        f.config_maps.insert(
            NAME,
            [archive::encode(&record).expect("should encode")].into(),
        );
        f.pods.set_fail_lookups(true);

        let summary = f
            .service
            .init_from_config_map()
            .await
            .expect("should recover");

        assert_eq!(summary.restored, 1);
        assert!(f.repository.custom_instance(&record.instance_id).is_some());
    }

    #[test(tokio::test)]
    async fn archive_sync_mirrors_other_replicas() {
        let f = fixture();
        f.service
            .register("orders", payload("10.0.0.5", 8080))
            .await
            .expect("should register");

        let mut other = payload("10.0.0.8", 9000);
        other.app = "billing".to_string();
        other.assign_instance_id();
        let data = [archive::encode(&other).expect("should encode")].into();

        f.service.sync_from_archive(&data);

        assert_eq!(f.repository.custom_instance_ids(), vec![other.instance_id.clone()]);
        assert_eq!(f.repository.origin("custom/10.0.0.5:orders:8080"), None);
        assert!(f.repository.origin(&custom_origin_key(&other.instance_id)).is_some());
    }
}
