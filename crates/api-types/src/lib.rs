//! Shared API type definitions
//!
//! This crate contains the Eureka-compatible wire types served and accepted by
//! the register server: instances, applications and the application list
//! document, together with the well-known metadata keys used to tag the
//! provenance of an instance.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

/// Metadata key recording who created an instance (`pod` or `custom`).
pub const METADATA_PROVISIONER: &str = "provisioner";
/// Metadata key holding the `namespace/name` of the pod an instance came from.
pub const METADATA_POD_SELF_LINK: &str = "pod-self-link";
/// Metadata key holding the service version label.
pub const METADATA_VERSION: &str = "version";
/// Metadata key holding the servlet context path of the service.
pub const METADATA_CONTEXT_PATH: &str = "context-path";

/// Keys that stay pod-authoritative and are never overwritten by a custom
/// registration or a metadata patch.
pub const PROTECTED_METADATA_KEYS: [&str; 4] = [
    METADATA_PROVISIONER,
    METADATA_POD_SELF_LINK,
    METADATA_VERSION,
    METADATA_CONTEXT_PATH,
];

pub const PROVISIONER_POD: &str = "pod";
pub const PROVISIONER_CUSTOM: &str = "custom";

pub const DATA_CENTER_CLASS: &str = "com.netflix.appinfo.InstanceInfo$DefaultDataCenterInfo";
pub const DATA_CENTER_NAME: &str = "MyOwn";
pub const ACTION_ADDED: &str = "ADDED";

const DEFAULT_COUNTRY_ID: u64 = 8;
const DEFAULT_RENEWAL_INTERVAL_SECS: u64 = 10;
const DEFAULT_LEASE_DURATION_SECS: u64 = 90;

/// Returns true when `key` may not be changed by custom registrations.
pub fn is_protected_metadata_key(key: &str) -> bool {
    PROTECTED_METADATA_KEYS.contains(&key)
}

/// Instance status as understood by Eureka clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstanceStatus {
    #[default]
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
    #[serde(rename = "STARTING")]
    Starting,
    #[serde(rename = "OUT_OF_SERVICE")]
    OutOfService,
    #[serde(rename = "UNKNOWN", other)]
    Unknown,
}

impl InstanceStatus {
    fn unknown() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Starting => "STARTING",
            Self::OutOfService => "OUT_OF_SERVICE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A port together with its enabled flag, in Eureka's attribute notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Port {
    #[serde(
        rename = "@enabled",
        alias = "enabled",
        default,
        deserialize_with = "flexible_bool"
    )]
    pub enabled: bool,
    #[serde(rename = "$", alias = "port", default)]
    pub port: i32,
}

/// Eureka clients send `"@enabled": "true"`, hand-written bodies use a bool.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Text(text) => text.eq_ignore_ascii_case("true"),
    })
}

impl Port {
    pub fn enabled(port: i32) -> Self {
        Self {
            enabled: true,
            port,
        }
    }

    pub fn disabled(port: i32) -> Self {
        Self {
            enabled: false,
            port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataCenterInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "@class", alias = "class", default)]
    pub class: String,
}

impl DataCenterInfo {
    pub fn own() -> Self {
        Self {
            name: DATA_CENTER_NAME.to_string(),
            class: DATA_CENTER_CLASS.to_string(),
        }
    }
}

/// Lease bookkeeping. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaseInfo {
    pub renewal_interval_in_secs: u64,
    pub duration_in_secs: u64,
    pub registration_timestamp: u64,
    pub last_renewal_timestamp: u64,
    pub eviction_timestamp: u64,
    pub service_up_timestamp: u64,
}

impl LeaseInfo {
    /// Standard lease started at `now`.
    pub fn started_at(now: u64) -> Self {
        Self {
            renewal_interval_in_secs: DEFAULT_RENEWAL_INTERVAL_SECS,
            duration_in_secs: DEFAULT_LEASE_DURATION_SECS,
            registration_timestamp: now,
            last_renewal_timestamp: now,
            eviction_timestamp: 0,
            service_up_timestamp: now,
        }
    }
}

/// One addressable endpoint of a service, identified by `ip:app:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub ip_addr: String,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(rename = "overriddenstatus", default = "InstanceStatus::unknown")]
    pub overridden_status: InstanceStatus,
    #[serde(default)]
    pub port: Port,
    #[serde(default)]
    pub secure_port: Port,
    #[serde(default)]
    pub country_id: u64,
    #[serde(default)]
    pub data_center_info: DataCenterInfo,
    #[serde(default)]
    pub lease_info: LeaseInfo,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub home_page_url: String,
    #[serde(default)]
    pub status_page_url: String,
    #[serde(default)]
    pub health_check_url: String,
    #[serde(default)]
    pub vip_address: String,
    #[serde(default)]
    pub secure_vip_address: String,
    #[serde(default)]
    pub is_coordinating_discovery_server: bool,
    #[serde(default)]
    pub last_updated_timestamp: u64,
    #[serde(default)]
    pub last_dirty_timestamp: u64,
    #[serde(default)]
    pub action_type: String,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            host_name: String::new(),
            app: String::new(),
            ip_addr: String::new(),
            status: InstanceStatus::Up,
            overridden_status: InstanceStatus::Unknown,
            port: Port::default(),
            secure_port: Port::default(),
            country_id: 0,
            data_center_info: DataCenterInfo::default(),
            lease_info: LeaseInfo::default(),
            metadata: BTreeMap::new(),
            home_page_url: String::new(),
            status_page_url: String::new(),
            health_check_url: String::new(),
            vip_address: String::new(),
            secure_vip_address: String::new(),
            is_coordinating_discovery_server: false,
            last_updated_timestamp: 0,
            last_dirty_timestamp: 0,
            action_type: String::new(),
        }
    }
}

impl Instance {
    /// Builds the registry identity `ip:app:port`.
    pub fn instance_id_for(ip_addr: &str, app: &str, port: i32) -> String {
        format!("{ip_addr}:{app}:{port}")
    }

    /// Recomputes `instance_id` from the address fields.
    pub fn assign_instance_id(&mut self) {
        self.instance_id = Self::instance_id_for(&self.ip_addr, &self.app, self.port.port);
    }

    /// ConfigMap data keys may not contain `:`.
    pub fn config_map_key(instance_id: &str) -> String {
        instance_id.replace(':', "-")
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }

    pub fn provisioner(&self) -> Option<&str> {
        self.metadata.get(METADATA_PROVISIONER).map(String::as_str)
    }

    pub fn pod_self_link(&self) -> Option<&str> {
        self.metadata.get(METADATA_POD_SELF_LINK).map(String::as_str)
    }

    /// Defaults every field a brand-new custom registration may leave out.
    ///
    /// A registration timestamp already present is kept, everything else
    /// lease related restarts at `now`.
    pub fn fill_custom_defaults(&mut self, now: u64) {
        let port = self.port.port;
        if self.home_page_url.is_empty() {
            self.home_page_url = format!("http://{}:{}/", self.ip_addr, port);
        }
        if self.status_page_url.is_empty() {
            self.status_page_url = format!("http://{}:{}/actuator/info", self.ip_addr, port + 1);
        }
        if self.health_check_url.is_empty() {
            self.health_check_url =
                format!("http://{}:{}/actuator/health", self.ip_addr, port + 1);
        }
        self.metadata
            .entry(METADATA_PROVISIONER.to_string())
            .or_insert_with(|| PROVISIONER_CUSTOM.to_string());

        self.host_name = self.ip_addr.clone();
        self.overridden_status = InstanceStatus::Unknown;
        self.country_id = DEFAULT_COUNTRY_ID;
        self.action_type = ACTION_ADDED.to_string();
        self.is_coordinating_discovery_server = true;
        self.vip_address = self.app.clone();
        self.secure_vip_address = self.app.clone();
        self.data_center_info = DataCenterInfo::own();

        let registered_at = self.lease_info.registration_timestamp;
        self.lease_info = LeaseInfo::started_at(now);
        if registered_at != 0 {
            self.lease_info.registration_timestamp = registered_at;
        }
        self.last_updated_timestamp = now;
        self.last_dirty_timestamp = now;
    }

    /// Applies a custom overlay: status wins, unprotected metadata is merged
    /// key by key with the overlay winning.
    pub fn overlay(&mut self, custom: &Instance) {
        self.status = custom.status;
        self.merge_unprotected_metadata(&custom.metadata);
    }

    /// Merges unprotected metadata from `incoming`; protected keys keep their
    /// current values.
    pub fn merge_unprotected_metadata(&mut self, incoming: &BTreeMap<String, String>) {
        for (key, value) in incoming {
            if is_protected_metadata_key(key) {
                continue;
            }
            self.metadata.insert(key.clone(), value.clone());
        }
    }

    /// Applies a metadata patch. Empty values delete, protected keys are
    /// skipped. Returns the number of keys changed.
    pub fn patch_metadata(&mut self, patch: &BTreeMap<String, String>) -> usize {
        let mut changed = 0;
        for (key, value) in patch {
            if is_protected_metadata_key(key) {
                continue;
            }
            if value.is_empty() {
                if self.metadata.remove(key).is_some() {
                    changed += 1;
                }
            } else if self.metadata.get(key) != Some(value) {
                self.metadata.insert(key.clone(), value.clone());
                changed += 1;
            }
        }
        changed
    }
}

/// Named group of instances sharing an `app`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(rename = "instance", default)]
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Applications {
    #[serde(rename = "application", default)]
    pub applications: Vec<Application>,
    #[serde(rename = "apps__hashcode", default)]
    pub apps_hashcode: String,
    #[serde(rename = "versions__delta", default)]
    pub versions_delta: i64,
}

/// The document served on `GET /eureka/apps`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationResources {
    pub applications: Applications,
}

impl ApplicationResources {
    pub const APPS_HASHCODE: &'static str = "app_hashcode";
    pub const VERSIONS_DELTA: i64 = 2;

    pub fn new(applications: Vec<Application>) -> Self {
        Self {
            applications: Applications {
                applications,
                apps_hashcode: Self::APPS_HASHCODE.to_string(),
                versions_delta: Self::VERSIONS_DELTA,
            },
        }
    }

    /// Delta tracking is not implemented; clients always see "no changes".
    pub fn empty_delta() -> Self {
        Self::new(Vec::new())
    }

    pub fn find_instance(&self, instance_id: &str) -> Option<&Instance> {
        self.applications
            .applications
            .iter()
            .flat_map(|app| app.instances.iter())
            .find(|instance| instance.instance_id == instance_id)
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications
            .applications
            .iter()
            .find(|app| app.name == name)
    }
}

/// Registration body. Eureka clients wrap the instance in an `instance`
/// object, hand-written registrations usually don't.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RegistrationPayload {
    Wrapped { instance: Instance },
    Bare(Instance),
}

impl RegistrationPayload {
    pub fn into_instance(self) -> Instance {
        match self {
            Self::Wrapped { instance } | Self::Bare(instance) => instance,
        }
    }
}

/// Metadata patch body: instance id to key/value changes.
pub type MetadataBatch = BTreeMap<String, BTreeMap<String, String>>;

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn partial_payload_uses_eureka_defaults() {
        let payload: RegistrationPayload = serde_json::from_str(
            r#"{"ipAddr":"10.0.0.5","port":{"port":8080},"app":"orders"}"#,
        )
        .expect("should parse bare payload");
        let instance = payload.into_instance();

        assert_eq!(instance.ip_addr, "10.0.0.5");
        assert_eq!(instance.port.port, 8080);
        assert_eq!(instance.status, InstanceStatus::Up);
        assert_eq!(instance.overridden_status, InstanceStatus::Unknown);
    }

    #[test]
    fn wrapped_payload_is_unwrapped() {
        let payload: RegistrationPayload = serde_json::from_str(
            r#"{"instance":{"ipAddr":"10.0.0.6","port":{"$":9000,"@enabled":"true"},"status":"DOWN"}}"#,
        )
        .expect("should parse wrapped payload");
        let instance = payload.into_instance();

        assert_eq!(instance.ip_addr, "10.0.0.6");
        assert_eq!(instance.port.port, 9000);
        assert!(instance.port.enabled);
        assert_eq!(instance.status, InstanceStatus::Down);
    }

    #[test]
    fn unknown_status_falls_back() {
        let instance: Instance =
            serde_json::from_str(r#"{"status":"SLEEPING"}"#).expect("should parse");
        assert_eq!(instance.status, InstanceStatus::Unknown);
    }

    #[test]
    fn serializes_eureka_field_names() {
        let mut instance = Instance {
            ip_addr: "10.0.0.5".to_string(),
            app: "orders".to_string(),
            port: Port::enabled(8080),
            ..Default::default()
        };
        instance.assign_instance_id();
        let resources = ApplicationResources::new(vec![Application {
            name: "orders".to_string(),
            instances: vec![instance],
        }]);

        let value = serde_json::to_value(&resources).expect("should serialize");
        let apps = &value["applications"];
        assert_eq!(apps["apps__hashcode"], "app_hashcode");
        assert_eq!(apps["versions__delta"], 2);
        let first = &apps["application"][0]["instance"][0];
        assert_eq!(first["instanceId"], "10.0.0.5:orders:8080");
        assert_eq!(first["port"]["$"], 8080);
        assert_eq!(first["port"]["@enabled"], true);
        assert_eq!(first["overriddenstatus"], "UNKNOWN");
    }

    #[test]
    fn custom_defaults_keep_registration_timestamp() {
        let mut instance = Instance {
            ip_addr: "192.168.1.9".to_string(),
            app: "legacy".to_string(),
            port: Port::enabled(7000),
            ..Default::default()
        };
        instance.lease_info.registration_timestamp = 42;
        instance.fill_custom_defaults(1_000);

        assert_eq!(instance.home_page_url, "http://192.168.1.9:7000/");
        assert_eq!(
            instance.health_check_url,
            "http://192.168.1.9:7001/actuator/health"
        );
        assert_eq!(instance.provisioner(), Some(PROVISIONER_CUSTOM));
        assert_eq!(instance.lease_info.registration_timestamp, 42);
        assert_eq!(instance.lease_info.last_renewal_timestamp, 1_000);
        assert_eq!(instance.vip_address, "legacy");
    }

    #[test]
    fn patch_metadata_skips_protected_keys() {
        let mut instance = Instance::default();
        instance
            .metadata
            .insert(METADATA_VERSION.to_string(), "v1".to_string());
        instance
            .metadata
            .insert("zone".to_string(), "a".to_string());

        let patch = BTreeMap::from([
            (METADATA_VERSION.to_string(), "v2".to_string()),
            (METADATA_POD_SELF_LINK.to_string(), "x/y".to_string()),
            ("zone".to_string(), String::new()),
            ("weight".to_string(), "3".to_string()),
        ]);
        let changed = instance.patch_metadata(&patch);

        assert_eq!(changed, 2);
        assert_eq!(instance.metadata.get(METADATA_VERSION).map(String::as_str), Some("v1"));
        assert!(!instance.metadata.contains_key(METADATA_POD_SELF_LINK));
        assert!(!instance.metadata.contains_key("zone"));
        assert_eq!(instance.metadata.get("weight").map(String::as_str), Some("3"));
    }

    #[test]
    fn config_map_key_replaces_colons() {
        assert_eq!(
            Instance::config_map_key("10.0.0.5:orders:8080"),
            "10.0.0.5-orders-8080"
        );
    }
}
