//! Durable record of custom instances, kept in one ConfigMap
//!
//! Each data entry maps the sanitised instance id to the JSON encoded
//! instance. Writes are read-modify-write cycles guarded by the ConfigMap's
//! `resourceVersion`.

use core::error::Error;
use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::Instance;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;
use tracing::info;

use crate::infrastructure::k8s::ConfigMapStore;

const MAX_WRITE_ATTEMPTS: usize = 5;

#[derive(Debug, derive_more::Display)]
pub enum ArchiveError {
    #[display("Failed to read registry ConfigMap {name}")]
    Read { name: String },
    #[display("Failed to write registry ConfigMap {name}")]
    Write { name: String },
    #[display("Failed to serialize instance {instance_id}")]
    Serialization { instance_id: String },
}

impl Error for ArchiveError {}

pub struct RegistryArchive {
    store: Arc<dyn ConfigMapStore>,
    name: String,
}

impl RegistryArchive {
    pub fn new(store: Arc<dyn ConfigMapStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// Name of the registry ConfigMap.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current archive content, `None` when the ConfigMap does not exist.
    pub async fn load(&self) -> Result<Option<BTreeMap<String, String>>, Report<ArchiveError>> {
        let config_map = self
            .store
            .get(&self.name)
            .await
            .change_context_lazy(|| self.read_error())?;
        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }

    /// Loads the archive, creating an empty one on first boot.
    pub async fn ensure_exists(&self) -> Result<BTreeMap<String, String>, Report<ArchiveError>> {
        if let Some(data) = self.load().await? {
            return Ok(data);
        }

        info!(name = %self.name, "registry ConfigMap missing, creating an empty one");
        match self.store.create(&self.empty_config_map()).await {
            Ok(created) => Ok(created.data.unwrap_or_default()),
            // another replica won the race
            Err(e) if e.current_context().is_conflict() => {
                Ok(self.load().await?.unwrap_or_default())
            }
            Err(e) => Err(e.change_context(self.write_error())),
        }
    }

    pub async fn put(&self, instance: &Instance) -> Result<(), Report<ArchiveError>> {
        self.apply(std::slice::from_ref(instance), &[]).await
    }

    pub async fn remove(&self, instance_id: &str) -> Result<(), Report<ArchiveError>> {
        self.apply(&[], &[Instance::config_map_key(instance_id)])
            .await
    }

    /// Writes `upserts` and drops `removed_keys` (already sanitised) in a
    /// single update, retrying on conflicting writes.
    pub async fn apply(
        &self,
        upserts: &[Instance],
        removed_keys: &[String],
    ) -> Result<(), Report<ArchiveError>> {
        let encoded = upserts
            .iter()
            .map(encode)
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        if encoded.is_empty() && removed_keys.is_empty() {
            return Ok(());
        }

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get(&self.name)
                .await
                .change_context_lazy(|| self.read_error())?;

            let result = match current {
                Some(mut config_map) => {
                    let data = config_map.data.get_or_insert_with(BTreeMap::new);
                    for key in removed_keys {
                        data.remove(key);
                    }
                    data.extend(encoded.clone());
                    self.store.update(&config_map).await
                }
                None => {
                    let mut config_map = self.empty_config_map();
                    config_map.data = Some(encoded.clone());
                    self.store.create(&config_map).await
                }
            };

            match result {
                Ok(_) => return Ok(()),
                Err(e) if e.current_context().is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(name = %self.name, attempt, "registry ConfigMap changed underneath, retrying");
                }
                Err(e) => {
                    return Err(e
                        .change_context(self.write_error())
                        .attach_printable(format!("attempt {attempt} of {MAX_WRITE_ATTEMPTS}")))
                }
            }
        }

        Err(Report::new(self.write_error()).attach_printable("conflict retries exhausted"))
    }

    fn empty_config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::new()),
            ..Default::default()
        }
    }

    fn read_error(&self) -> ArchiveError {
        ArchiveError::Read {
            name: self.name.clone(),
        }
    }

    fn write_error(&self) -> ArchiveError {
        ArchiveError::Write {
            name: self.name.clone(),
        }
    }
}

/// Encodes an instance as its archive entry.
pub fn encode(instance: &Instance) -> Result<(String, String), Report<ArchiveError>> {
    let value =
        serde_json::to_string(instance).change_context_lazy(|| ArchiveError::Serialization {
            instance_id: instance.instance_id.clone(),
        })?;
    Ok((Instance::config_map_key(&instance.instance_id), value))
}

pub fn decode(value: &str) -> Result<Instance, serde_json::Error> {
    serde_json::from_str(value)
}
