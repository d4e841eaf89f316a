//! Registry domain: the in-memory repository, the durable archive and the
//! services that keep them in step with the cluster and with API callers.

pub mod archive;
pub mod reconciler;
pub mod registration;
pub mod repository;

pub use archive::ArchiveError;
pub use archive::RegistryArchive;
pub use reconciler::PodReconciler;
pub use reconciler::ReconcileError;
pub use registration::RegistrationError;
pub use registration::RegistrationService;
pub use repository::ApplicationRepository;

/// Wall clock in epoch milliseconds, the unit of every Eureka timestamp.
pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
