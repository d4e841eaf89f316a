use core::error::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch {resource}: {message}")]
    WatchFailed { resource: String, message: String },
    #[display("Kubernetes API request failed: {message}")]
    ApiRequest { message: String },
    #[display("Conflicting update of {kind} {name}")]
    Conflict { kind: String, name: String },
    #[display("{kind} not found: {name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },
    #[display("Invalid object: {message}")]
    InvalidObject { message: String },
}

impl Error for KubernetesError {}

impl KubernetesError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let conflict = KubernetesError::Conflict {
            kind: "ConfigMap".to_string(),
            name: "register-server".to_string(),
        };
        assert_eq!(
            conflict.to_string(),
            "Conflicting update of ConfigMap register-server"
        );
        assert!(conflict.is_conflict());

        let not_found = KubernetesError::NotFound {
            kind: "Pod".to_string(),
            name: "orders-0".to_string(),
            namespace: "prod".to_string(),
        };
        assert_eq!(
            not_found.to_string(),
            "Pod not found: orders-0 in namespace prod"
        );
        assert!(!not_found.is_conflict());
    }
}
