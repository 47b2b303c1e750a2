//! Error types for the PRStack operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while reconciling a PRStack
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// Database admin API error
    Database(String),
    /// Backup object store error
    ObjectStore(String),
    /// Spec rejected by the validator
    Validation(String),
    /// Operator misconfiguration
    Configuration(String),
    /// Status references a resource that cannot be located or re-created
    Inconsistency(String),
    /// Serialization error
    Serialization(String),
}

impl OperatorError {
    /// Stable label for metrics, derived from the error kind.
    pub fn label(&self) -> &'static str {
        match self {
            OperatorError::KubeApi(_) => "kube_api",
            OperatorError::Database(_) => "database",
            OperatorError::ObjectStore(_) => "object_store",
            OperatorError::Validation(_) => "validation",
            OperatorError::Configuration(_) => "configuration",
            OperatorError::Inconsistency(_) => "inconsistency",
            OperatorError::Serialization(_) => "serialization",
        }
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Database(msg) => write!(f, "Database error: {}", msg),
            OperatorError::ObjectStore(msg) => write!(f, "Object store error: {}", msg),
            OperatorError::Validation(msg) => write!(f, "Validation error: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::Inconsistency(msg) => write!(f, "Inconsistent state: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err.to_string())
    }
}

impl From<mongodb::error::Error> for OperatorError {
    fn from(err: mongodb::error::Error) -> Self {
        OperatorError::Database(err.to_string())
    }
}

impl From<object_store::Error> for OperatorError {
    fn from(err: object_store::Error) -> Self {
        OperatorError::ObjectStore(err.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::Database("connection refused".to_string());
        assert!(err.to_string().contains("Database error"));
    }

    #[test]
    fn test_error_labels_are_stable() {
        let errors = vec![
            OperatorError::KubeApi("api".to_string()),
            OperatorError::Database("db".to_string()),
            OperatorError::ObjectStore("store".to_string()),
            OperatorError::Validation("spec".to_string()),
            OperatorError::Configuration("config".to_string()),
            OperatorError::Inconsistency("state".to_string()),
            OperatorError::Serialization("serde".to_string()),
        ];

        for err in errors {
            assert!(!err.label().is_empty());
            let _ = format!("{}", err);
        }
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: OperatorError = parse_err.into();
        assert_eq!(err.label(), "serialization");
    }
}
