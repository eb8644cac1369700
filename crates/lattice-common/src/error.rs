//! Error types for the Lattice Azure controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to tell which cluster, cloud
//! operation or resource failed.
//!
//! Not-ready conditions (a deployment still running, a storage account that
//! does not exist yet) are deliberately absent from this enum: they cancel the
//! current reconciliation pass instead of failing it.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Lattice Azure operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Configuration or spec validation error
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.networkCidr")
        field: Option<String>,
    },

    /// Error returned by the cloud API gateway
    #[error("cloud error during {operation}: {message}")]
    Cloud {
        /// Gateway operation that failed (e.g., "deployments.create_or_update")
        operation: String,
        /// Description of what failed
        message: String,
        /// HTTP status code returned upstream, if any
        status_code: Option<u16>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being serialized (if known)
        kind: Option<String>,
    },

    /// A resource found required reconciliation context values unset
    #[error("invalid reconciliation context for {resource}: missing {}", .missing.join(", "))]
    InvalidContext {
        /// Resource that requested the values
        resource: String,
        /// Names of the fields that were empty
        missing: Vec<String>,
    },

    /// No free block of the requested size remains in the parent network
    #[error("subnet space exhausted: no free /{prefix_len} block left in {parent}")]
    SubnetSpaceExhausted {
        /// Parent network being carved
        parent: String,
        /// Prefix length that could not be allocated
        prefix_len: u8,
    },

    /// Optimistic-concurrency status write kept conflicting
    #[error("status update for {name} conflicted {attempts} times")]
    StatusConflict {
        /// Object whose status was being written
        name: String,
        /// Number of read-modify-write attempts made
        attempts: u32,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "watchdog", "resource-set")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For configuration errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a cloud error for the given gateway operation
    pub fn cloud(
        operation: impl Into<String>,
        msg: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Cloud {
            operation: operation.into(),
            message: msg.into(),
            status_code,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an invalid-context error listing every missing field
    pub fn invalid_context(resource: impl Into<String>, missing: Vec<String>) -> Self {
        Self::InvalidContext {
            resource: resource.into(),
            missing,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is worth retrying on a later pass
    ///
    /// Configuration, shape and exhaustion errors need a spec or config fix.
    /// Cloud errors are retryable unless the upstream rejected the request (4xx).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Cloud { status_code, .. } => {
                !matches!(status_code, Some(code) if (400..500).contains(code) && *code != 429)
            }
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::InvalidContext { .. } => false,
            Error::SubnetSpaceExhausted { .. } => false,
            Error::StatusConflict { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::StatusConflict { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Classification During Reconciliation
    // ==========================================================================

    /// Story: configuration mistakes are surfaced once and never retried
    #[test]
    fn story_configuration_errors_are_permanent() {
        let err = Error::validation_for_field("prod", "spec.networkCidr", "not a CIDR");
        assert!(err.to_string().contains("validation error for prod"));
        assert_eq!(err.cluster(), Some("prod"));
        assert!(!err.is_retryable());

        match Error::validation("missing client") {
            Error::Validation { cluster, .. } => assert_eq!(cluster, UNKNOWN_CONTEXT),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: an undersized network fails the pass with a clear message
    #[test]
    fn story_subnet_exhaustion_names_parent_and_size() {
        let err = Error::SubnetSpaceExhausted {
            parent: "10.0.0.0/24".to_string(),
            prefix_len: 24,
        };
        assert_eq!(
            err.to_string(),
            "subnet space exhausted: no free /24 block left in 10.0.0.0/24"
        );
        assert!(!err.is_retryable());
    }

    /// Story: a resource reports every context value it was missing at once
    #[test]
    fn story_invalid_context_lists_all_missing_fields() {
        let err = Error::invalid_context(
            "blobobject",
            vec!["masterSubnetID".to_string(), "storageContainer".to_string()],
        );
        assert!(err
            .to_string()
            .contains("missing masterSubnetID, storageContainer"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cloud_error_retryability_follows_status_code() {
        assert!(Error::cloud("deployments.get", "timeout", None).is_retryable());
        assert!(Error::cloud("deployments.get", "server error", Some(503)).is_retryable());
        assert!(Error::cloud("deployments.get", "throttled", Some(429)).is_retryable());
        assert!(!Error::cloud("deployments.create_or_update", "bad template", Some(400))
            .is_retryable());
    }

    #[test]
    fn test_serde_json_errors_become_serialization_errors() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
