//! Error types for the provisioning core.
//!
//! Forward operations fail fast with a [`ProvisionError`]; compensations never
//! return one. Failures reported by the virtualization service itself are
//! carried as [`DriverError`].

use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for provisioning operations.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    /// A descriptor could not be serialized to, or parsed from, its XML form.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// A call to the virtualization service failed.
    #[error("remote call failed: {0}")]
    RemoteCall(#[from] DriverError),

    /// A volume handle is already held by the preparation context.
    #[error("{0}: volume already exists")]
    AlreadyExists(String),

    /// Two mutually exclusive settings were requested together.
    #[error("conflicting configuration: {0}")]
    ConflictingConfiguration(String),

    /// A configuration value is not in the recognized set.
    #[error("unrecognized value '{value}' for '{key}'")]
    UnrecognizedConfiguration {
        /// The configuration key.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// Cancellation was observed before or during an operation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Configuration validation failed.
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
}

impl ProvisionError {
    /// Creates a marshal error from any displayable cause.
    #[must_use]
    pub fn marshal(cause: impl std::fmt::Display) -> Self {
        Self::Marshal(cause.to_string())
    }

    /// Creates an already-exists error for the named operation.
    #[must_use]
    pub fn already_exists(operation: impl Into<String>) -> Self {
        Self::AlreadyExists(operation.into())
    }

    /// Creates a conflicting configuration error.
    #[must_use]
    pub fn conflicting(reason: impl Into<String>) -> Self {
        Self::ConflictingConfiguration(reason.into())
    }

    /// Creates an unrecognized configuration error.
    #[must_use]
    pub fn unrecognized(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::UnrecognizedConfiguration {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Returns the classification name used in structured reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Marshal(_) => "MarshalError",
            Self::RemoteCall(_) => "RemoteCallError",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::ConflictingConfiguration(_) => "ConflictingConfiguration",
            Self::UnrecognizedConfiguration { .. } => "UnrecognizedConfiguration",
            Self::Cancelled(_) => "Cancelled",
            Self::InvalidConfig(_) => "InvalidConfig",
        }
    }

    /// Returns true for errors raised before any remote call was attempted.
    #[must_use]
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::RemoteCall(_))
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), json!(self.kind()));
        map.insert("message".to_string(), json!(self.to_string()));

        match self {
            Self::RemoteCall(inner) => {
                map.insert("driver_error".to_string(), json!(inner.to_string()));
            }
            Self::UnrecognizedConfiguration { key, value } => {
                map.insert("key".to_string(), json!(key));
                map.insert("value".to_string(), json!(value));
            }
            Self::InvalidConfig(problems) => {
                map.insert("problems".to_string(), json!(problems));
            }
            _ => {}
        }

        map
    }
}

/// Errors reported by the virtualization service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The referenced object does not exist on the service.
    #[error("no {kind} named '{name}'")]
    NotFound {
        /// Object kind, e.g. "domain" or "storage pool".
        kind: String,
        /// Object name.
        name: String,
    },

    /// The RPC itself failed.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Service error code.
        code: i32,
        /// Service error message.
        message: String,
    },
}

impl DriverError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates an RPC error.
    #[must_use]
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }
}
