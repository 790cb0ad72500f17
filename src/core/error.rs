//! Error type system for the portal runtime
//!
//! This module provides the runtime's error types with:
//! - One variant per failure class the plugin pipeline can produce
//! - Error context and chaining support
//! - HTTP status code mapping for the admin API
//! - Detailed error messages with trace IDs

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Main error type for the portal runtime
#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    // System-level errors
    #[error("Runtime initialization failed: {0}")]
    Runtime(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Descriptor ingestion: a bad or invalid manifest. Fatal for that plugin
    // only; `violations` carries every schema violation found in one pass.
    #[error("Invalid plugin manifest {path}: {}", violations.join("; "))]
    Descriptor {
        path: PathBuf,
        violations: Vec<String>,
    },

    // Dependency cycle: fatal for the cycle's members only.
    #[error("Dependency cycle among plugins: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },

    // Bootstrap threw, rejected, or timed out. The plugin moves to `Error`,
    // siblings are unaffected.
    #[error("Plugin '{plugin}' failed to initialize: {cause}")]
    Initialization { plugin: String, cause: String },

    // Illegal concurrent state transition. A programming/race bug, logged
    // loudly at the call site.
    #[error("Illegal concurrent transition for plugin '{plugin}': {status} -> {attempted}")]
    ConcurrentAccess {
        plugin: String,
        status: String,
        attempted: String,
    },

    // Plugin-supplied config failed its own schema. Fatal for that plugin.
    #[error("Plugin '{plugin}' configuration invalid: {cause}")]
    Configuration { plugin: String, cause: String },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("No handler registered for plugin type: {0}")]
    UnknownPluginType(String),

    // Module resolution / re-evaluation failure from the hot-reload loader.
    #[error("Module resolution failed for '{specifier}': {cause}")]
    ModuleResolution { specifier: String, cause: String },

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl PortalError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            PortalError::Descriptor { .. }
            | PortalError::Serialization(_)
            | PortalError::Configuration { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            PortalError::PluginNotFound(_) => StatusCode::NOT_FOUND,

            // 408 Request Timeout
            PortalError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,

            // 409 Conflict
            PortalError::ConcurrentAccess { .. } => StatusCode::CONFLICT,

            // 422 Unprocessable Entity
            PortalError::Cycle { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            // 500 Internal Server Error
            PortalError::Runtime(_)
            | PortalError::Config(_)
            | PortalError::Initialization { .. }
            | PortalError::UnknownPluginType(_)
            | PortalError::ModuleResolution { .. }
            | PortalError::Io(_)
            | PortalError::Network(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type name for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            PortalError::Runtime(_) => "Runtime",
            PortalError::Config(_) => "Config",
            PortalError::Descriptor { .. } => "DescriptorError",
            PortalError::Cycle { .. } => "CycleError",
            PortalError::Initialization { .. } => "InitializationError",
            PortalError::ConcurrentAccess { .. } => "ConcurrentAccessError",
            PortalError::Configuration { .. } => "ConfigurationError",
            PortalError::PluginNotFound(_) => "PluginNotFound",
            PortalError::UnknownPluginType(_) => "UnknownPluginType",
            PortalError::ModuleResolution { .. } => "ModuleResolutionError",
            PortalError::Io(_) => "IoError",
            PortalError::Network(_) => "NetworkError",
            PortalError::Serialization(_) => "SerializationError",
            PortalError::Timeout(_) => "Timeout",
        }
    }

    /// Check whether this error stays local to one plugin.
    ///
    /// Plugin-local errors attach to the registry entry and never propagate to
    /// or block unrelated plugins. Non-local errors indicate a defect in the
    /// runtime itself.
    pub fn is_plugin_local(&self) -> bool {
        matches!(
            self,
            PortalError::Descriptor { .. }
                | PortalError::Cycle { .. }
                | PortalError::Initialization { .. }
                | PortalError::Configuration { .. }
                | PortalError::ModuleResolution { .. }
                | PortalError::Timeout(_)
        )
    }
}

/// Error response structure for the admin API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type identifier
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Unique trace ID for this error
    pub trace_id: String,
}

impl ErrorResponse {
    /// Create a new error response with a generated trace ID
    pub fn new(error: String, message: String) -> Self {
        Self {
            error,
            message,
            details: None,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an error response with additional details
    pub fn with_details(error: String, message: String, details: serde_json::Value) -> Self {
        Self {
            error,
            message,
            details: Some(details),
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an error response from a PortalError
    pub fn from_error(error: &PortalError) -> Self {
        match error {
            PortalError::Descriptor { path, violations } => Self::with_details(
                error.error_type().to_string(),
                error.to_string(),
                serde_json::json!({
                    "path": path.display().to_string(),
                    "violations": violations,
                }),
            ),
            PortalError::Cycle { members } => Self::with_details(
                error.error_type().to_string(),
                error.to_string(),
                serde_json::json!({ "cycle_members": members }),
            ),
            _ => Self::new(error.error_type().to_string(), error.to_string()),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (trace_id: {})",
            self.error, self.message, self.trace_id
        )
    }
}

/// Implement IntoResponse for PortalError to enable automatic error handling in Axum
impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = ErrorResponse::from_error(&self);

        tracing::error!(
            error_type = self.error_type(),
            trace_id = %error_response.trace_id,
            status_code = %status_code,
            "Request failed: {}",
            self
        );

        (status_code, Json(error_response)).into_response()
    }
}

/// Result type alias for operations that can fail with PortalError
pub type Result<T> = std::result::Result<T, PortalError>;

/// Context extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let context_str = context.into();
            PortalError::Runtime(format!("{}: {}", context_str, e))
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let context_str = f();
            PortalError::Runtime(format!("{}: {}", context_str, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            PortalError::Descriptor {
                path: PathBuf::from("portal.json"),
                violations: vec!["missing field 'name'".into()],
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PortalError::PluginNotFound("test".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PortalError::Timeout("test".into()).status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            PortalError::ConcurrentAccess {
                plugin: "a".into(),
                status: "loading".into(),
                attempted: "loading".into(),
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PortalError::Cycle {
                members: vec!["a".into(), "b".into()],
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            PortalError::Runtime("test".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_types() {
        assert_eq!(
            PortalError::Cycle {
                members: vec!["a".into()],
            }
            .error_type(),
            "CycleError"
        );
        assert_eq!(
            PortalError::Initialization {
                plugin: "svc".into(),
                cause: "boom".into(),
            }
            .error_type(),
            "InitializationError"
        );
        assert_eq!(
            PortalError::PluginNotFound("test".into()).error_type(),
            "PluginNotFound"
        );
    }

    #[test]
    fn test_plugin_local_classification() {
        assert!(PortalError::Initialization {
            plugin: "svc".into(),
            cause: "boom".into(),
        }
        .is_plugin_local());
        assert!(PortalError::Cycle {
            members: vec!["a".into(), "b".into()],
        }
        .is_plugin_local());
        assert!(!PortalError::Runtime("broken invariant".into()).is_plugin_local());
        assert!(!PortalError::Network("refused".into()).is_plugin_local());
    }

    #[test]
    fn test_error_response_collects_violations() {
        let error = PortalError::Descriptor {
            path: PathBuf::from("/pkg/portal.json"),
            violations: vec![
                "missing field 'name'".into(),
                "missing field 'bootstrap'".into(),
            ],
        };
        let response = ErrorResponse::from_error(&error);

        assert_eq!(response.error, "DescriptorError");
        let details = response.details.expect("details");
        assert_eq!(details["violations"].as_array().unwrap().len(), 2);
        assert!(!response.trace_id.is_empty());
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        let contexted = result.context("Failed to read plugin manifest");

        assert!(contexted.is_err());
        let err = contexted.unwrap_err();
        assert!(err.to_string().contains("Failed to read plugin manifest"));
        assert!(err.to_string().contains("file not found"));
    }
}
