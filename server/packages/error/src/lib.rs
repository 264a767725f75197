//! Error taxonomy shared by every sandbox-studio crate.
//!
//! Errors are rendered to HTTP callers as RFC 7807 problem details. Only
//! user-correctable classes (validation, not-found, conflict) expose their
//! message; everything else gets a generic detail plus a correlation id that
//! also appears in the server log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Stable machine-readable error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorType {
    Validation,
    NotFound,
    Conflict,
    TransientNetwork,
    Configuration,
    FatalAgent,
    Timeout,
    TokenInvalid,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            ErrorType::Validation => "urn:sandbox-studio:error:validation",
            ErrorType::NotFound => "urn:sandbox-studio:error:not-found",
            ErrorType::Conflict => "urn:sandbox-studio:error:conflict",
            ErrorType::TransientNetwork => "urn:sandbox-studio:error:transient-network",
            ErrorType::Configuration => "urn:sandbox-studio:error:configuration",
            ErrorType::FatalAgent => "urn:sandbox-studio:error:fatal-agent",
            ErrorType::Timeout => "urn:sandbox-studio:error:timeout",
            ErrorType::TokenInvalid => "urn:sandbox-studio:error:token-invalid",
            ErrorType::Internal => "urn:sandbox-studio:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ErrorType::Validation => "Invalid request",
            ErrorType::NotFound => "Not found",
            ErrorType::Conflict => "Conflict",
            ErrorType::TransientNetwork => "Upstream unavailable",
            ErrorType::Configuration => "Server misconfigured",
            ErrorType::FatalAgent => "Agent failed",
            ErrorType::Timeout => "Timed out",
            ErrorType::TokenInvalid => "Token invalid",
            ErrorType::Internal => "Internal error",
        }
    }
}

/// RFC 7807 problem details body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("transient network error: {message}")]
    TransientNetwork { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("agent error: {message}")]
    FatalAgent { message: String },

    #[error("timed out: {message}")]
    Timeout { message: String },

    #[error("token invalid: {message}")]
    TokenInvalid { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SandboxError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SandboxError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        SandboxError::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        SandboxError::Conflict {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SandboxError::TransientNetwork {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        SandboxError::Configuration {
            message: message.into(),
        }
    }

    pub fn fatal_agent(message: impl Into<String>) -> Self {
        SandboxError::FatalAgent {
            message: message.into(),
        }
    }

    pub fn token_invalid(message: impl Into<String>) -> Self {
        SandboxError::TokenInvalid {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SandboxError::Internal {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            SandboxError::Validation { .. } => ErrorType::Validation,
            SandboxError::NotFound { .. } => ErrorType::NotFound,
            SandboxError::Conflict { .. } => ErrorType::Conflict,
            SandboxError::TransientNetwork { .. } => ErrorType::TransientNetwork,
            SandboxError::Configuration { .. } => ErrorType::Configuration,
            SandboxError::FatalAgent { .. } => ErrorType::FatalAgent,
            SandboxError::Timeout { .. } => ErrorType::Timeout,
            SandboxError::TokenInvalid { .. } => ErrorType::TokenInvalid,
            SandboxError::Internal { .. } => ErrorType::Internal,
        }
    }

    /// Only transient network failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::TransientNetwork { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::NotFound { .. })
    }

    pub fn status_code(&self) -> u16 {
        match self {
            SandboxError::Validation { .. } => 400,
            SandboxError::TokenInvalid { .. } => 401,
            SandboxError::NotFound { .. } => 404,
            _ => 500,
        }
    }

    /// Whether the message is safe to show an untrusted caller.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            SandboxError::Validation { .. }
                | SandboxError::NotFound { .. }
                | SandboxError::Conflict { .. }
                | SandboxError::TokenInvalid { .. }
        )
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let error_type = self.error_type();
        let detail = if self.is_user_facing() {
            self.to_string()
        } else {
            format!(
                "{}; reference {}",
                error_type.title(),
                next_correlation_id()
            )
        };
        ProblemDetails {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: self.status_code(),
            detail,
            instance: None,
        }
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::internal(format!("json: {err}"))
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::internal(format!("io: {err}"))
    }
}

/// Correlation ids are unique per process: `<unix millis>-<counter>`.
pub fn next_correlation_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{millis:x}-{seq}")
}
