//! Error type definitions for the IPTV manager
//!
//! The hierarchy mirrors the layers of the application: persistence
//! (`RepositoryError`), upstream fetches (`SourceError`), the HTTP surface
//! (`WebError`) and the top-level `AppError` that wraps them all.

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Repository layer errors
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Upstream fetch errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Web layer errors
    #[error("Web error: {0}")]
    Web(#[from] WebError),

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Management plane could not be reached from a proxy
    #[error("Management plane unavailable: {message}")]
    ManagementUnavailable { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Repository layer specific errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Record not found
    #[error("Record not found: {table} with {field} = {value}")]
    RecordNotFound {
        table: String,
        field: String,
        value: String,
    },

    /// Constraint violations (unique, foreign key, etc.)
    #[error("Constraint violation: {constraint} - {message}")]
    ConstraintViolation { constraint: String, message: String },

    /// Migration failures
    #[error("Migration failed: {version} - {message}")]
    MigrationFailed { version: String, message: String },
}

/// Upstream fetch errors. Fatal for the current reconciliation cycle or
/// stream start, never retried automatically.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Connect or read timeout
    #[error("Connection timeout: {url}")]
    Timeout { url: String },

    /// Transport level failure (DNS, refused connection, TLS, reset)
    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// Non-success HTTP status from upstream
    #[error("HTTP error: {status} - {url}")]
    Http { status: u16, url: String },

    /// Reading a local playlist failed
    #[error("Local file error: {path} - {message}")]
    LocalFile { path: String, message: String },
}

/// Web layer specific errors
#[derive(Error, Debug)]
pub enum WebError {
    /// Invalid request format
    #[error("Invalid request: {field} - {message}")]
    InvalidRequest { field: String, message: String },

    /// Missing required headers
    #[error("Missing header: {header}")]
    MissingHeader { header: String },

    /// Path identity could not be decoded
    #[error("Invalid encoded identity: {value}")]
    InvalidIdentity { value: String },
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific resource
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn management_unavailable<S: Into<String>>(message: S) -> Self {
        Self::ManagementUnavailable {
            message: message.into(),
        }
    }
}

impl RepositoryError {
    /// Create a record not found error
    pub fn record_not_found<T: Into<String>, F: Into<String>, V: Into<String>>(
        table: T,
        field: F,
        value: V,
    ) -> Self {
        Self::RecordNotFound {
            table: table.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a constraint violation error
    pub fn constraint_violation<C: Into<String>, M: Into<String>>(
        constraint: C,
        message: M,
    ) -> Self {
        Self::ConstraintViolation {
            constraint: constraint.into(),
            message: message.into(),
        }
    }
}

impl SourceError {
    /// Create a timeout error
    pub fn timeout<U: Into<String>>(url: U) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Classify a reqwest failure for the given upstream URL
    pub fn from_reqwest<U: Into<String>>(url: U, err: &reqwest::Error) -> Self {
        let url = url.into();
        if err.is_timeout() {
            Self::Timeout { url }
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                url,
            }
        } else {
            Self::Transport {
                url,
                message: err.to_string(),
            }
        }
    }

    pub fn local_file<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self::LocalFile {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl WebError {
    /// Create an invalid request error
    pub fn invalid_request<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::InvalidRequest {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a missing header error
    pub fn missing_header<H: Into<String>>(header: H) -> Self {
        Self::MissingHeader {
            header: header.into(),
        }
    }
}
