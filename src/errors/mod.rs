//! Application error handling

pub mod types;

pub use types::{AppError, RepositoryError, SourceError, WebError};

/// Result alias used throughout the service and repository layers
pub type AppResult<T> = Result<T, AppError>;
