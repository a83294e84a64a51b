//! Error types for observability crate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObservabilityError {
    /// Exporter could not be built
    #[error("Failed to initialize observability: {0}")]
    InitFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A global subscriber is already installed
    #[error("A global tracing subscriber is already installed")]
    AlreadyInitialized,
}
