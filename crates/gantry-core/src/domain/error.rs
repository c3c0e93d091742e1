//! Error taxonomy for Gantry.
//!
//! Only conditions that abort work are errors. Absent capabilities, failing
//! stage bodies, gate violations and unreadable report files are ordinary
//! outcomes and never surface here.

/// Gantry errors.
#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    #[error("required capability missing: {name}")]
    MissingRequiredCapability { name: String },

    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),

    #[error("stage '{stage}' has an empty command")]
    EmptyCommand { stage: String },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git error: {0}")]
    Git(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Gantry operations.
pub type Result<T> = std::result::Result<T, GantryError>;
