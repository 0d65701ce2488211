use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ironic::IronicError;

#[derive(Error, Debug)]
pub enum InspectorError {
    #[error("{0}")]
    NotFound(String),

    #[error("Some or all of {name}'s {values:?} are already on introspection")]
    DuplicateAttribute { name: String, values: Vec<String> },

    #[error("Multiple matching nodes found for attributes {criteria}: {candidates:?}")]
    AmbiguousMatch {
        criteria: String,
        candidates: Vec<String>,
    },

    #[error("Introspection for node {id} already finished on {finished_at}")]
    AlreadyFinished {
        id: String,
        finished_at: DateTime<Utc>,
    },

    #[error("Introspection for node {id} was restarted, this run is no longer current")]
    Superseded { id: String },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Control-plane error: {0}")]
    Remote(#[from] IronicError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl InspectorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, InspectorError::NotFound(_))
    }
}
