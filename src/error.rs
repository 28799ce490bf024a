use thiserror::Error;

use crate::resources::ResourceMetadata;

/// Raised when two partial definitions of the same type disagree on a field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Conflicting definitions for {conflicting_name}: {reason}")]
pub struct SchemaMergeError {
    /// `Type.field` for field conflicts, the bare type name otherwise.
    pub conflicting_name: String,
    pub reason: String,
}

impl SchemaMergeError {
    pub(crate) fn new(conflicting_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            conflicting_name: conflicting_name.into(),
            reason: reason.into(),
        }
    }
}

/// Anything that prevents a resource group from becoming an executable schema.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed to parse schema {name}: {message}")]
    Parse { name: String, message: String },

    #[error(transparent)]
    Merge(#[from] SchemaMergeError),

    #[error("Invalid @{directive} on {coordinate}: {message}")]
    Directive {
        directive: String,
        coordinate: String,
        message: String,
    },

    #[error("Invalid upstream {upstream}: {message}")]
    Upstream {
        upstream: ResourceMetadata,
        message: String,
    },

    #[error("Failed to build executable schema: {0}")]
    Schema(String),
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("No resources have been stored yet")]
    NotFound,

    #[error("Resource storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize resources as JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to (de)serialize resources as YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("The gateway has not loaded a schema yet")]
    NotReady,

    #[error("The gateway has been disposed")]
    Disposed,

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Failed to serialize response: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Resource group is invalid: {0}")]
    Validation(#[from] BuildError),
}
