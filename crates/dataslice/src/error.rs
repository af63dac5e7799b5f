//! Error types for the transfer library.

use thiserror::Error;

use crate::orchestrator::RunResult;
use crate::core::schema::EntityType;

/// Main error type for registry, validation and transfer operations.
#[derive(Error, Debug)]
pub enum SliceError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity type registered twice
    #[error("Entity {0} is already registered")]
    DuplicateEntity(EntityType),

    /// Entity type referenced but never registered
    #[error("Entity {0} is not registered")]
    UnregisteredEntity(EntityType),

    /// Relation pointing at an entity that is not registered at graph-build time
    #[error("Relation {entity}.{field} targets unregistered entity {target}")]
    UnresolvedRelation {
        entity: EntityType,
        field: String,
        target: EntityType,
    },

    /// Excluded column that does not name a relation
    #[error("Excluded column {0} is not a foreign-key relation")]
    InvalidExclusion(String),

    /// Two jobs for the same entity in one run
    #[error("Entity {0} appears in more than one job")]
    DuplicateJob(EntityType),

    /// Cycle among two or more distinct entities with no declared exclusion
    #[error("Circular dependency detected involving: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<EntityType> },

    /// Source and target resolve to the same storage without overwrite
    #[error("Source and target both point at {0} and overwrite is disabled")]
    SameStorage(String),

    /// Foreign-key dependency that is neither loaded in this run nor present in the target
    #[error("{entity}.{field} depends on {target}, which is neither transferred earlier in this run nor present in the target")]
    UnresolvedDependency {
        entity: EntityType,
        field: String,
        target: EntityType,
    },

    /// Generic pre-flight validation failure
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Source file or table missing
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Selection could not be lowered to a concrete query
    #[error("Selection for {entity} cannot be applied: {message}")]
    Selection { entity: EntityType, message: String },

    /// Target file exists and overwrite is disabled
    #[error("File already exists: {0} (set overwrite to replace it)")]
    FileExists(String),

    /// Storage could not be read or written
    #[error("Storage access failed for {location}: {message}")]
    StorageAccess { location: String, message: String },

    /// Target rejected rows with a constraint violation
    #[error("Target constraint violated while loading {entity}: {message}")]
    TargetConstraint { entity: EntityType, message: String },

    /// Foreign-key value that cannot be resolved even after remapping
    #[error("Integrity error in {entity}: {message}")]
    Integrity { entity: EntityType, message: String },

    /// Deferred references of a cyclic group failed at the group boundary
    #[error("Could not resolve circular references in group [{}]: {message}", format_group(.group))]
    CircularResolution {
        group: Vec<EntityType>,
        message: String,
    },

    /// Consumer of a row stream went away before the producer finished
    #[error("Row stream closed by consumer")]
    StreamClosed,

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// CSV encoding or decoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run cancelled between jobs
    #[error("Run cancelled after {} of {} jobs", .partial.jobs_completed(), .partial.jobs_total)]
    Cancelled { partial: Box<RunResult> },

    /// A job failed mid-run; remaining jobs were not started
    #[error("Run aborted at {entity}: {source}")]
    Aborted {
        entity: EntityType,
        #[source]
        source: Box<SliceError>,
        partial: Box<RunResult>,
    },
}

fn format_cycle(cycle: &[EntityType]) -> String {
    cycle
        .iter()
        .map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_group(group: &[EntityType]) -> String {
    group
        .iter()
        .map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl SliceError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        SliceError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a StorageAccess error
    pub fn storage(location: impl Into<String>, message: impl ToString) -> Self {
        SliceError::StorageAccess {
            location: location.into(),
            message: message.to_string(),
        }
    }

    /// Create an Integrity error
    pub fn integrity(entity: &EntityType, message: impl Into<String>) -> Self {
        SliceError::Integrity {
            entity: entity.clone(),
            message: message.into(),
        }
    }

    /// Create a Selection error
    pub fn selection(entity: &EntityType, message: impl Into<String>) -> Self {
        SliceError::Selection {
            entity: entity.clone(),
            message: message.into(),
        }
    }

    /// Partial run result attached to mid-run failures.
    pub fn partial_result(&self) -> Option<&RunResult> {
        match self {
            SliceError::Cancelled { partial } | SliceError::Aborted { partial, .. } => {
                Some(partial)
            }
            _ => None,
        }
    }

    /// The underlying error for aborted runs, or self otherwise.
    pub fn root(&self) -> &SliceError {
        match self {
            SliceError::Aborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for errors raised before any data movement.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            SliceError::DuplicateEntity(_)
                | SliceError::UnregisteredEntity(_)
                | SliceError::UnresolvedRelation { .. }
                | SliceError::InvalidExclusion(_)
                | SliceError::DuplicateJob(_)
                | SliceError::CircularDependency { .. }
                | SliceError::SameStorage(_)
                | SliceError::UnresolvedDependency { .. }
                | SliceError::Validation(_)
        )
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        if let Some(partial) = self.partial_result() {
            output.push_str(&format!(
                "\n\nCompleted {} of {} jobs ({} rows) before stopping",
                partial.jobs_completed(),
                partial.jobs_total,
                partial.rows_total
            ));
        }

        output
    }
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, SliceError>;
