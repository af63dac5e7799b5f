//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::schema::{ColumnRef, EntityDescriptor, EntityType};
use crate::integrity::RemapConfig;
use crate::transfer::Selection;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where rows are read from.
    pub source: StorageConfig,

    /// Where rows are written to.
    pub target: StorageConfig,

    /// Run behavior.
    #[serde(default)]
    pub run: RunSettings,

    /// Entity descriptors, registered in this order.
    #[serde(default)]
    pub entities: Vec<EntityDescriptor>,

    /// Transfer jobs, in any order.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Storage location, tagged by `type:`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// PostgreSQL database.
    Postgres(PostgresConfig),

    /// Directory of CSV files.
    Csv(FileConfig),
}

impl StorageConfig {
    /// Adapter kind this configuration builds.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Postgres(_) => "postgres",
            StorageConfig::Csv(_) => "csv",
        }
    }
}

/// PostgreSQL storage configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// libpq-style connection string (`host=.. dbname=..` or `postgres://` URL).
    pub connection_string: String,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Rows per batch when reading (default: 10000).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Skip rows that collide with existing keys (default: false).
    #[serde(default)]
    pub on_conflict_do_nothing: bool,
}

impl PostgresConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            pool_size: default_pool_size(),
            chunk_size: default_chunk_size(),
            on_conflict_do_nothing: false,
        }
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("connection_string", &"[REDACTED]")
            .field("pool_size", &self.pool_size)
            .field("chunk_size", &self.chunk_size)
            .field("on_conflict_do_nothing", &self.on_conflict_do_nothing)
            .finish()
    }
}

/// CSV directory storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Directory holding one `{output_name}.csv` per entity.
    pub directory: PathBuf,

    /// Replace existing files (default: false).
    #[serde(default)]
    pub overwrite: bool,

    /// Rows per batch when reading (default: 10000).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl FileConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            overwrite: false,
            chunk_size: default_chunk_size(),
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Run behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Relations ignored for ordering, written `Entity.field`.
    #[serde(default)]
    pub excluded_columns: Vec<ColumnRef>,

    /// Check foreign keys before moving data (default: true).
    #[serde(default = "default_true")]
    pub check_references: bool,

    /// Id remapping; absent means ids are copied as-is.
    #[serde(default)]
    pub remapping: Option<RemapConfig>,

    /// Lineage file read as preset mappings and rewritten after the run.
    #[serde(default)]
    pub lineage_path: Option<PathBuf>,

    /// Batches buffered between reader and writer (default: 4).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            excluded_columns: Vec::new(),
            check_references: true,
            remapping: None,
            lineage_path: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// One transfer job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub entity: EntityType,

    #[serde(default)]
    pub selection: Selection,

    /// Fields left out of the transfer.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_pool_size() -> usize {
    4
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_channel_capacity() -> usize {
    crate::core::value::DEFAULT_CHANNEL_CAPACITY
}

fn default_true() -> bool {
    true
}
