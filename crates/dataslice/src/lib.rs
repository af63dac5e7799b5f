//! # dataslice
//!
//! Dependency-ordered transfer of relational record graphs.
//!
//! This library moves a consistent slice of related records between storage
//! back-ends with support for:
//!
//! - **Dependency ordering** from declared foreign-key relations, with cycle
//!   detection and an excluded-columns override
//! - **Streaming transfers** over bounded channels, PostgreSQL COPY and CSV
//! - **Id remapping** (sequential, hash-based, preset) with foreign-key rewriting
//! - **Cyclic groups** loaded with deferred references and a single commit
//! - **Lineage files** persisting id mappings between runs
//!
//! ## Example
//!
//! ```rust,no_run
//! use dataslice::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> dataslice::Result<()> {
//!     let config = Config::load("slice.yaml")?;
//!     let registry = config.registry()?;
//!     let source = config.source.connect().await?;
//!     let target = config.target.connect().await?;
//!
//!     let result = Orchestrator::new(&registry)
//!         .run(&*source, &*target, config.jobs(), config.run_options()?)
//!         .await?;
//!     println!("Transferred {} rows", result.rows_total);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod graph;
pub mod integrity;
pub mod orchestrator;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, FileConfig, PostgresConfig, StorageConfig};
pub use core::{
    ColumnRef, EntityDescriptor, EntityType, FieldKind, SchemaRegistry, StorageAdapter,
};
pub use drivers::{FileAdapter, RelationalAdapter};
pub use error::{Result, SliceError};
pub use graph::{DependencyGraph, ExecutionOrder};
pub use integrity::{IdMapping, IdMappings, RemapConfig, RemapStrategy};
pub use orchestrator::{JobResult, Orchestrator, Progress, RunOptions, RunResult, RunStatus};
pub use transfer::{Predicate, Selection, TransferJob};
