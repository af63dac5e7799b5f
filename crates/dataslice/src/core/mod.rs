//! Core abstractions shared by the graph, the adapters and the orchestrator.
//!
//! - [`schema`]: entity, field and relation descriptors
//! - [`registry`]: the explicit schema registry
//! - [`value`]: rows and bounded row streams
//! - [`traits`]: the storage adapter capability
//! - [`identifier`]: SQL identifier quoting and validation

pub mod identifier;
pub mod registry;
pub mod schema;
pub mod traits;
pub mod value;

pub use registry::{SchemaRegistry, SchemaWarning};
pub use schema::{
    ColumnRef, EntityDescriptor, EntityDescriptorBuilder, EntityType, FieldDescriptor, FieldKind,
    Relation,
};
pub use traits::{FieldUpdate, StorageAdapter, WriteSummary};
pub use value::{Row, RowBatch, RowSender, RowStream, NULL_MARKER};
