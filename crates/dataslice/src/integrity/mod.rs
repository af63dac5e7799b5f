//! Referential integrity across storage instances.
//!
//! - [`validator`]: pre-flight foreign-key checks and deferred-group planning
//! - [`remap`]: id mappings, remapping strategies and the row rewrite stage
//! - [`lineage`]: optional durable storage of id mappings

pub mod lineage;
pub mod remap;
pub mod validator;

pub use lineage::Lineage;
pub use remap::{
    hash_id, resolve_deferred, tenant_field_name, tenant_filter, DeferredUpdate, IdAllocator,
    IdMapping, IdMappings, RemapConfig, RemapScope, RemapStrategy, Remapper,
};
pub use validator::{deferred_groups, FkValidator, ValidationReport};
