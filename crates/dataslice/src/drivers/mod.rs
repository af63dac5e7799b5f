//! Storage adapter implementations.
//!
//! - [`postgres`]: PostgreSQL via bulk COPY and staging tables
//! - [`file`]: a directory of CSV files, one per entity
//!
//! Both implement [`StorageAdapter`](crate::core::StorageAdapter) and are
//! normally built from configuration with
//! [`StorageConfig::connect`](crate::config::StorageConfig::connect).

pub mod file;
pub mod postgres;

pub use file::FileAdapter;
pub use postgres::RelationalAdapter;
