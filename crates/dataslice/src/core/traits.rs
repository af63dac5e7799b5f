//! The storage adapter capability.
//!
//! - [`StorageAdapter`]: reads and writes row streams for planned jobs, and
//!   exposes the hooks the orchestrator needs for validation, id generation
//!   and deferred-constraint group loading.
//!
//! Two implementations ship with the crate: the PostgreSQL
//! [`RelationalAdapter`](crate::drivers::postgres::RelationalAdapter) and the
//! CSV [`FileAdapter`](crate::drivers::file::FileAdapter). They are chosen at
//! construction time (see [`StorageConfig::connect`](crate::config::StorageConfig::connect))
//! and used through `&dyn StorageAdapter`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::schema::EntityType;
use crate::core::value::RowStream;
use crate::error::Result;
use crate::transfer::PlannedJob;

/// Outcome of a completed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    /// Rows written.
    pub rows: u64,
    /// File path or qualified table name.
    pub location: String,
}

/// A resolved post-load fix-up: set the field of the row with primary key
/// `pk` to `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    pub pk: String,
    pub value: Option<String>,
}

/// Read and write row streams against one storage location.
///
/// An adapter holds its connection or handle between [`open`](Self::open)
/// and [`close`](Self::close); the orchestrator calls `close` on every exit
/// path of a run.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Adapter type ("postgres", "csv").
    fn kind(&self) -> &str;

    /// Identity of the storage location, compared to detect self-transfers.
    fn location(&self) -> String;

    /// Whether existing data may be replaced.
    fn overwrite(&self) -> bool {
        false
    }

    /// Acquire the per-run connection/handle.
    async fn open(&self) -> Result<()>;

    /// Release the per-run connection/handle. Must not fail.
    async fn close(&self);

    /// Stream the rows selected by `job`, header in declaration order.
    async fn read_rows(&self, job: &PlannedJob) -> Result<RowStream>;

    /// Persist `rows` for `job`.
    async fn write_rows(&self, job: &PlannedJob, rows: RowStream) -> Result<WriteSummary>;

    /// Pre-flight check that `write_rows` could succeed, run before any data moves.
    async fn check_writable(&self, _job: &PlannedJob) -> Result<()> {
        Ok(())
    }

    /// Whether rows of `job`'s entity already exist in this storage.
    async fn contains(&self, job: &PlannedJob) -> Result<bool>;

    /// Largest integer primary key currently stored, 0 when empty.
    async fn max_id(&self, job: &PlannedJob) -> Result<i64>;

    /// Start a group whose writes become visible together at `commit_group`.
    async fn begin_group(&self, entities: &[EntityType]) -> Result<()>;

    /// Apply deferred field updates to rows written earlier in the open group.
    async fn apply_deferred(
        &self,
        job: &PlannedJob,
        field: &str,
        updates: &[FieldUpdate],
    ) -> Result<u64>;

    /// Make the group's writes permanent, checking deferred constraints.
    async fn commit_group(&self) -> Result<()>;

    /// Discard every write of the open group.
    async fn rollback_group(&self);
}
