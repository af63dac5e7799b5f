//! Staged COPY-in writer and deferred updates.
//!
//! Rows are copied into a temporary table shaped like the destination, then
//! moved with a single `INSERT ... SELECT`. A failed job only ever leaves
//! rows in the staging table, which is dropped with the transaction.

use bytes::BytesMut;
use deadpool_postgres::Object;
use futures::SinkExt;
use tokio_postgres::error::SqlState;
use tracing::debug;

use super::copy_text::encode_row;
use crate::core::identifier::{qualify_pg, quote_literal, quote_pg};
use crate::core::schema::EntityType;
use crate::core::traits::FieldUpdate;
use crate::core::value::RowStream;
use crate::error::{Result, SliceError};
use crate::transfer::PlannedJob;

/// Rows per `UPDATE ... FROM (VALUES ...)` statement.
const DEFERRED_UPDATE_CHUNK: usize = 1000;

/// Staging table name for a destination table, within the 63 byte limit.
pub(super) fn staging_table_name(table: &str) -> String {
    let mut name = format!("_staging_{}", table);
    if name.len() > 63 {
        let mut cut = 63;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

pub(super) fn build_create_staging(staging: &str, destination: &str) -> Result<String> {
    Ok(format!(
        "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
        quote_pg(staging)?,
        destination
    ))
}

pub(super) fn build_copy_in(staging: &str, columns: &[String]) -> Result<String> {
    let cols = columns
        .iter()
        .map(|c| quote_pg(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        quote_pg(staging)?,
        cols.join(", ")
    ))
}

pub(super) fn build_insert_from_staging(
    destination: &str,
    staging: &str,
    columns: &[String],
    on_conflict_do_nothing: bool,
) -> Result<String> {
    let cols = columns
        .iter()
        .map(|c| quote_pg(c))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let mut sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        destination,
        cols,
        cols,
        quote_pg(staging)?
    );
    if on_conflict_do_nothing {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    Ok(sql)
}

/// `UPDATE` applying resolved deferred references to one field.
pub(super) fn build_deferred_update(
    job: &PlannedJob,
    field: &str,
    updates: &[FieldUpdate],
) -> Result<String> {
    let descriptor = job.descriptor();
    let kind = descriptor
        .field(field)
        .map(|f| f.kind.sql_type().to_string())
        .ok_or_else(|| {
            SliceError::Validation(format!("{} has no field '{}'", job.entity(), field))
        })?;
    let values = updates
        .iter()
        .map(|u| {
            let value = u
                .value
                .as_deref()
                .map(quote_literal)
                .unwrap_or_else(|| "NULL".to_string());
            format!("({}::text, {}::text)", quote_literal(&u.pk), value)
        })
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        "UPDATE {} AS t SET {} = CAST(d.value AS {}) FROM (VALUES {}) AS d(pk, value) WHERE t.{}::text = d.pk",
        qualify_pg(&descriptor.schema, descriptor.output_name())?,
        quote_pg(field)?,
        kind,
        values,
        quote_pg(&descriptor.primary_key)?
    ))
}

/// Map a driver error raised while loading `entity`.
pub(super) fn classify(entity: &EntityType, location: &str, e: tokio_postgres::Error) -> SliceError {
    match e.code() {
        Some(code) if code.code().starts_with("23") => SliceError::TargetConstraint {
            entity: entity.clone(),
            message: e
                .as_db_error()
                .map(|d| d.message().to_string())
                .unwrap_or_else(|| e.to_string()),
        },
        Some(code) if *code == SqlState::UNDEFINED_TABLE => {
            SliceError::storage(location, format!("destination table missing: {}", e))
        }
        Some(code) if *code == SqlState::INSUFFICIENT_PRIVILEGE => SliceError::storage(location, e),
        _ => SliceError::from(e),
    }
}

/// Copy `rows` into staging and move them into the destination.
///
/// Runs inside a transaction opened by the caller. Returns the number of
/// rows inserted into the destination.
pub(super) async fn copy_in(
    client: &Object,
    job: &PlannedJob,
    mut rows: RowStream,
    on_conflict_do_nothing: bool,
) -> Result<u64> {
    let descriptor = job.descriptor();
    let destination = qualify_pg(&descriptor.schema, descriptor.output_name())?;
    let staging = staging_table_name(descriptor.output_name());
    let entity = job.entity();
    let columns = rows.header().to_vec();

    client
        .batch_execute(&build_create_staging(&staging, &destination)?)
        .await
        .map_err(|e| classify(entity, &destination, e))?;

    let copy_sql = build_copy_in(&staging, &columns)?;
    debug!("COPY statement: {}", copy_sql);
    let sink = client
        .copy_in(&copy_sql)
        .await
        .map_err(|e| classify(entity, &destination, e))?;
    tokio::pin!(sink);

    let mut staged = 0u64;
    let mut buf = BytesMut::new();
    while let Some(batch) = rows.next_batch().await {
        // Dropping the unfinished sink aborts the COPY.
        let batch = batch?;
        buf.reserve(batch.len() * 64);
        for row in &batch {
            encode_row(row, &mut buf);
        }
        staged += batch.len() as u64;
        sink.send(buf.split().freeze())
            .await
            .map_err(|e| classify(entity, &destination, e))?;
    }
    sink.finish()
        .await
        .map_err(|e| classify(entity, &destination, e))?;
    debug!("{}: staged {} rows in {}", entity, staged, staging);

    let inserted = client
        .execute(
            &build_insert_from_staging(&destination, &staging, &columns, on_conflict_do_nothing)?,
            &[],
        )
        .await
        .map_err(|e| classify(entity, &destination, e))?;

    client
        .batch_execute(&format!("DROP TABLE IF EXISTS {}", quote_pg(&staging)?))
        .await?;

    if inserted < staged {
        debug!(
            "{}: {} staged rows skipped on conflict",
            entity,
            staged - inserted
        );
    }
    Ok(inserted)
}

/// Apply deferred updates in chunks.
pub(super) async fn apply_updates(
    client: &Object,
    job: &PlannedJob,
    field: &str,
    updates: &[FieldUpdate],
) -> Result<u64> {
    let mut applied = 0;
    for chunk in updates.chunks(DEFERRED_UPDATE_CHUNK) {
        let sql = build_deferred_update(job, field, chunk)?;
        applied += client
            .execute(&sql, &[])
            .await
            .map_err(|e| classify(job.entity(), job.output_name(), e))?;
    }
    Ok(applied)
}
