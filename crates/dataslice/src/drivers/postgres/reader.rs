//! COPY-out reader.

use deadpool_postgres::Object;
use futures::StreamExt;
use tokio::sync::OwnedMutexGuard;
use tokio_postgres::error::SqlState;
use tracing::debug;

use super::copy_text::LineParser;
use crate::core::value::{RowSender, RowStream};
use crate::error::{Result, SliceError};
use crate::transfer::PlannedJob;

/// Wrap a row-source query in a COPY TO STDOUT statement.
pub(super) fn build_copy_out(query: &str) -> String {
    format!("COPY ({}) TO STDOUT WITH (FORMAT text)", query)
}

/// Start COPY for `query` and stream the rows from a spawned task.
///
/// The client guard moves into the task and is released once the last row
/// has been sent. Errors raised by the statement itself (a missing table, a
/// bad predicate) are returned here rather than through the stream.
pub(super) async fn copy_out(
    guard: OwnedMutexGuard<Option<Object>>,
    job: &PlannedJob,
    query: String,
    chunk_size: usize,
    capacity: usize,
) -> Result<RowStream> {
    let client = guard
        .as_ref()
        .ok_or_else(|| SliceError::pool("adapter is not open", "reading rows"))?;

    let statement = build_copy_out(&query);
    debug!("COPY query: {}", statement);

    let table = format!("{}.{}", job.descriptor().schema, job.output_name());
    let copy_stream = client.copy_out(&statement).await.map_err(|e| {
        match e.code() {
            Some(code) if *code == SqlState::UNDEFINED_TABLE => SliceError::SourceNotFound(table.clone()),
            Some(code) if *code == SqlState::UNDEFINED_COLUMN || *code == SqlState::SYNTAX_ERROR => {
                SliceError::selection(job.entity(), e.to_string())
            }
            _ => SliceError::from(e),
        }
    })?;

    let header = job.columns().to_vec();
    let (tx, stream) = RowStream::channel(header.clone(), capacity);
    let chunk_size = chunk_size.max(1);

    tokio::spawn(async move {
        // Hold the connection until the copy is drained.
        let _guard = guard;
        if let Err(e) = pump(copy_stream, header.len(), chunk_size, &tx, &table).await {
            tx.fail(e).await;
        }
    });

    Ok(stream)
}

async fn pump(
    copy_stream: tokio_postgres::CopyOutStream,
    columns: usize,
    chunk_size: usize,
    tx: &RowSender,
    table: &str,
) -> Result<()> {
    let mut parser = LineParser::new(columns);
    let mut batch = Vec::with_capacity(chunk_size);
    let mut total_rows = 0u64;

    tokio::pin!(copy_stream);

    while let Some(data) = copy_stream.next().await {
        let bytes = data.map_err(|e| SliceError::storage(table, format!("reading COPY data: {}", e)))?;
        parser.extend(&bytes);

        while let Some(row) = parser.next_row().map_err(|m| SliceError::storage(table, m))? {
            batch.push(row);
            total_rows += 1;
            if batch.len() >= chunk_size {
                tx.send(std::mem::replace(&mut batch, Vec::with_capacity(chunk_size)))
                    .await?;
            }
        }
    }

    if parser.has_remainder() {
        return Err(SliceError::storage(table, "COPY output ended mid-row"));
    }
    tx.send(batch).await?;
    debug!("{}: read {} rows", table, total_rows);
    Ok(())
}
