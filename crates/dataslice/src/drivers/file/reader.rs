//! Blocking CSV reads, run on the blocking thread pool.

use std::fs::File;
use std::path::Path;

use csv::{Reader, ReaderBuilder};

use crate::core::value::{decode_cell, Row, RowSender};
use crate::error::{Result, SliceError};
use crate::transfer::Predicate;

pub(super) fn open(path: &Path) -> Result<Reader<File>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SliceError::SourceNotFound(path.display().to_string()),
        _ => SliceError::storage(path.display().to_string(), e),
    })?;
    Ok(ReaderBuilder::new().has_headers(true).from_reader(file))
}

pub(super) fn header(reader: &mut Reader<File>) -> Result<Vec<String>> {
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}

/// What to keep from each file row.
pub(super) struct Projection {
    /// File header, used to evaluate the filter.
    pub file_header: Vec<String>,
    /// Positions of the output columns within a file row.
    pub keep: Vec<usize>,
    pub filter: Option<Predicate>,
}

/// Stream every matching record into `tx` in batches of `chunk_size`.
pub(super) fn pump(
    mut reader: Reader<File>,
    projection: &Projection,
    chunk_size: usize,
    tx: &RowSender,
    location: &str,
) -> Result<u64> {
    let mut batch = Vec::with_capacity(chunk_size);
    let mut total = 0u64;
    for record in reader.records() {
        let record = record?;
        let mut row: Row = record.iter().map(decode_cell).collect();

        if let Some(filter) = &projection.filter {
            let keep = filter
                .matches(&projection.file_header, &row)
                .map_err(|m| SliceError::storage(location, m))?;
            if !keep {
                continue;
            }
        }

        let projected: Row = projection
            .keep
            .iter()
            .map(|&i| row[i].take())
            .collect();
        batch.push(projected);
        total += 1;
        if batch.len() >= chunk_size {
            tx.blocking_send(std::mem::replace(&mut batch, Vec::with_capacity(chunk_size)))?;
        }
    }
    tx.blocking_send(batch)?;
    Ok(total)
}

/// Whether the file has at least one data row.
pub(super) fn has_rows(path: &Path) -> Result<bool> {
    match open(path) {
        Ok(mut reader) => Ok(reader.records().next().transpose()?.is_some()),
        Err(SliceError::SourceNotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Largest integer value of `column`, 0 when the file is absent or empty.
pub(super) fn max_integer(path: &Path, column: &str) -> Result<i64> {
    let mut reader = match open(path) {
        Ok(reader) => reader,
        Err(SliceError::SourceNotFound(_)) => return Ok(0),
        Err(e) => return Err(e),
    };
    let Some(index) = header(&mut reader)?.iter().position(|c| c == column) else {
        return Ok(0);
    };

    let mut max = 0i64;
    for record in reader.records() {
        let record = record?;
        let Some(value) = record.get(index).and_then(decode_cell) else {
            continue;
        };
        let id: i64 = value.trim().parse().map_err(|_| {
            SliceError::Validation(format!(
                "{}: primary key value '{}' is not an integer",
                path.display(),
                value
            ))
        })?;
        max = max.max(id);
    }
    Ok(max)
}

/// Read a whole file into memory (header and rows). Used to patch files.
pub(super) fn read_all(path: &Path) -> Result<(Vec<String>, Vec<Row>)> {
    let mut reader = open(path)?;
    let header = header(&mut reader)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(decode_cell).collect());
    }
    Ok((header, rows))
}
