//! CSV encoding and file writes.
//!
//! Each job writes to `{name}.csv.partial` and renames it into place on
//! commit, so a failed job never leaves a truncated `{name}.csv` behind.

use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::core::value::{encode_cell, Row, RowStream};
use crate::error::{Result, SliceError};

/// Encode records into CSV bytes, `None` as the null marker.
pub(super) fn encode<'a, I>(records: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a Row>,
{
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    for row in records {
        writer.write_record(row.iter().map(encode_cell))?;
    }
    writer
        .into_inner()
        .map_err(|e| SliceError::Io(e.into_error()))
}

pub(super) fn encode_header(header: &[String]) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(header)?;
    writer
        .into_inner()
        .map_err(|e| SliceError::Io(e.into_error()))
}

/// Path of the in-progress file for `path`.
pub(super) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Write `rows` to `partial`, flushing once per batch. Returns the row count.
pub(super) async fn write_partial(partial: &Path, mut rows: RowStream) -> Result<u64> {
    let location = partial.display().to_string();
    let mut file = fs::File::create(partial)
        .await
        .map_err(|e| SliceError::storage(&location, e))?;

    file.write_all(&encode_header(rows.header())?)
        .await
        .map_err(|e| SliceError::storage(&location, e))?;

    let mut written = 0u64;
    while let Some(batch) = rows.next_batch().await {
        let batch = batch?;
        file.write_all(&encode(&batch)?)
            .await
            .map_err(|e| SliceError::storage(&location, e))?;
        file.flush()
            .await
            .map_err(|e| SliceError::storage(&location, e))?;
        written += batch.len() as u64;
    }
    file.sync_all()
        .await
        .map_err(|e| SliceError::storage(&location, e))?;
    debug!("Wrote {} rows to {}", written, location);
    Ok(written)
}

/// Replace `path` with the given header and rows (temp file, then rename).
pub(super) async fn rewrite(path: &Path, header: &[String], rows: &[Row]) -> Result<()> {
    let mut content = encode_header(header)?;
    content.extend(encode(rows)?);
    let temp = path.with_extension("tmp");
    fs::write(&temp, content)
        .await
        .map_err(|e| SliceError::storage(temp.display().to_string(), e))?;
    fs::rename(&temp, path)
        .await
        .map_err(|e| SliceError::storage(path.display().to_string(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_quotes_and_nulls() {
        let rows = vec![
            vec![Some("1".into()), Some("Acme, Inc.".into()), None],
            vec![Some("2".into()), Some("say \"hi\"".into()), Some(String::new())],
        ];
        let bytes = encode(&rows).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "1,\"Acme, Inc.\",\\N\n2,\"say \"\"hi\"\"\",\n"
        );
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/out/shop.csv")),
            PathBuf::from("/out/shop.csv.partial")
        );
    }
}
