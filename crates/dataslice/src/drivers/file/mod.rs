//! CSV directory storage adapter.
//!
//! One file per entity, `{output_name}.csv`, header line first. Reads run on
//! the blocking pool and feed the bounded row channel; writes go through a
//! `.partial` file that is renamed into place when the job (or the enclosing
//! group) commits.

mod reader;
mod writer;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::FileConfig;
use crate::core::schema::EntityType;
use crate::core::traits::{FieldUpdate, StorageAdapter, WriteSummary};
use crate::core::value::{RowStream, DEFAULT_CHANNEL_CAPACITY};
use crate::error::{Result, SliceError};
use crate::transfer::{PlannedJob, Selection};

#[derive(Debug)]
struct PendingFile {
    entity: EntityType,
    partial: PathBuf,
    path: PathBuf,
}

/// Writes made inside an open group, renamed into place on commit.
#[derive(Debug, Default)]
struct GroupState {
    open: bool,
    pending: Vec<PendingFile>,
}

/// CSV implementation of [`StorageAdapter`].
#[derive(Debug)]
pub struct FileAdapter {
    config: FileConfig,
    group: Mutex<GroupState>,
}

impl FileAdapter {
    pub fn new(config: FileConfig) -> Self {
        Self {
            config,
            group: Mutex::new(GroupState::default()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// `{directory}/{output_name}.csv`
    pub fn path_for(&self, job: &PlannedJob) -> PathBuf {
        self.config
            .directory
            .join(format!("{}.csv", job.output_name()))
    }

    fn group(&self) -> std::sync::MutexGuard<'_, GroupState> {
        self.group.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// File currently holding `job`'s rows: the pending partial inside a
    /// group, the committed file otherwise.
    fn current_file(&self, job: &PlannedJob) -> PathBuf {
        let group = self.group();
        group
            .pending
            .iter()
            .rev()
            .find(|p| &p.entity == job.entity())
            .map(|p| p.partial.clone())
            .unwrap_or_else(|| self.path_for(job))
    }
}

async fn blocking<T, F>(location: String, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SliceError::storage(location, e))?
}

#[async_trait]
impl StorageAdapter for FileAdapter {
    fn kind(&self) -> &str {
        "csv"
    }

    fn location(&self) -> String {
        // The directory may not exist yet; compare absolute paths then.
        let dir = std::fs::canonicalize(&self.config.directory)
            .or_else(|_| std::path::absolute(&self.config.directory))
            .unwrap_or_else(|_| self.config.directory.clone());
        format!("file://{}", dir.display())
    }

    fn overwrite(&self) -> bool {
        self.config.overwrite
    }

    async fn open(&self) -> Result<()> {
        debug!("Opened file storage at {}", self.config.directory.display());
        Ok(())
    }

    async fn close(&self) {
        let pending = {
            let mut group = self.group();
            group.open = false;
            std::mem::take(&mut group.pending)
        };
        for p in pending {
            warn!("Discarding uncommitted {}", p.partial.display());
            let _ = tokio::fs::remove_file(&p.partial).await;
        }
    }

    async fn read_rows(&self, job: &PlannedJob) -> Result<RowStream> {
        let filter = match job.selection() {
            Selection::All => None,
            Selection::Filter(predicate) => Some(predicate.clone()),
            Selection::Raw(_) => {
                return Err(SliceError::selection(
                    job.entity(),
                    "raw SQL predicates cannot be applied to CSV files",
                ))
            }
        };

        let path = self.path_for(job);
        let location = path.display().to_string();
        let (file_reader, file_header) = {
            let path = path.clone();
            blocking(location.clone(), move || {
                let mut r = reader::open(&path)?;
                let header = reader::header(&mut r)?;
                Ok((r, header))
            })
            .await?
        };

        if let Some(predicate) = &filter {
            if let Some(missing) = predicate
                .columns()
                .into_iter()
                .find(|c| !file_header.iter().any(|h| h == c))
            {
                return Err(SliceError::selection(
                    job.entity(),
                    format!("filter column '{}' is not in {}", missing, location),
                ));
            }
        }

        // Rows leave in the job's column order; undeclared columns are dropped.
        let undeclared: Vec<&String> = file_header
            .iter()
            .filter(|c| !job.descriptor().has_field(c))
            .collect();
        if !undeclared.is_empty() {
            debug!("{}: ignoring undeclared columns {:?}", location, undeclared);
        }
        let (keep, header): (Vec<usize>, Vec<String>) = job
            .columns()
            .iter()
            .filter_map(|c| {
                file_header
                    .iter()
                    .position(|h| h == c)
                    .map(|i| (i, c.clone()))
            })
            .unzip();

        let (tx, stream) = RowStream::channel(header, DEFAULT_CHANNEL_CAPACITY);
        let projection = reader::Projection {
            file_header,
            keep,
            filter,
        };
        let chunk_size = self.config.chunk_size.max(1);
        tokio::task::spawn_blocking(move || {
            match reader::pump(file_reader, &projection, chunk_size, &tx, &location) {
                Ok(rows) => debug!("{}: read {} rows", location, rows),
                Err(e) => tx.blocking_fail(e),
            }
        });

        Ok(stream)
    }

    async fn check_writable(&self, job: &PlannedJob) -> Result<()> {
        let path = self.path_for(job);
        if self.config.overwrite {
            return Ok(());
        }
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| SliceError::storage(path.display().to_string(), e))?;
        if exists {
            return Err(SliceError::FileExists(path.display().to_string()));
        }
        Ok(())
    }

    async fn write_rows(&self, job: &PlannedJob, rows: RowStream) -> Result<WriteSummary> {
        self.check_writable(job).await?;

        let dir = &self.config.directory;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SliceError::storage(dir.display().to_string(), e))?;

        let path = self.path_for(job);
        let partial = writer::partial_path(&path);
        let written = match writer::write_partial(&partial, rows).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        let in_group = {
            let mut group = self.group();
            if group.open {
                group.pending.push(PendingFile {
                    entity: job.entity().clone(),
                    partial: partial.clone(),
                    path: path.clone(),
                });
            }
            group.open
        };
        if !in_group {
            tokio::fs::rename(&partial, &path)
                .await
                .map_err(|e| SliceError::storage(path.display().to_string(), e))?;
            info!("Wrote {} rows to {}", written, path.display());
        }

        Ok(WriteSummary {
            rows: written,
            location: path.display().to_string(),
        })
    }

    async fn contains(&self, job: &PlannedJob) -> Result<bool> {
        let path = self.path_for(job);
        blocking(path.display().to_string(), move || reader::has_rows(&path)).await
    }

    async fn max_id(&self, job: &PlannedJob) -> Result<i64> {
        let path = self.path_for(job);
        let pk = job.descriptor().primary_key.clone();
        blocking(path.display().to_string(), move || {
            reader::max_integer(&path, &pk)
        })
        .await
    }

    async fn begin_group(&self, entities: &[EntityType]) -> Result<()> {
        let mut group = self.group();
        group.open = true;
        group.pending.clear();
        debug!("File group opened for {:?}", entities);
        Ok(())
    }

    async fn apply_deferred(
        &self,
        job: &PlannedJob,
        field: &str,
        updates: &[FieldUpdate],
    ) -> Result<u64> {
        let file = self.current_file(job);
        let read_path = file.clone();
        let (header, mut rows) = blocking(file.display().to_string(), move || {
            reader::read_all(&read_path)
        })
        .await?;

        let location = file.display().to_string();
        let pk_index = header
            .iter()
            .position(|c| c == &job.descriptor().primary_key)
            .ok_or_else(|| SliceError::storage(&location, "primary key column missing"))?;
        let field_index = header
            .iter()
            .position(|c| c == field)
            .ok_or_else(|| SliceError::storage(&location, format!("column '{}' missing", field)))?;

        let by_pk: std::collections::HashMap<&str, &Option<String>> = updates
            .iter()
            .map(|u| (u.pk.as_str(), &u.value))
            .collect();
        let mut applied = 0u64;
        for row in rows.iter_mut() {
            if let Some(value) = row[pk_index].as_deref().and_then(|pk| by_pk.get(pk)) {
                row[field_index] = (*value).clone();
                applied += 1;
            }
        }

        writer::rewrite(&file, &header, &rows).await?;
        debug!("{}: patched {} rows of {}", location, applied, field);
        Ok(applied)
    }

    async fn commit_group(&self) -> Result<()> {
        let pending = {
            let mut group = self.group();
            group.open = false;
            std::mem::take(&mut group.pending)
        };
        for p in pending {
            tokio::fs::rename(&p.partial, &p.path)
                .await
                .map_err(|e| SliceError::storage(p.path.display().to_string(), e))?;
            info!("Committed {}", p.path.display());
        }
        Ok(())
    }

    async fn rollback_group(&self) {
        let pending = {
            let mut group = self.group();
            group.open = false;
            std::mem::take(&mut group.pending)
        };
        for p in pending {
            if let Err(e) = tokio::fs::remove_file(&p.partial).await {
                warn!("Could not remove {}: {}", p.partial.display(), e);
            }
        }
    }
}
