//! Configuration validation.

use std::collections::HashSet;

use super::{Config, StorageConfig};
use crate::error::{Result, SliceError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_storage("source", &config.source)?;
    validate_storage("target", &config.target)?;

    // Cannot write into the location being read unless replacing is allowed
    match (&config.source, &config.target) {
        (StorageConfig::Csv(source), StorageConfig::Csv(target))
            if source.directory == target.directory && !target.overwrite =>
        {
            return Err(SliceError::Config(
                "source and target cannot be the same directory unless target.overwrite is set"
                    .into(),
            ));
        }
        (StorageConfig::Postgres(source), StorageConfig::Postgres(target))
            if source.connection_string == target.connection_string =>
        {
            return Err(SliceError::Config(
                "source and target cannot be the same database".into(),
            ));
        }
        _ => {}
    }

    if config.run.channel_capacity == 0 {
        return Err(SliceError::Config(
            "run.channel_capacity must be at least 1".into(),
        ));
    }

    let mut declared = HashSet::new();
    for entity in &config.entities {
        if !declared.insert(&entity.entity) {
            return Err(SliceError::Config(format!(
                "entity '{}' is declared more than once",
                entity.entity
            )));
        }
        if entity.fields.is_empty() {
            return Err(SliceError::Config(format!(
                "entity '{}' has no fields",
                entity.entity
            )));
        }
    }

    for (i, job) in config.jobs.iter().enumerate() {
        if !declared.contains(&job.entity) {
            return Err(SliceError::Config(format!(
                "jobs[{}].entity '{}' is not declared in entities",
                i, job.entity
            )));
        }
    }

    for column in &config.run.excluded_columns {
        if !declared.contains(&column.entity) {
            return Err(SliceError::Config(format!(
                "run.excluded_columns: '{}' names an undeclared entity",
                column
            )));
        }
    }

    Ok(())
}

fn validate_storage(name: &str, storage: &StorageConfig) -> Result<()> {
    match storage {
        StorageConfig::Postgres(pg) => {
            if pg.connection_string.trim().is_empty() {
                return Err(SliceError::Config(format!(
                    "{name}.connection_string is required"
                )));
            }
            if pg.pool_size == 0 {
                return Err(SliceError::Config(format!(
                    "{name}.pool_size must be at least 1"
                )));
            }
            if pg.chunk_size == 0 {
                return Err(SliceError::Config(format!(
                    "{name}.chunk_size must be at least 1"
                )));
            }
        }
        StorageConfig::Csv(file) => {
            if file.directory.as_os_str().is_empty() {
                return Err(SliceError::Config(format!("{name}.directory is required")));
            }
            if file.chunk_size == 0 {
                return Err(SliceError::Config(format!(
                    "{name}.chunk_size must be at least 1"
                )));
            }
        }
    }
    Ok(())
}
