//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::collections::BTreeSet;
use std::path::Path;

use tracing::info;

use crate::core::registry::SchemaRegistry;
use crate::core::traits::StorageAdapter;
use crate::drivers::{FileAdapter, RelationalAdapter};
use crate::error::Result;
use crate::integrity::IdMappings;
use crate::orchestrator::RunOptions;
use crate::transfer::TransferJob;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Registry holding every configured entity, in file order.
    pub fn registry(&self) -> Result<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry.register_all(self.entities.iter().cloned())?;
        Ok(registry)
    }

    /// Transfer jobs as configured.
    pub fn jobs(&self) -> Vec<TransferJob> {
        self.jobs
            .iter()
            .map(|j| {
                j.exclude.iter().fold(
                    TransferJob::new(j.entity.clone()).with_selection(j.selection.clone()),
                    |job, field| job.exclude(field.clone()),
                )
            })
            .collect()
    }

    /// Run options, with remapping seeded from an existing lineage file.
    pub fn run_options(&self) -> Result<RunOptions> {
        let run = &self.run;
        let remapping = match (&run.remapping, &run.lineage_path) {
            (Some(config), Some(path)) if path.exists() => {
                let previous = IdMappings::load(path)?;
                info!(
                    "Seeding remapping from lineage {} ({} entities)",
                    path.display(),
                    previous.entities().count()
                );
                Some(config.clone().seed_from(&previous))
            }
            (config, _) => config.clone(),
        };

        let mut options = RunOptions::default()
            .with_excluded_columns(run.excluded_columns.iter().cloned().collect::<BTreeSet<_>>())
            .with_reference_checks(run.check_references)
            .with_channel_capacity(run.channel_capacity);
        if let Some(remapping) = remapping {
            options = options.with_remapping(remapping);
        }
        if let Some(path) = &run.lineage_path {
            options = options.with_lineage_path(path.clone());
        }
        Ok(options)
    }
}

impl StorageConfig {
    /// Build the adapter for this location.
    pub async fn connect(&self) -> Result<Box<dyn StorageAdapter>> {
        match self {
            StorageConfig::Postgres(config) => {
                Ok(Box::new(RelationalAdapter::connect(config).await?))
            }
            StorageConfig::Csv(config) => Ok(Box::new(FileAdapter::new(config.clone()))),
        }
    }
}
