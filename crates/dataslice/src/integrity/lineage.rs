//! Durable id lineage.
//!
//! Id mappings normally live for one run only. When the host asks for
//! lineage, the mappings are written as JSON so a later run can reuse them as
//! preset strategies (see [`RemapConfig::seed_from`](super::RemapConfig::seed_from)).

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::core::schema::EntityType;
use crate::error::{Result, SliceError};
use crate::integrity::remap::{IdMapping, IdMappings};

/// On-disk lineage document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lineage {
    /// Run that produced the mappings.
    pub run_id: String,

    pub created_at: DateTime<Utc>,

    /// SHA-256 over the serialized mappings.
    #[serde(default)]
    pub checksum: Option<String>,

    pub mappings: BTreeMap<EntityType, IdMapping>,
}

impl Lineage {
    pub fn new(run_id: impl Into<String>, mappings: &IdMappings) -> Self {
        Self {
            run_id: run_id.into(),
            created_at: Utc::now(),
            checksum: None,
            mappings: mappings.to_map(),
        }
    }

    fn compute_checksum(&self) -> Result<String> {
        let content = serde_json::to_string(&self.mappings)?;
        Ok(format!("{:x}", Sha256::digest(content.as_bytes())))
    }

    /// Load a lineage file, verifying its checksum when present.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let lineage: Self = serde_json::from_str(&content)?;

        match &lineage.checksum {
            Some(stored) => {
                if stored != &lineage.compute_checksum()? {
                    return Err(SliceError::Config(
                        "Lineage file integrity check failed: checksum mismatch".to_string(),
                    ));
                }
            }
            None => warn!("Lineage file has no checksum, integrity cannot be verified"),
        }

        Ok(lineage)
    }

    /// Save atomically: write a temp file next to `path`, then rename.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.checksum = Some(self.compute_checksum()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| SliceError::Config(format!("Failed to serialize lineage: {}", e)))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        info!(
            "Saved id lineage for {} entities to {}",
            self.mappings.len(),
            path.display()
        );
        Ok(())
    }

    pub fn into_mappings(self) -> IdMappings {
        IdMappings::from_map(self.mappings)
    }
}

impl IdMappings {
    /// Persist these mappings as lineage of `run_id`.
    pub fn save<P: AsRef<Path>>(&self, run_id: &str, path: P) -> Result<()> {
        Lineage::new(run_id, self).save(path)
    }

    /// Load mappings from a lineage file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Lineage::load(path)?.into_mappings())
    }
}
