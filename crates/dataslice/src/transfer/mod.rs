//! Transfer jobs: what to move for one entity type.
//!
//! A [`TransferJob`] is the caller-facing unit of work. Before a run starts
//! each job is planned against the registry into a [`PlannedJob`], which
//! carries the descriptor and the resolved column list that adapters use.

mod selection;

pub use selection::{Predicate, QueryLowering, Selection, SqlLowering};

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::core::registry::SchemaRegistry;
use crate::core::schema::{EntityDescriptor, EntityType};
use crate::error::{Result, SliceError};

/// Transfer job for a single entity type.
///
/// Jobs compare, hash and order by entity type only; the selection does not
/// contribute to identity.
#[derive(Debug, Clone)]
pub struct TransferJob {
    entity: EntityType,
    selection: Selection,
    excluded_fields: BTreeSet<String>,
}

impl TransferJob {
    /// Job transferring every row of `entity`.
    pub fn new(entity: impl Into<EntityType>) -> Self {
        Self {
            entity: entity.into(),
            selection: Selection::All,
            excluded_fields: BTreeSet::new(),
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    /// Leave `field` out of this transfer.
    pub fn exclude(mut self, field: impl Into<String>) -> Self {
        self.excluded_fields.insert(field.into());
        self
    }

    pub fn entity(&self) -> &EntityType {
        &self.entity
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn excluded_fields(&self) -> &BTreeSet<String> {
        &self.excluded_fields
    }

    /// Resolve against the registry.
    ///
    /// Fails with `UnregisteredEntity` for unknown entities and `Validation`
    /// when an excluded field does not exist.
    pub fn plan(&self, registry: &SchemaRegistry) -> Result<PlannedJob> {
        let descriptor = registry.get(&self.entity)?;

        if let Some(unknown) = self
            .excluded_fields
            .iter()
            .find(|f| !descriptor.has_field(f))
        {
            return Err(SliceError::Validation(format!(
                "{} has no field '{}' to exclude",
                self.entity, unknown
            )));
        }

        let columns = descriptor
            .fields
            .iter()
            .filter(|f| !self.excluded_fields.contains(&f.name))
            .map(|f| f.name.clone())
            .collect::<Vec<_>>();
        if columns.is_empty() {
            return Err(SliceError::Validation(format!(
                "{} has no fields left to transfer",
                self.entity
            )));
        }

        Ok(PlannedJob {
            job: self.clone(),
            descriptor: Arc::new(descriptor.clone()),
            columns,
        })
    }
}

impl PartialEq for TransferJob {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
    }
}

impl Eq for TransferJob {}

impl Hash for TransferJob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
    }
}

impl PartialOrd for TransferJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransferJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entity.cmp(&other.entity)
    }
}

/// A job resolved against the registry, as handed to storage adapters.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    job: TransferJob,
    descriptor: Arc<EntityDescriptor>,
    columns: Vec<String>,
}

impl PlannedJob {
    pub fn job(&self) -> &TransferJob {
        &self.job
    }

    pub fn entity(&self) -> &EntityType {
        &self.job.entity
    }

    pub fn selection(&self) -> &Selection {
        &self.job.selection
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    /// Columns moved by this job, in declaration order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn output_name(&self) -> &str {
        self.descriptor.output_name()
    }

    pub fn is_excluded(&self, field: &str) -> bool {
        self.job.excluded_fields.contains(field)
    }
}
