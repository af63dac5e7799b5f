//! Identifier remapping between storage instances.
//!
//! When the target assigns its own identifiers, every loaded row gets a new
//! primary key and every foreign key pointing at a remapped entity is
//! rewritten through that entity's [`IdMapping`]. The [`Remapper`] does this
//! as a [`BatchStage`] between the source reader and the target writer.
//!
//! References that cannot be resolved while the row is in flight (self
//! references to later rows, or references into a cyclic group that has not
//! finished loading) are written as null and recorded as [`DeferredUpdate`]s,
//! which the orchestrator resolves and applies at the group boundary.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::schema::EntityType;
use crate::core::traits::{FieldUpdate, StorageAdapter};
use crate::core::value::{BatchStage, RowBatch};
use crate::error::{Result, SliceError};
use crate::transfer::{Predicate, PlannedJob, Selection};

/// Source id → target id for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMapping(BTreeMap<String, String>);

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source_id: &str) -> Option<&str> {
        self.0.get(source_id).map(String::as_str)
    }

    pub fn insert(&mut self, source_id: impl Into<String>, target_id: impl Into<String>) {
        self.0.insert(source_id.into(), target_id.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for IdMapping {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// The id mappings of one run, keyed by entity.
///
/// Mappings are shared behind `Arc` so snapshots handed to rewrite stages are
/// cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct IdMappings {
    by_entity: HashMap<EntityType, Arc<IdMapping>>,
}

impl IdMappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: &EntityType) -> Option<&IdMapping> {
        self.by_entity.get(entity).map(Arc::as_ref)
    }

    pub fn contains_entity(&self, entity: &EntityType) -> bool {
        self.by_entity.contains_key(entity)
    }

    /// Target id for `source_id` of `entity`, if mapped.
    pub fn resolve(&self, entity: &EntityType, source_id: &str) -> Option<&str> {
        self.get(entity).and_then(|m| m.get(source_id))
    }

    /// Merge `mapping` into the entity's existing mapping.
    pub fn merge(&mut self, entity: EntityType, mapping: IdMapping) {
        match self.by_entity.get_mut(&entity) {
            Some(existing) => Arc::make_mut(existing).0.extend(mapping.0),
            None => {
                self.by_entity.insert(entity, Arc::new(mapping));
            }
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.by_entity.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }

    /// Plain map view, used for lineage persistence.
    pub fn to_map(&self) -> BTreeMap<EntityType, IdMapping> {
        self.by_entity
            .iter()
            .map(|(e, m)| (e.clone(), m.as_ref().clone()))
            .collect()
    }

    pub fn from_map(map: BTreeMap<EntityType, IdMapping>) -> Self {
        Self {
            by_entity: map.into_iter().map(|(e, m)| (e, Arc::new(m))).collect(),
        }
    }
}

/// How target identifiers are chosen for an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RemapStrategy {
    /// Keep source identifiers (references are still tracked and checked).
    Preserve,
    /// New ids continue after the target's current maximum, in source order.
    Sequential,
    /// Deterministic ids derived from a business key column.
    HashBased { business_key: String },
    /// Explicit mapping; ids not listed keep their source value.
    Preset { mapping: IdMapping },
}

/// Strategy selection for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapConfig {
    /// Strategy for entities without an explicit entry.
    #[serde(default = "default_strategy")]
    pub default: RemapStrategy,

    /// Per-entity overrides.
    #[serde(default)]
    pub per_entity: BTreeMap<EntityType, RemapStrategy>,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            default: default_strategy(),
            per_entity: BTreeMap::new(),
        }
    }
}

fn default_strategy() -> RemapStrategy {
    RemapStrategy::Sequential
}

impl RemapConfig {
    pub fn new(default: RemapStrategy) -> Self {
        Self {
            default,
            per_entity: BTreeMap::new(),
        }
    }

    pub fn with_strategy(mut self, entity: impl Into<EntityType>, strategy: RemapStrategy) -> Self {
        self.per_entity.insert(entity.into(), strategy);
        self
    }

    /// Map one source tenant onto an existing target tenant.
    pub fn tenant(
        self,
        entity: impl Into<EntityType>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        let mapping = [(source_id.into(), target_id.into())].into_iter().collect();
        self.with_strategy(entity, RemapStrategy::Preset { mapping })
    }

    /// Turn previously persisted mappings into presets for entities without
    /// an explicit strategy.
    pub fn seed_from(mut self, mappings: &IdMappings) -> Self {
        for (entity, mapping) in mappings.to_map() {
            self.per_entity
                .entry(entity)
                .or_insert(RemapStrategy::Preset { mapping });
        }
        self
    }

    pub fn strategy_for(&self, entity: &EntityType) -> &RemapStrategy {
        self.per_entity.get(entity).unwrap_or(&self.default)
    }

    /// Mappings known before any row moves: every preset.
    pub fn seeded_mappings(&self) -> IdMappings {
        let mut mappings = IdMappings::new();
        for (entity, strategy) in &self.per_entity {
            if let RemapStrategy::Preset { mapping } = strategy {
                mappings.merge(entity.clone(), mapping.clone());
            }
        }
        mappings
    }
}

/// Foreign-key field name used for tenant scoping: `<lowercase entity>_id`.
pub fn tenant_field_name(tenant: &EntityType) -> String {
    format!("{}_id", tenant.as_str().to_lowercase())
}

/// Selection restricting a dependent entity's export to one tenant.
pub fn tenant_filter(tenant: &EntityType, tenant_id: impl Into<String>) -> Selection {
    Selection::Filter(Predicate::eq(tenant_field_name(tenant), tenant_id))
}

/// Deterministic positive id for a business key.
pub fn hash_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let id = i64::from_be_bytes(bytes) & i64::MAX;
    id.max(1)
}

/// Per-job id generator built from a [`RemapStrategy`].
#[derive(Debug, Clone)]
pub enum IdAllocator {
    Preserve,
    Sequential { next: i64 },
    HashBased { key_index: usize },
    Preset(IdMapping),
}

impl IdAllocator {
    /// Sequential allocator handing out `start`, `start + 1`, ...
    pub fn sequential(start: i64) -> Self {
        IdAllocator::Sequential { next: start }
    }

    /// Build the allocator for `job`, whose rows arrive in `header` order,
    /// querying the target where needed.
    pub async fn for_job(
        strategy: &RemapStrategy,
        job: &PlannedJob,
        header: &[String],
        target: &dyn StorageAdapter,
    ) -> Result<Self> {
        let descriptor = job.descriptor();
        match strategy {
            RemapStrategy::Preserve => Ok(IdAllocator::Preserve),
            RemapStrategy::Sequential => {
                let pk_is_integer = descriptor
                    .primary_key_field()
                    .is_some_and(|f| f.kind.is_integer());
                if !pk_is_integer {
                    return Err(SliceError::Validation(format!(
                        "{}: sequential remapping needs an integer primary key",
                        job.entity()
                    )));
                }
                let max = target.max_id(job).await?;
                debug!("{}: sequential ids start after {}", job.entity(), max);
                Ok(IdAllocator::Sequential { next: max + 1 })
            }
            RemapStrategy::HashBased { business_key } => {
                let key_index = header
                    .iter()
                    .position(|c| c == business_key)
                    .ok_or_else(|| {
                        SliceError::Validation(format!(
                            "{}: business key '{}' not found",
                            job.entity(),
                            business_key
                        ))
                    })?;
                Ok(IdAllocator::HashBased { key_index })
            }
            RemapStrategy::Preset { mapping } => Ok(IdAllocator::Preset(mapping.clone())),
        }
    }

    fn allocate(&mut self, source_id: &str, row: &[Option<String>]) -> String {
        match self {
            IdAllocator::Preserve => source_id.to_string(),
            IdAllocator::Sequential { next } => {
                let id = *next;
                *next += 1;
                id.to_string()
            }
            IdAllocator::HashBased { key_index } => match row.get(*key_index) {
                Some(Some(key)) if !key.is_empty() => hash_id(key).to_string(),
                _ => source_id.to_string(),
            },
            IdAllocator::Preset(mapping) => mapping
                .get(source_id)
                .unwrap_or(source_id)
                .to_string(),
        }
    }
}

/// A reference written provisionally and fixed once its target is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredUpdate {
    pub entity: EntityType,
    pub field: String,
    /// Primary key of the written row, in target ids.
    pub pk: String,
    /// Referenced entity.
    pub target: EntityType,
    /// Referenced id, in source ids.
    pub source_value: String,
}

/// What the run looks like from the point of view of one job.
#[derive(Debug, Clone, Default)]
pub struct RemapScope {
    /// Mappings of every entity loaded so far, plus presets.
    pub known: IdMappings,
    /// Entities transferred in this run.
    pub in_run: HashSet<EntityType>,
    /// Members of the current cyclic group that have not been written yet,
    /// the current entity included.
    pub pending_in_group: HashSet<EntityType>,
    /// Rewrite and check references to entities outside the group.
    pub rewrite_references: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefMode {
    /// Rewrite through a completed entity's mapping.
    Rewrite,
    /// Reference into this entity; resolved from rows already seen, or deferred.
    SelfRef,
    /// Reference into an unfinished group member; always deferred.
    Deferred,
}

#[derive(Debug, Clone)]
struct RefPlan {
    index: usize,
    field: String,
    target: EntityType,
    nullable: bool,
    mode: RefMode,
}

/// Row rewrite stage: primary keys, foreign keys and deferred references.
#[derive(Debug)]
pub struct Remapper {
    entity: EntityType,
    pk_index: usize,
    allocator: IdAllocator,
    mapping: IdMapping,
    refs: Vec<RefPlan>,
    scope: RemapScope,
    deferred: Vec<DeferredUpdate>,
    fallbacks: u64,
}

impl Remapper {
    /// Plan the rewrite of `job`'s rows, whose stream carries `header`.
    pub fn new(
        job: &PlannedJob,
        header: &[String],
        allocator: IdAllocator,
        scope: RemapScope,
    ) -> Result<Self> {
        let descriptor = job.descriptor();
        let pk_index = header
            .iter()
            .position(|c| c == &descriptor.primary_key)
            .ok_or_else(|| {
                SliceError::Validation(format!(
                    "{}: primary key '{}' must be transferred for id tracking",
                    job.entity(),
                    descriptor.primary_key
                ))
            })?;

        let mut refs = Vec::new();
        for relation in &descriptor.relations {
            let Some(index) = header.iter().position(|c| c == &relation.field) else {
                continue;
            };
            let mode = if relation.target == descriptor.entity {
                RefMode::SelfRef
            } else if scope.pending_in_group.contains(&relation.target) {
                RefMode::Deferred
            } else if scope.rewrite_references {
                RefMode::Rewrite
            } else {
                continue;
            };
            refs.push(RefPlan {
                index,
                field: relation.field.clone(),
                target: relation.target.clone(),
                nullable: descriptor.is_nullable(&relation.field),
                mode,
            });
        }

        Ok(Self {
            entity: job.entity().clone(),
            pk_index,
            allocator,
            mapping: IdMapping::new(),
            refs,
            scope,
            deferred: Vec::new(),
            fallbacks: 0,
        })
    }

    /// Mapping built for this entity and the deferred references collected.
    pub fn into_parts(self) -> (IdMapping, Vec<DeferredUpdate>) {
        if self.fallbacks > 0 {
            debug!(
                "{}: {} references kept their source value (target entity not in this run)",
                self.entity, self.fallbacks
            );
        }
        (self.mapping, self.deferred)
    }

    fn defer(&mut self, row: &mut [Option<String>], r: usize, pk: &str, value: String) {
        let plan = &self.refs[r];
        if plan.nullable {
            row[plan.index] = None;
        }
        self.deferred.push(DeferredUpdate {
            entity: self.entity.clone(),
            field: plan.field.clone(),
            pk: pk.to_string(),
            target: plan.target.clone(),
            source_value: value,
        });
    }
}

impl BatchStage for Remapper {
    fn process(&mut self, mut batch: RowBatch) -> Result<RowBatch> {
        for row in batch.iter_mut() {
            let source_pk = row
                .get(self.pk_index)
                .cloned()
                .flatten()
                .ok_or_else(|| SliceError::integrity(&self.entity, "row without primary key"))?;

            let target_pk = match self.mapping.get(&source_pk) {
                Some(existing) => existing.to_string(),
                None => {
                    let id = self.allocator.allocate(&source_pk, row);
                    self.mapping.insert(source_pk.clone(), id.clone());
                    id
                }
            };
            row[self.pk_index] = Some(target_pk.clone());

            for r in 0..self.refs.len() {
                let (index, mode) = (self.refs[r].index, self.refs[r].mode);
                let Some(value) = row[index].clone() else {
                    continue;
                };
                match mode {
                    RefMode::Rewrite => {
                        let target = &self.refs[r].target;
                        if let Some(new) = self.scope.known.resolve(target, &value) {
                            row[index] = Some(new.to_string());
                        } else if self.scope.in_run.contains(target) {
                            return Err(SliceError::integrity(
                                &self.entity,
                                format!(
                                    "{} = {} references {} {}, which was not loaded in this run",
                                    self.refs[r].field, value, target, value
                                ),
                            ));
                        } else {
                            self.fallbacks += 1;
                        }
                    }
                    RefMode::SelfRef => {
                        if let Some(new) = self.mapping.get(&value).map(str::to_string) {
                            row[index] = Some(new);
                        } else {
                            self.defer(row, r, &target_pk, value);
                        }
                    }
                    RefMode::Deferred => self.defer(row, r, &target_pk, value),
                }
            }
        }
        Ok(batch)
    }
}

/// Resolve deferred references through the final mappings of a group.
///
/// Returns updates grouped by (entity, field). Any reference whose target row
/// was never loaded fails with `CircularResolution`.
pub fn resolve_deferred(
    group: &[EntityType],
    updates: &[DeferredUpdate],
    mappings: &IdMappings,
) -> Result<BTreeMap<(EntityType, String), Vec<FieldUpdate>>> {
    let mut resolved: BTreeMap<(EntityType, String), Vec<FieldUpdate>> = BTreeMap::new();
    for u in updates {
        let value = mappings.resolve(&u.target, &u.source_value).ok_or_else(|| {
            SliceError::CircularResolution {
                group: group.to_vec(),
                message: format!(
                    "{}.{} of row {} references {} {}, which was not loaded",
                    u.entity, u.field, u.pk, u.target, u.source_value
                ),
            }
        })?;
        resolved
            .entry((u.entity.clone(), u.field.clone()))
            .or_default()
            .push(FieldUpdate {
                pk: u.pk.clone(),
                value: Some(value.to_string()),
            });
    }
    Ok(resolved)
}
