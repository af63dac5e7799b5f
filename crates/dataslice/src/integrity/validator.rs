//! Pre-flight foreign-key validation.
//!
//! Runs before any data moves and answers one question per relation of every
//! job: will the referenced rows exist in the target once this job writes?

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::core::registry::SchemaRegistry;
use crate::core::schema::{ColumnRef, EntityType};
use crate::core::traits::StorageAdapter;
use crate::error::{Result, SliceError};
use crate::graph::DependencyGraph;
use crate::integrity::remap::IdMappings;
use crate::transfer::{PlannedJob, TransferJob};

/// Outcome of a successful validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Groups that must be loaded with deferred constraint checking.
    pub deferred_groups: Vec<Vec<EntityType>>,
    /// Unresolved nullable relations, loaded as-is.
    pub warnings: Vec<String>,
}

/// Groups of jobs that load together.
///
/// A group spans the execution order from a job to the last job it
/// references ahead of itself: members of a cyclic component, a forward
/// reference through an excluded edge, or a self-referencing entity on its
/// own. Overlapping spans merge into one group.
///
/// `jobs` must be in execution order; members come out in that order.
pub fn deferred_groups(graph: &DependencyGraph, jobs: &[PlannedJob]) -> Vec<Vec<EntityType>> {
    let position: HashMap<&EntityType, usize> = jobs
        .iter()
        .enumerate()
        .map(|(i, j)| (j.entity(), i))
        .collect();

    // Inclusive ranges of positions that must share a group.
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for component in graph.cyclic_groups() {
        let members: Vec<usize> = component
            .iter()
            .filter_map(|e| position.get(e).copied())
            .collect();
        if members.len() > 1 {
            let lo = members.iter().copied().min().unwrap_or(0);
            let hi = members.iter().copied().max().unwrap_or(0);
            spans.push((lo, hi));
        }
    }
    for (i, job) in jobs.iter().enumerate() {
        if graph.is_self_referencing(job.entity()) {
            spans.push((i, i));
        }
        for relation in &job.descriptor().relations {
            if job.is_excluded(&relation.field) {
                continue;
            }
            if let Some(&j) = position.get(&relation.target) {
                if j > i {
                    debug!(
                        "{}.{} references {}, which loads later",
                        job.entity(),
                        relation.field,
                        relation.target
                    );
                    spans.push((i, j));
                }
            }
        }
    }

    spans.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (lo, hi) in spans {
        match merged.last_mut() {
            Some(last) if lo <= last.1 => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }
    merged
        .into_iter()
        .map(|(lo, hi)| jobs[lo..=hi].iter().map(|j| j.entity().clone()).collect())
        .collect()
}

/// Checks every relation of a job set against the run order and the target.
pub struct FkValidator<'a> {
    registry: &'a SchemaRegistry,
    graph: &'a DependencyGraph,
}

impl<'a> FkValidator<'a> {
    pub fn new(registry: &'a SchemaRegistry, graph: &'a DependencyGraph) -> Self {
        Self { registry, graph }
    }

    /// Validate `jobs` (in execution order) against `target`.
    ///
    /// A relation passes when its target entity is transferred in the run
    /// (earlier, or later within the job's deferred group), has a preset id
    /// mapping, or already has rows in the target. Nullable relations that pass none of
    /// these become warnings; anything else fails with
    /// `UnresolvedDependency`.
    pub async fn validate(
        &self,
        jobs: &[PlannedJob],
        excluded: &BTreeSet<ColumnRef>,
        presets: &IdMappings,
        target: &dyn StorageAdapter,
    ) -> Result<ValidationReport> {
        let in_run: HashSet<&EntityType> = jobs.iter().map(|j| j.entity()).collect();
        let groups = deferred_groups(self.graph, jobs);

        let mut present: HashMap<EntityType, bool> = HashMap::new();
        let mut warnings = Vec::new();

        for job in jobs {
            let descriptor = job.descriptor();
            for relation in &descriptor.relations {
                if relation.target == descriptor.entity || job.is_excluded(&relation.field) {
                    continue;
                }
                let column = ColumnRef::new(descriptor.entity.clone(), relation.field.clone());

                // In the run: loaded earlier, or later inside the same group.
                if in_run.contains(&relation.target)
                    || presets.contains_entity(&relation.target)
                    || self.target_has_rows(&relation.target, target, &mut present).await?
                {
                    continue;
                }

                if descriptor.is_nullable(&relation.field) {
                    let message = format!(
                        "{} references {}, which is neither loaded earlier nor present in the target{}",
                        column,
                        relation.target,
                        if excluded.contains(&column) {
                            " (excluded edge)"
                        } else {
                            ""
                        }
                    );
                    warn!("{}", message);
                    warnings.push(message);
                    continue;
                }

                return Err(SliceError::UnresolvedDependency {
                    entity: descriptor.entity.clone(),
                    field: relation.field.clone(),
                    target: relation.target.clone(),
                });
            }
        }

        Ok(ValidationReport {
            deferred_groups: groups,
            warnings,
        })
    }

    async fn target_has_rows(
        &self,
        entity: &EntityType,
        target: &dyn StorageAdapter,
        cache: &mut HashMap<EntityType, bool>,
    ) -> Result<bool> {
        if let Some(&known) = cache.get(entity) {
            return Ok(known);
        }
        let whole = TransferJob::new(entity.clone()).plan(self.registry)?;
        let has_rows = target.contains(&whole).await?;
        debug!("target contains {}: {}", entity, has_rows);
        cache.insert(entity.clone(), has_rows);
        Ok(has_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{EntityDescriptor, FieldKind};
    use crate::config::FileConfig;
    use crate::drivers::file::FileAdapter;

    fn registry() -> SchemaRegistry {
        let mut r = SchemaRegistry::new();
        r.register_all([
            EntityDescriptor::builder("Tenant")
                .field("id", FieldKind::BigInt)
                .build(),
            EntityDescriptor::builder("Shop")
                .field("id", FieldKind::BigInt)
                .foreign_key("tenant_id", "Tenant")
                .nullable_foreign_key("parent_id", "Shop")
                .build(),
            EntityDescriptor::builder("Customer")
                .field("id", FieldKind::BigInt)
                .foreign_key("shop_id", "Shop")
                .nullable_foreign_key("referrer_shop_id", "Shop")
                .build(),
            EntityDescriptor::builder("Author")
                .field("id", FieldKind::BigInt)
                .nullable_foreign_key("favorite_book", "Book")
                .build(),
            EntityDescriptor::builder("Book")
                .field("id", FieldKind::BigInt)
                .foreign_key("author_id", "Author")
                .build(),
        ])
        .unwrap();
        r
    }

    fn jobs(registry: &SchemaRegistry, names: &[&str]) -> Vec<PlannedJob> {
        names
            .iter()
            .map(|n| TransferJob::new(*n).plan(registry).unwrap())
            .collect()
    }

    fn empty_target(dir: &tempfile::TempDir) -> FileAdapter {
        FileAdapter::new(FileConfig::new(dir.path()))
    }

    #[tokio::test]
    async fn test_dependencies_loaded_earlier_pass() {
        let registry = registry();
        let graph = DependencyGraph::build(&registry).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let report = FkValidator::new(&registry, &graph)
            .validate(
                &jobs(&registry, &["Tenant", "Shop", "Customer"]),
                &BTreeSet::new(),
                &IdMappings::new(),
                &empty_target(&dir),
            )
            .await
            .unwrap();
        assert!(report.warnings.is_empty());
        // Shop references itself.
        assert_eq!(report.deferred_groups, vec![vec![EntityType::new("Shop")]]);
    }

    #[tokio::test]
    async fn test_missing_dependency_fails() {
        let registry = registry();
        let graph = DependencyGraph::build(&registry).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = FkValidator::new(&registry, &graph)
            .validate(
                &jobs(&registry, &["Shop"]),
                &BTreeSet::new(),
                &IdMappings::new(),
                &empty_target(&dir),
            )
            .await
            .unwrap_err();
        match err {
            SliceError::UnresolvedDependency {
                entity,
                field,
                target,
            } => {
                assert_eq!(entity.as_str(), "Shop");
                assert_eq!(field, "tenant_id");
                assert_eq!(target.as_str(), "Tenant");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dependency_present_in_target_passes() {
        let registry = registry();
        let graph = DependencyGraph::build(&registry).unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tenant.csv"), "id\n1\n").unwrap();

        let report = FkValidator::new(&registry, &graph)
            .validate(
                &jobs(&registry, &["Shop"]),
                &BTreeSet::new(),
                &IdMappings::new(),
                &empty_target(&dir),
            )
            .await
            .unwrap();
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_preset_mapping_and_nullable_warning() {
        let registry = registry();
        let graph = DependencyGraph::build(&registry).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut presets = IdMappings::new();
        presets.merge("Shop".into(), [("1", "5")].into_iter().collect());

        let report = FkValidator::new(&registry, &graph)
            .validate(
                &jobs(&registry, &["Customer"]),
                &BTreeSet::new(),
                &presets,
                &empty_target(&dir),
            )
            .await
            .unwrap();
        assert!(report.warnings.is_empty());

        let job = TransferJob::new("Author").plan(&registry).unwrap();
        let report = FkValidator::new(&registry, &graph)
            .validate(
                &[job],
                &BTreeSet::new(),
                &IdMappings::new(),
                &empty_target(&dir),
            )
            .await
            .unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("Author.favorite_book"));
    }

    #[tokio::test]
    async fn test_cyclic_group_is_deferred() {
        let registry = registry();
        let graph = DependencyGraph::build(&registry).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let excluded: BTreeSet<ColumnRef> = ["Author.favorite_book".parse().unwrap()].into();
        let order = graph.compute_order(&excluded).unwrap();

        let mut planned = jobs(&registry, &["Book", "Author"]);
        planned.sort_by_key(|j| order.position(j.entity()));

        let report = FkValidator::new(&registry, &graph)
            .validate(&planned, &excluded, &IdMappings::new(), &empty_target(&dir))
            .await
            .unwrap();
        assert_eq!(
            report.deferred_groups,
            vec![vec![EntityType::new("Author"), EntityType::new("Book")]]
        );
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_forward_reference_through_excluded_edge_is_grouped() {
        let mut registry = SchemaRegistry::new();
        registry
            .register_all([
                EntityDescriptor::builder("Shop")
                    .field("id", FieldKind::BigInt)
                    .nullable_foreign_key("tenant_id", "Tenant")
                    .build(),
                EntityDescriptor::builder("Note")
                    .field("id", FieldKind::BigInt)
                    .build(),
                EntityDescriptor::builder("Tenant")
                    .field("id", FieldKind::BigInt)
                    .build(),
            ])
            .unwrap();
        let graph = DependencyGraph::build(&registry).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let excluded: BTreeSet<ColumnRef> = ["Shop.tenant_id".parse().unwrap()].into();
        let order = graph.compute_order(&excluded).unwrap();

        let mut planned = jobs(&registry, &["Tenant", "Note", "Shop"]);
        planned.sort_by_key(|j| order.position(j.entity()));
        let names: Vec<&str> = planned.iter().map(|j| j.entity().as_str()).collect();
        assert_eq!(names, vec!["Shop", "Note", "Tenant"]);

        // Shop writes before Tenant, so everything in between loads as one group.
        let report = FkValidator::new(&registry, &graph)
            .validate(&planned, &excluded, &IdMappings::new(), &empty_target(&dir))
            .await
            .unwrap();
        assert_eq!(
            report.deferred_groups,
            vec![vec![
                EntityType::new("Shop"),
                EntityType::new("Note"),
                EntityType::new("Tenant")
            ]]
        );
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_excluded_field_not_checked() {
        let registry = registry();
        let graph = DependencyGraph::build(&registry).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job = TransferJob::new("Book")
            .exclude("author_id")
            .plan(&registry)
            .unwrap();
        let report = FkValidator::new(&registry, &graph)
            .validate(
                &[job],
                &BTreeSet::new(),
                &IdMappings::new(),
                &empty_target(&dir),
            )
            .await
            .unwrap();
        assert!(report.warnings.is_empty());
    }
}
