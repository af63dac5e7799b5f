//! Run orchestrator - validates, orders and executes transfer jobs.
//!
//! A run is strictly sequential: jobs execute one at a time in dependency
//! order, each streaming `source.read_rows` into `target.write_rows`,
//! optionally through a [`Remapper`] stage. Members of a cyclic group (and
//! self-referencing entities) are written inside one target group and their
//! deferred references are patched before the group commits.

mod result;

pub use result::{JobResult, Progress, RunResult, RunStatus};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::registry::SchemaRegistry;
use crate::core::schema::{ColumnRef, EntityType};
use crate::core::traits::{StorageAdapter, WriteSummary};
use crate::core::value::DEFAULT_CHANNEL_CAPACITY;
use crate::error::{Result, SliceError};
use crate::graph::DependencyGraph;
use crate::integrity::{
    deferred_groups, resolve_deferred, DeferredUpdate, FkValidator, IdAllocator, IdMappings,
    RemapConfig, RemapScope, RemapStrategy, Remapper,
};
use crate::transfer::{PlannedJob, TransferJob};
use result::RunRecorder;

/// Callback invoked after every completed job.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Per-run options.
#[derive(Clone)]
pub struct RunOptions {
    /// Relations ignored for ordering (cycle breakers).
    pub excluded_columns: BTreeSet<ColumnRef>,

    /// Validate foreign keys before any data moves.
    pub check_references: bool,

    /// Id remapping; `None` copies identifiers unchanged.
    pub remapping: Option<RemapConfig>,

    /// Where to persist id mappings after a successful run.
    pub lineage_path: Option<PathBuf>,

    /// Checked between jobs.
    pub cancel: Option<CancellationToken>,

    pub progress: Option<ProgressCallback>,

    /// Batches buffered between pipeline stages.
    pub channel_capacity: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            excluded_columns: BTreeSet::new(),
            check_references: true,
            remapping: None,
            lineage_path: None,
            cancel: None,
            progress: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("excluded_columns", &self.excluded_columns)
            .field("check_references", &self.check_references)
            .field("remapping", &self.remapping)
            .field("lineage_path", &self.lineage_path)
            .field("cancel", &self.cancel)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl RunOptions {
    pub fn with_excluded_columns<I>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = ColumnRef>,
    {
        self.excluded_columns.extend(columns);
        self
    }

    /// Ignore `column` when ordering, e.g. `"Author.favorite_book"`.
    pub fn exclude_column(mut self, column: ColumnRef) -> Self {
        self.excluded_columns.insert(column);
        self
    }

    pub fn with_reference_checks(mut self, enabled: bool) -> Self {
        self.check_references = enabled;
        self
    }

    pub fn with_remapping(mut self, remapping: RemapConfig) -> Self {
        self.remapping = Some(remapping);
        self
    }

    pub fn with_lineage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lineage_path = Some(path.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// Whether every job needs the rewrite stage.
    fn tracks_ids(&self) -> bool {
        self.remapping.is_some() || self.lineage_path.is_some()
    }
}

/// Mutable state of one execution.
struct RunState<'p> {
    recorder: RunRecorder,
    mappings: IdMappings,
    in_run: HashSet<EntityType>,
    group_of: HashMap<EntityType, usize>,
    groups: Vec<Vec<EntityType>>,
    open_group: Option<usize>,
    /// Deferred references of the open group.
    deferred: Vec<DeferredUpdate>,
    /// Jobs written inside the open group, recorded when it commits.
    group_results: Vec<JobResult>,
    planned: &'p [PlannedJob],
}

/// Runs transfer jobs against a fixed registry.
pub struct Orchestrator<'r> {
    registry: &'r SchemaRegistry,
}

impl<'r> Orchestrator<'r> {
    pub fn new(registry: &'r SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Run `jobs` from `source` into `target`.
    ///
    /// Validation failures are returned before any data moves. Once jobs
    /// start, a failure stops the run and is returned as
    /// [`SliceError::Aborted`]; cancellation as [`SliceError::Cancelled`].
    /// Both carry the partial [`RunResult`].
    pub async fn run(
        &self,
        source: &dyn StorageAdapter,
        target: &dyn StorageAdapter,
        jobs: Vec<TransferJob>,
        options: RunOptions,
    ) -> Result<RunResult> {
        if jobs.is_empty() {
            info!("No jobs to run");
            return Ok(RunResult::empty());
        }

        let mut planned = self.plan(&jobs)?;

        if source.location() == target.location() && !target.overwrite() {
            return Err(SliceError::SameStorage(target.location()));
        }

        let graph = DependencyGraph::build(self.registry)?;
        let order = graph.compute_order(&options.excluded_columns)?;
        planned.sort_by_key(|j| order.position(j.entity()));

        let mut recorder = RunRecorder::new(planned.len());
        recorder.set_dropped_edges(order.dropped_edges.iter().map(|e| e.to_string()).collect());
        for edge in &order.dropped_edges {
            debug!("Ignoring {} for ordering", edge);
        }

        info!(
            "Starting run {}: {} jobs from {} to {}",
            recorder.run_id(),
            planned.len(),
            source.kind(),
            target.kind()
        );
        debug!(
            "Execution order: {}",
            planned
                .iter()
                .map(|j| j.entity().as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        source.open().await?;
        if let Err(e) = target.open().await {
            source.close().await;
            return Err(e);
        }

        let outcome = self
            .execute(source, target, &graph, &planned, &options, recorder)
            .await;

        target.close().await;
        source.close().await;
        outcome
    }

    /// Bind every job to its descriptor, rejecting duplicates.
    fn plan(&self, jobs: &[TransferJob]) -> Result<Vec<PlannedJob>> {
        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(jobs.len());
        for job in jobs {
            if !seen.insert(job.entity().clone()) {
                return Err(SliceError::DuplicateJob(job.entity().clone()));
            }
            planned.push(job.plan(self.registry)?);
        }
        Ok(planned)
    }

    async fn execute(
        &self,
        source: &dyn StorageAdapter,
        target: &dyn StorageAdapter,
        graph: &DependencyGraph,
        planned: &[PlannedJob],
        options: &RunOptions,
        mut recorder: RunRecorder,
    ) -> Result<RunResult> {
        for job in planned {
            target.check_writable(job).await?;
        }

        let presets = options
            .remapping
            .as_ref()
            .map(RemapConfig::seeded_mappings)
            .unwrap_or_default();

        if options.check_references || options.remapping.is_some() {
            let report = FkValidator::new(self.registry, graph)
                .validate(planned, &options.excluded_columns, &presets, target)
                .await?;
            recorder.add_warnings(report.warnings);
        }

        let groups = deferred_groups(graph, planned);
        for group in &groups {
            debug!(
                "Deferred group: [{}]",
                group
                    .iter()
                    .map(|e| e.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let mut state = RunState {
            recorder,
            mappings: presets,
            in_run: planned.iter().map(|j| j.entity().clone()).collect(),
            group_of: groups
                .iter()
                .enumerate()
                .flat_map(|(i, g)| g.iter().map(move |e| (e.clone(), i)))
                .collect(),
            groups,
            open_group: None,
            deferred: Vec::new(),
            group_results: Vec::new(),
            planned,
        };

        for job in planned {
            if state.open_group.is_none() && options.is_cancelled() {
                let partial = state.recorder.finish(RunStatus::Cancelled);
                warn!(
                    "Run {} cancelled after {} of {} jobs",
                    partial.run_id,
                    partial.jobs_completed(),
                    partial.jobs_total
                );
                return Err(SliceError::Cancelled {
                    partial: Box::new(partial),
                });
            }

            if let Err(e) = self.step(source, target, job, options, &mut state).await {
                if state.open_group.take().is_some() {
                    target.rollback_group().await;
                }
                error!("Run {} aborted at {}: {}", state.recorder.run_id(), job.entity(), e);
                return Err(SliceError::Aborted {
                    entity: job.entity().clone(),
                    source: Box::new(e),
                    partial: Box::new(state.recorder.finish(RunStatus::Failed)),
                });
            }
        }

        if let Some(path) = &options.lineage_path {
            state.mappings.save(state.recorder.run_id(), path)?;
        }

        let result = state.recorder.finish(RunStatus::Completed);
        info!(
            "Run {} completed: {} jobs, {} rows in {:.1}s",
            result.run_id,
            result.jobs_completed(),
            result.rows_total,
            result.duration_seconds
        );
        Ok(result)
    }

    /// Execute one job, opening or committing its group as needed.
    async fn step(
        &self,
        source: &dyn StorageAdapter,
        target: &dyn StorageAdapter,
        job: &PlannedJob,
        options: &RunOptions,
        state: &mut RunState<'_>,
    ) -> Result<()> {
        let entity = job.entity();
        let group = state.group_of.get(entity).copied();

        if let Some(g) = group {
            if state.open_group.is_none() {
                target.begin_group(&state.groups[g]).await?;
                state.open_group = Some(g);
            }
        }

        let started = Instant::now();
        let (summary, remapper) = self
            .transfer(source, target, job, options, state, group)
            .await?;
        let elapsed = started.elapsed().as_secs_f64();

        if let Some(remapper) = remapper {
            let (mapping, deferred) = remapper.into_parts();
            debug!("{}: {} ids mapped", entity, mapping.len());
            state.mappings.merge(entity.clone(), mapping);
            state.deferred.extend(deferred);
        }

        info!(
            "{}: {} rows -> {} in {:.2}s",
            entity, summary.rows, summary.location, elapsed
        );
        let job_result = JobResult {
            entity: entity.clone(),
            rows: summary.rows,
            location: summary.location,
            elapsed_seconds: elapsed,
            deferred_updates: 0,
        };

        match group {
            None => self.record(state, job_result, options),
            Some(g) => {
                state.group_results.push(job_result);
                let last = state.groups[g].last() == Some(entity);
                if last {
                    self.commit_group(target, g, options, state).await?;
                }
            }
        }
        Ok(())
    }

    /// Stream one job, through the rewrite stage when ids are tracked or
    /// references must be deferred.
    async fn transfer(
        &self,
        source: &dyn StorageAdapter,
        target: &dyn StorageAdapter,
        job: &PlannedJob,
        options: &RunOptions,
        state: &RunState<'_>,
        group: Option<usize>,
    ) -> Result<(WriteSummary, Option<Remapper>)> {
        let pk = &job.descriptor().primary_key;
        let needs_stage =
            options.tracks_ids() || (group.is_some() && job.columns().contains(pk));

        let rows = source.read_rows(job).await?;
        if !needs_stage {
            return Ok((target.write_rows(job, rows).await?, None));
        }

        let strategy = options
            .remapping
            .as_ref()
            .map(|r| r.strategy_for(job.entity()).clone())
            .unwrap_or(RemapStrategy::Preserve);
        let allocator = IdAllocator::for_job(&strategy, job, rows.header(), target).await?;

        let pending_in_group = match group {
            Some(g) => {
                let members = &state.groups[g];
                let done = state.group_results.len();
                members[done..].iter().cloned().collect()
            }
            None => HashSet::new(),
        };
        let scope = RemapScope {
            known: state.mappings.clone(),
            in_run: state.in_run.clone(),
            pending_in_group,
            rewrite_references: options.remapping.is_some(),
        };
        let remapper = Remapper::new(job, rows.header(), allocator, scope)?;

        let (rewritten, handle) = rows.pipe(options.channel_capacity, remapper);
        let written = target.write_rows(job, rewritten).await;
        let stage = handle.await.map_err(|e| {
            SliceError::integrity(job.entity(), format!("Rewrite task panicked: {}", e))
        })?;

        // The writer sees stage errors forwarded through the stream.
        let summary = written?;
        Ok((summary, Some(stage?)))
    }

    /// Patch deferred references of group `g` and commit it.
    async fn commit_group(
        &self,
        target: &dyn StorageAdapter,
        g: usize,
        options: &RunOptions,
        state: &mut RunState<'_>,
    ) -> Result<()> {
        let members = state.groups[g].clone();
        let deferred = std::mem::take(&mut state.deferred);
        let updates = resolve_deferred(&members, &deferred, &state.mappings)?;

        for ((entity, field), resolved) in &updates {
            let Some(job) = state.planned.iter().find(|j| j.entity() == entity) else {
                continue;
            };
            let applied = target.apply_deferred(job, field, resolved).await?;
            debug!("{}.{}: {} deferred references applied", entity, field, applied);
            if let Some(result) = state.group_results.iter_mut().find(|r| &r.entity == entity) {
                result.deferred_updates += applied;
            }
        }

        target.commit_group().await.map_err(|e| match e {
            SliceError::CircularResolution { group, message } if group.is_empty() => {
                SliceError::CircularResolution {
                    group: members.clone(),
                    message,
                }
            }
            other => other,
        })?;
        state.open_group = None;

        info!(
            "Committed group [{}] ({} deferred references)",
            members
                .iter()
                .map(|e| e.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            deferred.len()
        );

        for result in std::mem::take(&mut state.group_results) {
            self.record(state, result, options);
        }
        Ok(())
    }

    fn record(&self, state: &mut RunState<'_>, job: JobResult, options: &RunOptions) {
        let progress = state.recorder.record(job);
        if let Some(callback) = &options.progress {
            callback(&progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use crate::core::schema::{EntityDescriptor, FieldKind};
    use crate::drivers::FileAdapter;
    use std::sync::Mutex;

    fn registry() -> SchemaRegistry {
        let mut r = SchemaRegistry::new();
        r.register_all([
            EntityDescriptor::builder("Tenant")
                .field("id", FieldKind::BigInt)
                .nullable_field("name", FieldKind::Text)
                .build(),
            EntityDescriptor::builder("Shop")
                .field("id", FieldKind::BigInt)
                .foreign_key("tenant_id", "Tenant")
                .nullable_field("name", FieldKind::Text)
                .build(),
        ])
        .unwrap();
        r
    }

    fn seed(dir: &std::path::Path) {
        std::fs::write(dir.join("tenant.csv"), "id,name\n1,Acme\n2,Globex\n").unwrap();
        std::fs::write(dir.join("shop.csv"), "id,tenant_id,name\n10,1,North\n11,2,South\n")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_orders_jobs_and_reports_progress() {
        let registry = registry();
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        seed(src.path());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = RunOptions::default().with_progress(move |p: &Progress| {
            sink.lock()
                .unwrap()
                .push((p.entity.to_string(), p.jobs_completed, p.rows_total));
        });

        let result = Orchestrator::new(&registry)
            .run(
                &FileAdapter::new(FileConfig::new(src.path())),
                &FileAdapter::new(FileConfig::new(dst.path())),
                vec![TransferJob::new("Shop"), TransferJob::new("Tenant")],
                options,
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.rows_total, 4);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("Tenant".to_string(), 1, 2), ("Shop".to_string(), 2, 4)]
        );
        assert!(dst.path().join("shop.csv").exists());
    }

    #[tokio::test]
    async fn test_empty_job_list() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::new(FileConfig::new(dir.path()));
        let result = Orchestrator::new(&registry)
            .run(&adapter, &adapter, vec![], RunOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.jobs_total, 0);
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected() {
        let registry = registry();
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let err = Orchestrator::new(&registry)
            .run(
                &FileAdapter::new(FileConfig::new(src.path())),
                &FileAdapter::new(FileConfig::new(dst.path())),
                vec![TransferJob::new("Tenant"), TransferJob::new("Tenant")],
                RunOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SliceError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn test_same_storage_rejected() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let adapter = FileAdapter::new(FileConfig::new(dir.path()));
        let err = Orchestrator::new(&registry)
            .run(
                &adapter,
                &adapter,
                vec![TransferJob::new("Tenant")],
                RunOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SliceError::SameStorage(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_first_job() {
        let registry = registry();
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        seed(src.path());

        let token = CancellationToken::new();
        token.cancel();
        let err = Orchestrator::new(&registry)
            .run(
                &FileAdapter::new(FileConfig::new(src.path())),
                &FileAdapter::new(FileConfig::new(dst.path())),
                vec![TransferJob::new("Tenant")],
                RunOptions::default().with_cancellation(token),
            )
            .await
            .unwrap_err();

        let partial = err.partial_result().unwrap();
        assert_eq!(partial.status, RunStatus::Cancelled);
        assert_eq!(partial.jobs_completed(), 0);
        assert!(!dst.path().join("tenant.csv").exists());
    }

    #[test]
    fn test_options_debug_hides_callback() {
        let options = RunOptions::default().with_progress(|_| {});
        let debug = format!("{:?}", options);
        assert!(debug.contains("<callback>"));
        assert!(options.check_references);
    }
}
