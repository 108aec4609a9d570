use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::dag::{CacheKeyManager, PipelineDAG, StageNode};
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::job::{Job, JobState, JobStateMachine, StageId};
use crate::pipeline::{StageConfig, StageContext, StageHandler, StageInput, StageOutput};
use codegraph_ir::features::chunking::file_filter::should_chunk_file;
use codegraph_storage::SnapshotStore;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pipeline result (aggregated metrics from all stages)
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub files_processed: usize,
    pub nodes_created: usize,
    pub chunks_created: usize,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

impl PipelineResult {
    pub fn merge_metrics(&mut self, metrics: &crate::pipeline::StageMetrics) {
        self.files_processed += metrics.files_processed;
        self.nodes_created += metrics.nodes_created;
        self.chunks_created += metrics.chunks_created;
        self.duration_ms += metrics.duration_ms;
        self.errors.extend(metrics.errors.clone());
    }
}

/// Schedules the Chunk → {CrossRef, Embedding} DAG across stage handlers,
/// checkpointing each stage's small summary payload for resume.
pub struct PipelineOrchestrator {
    dag: Arc<PipelineDAG>,
    checkpoint_mgr: Arc<CheckpointManager>,
    stage_handlers: HashMap<StageId, Arc<dyn StageHandler>>,
    worker_id: String,
}

impl PipelineOrchestrator {
    /// Create a new orchestrator with default pipeline
    pub fn new(checkpoint_mgr: Arc<CheckpointManager>) -> Result<Self> {
        let dag = PipelineDAG::default_pipeline()?;

        Ok(Self {
            dag: Arc::new(dag),
            checkpoint_mgr,
            stage_handlers: HashMap::new(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        })
    }

    /// Create with custom DAG
    pub fn with_dag(dag: PipelineDAG, checkpoint_mgr: Arc<CheckpointManager>) -> Self {
        Self {
            dag: Arc::new(dag),
            checkpoint_mgr,
            stage_handlers: HashMap::new(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Register a stage handler
    pub fn register_handler(&mut self, handler: Arc<dyn StageHandler>) {
        self.stage_handlers.insert(handler.stage_id(), handler);
    }

    /// Execute a job (main entry point)
    pub async fn execute_job(
        &self,
        mut job: Job,
        store: Arc<dyn SnapshotStore>,
        repo_root: PathBuf,
    ) -> Result<(Job, PipelineResult)> {
        let job_id = job.id;
        let start_time = Instant::now();

        info!(
            "Starting job {} for repo {} (snapshot: {})",
            job_id, job.repo_id, job.snapshot_id
        );

        let plan = self.dag.execution_plan();
        info!("Execution plan:\n{}", plan);

        let mut state_machine = JobStateMachine::new(job);
        state_machine.start(self.worker_id.clone(), StageId::Chunk)?;
        job = state_machine.into_job();

        let completed = self.checkpoint_mgr.completed_stages(job_id).await?;
        if !completed.is_empty() {
            info!(
                "Resuming from checkpoint - {} stages already completed: {:?}",
                completed.len(),
                completed
            );
        }

        let result = self
            .run_dag(job_id, &job.repo_id, &job.snapshot_id, &completed, store, repo_root)
            .await;

        let elapsed = start_time.elapsed();

        let final_job = match result {
            Ok(mut pipeline_result) => {
                pipeline_result.duration_ms = elapsed.as_millis() as u64;

                info!(
                    "Job {} completed successfully - processed {} files, created {} nodes, {} chunks in {}ms",
                    job_id,
                    pipeline_result.files_processed,
                    pipeline_result.nodes_created,
                    pipeline_result.chunks_created,
                    pipeline_result.duration_ms
                );

                let mut sm = JobStateMachine::new(job);
                sm.complete(pipeline_result.files_processed)?;
                let completed_job = sm.into_job();

                self.checkpoint_mgr.delete_job_checkpoints(job_id).await?;

                (completed_job, pipeline_result)
            }
            Err(e) => {
                error!("Job {} failed: {}", job_id, e);

                let anyhow_err: anyhow::Error = e.into();
                let error_category = self.classify_error(&anyhow_err);
                let failed_stage = self.get_current_stage_from_error(&anyhow_err);

                let mut sm = JobStateMachine::new(job);
                let retry_count = match &sm.job().state {
                    JobState::Failed { retry_count, .. } => *retry_count + 1,
                    _ => 0,
                };

                sm.fail(anyhow_err.to_string(), error_category, failed_stage, retry_count)?;
                let failed_job = sm.into_job();

                let empty_result = PipelineResult {
                    duration_ms: elapsed.as_millis() as u64,
                    ..Default::default()
                };

                return Ok((failed_job, empty_result));
            }
        };

        Ok(final_job)
    }

    /// Execute DAG with parallel phases
    async fn run_dag(
        &self,
        job_id: Uuid,
        repo_id: &str,
        snapshot_id: &str,
        completed: &HashSet<StageId>,
        store: Arc<dyn SnapshotStore>,
        repo_root: PathBuf,
    ) -> Result<PipelineResult> {
        let ctx = StageContext {
            job_id,
            repo_id: repo_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            cache_keys: CacheKeyManager::new(repo_id.to_string(), snapshot_id.to_string()),
            checkpoint_mgr: self.checkpoint_mgr.clone(),
            store,
            repo_root,
        };

        let mut overall_result = PipelineResult::default();

        for (phase_idx, parallel_group) in self.dag.execution_order().iter().enumerate() {
            info!(
                "Job {}: Phase {} - {} stages{}",
                job_id,
                phase_idx + 1,
                parallel_group.len(),
                if parallel_group.len() > 1 { " (parallel)" } else { "" }
            );

            let to_execute: Vec<_> = parallel_group
                .iter()
                .filter(|id| !completed.contains(id))
                .copied()
                .collect();

            if to_execute.is_empty() {
                info!("Job {}: Phase {} already completed, skipping", job_id, phase_idx + 1);
                continue;
            }

            let mut tasks = Vec::new();
            for stage_id in &to_execute {
                let stage = self
                    .dag
                    .get_stage(*stage_id)
                    .ok_or_else(|| OrchestratorError::StageNotFound(format!("{:?}", stage_id)))?;

                let handler = self
                    .stage_handlers
                    .get(stage_id)
                    .ok_or_else(|| {
                        OrchestratorError::Config(format!("No handler registered for stage {:?}", stage_id))
                    })?
                    .clone();

                let stage_ctx = ctx.clone();
                let stage_node = stage.clone();

                tasks.push(tokio::spawn(async move { Self::execute_stage(handler, stage_node, stage_ctx).await }));
            }

            let results = futures::future::join_all(tasks).await;

            for (i, task_result) in results.into_iter().enumerate() {
                let stage_id = to_execute[i];

                match task_result {
                    Ok(Ok(output)) => {
                        let cache_key = ctx.cache_keys.key_for_stage(stage_id);
                        let checkpoint = Checkpoint::new(job_id, stage_id, cache_key, output.cache_data.clone());

                        self.checkpoint_mgr.save_checkpoint(checkpoint).await?;

                        overall_result.merge_metrics(&output.metrics);

                        info!(
                            "Job {}: Stage {:?} completed - {} files, {} nodes in {}ms",
                            job_id,
                            stage_id,
                            output.metrics.files_processed,
                            output.metrics.nodes_created,
                            output.metrics.duration_ms
                        );
                    }
                    Ok(Err(e)) => {
                        // CrossRef and Embedding are optional stages; a failure there
                        // shouldn't sink the whole indexing run if Chunk already landed.
                        let stage_is_optional = self
                            .dag
                            .get_stage(stage_id)
                            .map(|s| s.optional)
                            .unwrap_or(false);

                        if stage_is_optional {
                            warn!("Job {}: optional stage {:?} failed, continuing: {}", job_id, stage_id, e);
                            continue;
                        }

                        error!("Job {}: Stage {:?} failed: {}", job_id, stage_id, e);
                        return Err(
                            OrchestratorError::StageExecutionFailed(format!("Stage {:?}: {}", stage_id, e)).into(),
                        );
                    }
                    Err(join_err) => {
                        error!("Job {}: Stage {:?} panicked: {}", job_id, stage_id, join_err);
                        return Err(OrchestratorError::StageExecutionFailed(format!(
                            "Stage {:?} panicked: {}",
                            stage_id, join_err
                        ))
                        .into());
                    }
                }
            }
        }

        Ok(overall_result)
    }

    /// Execute a single stage
    async fn execute_stage(
        handler: Arc<dyn StageHandler>,
        stage_node: StageNode,
        mut ctx: StageContext,
    ) -> Result<StageOutput> {
        let stage_id = stage_node.id;
        info!("Executing stage: {} ({:?})", stage_node.name, stage_id);

        if handler.can_skip(&ctx).await {
            info!("Stage {:?} skipped (cache hit)", stage_id);
            return Ok(StageOutput {
                cache_data: vec![],
                metrics: Default::default(),
            });
        }

        let mut cache = HashMap::new();
        for dep_id in &stage_node.dependencies {
            let cache_key = ctx.cache_keys.key_for_stage(*dep_id);
            if let Some(data) = ctx.checkpoint_mgr.load_checkpoint(&cache_key).await? {
                cache.insert(cache_key.clone(), data);
                info!("Loaded dependency cache for {:?} ({} bytes)", dep_id, cache[&cache_key].len());
            } else {
                warn!("Missing required cache: {} (dependency {:?})", cache_key, dep_id);
                return Err(OrchestratorError::MissingDependency(format!(
                    "Cache not found for dependency {:?}: {}",
                    dep_id, cache_key
                ))
                .into());
            }
        }

        let files = Self::enumerate_files(&ctx.repo_root)?;
        info!("Found {} files to process", files.len());

        let input = StageInput {
            files,
            cache,
            config: StageConfig::default(),
        };

        let timeout = tokio::time::Duration::from_millis(stage_node.timeout_ms);
        let result = tokio::time::timeout(timeout, handler.execute(input, &mut ctx)).await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "Stage {:?} timed out after {}ms",
                stage_id, stage_node.timeout_ms
            ))
            .into()),
        }
    }

    /// Walks `repo_root`, skipping hidden directories and anything
    /// `should_chunk_file` rejects (ignored dirs, language-specific
    /// generated-artifact extensions, dotfiles).
    fn enumerate_files(repo_root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        if !repo_root.exists() {
            return Err(OrchestratorError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Repository path not found: {}", repo_root.display()),
            ))
            .into());
        }

        fn visit_dirs(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
            if dir.is_dir() {
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    let path = entry.path();

                    if path.is_dir() {
                        if let Some(name) = path.file_name() {
                            if name.to_string_lossy().starts_with('.') {
                                continue;
                            }
                        }
                        visit_dirs(root, &path, files)?;
                    } else {
                        let rel = path.strip_prefix(root).unwrap_or(&path);
                        if should_chunk_file(&rel.to_string_lossy()) {
                            files.push(path);
                        }
                    }
                }
            }
            Ok(())
        }

        visit_dirs(repo_root, repo_root, &mut files)?;
        files.sort();
        Ok(files)
    }

    /// Classify error for retry logic
    fn classify_error(&self, error: &anyhow::Error) -> ErrorCategory {
        let error_str = error.to_string();

        if error_str.contains("timeout") || error_str.contains("connection") {
            ErrorCategory::Transient
        } else if error_str.contains("OOM") || error_str.contains("out of memory") {
            ErrorCategory::Infrastructure
        } else if error_str.contains("parse error") || error_str.contains("invalid") {
            ErrorCategory::Permanent
        } else {
            ErrorCategory::Transient
        }
    }

    /// Get current stage from error message
    fn get_current_stage_from_error(&self, error: &anyhow::Error) -> StageId {
        let error_str = error.to_string();

        if error_str.contains("Chunk") {
            StageId::Chunk
        } else if error_str.contains("CrossRef") {
            StageId::CrossRef
        } else if error_str.contains("Embedding") {
            StageId::Embedding
        } else {
            StageId::Chunk
        }
    }
}

/// The result of [`SnapshotOrchestrator::index_commit`]: either a completed
/// (or already-active) snapshot, or notice that another caller is already
/// indexing this repository, in which case the reindex has been flagged for
/// later rather than failed outright.
#[derive(Debug)]
pub enum IndexOutcome {
    Snapshot(codegraph_storage::Snapshot),
    ReindexRequested,
}

/// Drives a single snapshot through its full lifecycle: ensure the
/// repository row exists, open an `indexing` snapshot, run the pipeline,
/// compute the file manifest, and activate — or mark failed on any error
/// along the way so nothing is left stuck in `indexing`.
pub struct SnapshotOrchestrator {
    store: Arc<dyn SnapshotStore>,
    pipeline: PipelineOrchestrator,
}

impl SnapshotOrchestrator {
    pub fn new(store: Arc<dyn SnapshotStore>, pipeline: PipelineOrchestrator) -> Self {
        Self { store, pipeline }
    }

    /// Indexes one commit end-to-end. `force_new` bypasses the no-op check
    /// that otherwise skips re-indexing a commit the repository is already
    /// active on.
    ///
    /// When another caller already holds this repository's one-concurrent-
    /// indexing-job slot, `create_snapshot` loses that race; rather than
    /// surface it as a failure, the loss is recorded via `request_reindex`
    /// and reported back as [`IndexOutcome::ReindexRequested`] so the caller
    /// knows to retry once the in-flight index completes.
    pub async fn index_commit(
        &self,
        repo_url: &str,
        branch: &str,
        repo_name: &str,
        commit_hash: &str,
        repo_root: PathBuf,
        force_new: bool,
    ) -> Result<IndexOutcome> {
        let repository = self
            .store
            .ensure_repository(repo_url, branch, repo_name)
            .await
            .map_err(OrchestratorError::Storage)?;

        if !force_new {
            if let Some(active_id) = self
                .store
                .get_active_snapshot_id(&repository.id)
                .await
                .map_err(OrchestratorError::Storage)?
            {
                let active = self.store.get_snapshot(&active_id).await.map_err(OrchestratorError::Storage)?;
                if active.commit_hash == commit_hash {
                    info!(
                        "Repository {} already active on commit {}, skipping re-index",
                        repository.id, commit_hash
                    );
                    return Ok(IndexOutcome::Snapshot(active));
                }
            }
        }

        let snapshot = match self.store.create_snapshot(&repository.id, commit_hash).await {
            Ok(snapshot) => snapshot,
            Err(err) if err.kind == codegraph_storage::ErrorKind::Transaction => {
                info!(
                    "Repository {} already has an indexing snapshot in flight, flagging for reindex",
                    repository.id
                );
                self.store
                    .request_reindex(&repository.id)
                    .await
                    .map_err(OrchestratorError::Storage)?;
                return Ok(IndexOutcome::ReindexRequested);
            }
            Err(err) => return Err(OrchestratorError::Storage(err)),
        };

        let job = Job::new_queued(repository.id.clone(), snapshot.id.clone(), 0);

        let outcome = self.pipeline.execute_job(job, self.store.clone(), repo_root).await;

        match outcome {
            Ok((job, pipeline_result)) => {
                if !matches!(job.state, JobState::Completed { .. }) {
                    let reason = pipeline_result.errors.join("; ");
                    self.store
                        .fail_snapshot(&snapshot.id, &reason)
                        .await
                        .map_err(OrchestratorError::Storage)?;
                    return Err(OrchestratorError::StageExecutionFailed(reason));
                }

                let stats = serde_json::json!({
                    "files_processed": pipeline_result.files_processed,
                    "nodes_created": pipeline_result.nodes_created,
                    "chunks_created": pipeline_result.chunks_created,
                    "duration_ms": pipeline_result.duration_ms,
                });

                self.store
                    .activate_snapshot(&snapshot.id, stats)
                    .await
                    .map_err(OrchestratorError::Storage)?;

                self.store
                    .get_snapshot(&snapshot.id)
                    .await
                    .map(IndexOutcome::Snapshot)
                    .map_err(OrchestratorError::Storage)
            }
            Err(e) => {
                self.store
                    .fail_snapshot(&snapshot.id, &e.to_string())
                    .await
                    .map_err(OrchestratorError::Storage)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageMetrics;
    use async_trait::async_trait;
    use codegraph_storage::SqliteSnapshotStore;

    struct MockHandler {
        id: StageId,
        should_fail: bool,
    }

    #[async_trait]
    impl StageHandler for MockHandler {
        fn stage_id(&self) -> StageId {
            self.id
        }

        async fn execute(&self, input: StageInput, _ctx: &mut StageContext) -> Result<StageOutput> {
            if self.should_fail {
                return Err(OrchestratorError::StageExecutionFailed("Mock failure".to_string()));
            }

            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

            Ok(StageOutput {
                cache_data: bincode::serialize(&input.files.len())?,
                metrics: StageMetrics {
                    files_processed: input.files.len(),
                    nodes_created: input.files.len() * 10,
                    chunks_created: input.files.len() * 5,
                    duration_ms: 10,
                    errors: vec![],
                },
            })
        }

        fn output_cache_key(&self, ctx: &StageContext) -> String {
            ctx.cache_keys.key_for_stage(self.id)
        }
    }

    fn test_store() -> Arc<dyn SnapshotStore> {
        Arc::new(SqliteSnapshotStore::new_in_memory().unwrap())
    }

    #[test]
    fn test_orchestrator_creation() {
        let checkpoint_mgr = Arc::new(CheckpointManager::new_in_memory());
        let orch = PipelineOrchestrator::new(checkpoint_mgr);
        assert!(orch.is_ok());
    }

    #[test]
    fn test_error_classification() {
        let checkpoint_mgr = Arc::new(CheckpointManager::new_in_memory());
        let orch = PipelineOrchestrator::new(checkpoint_mgr).unwrap();

        let timeout_err = anyhow::anyhow!("timeout occurred");
        assert_eq!(orch.classify_error(&timeout_err), ErrorCategory::Transient);

        let oom_err = anyhow::anyhow!("OOM: out of memory");
        assert_eq!(orch.classify_error(&oom_err), ErrorCategory::Infrastructure);

        let parse_err = anyhow::anyhow!("parse error: invalid syntax");
        assert_eq!(orch.classify_error(&parse_err), ErrorCategory::Permanent);
    }

    #[tokio::test]
    async fn test_execute_stage_success() {
        let handler = Arc::new(MockHandler {
            id: StageId::Chunk,
            should_fail: false,
        });

        let checkpoint_mgr = Arc::new(CheckpointManager::new_in_memory());
        let repo_path = std::env::temp_dir().join("test_repo_orchestrator");
        std::fs::create_dir_all(&repo_path).unwrap();

        let ctx = StageContext {
            job_id: Uuid::new_v4(),
            repo_id: "test".to_string(),
            snapshot_id: "snap1".to_string(),
            cache_keys: CacheKeyManager::new("test".to_string(), "snap1".to_string()),
            checkpoint_mgr,
            store: test_store(),
            repo_root: repo_path.clone(),
        };

        let stage_node = StageNode::new(StageId::Chunk, "Test", vec![], false, 5000);

        let result = PipelineOrchestrator::execute_stage(handler, stage_node, ctx).await;

        std::fs::remove_dir_all(&repo_path).ok();

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_pipeline_result_merge() {
        let mut result = PipelineResult::default();

        let metrics = StageMetrics {
            files_processed: 10,
            nodes_created: 100,
            chunks_created: 50,
            duration_ms: 1000,
            errors: vec!["error1".to_string()],
        };

        result.merge_metrics(&metrics);

        assert_eq!(result.files_processed, 10);
        assert_eq!(result.nodes_created, 100);
        assert_eq!(result.chunks_created, 50);
        assert_eq!(result.duration_ms, 1000);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_index_commit_losing_the_indexing_race_requests_reindex() {
        let store = test_store();
        let checkpoint_mgr = Arc::new(CheckpointManager::new_in_memory());
        let pipeline = PipelineOrchestrator::new(checkpoint_mgr).unwrap();
        let orchestrator = SnapshotOrchestrator::new(store.clone(), pipeline);

        let repository = store.ensure_repository("https://example.com/repo.git", "main", "repo").await.unwrap();
        // Simulate another caller already holding the one-indexing-job-per-repository slot.
        store.create_snapshot(&repository.id, "already-indexing-commit").await.unwrap();

        let repo_path = std::env::temp_dir().join("test_repo_race");
        std::fs::create_dir_all(&repo_path).unwrap();

        let outcome = orchestrator
            .index_commit("https://example.com/repo.git", "main", "repo", "new-commit", repo_path.clone(), false)
            .await
            .unwrap();

        std::fs::remove_dir_all(&repo_path).ok();

        assert!(matches!(outcome, IndexOutcome::ReindexRequested));
        assert!(store.check_and_reset_reindex_flag(&repository.id).await.unwrap());
    }
}
