use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use crate::pipeline::{StageContext, StageHandler, StageInput, StageMetrics, StageOutput};
use async_trait::async_trait;
use codegraph_ir::CrossRefResolver;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Cross-reference resolution stage: dispatches whatever SCIP-family
/// indexer is installed for the project and turns its output into
/// structural edges. Optional by design — no indexer being available is a
/// normal outcome, not a stage failure.
pub struct CrossRefStage {
    subprocess_timeout: Duration,
}

impl CrossRefStage {
    pub fn new(subprocess_timeout: Duration) -> Self {
        Self { subprocess_timeout }
    }
}

impl Default for CrossRefStage {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl StageHandler for CrossRefStage {
    fn stage_id(&self) -> StageId {
        StageId::CrossRef
    }

    async fn execute(&self, _input: StageInput, ctx: &mut StageContext) -> Result<StageOutput> {
        let start = Instant::now();
        let mut resolver = CrossRefResolver::new(ctx.repo_root.clone());

        let stats = resolver
            .resolve(ctx.store.as_ref(), &ctx.snapshot_id, self.subprocess_timeout)
            .await
            .map_err(OrchestratorError::Indexing)?;

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "CrossRefStage: {} definitions, {} resolved, {} external, {} skipped in {}ms",
            stats.definitions_found,
            stats.relations_resolved,
            stats.relations_external,
            stats.relations_skipped_unresolved_local,
            duration_ms
        );

        if stats.definitions_found == 0 {
            warn!("CrossRefStage: no definitions found, snapshot has no cross-file edges");
        }

        Ok(StageOutput {
            cache_data: bincode::serialize(&stats.relations_resolved)?,
            metrics: StageMetrics {
                files_processed: 0,
                nodes_created: stats.relations_resolved + stats.relations_external,
                chunks_created: 0,
                duration_ms,
                errors: vec![],
            },
        })
    }

    fn required_cache_keys(&self, ctx: &StageContext) -> Vec<String> {
        vec![ctx.cache_keys.chunk_key()]
    }

    fn output_cache_key(&self, ctx: &StageContext) -> String {
        ctx.cache_keys.cross_ref_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointManager;
    use crate::dag::CacheKeyManager;
    use codegraph_storage::{SnapshotStore, SqliteSnapshotStore};
    use std::path::PathBuf;
    use std::sync::Arc;
    use uuid::Uuid;

    fn test_ctx(repo_root: PathBuf) -> StageContext {
        let store: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::new_in_memory().unwrap());
        StageContext {
            job_id: Uuid::new_v4(),
            repo_id: "repo1".to_string(),
            snapshot_id: "snap1".to_string(),
            cache_keys: CacheKeyManager::new("repo1".to_string(), "snap1".to_string()),
            checkpoint_mgr: Arc::new(CheckpointManager::new_in_memory()),
            store,
            repo_root,
        }
    }

    #[test]
    fn test_cross_ref_stage_id() {
        let stage = CrossRefStage::default();
        assert_eq!(stage.stage_id(), StageId::CrossRef);
    }

    #[test]
    fn test_cross_ref_stage_cache_keys() {
        let stage = CrossRefStage::default();
        let ctx = test_ctx(PathBuf::from("/tmp"));
        assert_eq!(stage.output_cache_key(&ctx), "cross_ref:repo1:snap1");
        assert_eq!(stage.required_cache_keys(&ctx), vec!["chunks:repo1:snap1"]);
    }

    #[tokio::test]
    async fn test_cross_ref_stage_no_indexer_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let stage = CrossRefStage::new(Duration::from_secs(5));
        let mut ctx = test_ctx(dir.path().to_path_buf());

        let input = StageInput {
            files: vec![],
            cache: std::collections::HashMap::new(),
            config: crate::pipeline::StageConfig::default(),
        };

        let output = stage.execute(input, &mut ctx).await.unwrap();
        assert_eq!(output.metrics.nodes_created, 0);
    }
}
