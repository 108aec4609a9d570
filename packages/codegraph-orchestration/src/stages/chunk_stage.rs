use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use crate::pipeline::{StageContext, StageHandler, StageInput, StageMetrics, StageOutput};
use async_trait::async_trait;
use codegraph_ir::features::chunking::{process_file, ChunkingConfig, ChunkingOutput};
use codegraph_storage::SearchDoc;
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

/// Chunking stage: walks every candidate file in the worktree, runs the AST
/// chunker, and bulk-writes files/chunks/contents/search-index/`child_of`
/// edges straight to storage. A single file's parse failure never aborts
/// the run — [`process_file`] turns it into a `Skipped`/`Failed`
/// [`FileRecord`](codegraph_storage::FileRecord) instead of an error.
pub struct ChunkStage {
    commit_hash: String,
    config: ChunkingConfig,
}

impl ChunkStage {
    pub fn new(commit_hash: String) -> Self {
        Self {
            commit_hash,
            config: ChunkingConfig::default(),
        }
    }

    pub fn with_config(commit_hash: String, config: ChunkingConfig) -> Self {
        Self {
            commit_hash,
            config,
        }
    }

    fn search_docs(output: &ChunkingOutput) -> Vec<SearchDoc> {
        output
            .chunks
            .iter()
            .filter_map(|chunk| {
                let content = output
                    .contents
                    .iter()
                    .find(|c| c.chunk_hash == chunk.chunk_hash)
                    .map(|c| c.content.clone())?;
                let semantic_tags = chunk
                    .metadata
                    .get("tags")
                    .and_then(|v| v.as_array())
                    .map(|tags| {
                        tags.iter()
                            .filter_map(|t| t.as_str())
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                Some(SearchDoc {
                    node_id: chunk.id.clone(),
                    file_path: chunk.file_path.clone(),
                    semantic_tags,
                    content,
                })
            })
            .collect()
    }
}

#[async_trait]
impl StageHandler for ChunkStage {
    fn stage_id(&self) -> StageId {
        StageId::Chunk
    }

    async fn execute(&self, input: StageInput, ctx: &mut StageContext) -> Result<StageOutput> {
        let start = Instant::now();

        info!(
            "ChunkStage: processing {} files for snapshot {}",
            input.files.len(),
            ctx.snapshot_id
        );

        let repo_root = ctx.repo_root.clone();
        let snapshot_id = ctx.snapshot_id.clone();
        let commit_hash = self.commit_hash.clone();
        let config = self.config;
        let files = input.files.clone();

        // CPU-bound parsing runs off the async runtime's reactor thread.
        let outputs = tokio::task::spawn_blocking(move || {
            files
                .par_iter()
                .filter_map(|path| {
                    let rel_path = path.to_string_lossy().replace('\\', "/");
                    match process_file(&snapshot_id, &repo_root, &rel_path, &commit_hash, &config)
                    {
                        Ok(output) => Some(output),
                        Err(err) => {
                            warn!("ChunkStage: {} failed to chunk: {}", rel_path, err);
                            None
                        }
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| OrchestratorError::StageExecutionFailed(format!("chunking task panicked: {e}")))?;

        let mut files_processed = 0usize;
        let mut chunks_created = 0usize;
        let mut errors = Vec::new();

        let mut all_files = Vec::with_capacity(outputs.len());
        let mut all_chunks = Vec::new();
        let mut all_contents = Vec::new();
        let mut all_edges = Vec::new();
        let mut all_docs = Vec::new();

        for output in &outputs {
            files_processed += 1;
            chunks_created += output.chunks.len();
            if let Some(reason) = &output.file.parsing_error {
                errors.push(format!("{}: {}", output.file.path, reason));
            }
            all_docs.extend(Self::search_docs(output));
        }

        for output in outputs {
            all_files.push(output.file);
            all_chunks.extend(output.chunks);
            all_contents.extend(output.contents);
            all_edges.extend(output.edges);
        }

        ctx.store
            .add_files(&all_files)
            .await
            .map_err(OrchestratorError::Storage)?;
        ctx.store
            .add_nodes(&all_chunks)
            .await
            .map_err(OrchestratorError::Storage)?;
        ctx.store
            .add_contents(&all_contents)
            .await
            .map_err(OrchestratorError::Storage)?;
        if !all_docs.is_empty() {
            ctx.store
                .add_search_index(&all_docs)
                .await
                .map_err(OrchestratorError::Storage)?;
        }
        if !all_edges.is_empty() {
            ctx.store
                .add_edges(&all_edges)
                .await
                .map_err(OrchestratorError::Storage)?;
        }

        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "ChunkStage: completed {} files, {} chunks in {}ms ({} errors)",
            files_processed,
            chunks_created,
            duration_ms,
            errors.len()
        );

        Ok(StageOutput {
            cache_data: bincode::serialize(&files_processed)?,
            metrics: StageMetrics {
                files_processed,
                nodes_created: chunks_created,
                chunks_created,
                duration_ms,
                errors,
            },
        })
    }

    fn output_cache_key(&self, ctx: &StageContext) -> String {
        ctx.cache_keys.chunk_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointManager;
    use crate::dag::CacheKeyManager;
    use crate::pipeline::StageConfig;
    use codegraph_storage::{SnapshotStore, SqliteSnapshotStore};
    use std::collections::HashMap;
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

    #[tokio::test]
    async fn test_chunk_stage_creation() {
        let stage = ChunkStage::new("abc123".to_string());
        assert_eq!(stage.stage_id(), StageId::Chunk);
    }

    #[tokio::test]
    async fn test_chunk_stage_output_cache_key() {
        let stage = ChunkStage::new("abc123".to_string());
        let ctx = test_ctx(PathBuf::from("/tmp"));
        assert_eq!(stage.output_cache_key(&ctx), "chunks:repo1:snap1");
    }

    #[tokio::test]
    async fn test_chunk_stage_writes_files_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "def foo():\n    return 1\n").unwrap();

        let stage = ChunkStage::new("abc123".to_string());
        let mut ctx = test_ctx(dir.path().to_path_buf());

        let input = StageInput {
            files: vec![PathBuf::from("main.py")],
            cache: HashMap::new(),
            config: StageConfig::default(),
        };

        let output = stage.execute(input, &mut ctx).await.unwrap();
        assert_eq!(output.metrics.files_processed, 1);
        assert!(output.metrics.chunks_created >= 1);
    }
}
