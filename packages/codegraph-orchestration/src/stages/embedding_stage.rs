//! Embedding pipeline: turns every un-embedded chunk in a snapshot into a
//! vector, reusing historical embeddings by content hash before calling out
//! to the provider at all.
//!
//! Streamed stages: prepare staging → enumerate pending → prompt+hash (off
//! the async runtime) → bulk-stage → backfill/dedup → flush hits → delta
//! producer/workers → cleanup. Provider failures fail only the in-flight
//! batch — the snapshot still completes with whatever embeddings it has.

use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use crate::pipeline::{StageContext, StageHandler, StageInput, StageMetrics, StageOutput};
use async_trait::async_trait;
use codegraph_storage::{content_hash, Embedding, PendingEmbeddingRow, StagingRow};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, warn};
use uuid::Uuid;

const DELTA_BATCH_SIZE: usize = 200;
const QUEUE_CAPACITY: usize = 8;
const MAX_PROMPT_CHARS: usize = 25_000;

/// Capability set an embedding backend must implement. Input preconditions
/// (no empty strings, ≤ 25 000 chars, no newlines) are the caller's
/// responsibility — `sanitize_prompt` enforces them before every call.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimension(&self) -> usize;
    fn max_concurrency(&self) -> usize;

    async fn embed_async(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Structured progress, logged as the pipeline runs — the six events named
/// in the throughput section of the embedding pipeline.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StagingProgress { staged: usize },
    StagingComplete { total: usize },
    DeduplicationStats { recovered: usize },
    FlushedHits { flushed: usize },
    EmbeddingProgress { embedded: usize, total: usize },
    Completed { embedded: usize, failed: usize },
}

fn emit(event: ProgressEvent) {
    match &event {
        ProgressEvent::StagingProgress { staged } => info!(staged, "embedding: staging_progress"),
        ProgressEvent::StagingComplete { total } => info!(total, "embedding: staging_complete"),
        ProgressEvent::DeduplicationStats { recovered } => {
            info!(recovered, "embedding: deduplication_stats")
        }
        ProgressEvent::FlushedHits { flushed } => info!(flushed, "embedding: flushed_hits"),
        ProgressEvent::EmbeddingProgress { embedded, total } => {
            info!(embedded, total, "embedding: embedding_progress")
        }
        ProgressEvent::Completed { embedded, failed } => {
            info!(embedded, failed, "embedding: completed")
        }
    }
}

/// Builds the `[CONTEXT]\n...\n\n[CODE]\n<content>` prompt for one pending
/// row and its content hash.
fn build_prompt(row: &PendingEmbeddingRow) -> (String, String) {
    let mut context = format!(
        "File: {}\nLanguage: {}\nCategory: {}\n",
        row.file_path, row.language, row.category
    );

    let mut roles = Vec::new();
    let mut tags = Vec::new();
    if let Some(matches) = row.metadata.get("semantic_matches").and_then(|v| v.as_array()) {
        for m in matches {
            if m.get("category").and_then(|v| v.as_str()) == Some("role") {
                if let Some(value) = m.get("value").and_then(|v| v.as_str()) {
                    roles.push(value.to_string());
                }
            } else if let Some(value) = m.get("value").and_then(|v| v.as_str()) {
                tags.push(value.to_string());
            }
        }
    }
    if let Some(metadata_tags) = row.metadata.get("tags").and_then(|v| v.as_array()) {
        tags.extend(metadata_tags.iter().filter_map(|t| t.as_str().map(String::from)));
    }

    if !roles.is_empty() {
        context.push_str(&format!("Role: {}\n", roles.join(", ")));
    }
    if !tags.is_empty() {
        context.push_str(&format!("Tags: {}\n", tags.join(", ")));
    }
    if !row.incoming_definitions.is_empty() {
        let mut defs: BTreeSet<&str> = BTreeSet::new();
        defs.extend(row.incoming_definitions.iter().map(String::as_str));
        context.push_str(&format!(
            "Defines: {}\n",
            defs.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }

    let prompt = format!("[CONTEXT]\n{context}\n[CODE]\n{}", row.content);
    let hash = content_hash(&prompt);
    (prompt, hash)
}

/// Newlines to spaces, clamp to 25 000 chars, empty → sentinel.
fn sanitize_prompt(prompt: &str) -> String {
    let mut s = prompt.replace(['\n', '\r'], " ");
    if s.len() > MAX_PROMPT_CHARS {
        s.truncate(MAX_PROMPT_CHARS);
    }
    if s.trim().is_empty() {
        s = "<empty>".to_string();
    }
    s
}

pub struct EmbeddingStage {
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingStage {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl StageHandler for EmbeddingStage {
    fn stage_id(&self) -> StageId {
        StageId::Embedding
    }

    async fn execute(&self, _input: StageInput, ctx: &mut StageContext) -> Result<StageOutput> {
        let start = Instant::now();
        let store = ctx.store.clone();
        let snapshot_id = ctx.snapshot_id.clone();
        let model_name = self.provider.model_name().to_string();

        // 1. Prepare staging.
        store
            .prepare_embedding_staging(&snapshot_id)
            .await
            .map_err(OrchestratorError::Storage)?;

        // 2 + 3 + 4. Enumerate pending, build prompt+hash off the event
        // loop, bulk-stage.
        let pending = store
            .get_nodes_to_embed(&snapshot_id)
            .await
            .map_err(OrchestratorError::Storage)?;
        let total = pending.len();

        let staging_rows = tokio::task::spawn_blocking(move || {
            pending
                .into_iter()
                .map(|row| {
                    let (prompt, vector_hash) = build_prompt(&row);
                    StagingRow {
                        id: Uuid::new_v4().to_string(),
                        chunk_id: row.chunk_id,
                        snapshot_id: row.snapshot_id,
                        vector_hash,
                        embedding: None,
                        file_path: row.file_path,
                        language: row.language,
                        category: row.category,
                        start_line: row.start_line,
                        end_line: row.end_line,
                        model_name: model_name.clone(),
                        content: prompt,
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| OrchestratorError::StageExecutionFailed(format!("prompt build panicked: {e}")))?;

        emit(ProgressEvent::StagingProgress {
            staged: staging_rows.len(),
        });
        if !staging_rows.is_empty() {
            store
                .load_staging_data(&staging_rows)
                .await
                .map_err(OrchestratorError::Storage)?;
        }
        emit(ProgressEvent::StagingComplete { total });

        // 5. Backfill/dedup by vector_hash across all snapshots.
        let recovered = store
            .backfill_staging_vectors(&snapshot_id)
            .await
            .map_err(OrchestratorError::Storage)?;
        emit(ProgressEvent::DeduplicationStats { recovered });

        // 6. Flush hits into production.
        let flushed = store
            .flush_staged_hits(&snapshot_id)
            .await
            .map_err(OrchestratorError::Storage)?;
        emit(ProgressEvent::FlushedHits { flushed });

        // 7 + 8. Delta producer feeds a bounded queue; N = max_concurrency
        // workers drain it and call the provider.
        let embedded_count = Arc::new(AtomicUsize::new(0));
        let failed_count = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(StdMutex::new(Vec::<String>::new()));

        let (tx, rx) = mpsc::channel::<Vec<StagingRow>>(QUEUE_CAPACITY);
        let rx = Arc::new(AsyncMutex::new(rx));

        let producer_store = store.clone();
        let producer_snapshot = snapshot_id.clone();
        let producer = tokio::spawn(async move {
            loop {
                let batch = producer_store
                    .fetch_staging_delta(&producer_snapshot, DELTA_BATCH_SIZE)
                    .await;
                match batch {
                    Ok(rows) if rows.is_empty() => break,
                    Ok(rows) => {
                        if tx.send(rows).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("embedding: failed to fetch staging delta: {e}");
                        break;
                    }
                }
            }
        });

        let worker_count = self.provider.max_concurrency().max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let rx = rx.clone();
            let store = store.clone();
            let provider = self.provider.clone();
            let embedded_count = embedded_count.clone();
            let failed_count = failed_count.clone();
            let errors = errors.clone();
            let model_name = self.provider.model_name().to_string();

            workers.push(tokio::spawn(async move {
                loop {
                    let batch = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(batch) = batch else { break };

                    let prompts: Vec<String> =
                        batch.iter().map(|row| sanitize_prompt(&row.content)).collect();

                    match provider.embed_async(&prompts).await {
                        Ok(vectors) => {
                            let now = chrono::Utc::now();
                            let embeddings: Vec<Embedding> = batch
                                .iter()
                                .zip(vectors.into_iter())
                                .map(|(row, vector)| Embedding {
                                    id: Uuid::new_v4().to_string(),
                                    chunk_id: row.chunk_id.clone(),
                                    snapshot_id: row.snapshot_id.clone(),
                                    vector_hash: row.vector_hash.clone(),
                                    model_name: model_name.clone(),
                                    embedding: vector,
                                    file_path: row.file_path.clone(),
                                    language: row.language.clone(),
                                    category: row.category.clone(),
                                    start_line: row.start_line,
                                    end_line: row.end_line,
                                    created_at: now,
                                })
                                .collect();

                            if let Err(e) = store.save_embeddings_direct(&embeddings).await {
                                errors.lock().unwrap().push(format!("save_embeddings_direct: {e}"));
                                failed_count.fetch_add(batch.len(), Ordering::Relaxed);
                            } else {
                                embedded_count.fetch_add(embeddings.len(), Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            warn!("embedding: provider batch failed: {e}");
                            errors.lock().unwrap().push(format!("provider: {e}"));
                            failed_count.fetch_add(batch.len(), Ordering::Relaxed);
                        }
                    }

                    emit(ProgressEvent::EmbeddingProgress {
                        embedded: embedded_count.load(Ordering::Relaxed),
                        total,
                    });
                }
            }));
        }

        producer.await.ok();
        for worker in workers {
            worker.await.ok();
        }

        // 9. Cleanup.
        store
            .cleanup_staging(&snapshot_id)
            .await
            .map_err(OrchestratorError::Storage)?;

        let embedded = embedded_count.load(Ordering::Relaxed);
        let failed = failed_count.load(Ordering::Relaxed);
        emit(ProgressEvent::Completed { embedded, failed });

        let duration_ms = start.elapsed().as_millis() as u64;
        Ok(StageOutput {
            cache_data: bincode::serialize(&embedded)?,
            metrics: StageMetrics {
                files_processed: 0,
                nodes_created: embedded,
                chunks_created: 0,
                duration_ms,
                errors: errors.lock().unwrap().clone(),
            },
        })
    }

    fn required_cache_keys(&self, ctx: &StageContext) -> Vec<String> {
        vec![ctx.cache_keys.chunk_key()]
    }

    fn output_cache_key(&self, ctx: &StageContext) -> String {
        ctx.cache_keys.embedding_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointManager;
    use crate::dag::CacheKeyManager;
    use codegraph_storage::{
        ByteRange, ChunkContent, ChunkNode, FileCategory, FileRecord, ParsingStatus,
        SnapshotStore, SqliteSnapshotStore,
    };
    use std::collections::HashMap;
    use std::path::PathBuf;

    struct FakeProvider {
        dimension: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        fn model_name(&self) -> &str {
            "fake-embed-v1"
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn max_concurrency(&self) -> usize {
            2
        }

        async fn embed_async(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingProviderError> {
            Ok(texts.iter().map(|_| vec![0.1; self.dimension]).collect())
        }
    }

    #[test]
    fn sanitize_prompt_replaces_newlines_and_clamps() {
        let long = "a".repeat(30_000);
        let sanitized = sanitize_prompt(&format!("line one\nline two\n{long}"));
        assert!(!sanitized.contains('\n'));
        assert_eq!(sanitized.len(), MAX_PROMPT_CHARS);
    }

    #[test]
    fn sanitize_prompt_empty_becomes_sentinel() {
        assert_eq!(sanitize_prompt("   "), "<empty>");
    }

    #[test]
    fn build_prompt_includes_context_and_code_sections() {
        let row = PendingEmbeddingRow {
            chunk_id: "c1".to_string(),
            snapshot_id: "s1".to_string(),
            file_path: "a.py".to_string(),
            language: "python".to_string(),
            category: "source".to_string(),
            start_line: 1,
            end_line: 2,
            content: "def f(): pass".to_string(),
            metadata: serde_json::json!({"tags": ["async"]}),
            incoming_definitions: vec!["pkg.f".to_string()],
        };
        let (prompt, hash) = build_prompt(&row);
        assert!(prompt.contains("[CONTEXT]"));
        assert!(prompt.contains("[CODE]"));
        assert!(prompt.contains("Tags: async"));
        assert!(prompt.contains("Defines: pkg.f"));
        assert_eq!(hash, content_hash(&prompt));
    }

    async fn seeded_store() -> (Arc<dyn SnapshotStore>, String) {
        let store: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::new_in_memory().unwrap());
        let repo = store
            .ensure_repository("https://example.com/r.git", "main", "r")
            .await
            .unwrap();
        let snapshot = store.create_snapshot(&repo.id, "abc123").await.unwrap();

        let file = FileRecord {
            id: "f1".to_string(),
            snapshot_id: snapshot.id.clone(),
            path: "a.py".to_string(),
            file_hash: "h".to_string(),
            commit_hash: "abc123".to_string(),
            language: "python".to_string(),
            size_bytes: 20,
            category: FileCategory::Source,
            parsing_status: ParsingStatus::Success,
            parsing_error: None,
        };
        store.add_files(&[file]).await.unwrap();

        let chunk = ChunkNode {
            id: "c1".to_string(),
            file_id: "f1".to_string(),
            file_path: "a.py".to_string(),
            start_line: 1,
            end_line: 2,
            byte_range: ByteRange::new(0, 14),
            chunk_hash: content_hash("def f(): pass"),
            metadata: serde_json::json!({}),
        };
        store.add_nodes(&[chunk]).await.unwrap();
        store
            .add_contents(&[ChunkContent {
                chunk_hash: content_hash("def f(): pass"),
                content: "def f(): pass".to_string(),
            }])
            .await
            .unwrap();

        (store, snapshot.id)
    }

    #[tokio::test]
    async fn embedding_stage_embeds_pending_chunks() {
        let (store, snapshot_id) = seeded_store().await;
        let provider = Arc::new(FakeProvider { dimension: 8 });
        let stage = EmbeddingStage::new(provider);

        let mut ctx = StageContext {
            job_id: Uuid::new_v4(),
            repo_id: "repo1".to_string(),
            snapshot_id,
            cache_keys: CacheKeyManager::new("repo1".to_string(), "snap1".to_string()),
            checkpoint_mgr: Arc::new(CheckpointManager::new_in_memory()),
            store,
            repo_root: PathBuf::from("/tmp"),
        };

        let input = StageInput {
            files: vec![],
            cache: HashMap::new(),
            config: crate::pipeline::StageConfig::default(),
        };

        let output = stage.execute(input, &mut ctx).await.unwrap();
        assert_eq!(output.metrics.nodes_created, 1);
    }
}
