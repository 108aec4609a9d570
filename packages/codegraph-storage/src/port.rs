//! Storage port: the one abstraction every other component talks to.
//!
//! Grouped the way the data model is grouped: lifecycle, bulk writes,
//! retrieval, graph navigation, embedding staging.

use async_trait::async_trait;

use crate::domain::{
    ChunkContent, ChunkNode, Edge, Embedding, FileRecord, NeighborMetadata, PendingEmbeddingRow,
    Repository, SearchDoc, SearchFilters, SearchHit, Snapshot, StagingRow,
};
use crate::Result;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Idempotent upsert by `(url, branch)`.
    async fn ensure_repository(&self, url: &str, branch: &str, name: &str) -> Result<Repository>;

    async fn get_repository(&self, repository_id: &str) -> Result<Repository>;

    /// Inserts a new `indexing` snapshot. Fails with `Transaction` if one is
    /// already `indexing` for this repository (one concurrent index job per
    /// repository).
    async fn create_snapshot(&self, repository_id: &str, commit_hash: &str) -> Result<Snapshot>;

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;

    async fn list_snapshots(&self, repository_id: &str, limit: Option<usize>) -> Result<Vec<Snapshot>>;

    /// Atomically marks `snapshot_id` completed and repoints
    /// `current_snapshot_id`. Fails with `SnapshotRaceLost` if the snapshot
    /// is no longer `indexing` (e.g. concurrently failed or pruned).
    async fn activate_snapshot(&self, snapshot_id: &str, stats: serde_json::Value) -> Result<()>;

    async fn fail_snapshot(&self, snapshot_id: &str, reason: &str) -> Result<()>;

    /// Deletes a snapshot and everything keyed to it; never the currently
    /// active one.
    async fn prune_snapshot(&self, snapshot_id: &str) -> Result<()>;

    async fn get_active_snapshot_id(&self, repository_id: &str) -> Result<Option<String>>;

    /// Clears `reindex_requested_at` if set, returning whether it was set.
    async fn check_and_reset_reindex_flag(&self, repository_id: &str) -> Result<bool>;

    async fn request_reindex(&self, repository_id: &str) -> Result<()>;

    // ── Bulk writes (indexing pipeline) ──────────────────────────────────

    async fn add_files(&self, files: &[FileRecord]) -> Result<()>;

    async fn add_nodes(&self, nodes: &[ChunkNode]) -> Result<()>;

    /// Insert-or-ignore by `chunk_hash`; content is immutable once written.
    async fn add_contents(&self, contents: &[ChunkContent]) -> Result<()>;

    async fn add_search_index(&self, docs: &[SearchDoc]) -> Result<()>;

    async fn add_edge(&self, edge: &Edge) -> Result<()>;

    async fn add_edges(&self, edges: &[Edge]) -> Result<()>;

    async fn save_embeddings(&self, embeddings: &[Embedding]) -> Result<()>;

    /// Bulk-ingest resolved cross-file relations produced by the external
    /// SCIP-style indexer tool, spatially joined onto chunk ids.
    async fn ingest_scip_relations(&self, snapshot_id: &str, edges: &[Edge]) -> Result<usize>;

    // ── Retrieval ─────────────────────────────────────────────────────

    async fn get_chunk(&self, chunk_id: &str) -> Result<ChunkNode>;

    async fn get_content(&self, chunk_hash: &str) -> Result<String>;

    /// Finds the chunk whose byte range contains `(file_path, byte_offset)`
    /// within a snapshot — the spatial join used to resolve references.
    async fn find_chunk_id(
        &self,
        snapshot_id: &str,
        file_path: &str,
        byte_offset: usize,
    ) -> Result<Option<String>>;

    async fn search_vectors(
        &self,
        snapshot_id: &str,
        query_vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>>;

    async fn search_fts(
        &self,
        snapshot_id: &str,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>>;

    // ── Graph navigation ──────────────────────────────────────────────

    async fn get_context_neighbors(&self, chunk_id: &str) -> Result<NeighborMetadata>;

    async fn get_neighbor_chunk(&self, chunk_id: &str) -> Result<Option<ChunkNode>>;

    async fn get_incoming_references(&self, chunk_id: &str, limit: usize) -> Result<Vec<Edge>>;

    async fn get_outgoing_calls(&self, chunk_id: &str, limit: usize) -> Result<Vec<Edge>>;

    // ── Embedding staging pipeline ────────────────────────────────────

    async fn get_nodes_to_embed(&self, snapshot_id: &str) -> Result<Vec<PendingEmbeddingRow>>;

    /// Creates/truncates the staging table for a fresh embedding run.
    async fn prepare_embedding_staging(&self, snapshot_id: &str) -> Result<()>;

    async fn load_staging_data(&self, rows: &[StagingRow]) -> Result<()>;

    /// Copies `embedding` into staging rows whose `vector_hash` already has a
    /// vector in production, so the provider never re-embeds known content.
    async fn backfill_staging_vectors(&self, snapshot_id: &str) -> Result<usize>;

    /// Drains staging rows that now have a vector into `embeddings`.
    async fn flush_staged_hits(&self, snapshot_id: &str) -> Result<usize>;

    /// Pulls up to `batch_size` staging rows still missing a vector.
    async fn fetch_staging_delta(&self, snapshot_id: &str, batch_size: usize) -> Result<Vec<StagingRow>>;

    async fn save_embeddings_direct(&self, embeddings: &[Embedding]) -> Result<()>;

    async fn cleanup_staging(&self, snapshot_id: &str) -> Result<()>;
}
