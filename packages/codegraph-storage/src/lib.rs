//! Storage for the code property graph: repositories, immutable snapshots,
//! content-addressed chunk text, the structural edge graph, embeddings, and
//! the lexical search index.
//!
//! A snapshot moves through exactly one lifecycle: `indexing -> completed`
//! or `indexing -> failed`. Only one snapshot per repository may be
//! `indexing` at a time, and a repository's `current_snapshot_id` only ever
//! points at a `completed` snapshot, flipped atomically by
//! [`port::SnapshotStore::activate_snapshot`].
//!
//! ```rust,no_run
//! use codegraph_storage::{SnapshotStore, SqliteSnapshotStore};
//!
//! # async fn example() -> codegraph_storage::Result<()> {
//! let store = SqliteSnapshotStore::new_in_memory()?;
//! let repo = store.ensure_repository("https://example.com/acme/widget.git", "main", "widget").await?;
//! let snapshot = store.create_snapshot(&repo.id, "abc123").await?;
//! // ... chunk, embed, cross-reference ...
//! store.activate_snapshot(&snapshot.id, serde_json::json!({"chunks": 0})).await?;
//! # Ok(())
//! # }
//! ```

pub mod domain;
pub mod error;
pub mod port;

#[cfg(feature = "sqlite")]
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};
pub use port::SnapshotStore;

pub use domain::{
    content_hash, ByteRange, ChunkContent, ChunkNode, Edge, Embedding, FileCategory, FileRecord,
    NeighborMetadata, NeighborRef, ParsingStatus, PendingEmbeddingRow, RelationType, Repository,
    SearchDoc, SearchFilters, SearchHit, Snapshot, SnapshotStatus, StagingRow,
};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteSnapshotStore;
