//! SQLite-backed `SnapshotStore`.
//!
//! A single connection behind a `std::sync::Mutex`. Every async method is a
//! short, synchronous SQLite transaction — there is no long-lived lock hold
//! across an `.await`, so blocking the executor thread for the duration of a
//! call is an acceptable trade for the simplicity of one connection per
//! store, matching the scale (one indexing job at a time per repository)
//! this store is built for.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{
    ByteRange, ChunkContent, ChunkNode, Edge, Embedding, FileCategory, FileRecord,
    NeighborMetadata, NeighborRef, ParsingStatus, PendingEmbeddingRow, RelationType, Repository,
    SearchDoc, SearchFilters, SearchHit, Snapshot, SnapshotStatus, StagingRow,
};
use crate::error::{ErrorKind, StorageError};
use crate::port::SnapshotStore;
use crate::Result;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS repositories (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    branch TEXT NOT NULL,
    name TEXT NOT NULL,
    current_snapshot_id TEXT,
    reindex_requested_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(url, branch)
);

CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    repository_id TEXT NOT NULL REFERENCES repositories(id),
    commit_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    stats TEXT NOT NULL DEFAULT '{}',
    file_manifest TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_snapshots_repo ON snapshots(repository_id);
-- Only one snapshot may be `indexing` per repository at a time.
CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_one_indexing
    ON snapshots(repository_id) WHERE status = 'indexing';

CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    snapshot_id TEXT NOT NULL REFERENCES snapshots(id),
    path TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    language TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    category TEXT NOT NULL,
    parsing_status TEXT NOT NULL,
    parsing_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_files_snapshot_path ON files(snapshot_id, path);

CREATE TABLE IF NOT EXISTS chunk_nodes (
    id TEXT PRIMARY KEY,
    snapshot_id TEXT NOT NULL REFERENCES snapshots(id),
    file_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    byte_start INTEGER NOT NULL,
    byte_end INTEGER NOT NULL,
    chunk_hash TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_chunks_snapshot_file ON chunk_nodes(snapshot_id, file_path, byte_start);

CREATE TABLE IF NOT EXISTS contents (
    chunk_hash TEXT PRIMARY KEY,
    content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS edges (
    source_chunk_id TEXT NOT NULL,
    target_chunk_id TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (source_chunk_id, target_chunk_id, relation_type)
);
CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_chunk_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_chunk_id);

CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    chunk_id TEXT NOT NULL,
    snapshot_id TEXT NOT NULL,
    vector_hash TEXT NOT NULL,
    model_name TEXT NOT NULL,
    embedding BLOB NOT NULL,
    file_path TEXT NOT NULL,
    language TEXT NOT NULL,
    category TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_snapshot ON embeddings(snapshot_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_vector_hash ON embeddings(vector_hash);

CREATE VIRTUAL TABLE IF NOT EXISTS search_index USING fts5(
    node_id UNINDEXED,
    file_path,
    semantic_tags,
    content
);

CREATE TABLE IF NOT EXISTS staging_embeddings (
    id TEXT PRIMARY KEY,
    chunk_id TEXT NOT NULL,
    snapshot_id TEXT NOT NULL,
    vector_hash TEXT NOT NULL,
    embedding BLOB,
    file_path TEXT NOT NULL,
    language TEXT NOT NULL,
    category TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    content TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_staging_snapshot ON staging_embeddings(snapshot_id);
CREATE INDEX IF NOT EXISTS idx_staging_vector_hash ON staging_embeddings(vector_hash);
"#;

fn encode_vector(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Builds the `WHERE` fragment and bound params for `SearchFilters`.
/// `alias` is the table alias the filtered columns live under.
fn filter_clause(filters: &SearchFilters, alias: &str, metadata_alias: &str) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    let mut in_list = |col: &str, values: &[String], negate: bool, clauses: &mut Vec<String>, binds: &mut Vec<String>| {
        if values.is_empty() {
            return;
        }
        let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let op = if negate { "NOT IN" } else { "IN" };
        clauses.push(format!("{alias}.{col} {op} ({placeholders})"));
        binds.extend(values.iter().cloned());
    };

    in_list("language", &filters.language, false, &mut clauses, &mut binds);
    in_list("language", &filters.exclude_language, true, &mut clauses, &mut binds);
    in_list("category", &filters.category, false, &mut clauses, &mut binds);
    in_list("category", &filters.exclude_category, true, &mut clauses, &mut binds);

    for prefix in &filters.path_prefix {
        clauses.push(format!("{alias}.file_path LIKE ?"));
        binds.push(format!("{prefix}%"));
    }

    let mut role_match = |values: &[String], negate: bool, clauses: &mut Vec<String>, binds: &mut Vec<String>| {
        if values.is_empty() {
            return;
        }
        let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let exists = format!(
            "EXISTS (SELECT 1 FROM json_each({metadata_alias}.metadata, '$.semantic_matches') \
             WHERE json_extract(json_each.value, '$.value') IN ({placeholders}))"
        );
        clauses.push(if negate { format!("NOT {exists}") } else { exists });
        binds.extend(values.iter().cloned());
    };

    role_match(&filters.role, false, &mut clauses, &mut binds);
    role_match(&filters.exclude_role, true, &mut clauses, &mut binds);

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" AND {}", clauses.join(" AND "))
    };
    (sql, binds)
}

pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A neighbor's nav label: the first semantic match's human-readable label
/// if the chunk has one, otherwise the literal `"Code Block"`.
fn neighbor_label(metadata_json: &str) -> String {
    let metadata: serde_json::Value = match serde_json::from_str(metadata_json) {
        Ok(v) => v,
        Err(_) => return "Code Block".to_string(),
    };
    metadata
        .get("semantic_matches")
        .and_then(|v| v.as_array())
        .and_then(|matches| matches.first())
        .and_then(|m| m.get("label"))
        .and_then(|l| l.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Code Block".to_string())
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<ChunkNode> {
    let metadata_str: String = row.get("metadata")?;
    Ok(ChunkNode {
        id: row.get("id")?,
        file_id: row.get("file_id")?,
        file_path: row.get("file_path")?,
        start_line: row.get("start_line")?,
        end_line: row.get("end_line")?,
        byte_range: ByteRange::new(row.get("byte_start")?, row.get("byte_end")?),
        chunk_hash: row.get("chunk_hash")?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
    })
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn ensure_repository(&self, url: &str, branch: &str, name: &str) -> Result<Repository> {
        let conn = self.lock();
        let id = Repository::derive_id(url, branch);
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO repositories (id, url, branch, name, current_snapshot_id, reindex_requested_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?5)
             ON CONFLICT(url, branch) DO NOTHING",
            params![id, url, branch, name, now],
        )?;
        drop(conn);
        self.get_repository(&id).await
    }

    async fn get_repository(&self, repository_id: &str) -> Result<Repository> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, url, branch, name, current_snapshot_id, reindex_requested_at, created_at, updated_at
             FROM repositories WHERE id = ?1",
            params![repository_id],
            |row| {
                Ok(Repository {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    branch: row.get(2)?,
                    name: row.get(3)?,
                    current_snapshot_id: row.get(4)?,
                    reindex_requested_at: row
                        .get::<_, Option<String>>(5)?
                        .map(|s| s.parse().unwrap_or_default()),
                    created_at: row.get::<_, String>(6)?.parse().unwrap_or_default(),
                    updated_at: row.get::<_, String>(7)?.parse().unwrap_or_default(),
                })
            },
        )
        .optional()?
        .ok_or_else(|| StorageError::repository_not_found(repository_id))
    }

    async fn create_snapshot(&self, repository_id: &str, commit_hash: &str) -> Result<Snapshot> {
        let conn = self.lock();
        let id = uuid::Uuid::new_v4().to_string();
        let snapshot = Snapshot::new(id.clone(), repository_id, commit_hash);
        let result = conn.execute(
            "INSERT INTO snapshots (id, repository_id, commit_hash, status, created_at, completed_at, stats, file_manifest)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)",
            params![
                snapshot.id,
                snapshot.repository_id,
                snapshot.commit_hash,
                snapshot.status.as_str(),
                snapshot.created_at.to_rfc3339(),
                snapshot.stats.to_string(),
                snapshot.file_manifest.to_string(),
            ],
        );
        match result {
            Ok(_) => Ok(snapshot),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::new(
                    ErrorKind::Transaction,
                    format!("repository {repository_id} already has an indexing snapshot"),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, repository_id, commit_hash, status, created_at, completed_at, stats, file_manifest
             FROM snapshots WHERE id = ?1",
            params![snapshot_id],
            |row| {
                let status_str: String = row.get(3)?;
                let stats_str: String = row.get(6)?;
                let manifest_str: String = row.get(7)?;
                Ok(Snapshot {
                    id: row.get(0)?,
                    repository_id: row.get(1)?,
                    commit_hash: row.get(2)?,
                    status: status_str.parse().unwrap_or(SnapshotStatus::Failed),
                    created_at: row.get::<_, String>(4)?.parse().unwrap_or_default(),
                    completed_at: row
                        .get::<_, Option<String>>(5)?
                        .map(|s| s.parse().unwrap_or_default()),
                    stats: serde_json::from_str(&stats_str).unwrap_or(serde_json::json!({})),
                    file_manifest: serde_json::from_str(&manifest_str).unwrap_or(serde_json::json!({})),
                })
            },
        )
        .optional()?
        .ok_or_else(|| StorageError::snapshot_not_found(snapshot_id))
    }

    async fn list_snapshots(&self, repository_id: &str, limit: Option<usize>) -> Result<Vec<Snapshot>> {
        let conn = self.lock();
        let limit = limit.unwrap_or(usize::MAX) as i64;
        let mut stmt = conn.prepare(
            "SELECT id, repository_id, commit_hash, status, created_at, completed_at, stats, file_manifest
             FROM snapshots WHERE repository_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![repository_id, limit], |row| {
            let status_str: String = row.get(3)?;
            let stats_str: String = row.get(6)?;
            let manifest_str: String = row.get(7)?;
            Ok(Snapshot {
                id: row.get(0)?,
                repository_id: row.get(1)?,
                commit_hash: row.get(2)?,
                status: status_str.parse().unwrap_or(SnapshotStatus::Failed),
                created_at: row.get::<_, String>(4)?.parse().unwrap_or_default(),
                completed_at: row
                    .get::<_, Option<String>>(5)?
                    .map(|s| s.parse().unwrap_or_default()),
                stats: serde_json::from_str(&stats_str).unwrap_or(serde_json::json!({})),
                file_manifest: serde_json::from_str(&manifest_str).unwrap_or(serde_json::json!({})),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn activate_snapshot(&self, snapshot_id: &str, stats: serde_json::Value) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let repository_id: String = tx
            .query_row(
                "SELECT repository_id FROM snapshots WHERE id = ?1 AND status = 'indexing'",
                params![snapshot_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::snapshot_race_lost(snapshot_id))?;

        let updated = tx.execute(
            "UPDATE snapshots SET status = 'completed', completed_at = ?1, stats = ?2
             WHERE id = ?3 AND status = 'indexing'",
            params![now, stats.to_string(), snapshot_id],
        )?;
        if updated == 0 {
            return Err(StorageError::snapshot_race_lost(snapshot_id));
        }
        tx.execute(
            "UPDATE repositories SET current_snapshot_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![snapshot_id, now, repository_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn fail_snapshot(&self, snapshot_id: &str, reason: &str) -> Result<()> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let stats = serde_json::json!({ "failure_reason": reason }).to_string();
        conn.execute(
            "UPDATE snapshots SET status = 'failed', completed_at = ?1, stats = ?2 WHERE id = ?3",
            params![now, stats, snapshot_id],
        )?;
        Ok(())
    }

    async fn prune_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let is_active: Option<String> = tx
            .query_row(
                "SELECT current_snapshot_id FROM repositories r
                 JOIN snapshots s ON s.repository_id = r.id
                 WHERE s.id = ?1 AND r.current_snapshot_id = ?1",
                params![snapshot_id],
                |r| r.get(0),
            )
            .optional()?;
        if is_active.is_some() {
            return Err(StorageError::new(
                ErrorKind::InvariantViolation,
                format!("refusing to prune the active snapshot {snapshot_id}"),
            ));
        }
        tx.execute("DELETE FROM embeddings WHERE snapshot_id = ?1", params![snapshot_id])?;
        tx.execute("DELETE FROM staging_embeddings WHERE snapshot_id = ?1", params![snapshot_id])?;
        tx.execute(
            "DELETE FROM edges WHERE source_chunk_id IN (SELECT id FROM chunk_nodes WHERE snapshot_id = ?1)",
            params![snapshot_id],
        )?;
        tx.execute("DELETE FROM chunk_nodes WHERE snapshot_id = ?1", params![snapshot_id])?;
        tx.execute("DELETE FROM files WHERE snapshot_id = ?1", params![snapshot_id])?;
        tx.execute("DELETE FROM snapshots WHERE id = ?1", params![snapshot_id])?;
        tx.commit()?;
        Ok(())
    }

    async fn get_active_snapshot_id(&self, repository_id: &str) -> Result<Option<String>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT current_snapshot_id FROM repositories WHERE id = ?1",
                params![repository_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten())
    }

    async fn check_and_reset_reindex_flag(&self, repository_id: &str) -> Result<bool> {
        let conn = self.lock();
        let was_set: Option<String> = conn
            .query_row(
                "SELECT reindex_requested_at FROM repositories WHERE id = ?1",
                params![repository_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        if was_set.is_some() {
            conn.execute(
                "UPDATE repositories SET reindex_requested_at = NULL WHERE id = ?1",
                params![repository_id],
            )?;
        }
        Ok(was_set.is_some())
    }

    async fn request_reindex(&self, repository_id: &str) -> Result<()> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE repositories SET reindex_requested_at = ?1 WHERE id = ?2",
            params![now, repository_id],
        )?;
        Ok(())
    }

    async fn add_files(&self, files: &[FileRecord]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO files (id, snapshot_id, path, file_hash, commit_hash, language, size_bytes, category, parsing_status, parsing_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for f in files {
                stmt.execute(params![
                    f.id,
                    f.snapshot_id,
                    f.path,
                    f.file_hash,
                    f.commit_hash,
                    f.language,
                    f.size_bytes,
                    f.category.as_str(),
                    f.parsing_status.as_str(),
                    f.parsing_error,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn add_nodes(&self, nodes: &[ChunkNode]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            // snapshot_id is derivable from file_id's owning snapshot; callers
            // pass chunks already scoped to one snapshot via file_id lookup.
            let mut find_snapshot = tx.prepare("SELECT snapshot_id FROM files WHERE id = ?1")?;
            let mut stmt = tx.prepare(
                "INSERT INTO chunk_nodes (id, snapshot_id, file_id, file_path, start_line, end_line, byte_start, byte_end, chunk_hash, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for n in nodes {
                let snapshot_id: String = find_snapshot
                    .query_row(params![n.file_id], |r| r.get(0))
                    .optional()?
                    .ok_or_else(|| {
                        StorageError::new(
                            ErrorKind::InvariantViolation,
                            format!("chunk {} references unknown file_id {}", n.id, n.file_id),
                        )
                    })?;
                stmt.execute(params![
                    n.id,
                    snapshot_id,
                    n.file_id,
                    n.file_path,
                    n.start_line,
                    n.end_line,
                    n.byte_range.start as i64,
                    n.byte_range.end as i64,
                    n.chunk_hash,
                    n.metadata.to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn add_contents(&self, contents: &[ChunkContent]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO contents (chunk_hash, content) VALUES (?1, ?2) ON CONFLICT(chunk_hash) DO NOTHING",
            )?;
            for c in contents {
                stmt.execute(params![c.chunk_hash, c.content])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn add_search_index(&self, docs: &[SearchDoc]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO search_index (node_id, file_path, semantic_tags, content) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for d in docs {
                stmt.execute(params![d.node_id, d.file_path, d.semantic_tags, d.content])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn add_edge(&self, edge: &Edge) -> Result<()> {
        self.add_edges(std::slice::from_ref(edge)).await
    }

    async fn add_edges(&self, edges: &[Edge]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO edges (source_chunk_id, target_chunk_id, relation_type, metadata)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source_chunk_id, target_chunk_id, relation_type) DO NOTHING",
            )?;
            for e in edges {
                stmt.execute(params![
                    e.source_chunk_id,
                    e.target_chunk_id,
                    e.relation_type.as_str(),
                    e.metadata.to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn save_embeddings(&self, embeddings: &[Embedding]) -> Result<()> {
        self.save_embeddings_direct(embeddings).await
    }

    async fn ingest_scip_relations(&self, _snapshot_id: &str, edges: &[Edge]) -> Result<usize> {
        self.add_edges(edges).await?;
        Ok(edges.len())
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<ChunkNode> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, file_id, file_path, start_line, end_line, byte_start, byte_end, chunk_hash, metadata
             FROM chunk_nodes WHERE id = ?1",
            params![chunk_id],
            row_to_chunk,
        )
        .optional()?
        .ok_or_else(|| StorageError::chunk_not_found(chunk_id))
    }

    async fn get_content(&self, chunk_hash: &str) -> Result<String> {
        let conn = self.lock();
        conn.query_row(
            "SELECT content FROM contents WHERE chunk_hash = ?1",
            params![chunk_hash],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| StorageError::new(ErrorKind::ChunkNotFound, format!("no content for hash {chunk_hash}")))
    }

    async fn find_chunk_id(
        &self,
        snapshot_id: &str,
        file_path: &str,
        byte_offset: usize,
    ) -> Result<Option<String>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT id FROM chunk_nodes
                 WHERE snapshot_id = ?1 AND file_path = ?2 AND byte_start <= ?3 AND ?3 < byte_end
                 ORDER BY (byte_end - byte_start) ASC LIMIT 1",
                params![snapshot_id, file_path, byte_offset as i64],
                |r| r.get(0),
            )
            .optional()?)
    }

    async fn search_vectors(
        &self,
        snapshot_id: &str,
        query_vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.lock();
        let (filter_sql, filter_binds) = filter_clause(filters, "e", "n");
        let sql = format!(
            "SELECT e.chunk_id, e.embedding, e.file_path, e.language, e.category, e.start_line, e.end_line, n.chunk_hash, n.metadata
             FROM embeddings e
             JOIN chunk_nodes n ON n.id = e.chunk_id
             WHERE e.snapshot_id = ?1{filter_sql}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bind_params: Vec<&dyn rusqlite::ToSql> = vec![&snapshot_id];
        for b in &filter_binds {
            bind_params.push(b);
        }
        let rows = stmt.query_map(bind_params.as_slice(), |row| {
            let vec_bytes: Vec<u8> = row.get(1)?;
            let chunk_hash: String = row.get(7)?;
            let metadata_str: String = row.get(8)?;
            Ok((
                row.get::<_, String>(0)?,
                decode_vector(&vec_bytes),
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, u32>(6)?,
                chunk_hash,
                metadata_str,
            ))
        })?;

        let mut scored = Vec::new();
        for row in rows {
            let (chunk_id, vec, file_path, language, category, start_line, end_line, chunk_hash, metadata_str) = row?;
            let score = cosine_similarity(query_vector, &vec);
            let content = conn
                .query_row(
                    "SELECT content FROM contents WHERE chunk_hash = ?1",
                    params![chunk_hash],
                    |r| r.get::<_, String>(0),
                )
                .unwrap_or_default();
            scored.push(SearchHit {
                chunk_id,
                file_path,
                content,
                start_line,
                end_line,
                language,
                category,
                metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
                score,
            });
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn search_fts(
        &self,
        snapshot_id: &str,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.lock();
        let (filter_sql, filter_binds) = filter_clause(filters, "n", "n");
        let sql = format!(
            "SELECT n.id, n.file_path, n.start_line, n.end_line, n.chunk_hash, n.metadata, s.rank
             FROM search_index s
             JOIN chunk_nodes n ON n.id = s.node_id
             WHERE s.content MATCH ?1 AND n.snapshot_id = ?2{filter_sql}
             ORDER BY s.rank LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bind_params: Vec<&dyn rusqlite::ToSql> = vec![&query, &snapshot_id];
        for b in &filter_binds {
            bind_params.push(b);
        }
        let top_k_i64 = top_k as i64;
        bind_params.push(&top_k_i64);

        let mut hits = Vec::new();
        let rows = stmt.query_map(bind_params.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, f64>(6)?,
            ))
        })?;
        for row in rows {
            let (chunk_id, file_path, start_line, end_line, chunk_hash, metadata_str, bm25_rank) = row?;
            let content: String = conn
                .query_row(
                    "SELECT content FROM contents WHERE chunk_hash = ?1",
                    params![chunk_hash],
                    |r| r.get(0),
                )
                .unwrap_or_default();
            let (language, category) = conn
                .query_row(
                    "SELECT language, category FROM files WHERE snapshot_id = ?1 AND path = ?2",
                    params![snapshot_id, file_path],
                    |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
                )
                .unwrap_or_else(|_| ("unknown".to_string(), "source".to_string()));
            hits.push(SearchHit {
                chunk_id,
                file_path,
                content,
                start_line,
                end_line,
                language,
                category,
                metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
                // FTS5 rank is negative bm25; flip so higher is better.
                score: -bm25_rank as f32,
            });
        }
        Ok(hits)
    }

    async fn get_context_neighbors(&self, chunk_id: &str) -> Result<NeighborMetadata> {
        let conn = self.lock();
        let (file_path, snapshot_id, byte_start): (String, String, i64) = conn.query_row(
            "SELECT file_path, snapshot_id, byte_start FROM chunk_nodes WHERE id = ?1",
            params![chunk_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;

        let next: Option<(String, String)> = conn
            .query_row(
                "SELECT id, metadata FROM chunk_nodes
                 WHERE snapshot_id = ?1 AND file_path = ?2 AND byte_start > ?3
                 ORDER BY byte_start ASC LIMIT 1",
                params![snapshot_id, file_path, byte_start],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let prev: Option<(String, String)> = conn
            .query_row(
                "SELECT id, metadata FROM chunk_nodes
                 WHERE snapshot_id = ?1 AND file_path = ?2 AND byte_start < ?3
                 ORDER BY byte_start DESC LIMIT 1",
                params![snapshot_id, file_path, byte_start],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let parent: Option<(String, String)> = conn
            .query_row(
                "SELECT n.id, n.metadata FROM edges e
                 JOIN chunk_nodes n ON n.id = e.target_chunk_id
                 WHERE e.source_chunk_id = ?1 AND e.relation_type = 'child_of' LIMIT 1",
                params![chunk_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        Ok(NeighborMetadata {
            next: next.map(|(id, metadata)| NeighborRef { id, label: neighbor_label(&metadata) }),
            prev: prev.map(|(id, metadata)| NeighborRef { id, label: neighbor_label(&metadata) }),
            parent: parent.map(|(id, metadata)| NeighborRef { id, label: neighbor_label(&metadata) }),
        })
    }

    async fn get_neighbor_chunk(&self, chunk_id: &str) -> Result<Option<ChunkNode>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT id, file_id, file_path, start_line, end_line, byte_start, byte_end, chunk_hash, metadata
                 FROM chunk_nodes WHERE id = ?1",
                params![chunk_id],
                row_to_chunk,
            )
            .optional()?)
    }

    async fn get_incoming_references(&self, chunk_id: &str, limit: usize) -> Result<Vec<Edge>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT source_chunk_id, target_chunk_id, relation_type, metadata
             FROM edges WHERE target_chunk_id = ?1 LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chunk_id, limit as i64], |row| {
            let rel: String = row.get(2)?;
            let metadata_str: String = row.get(3)?;
            Ok(Edge {
                source_chunk_id: row.get(0)?,
                target_chunk_id: row.get(1)?,
                relation_type: rel.parse().unwrap_or(RelationType::References),
                metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_outgoing_calls(&self, chunk_id: &str, limit: usize) -> Result<Vec<Edge>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT source_chunk_id, target_chunk_id, relation_type, metadata
             FROM edges WHERE source_chunk_id = ?1 AND relation_type = 'calls' LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chunk_id, limit as i64], |row| {
            let metadata_str: String = row.get(3)?;
            Ok(Edge {
                source_chunk_id: row.get(0)?,
                target_chunk_id: row.get(1)?,
                relation_type: RelationType::Calls,
                metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_nodes_to_embed(&self, snapshot_id: &str) -> Result<Vec<PendingEmbeddingRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT n.id, n.file_path, n.start_line, n.end_line, n.metadata, c.content,
                    f.language, f.category, n.chunk_hash
             FROM chunk_nodes n
             JOIN files f ON f.id = n.file_id
             JOIN contents c ON c.chunk_hash = n.chunk_hash
             WHERE n.snapshot_id = ?1
               AND n.id NOT IN (SELECT chunk_id FROM embeddings WHERE snapshot_id = ?1)",
        )?;
        let mut rows_stmt = stmt.query(params![snapshot_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows_stmt.next()? {
            let chunk_id: String = row.get(0)?;
            let metadata_str: String = row.get(4)?;
            let mut incoming_stmt = conn.prepare(
                "SELECT metadata FROM edges WHERE target_chunk_id = ?1 AND relation_type = 'calls'",
            )?;
            let incoming: Vec<String> = incoming_stmt
                .query_map(params![chunk_id], |r| {
                    let m: String = r.get(0)?;
                    Ok(serde_json::from_str::<serde_json::Value>(&m)
                        .ok()
                        .and_then(|v| v.get("symbol").and_then(|s| s.as_str().map(String::from)))
                        .unwrap_or_default())
                })?
                .filter_map(|r| r.ok())
                .filter(|s| !s.is_empty())
                .collect();
            out.push(PendingEmbeddingRow {
                chunk_id,
                snapshot_id: snapshot_id.to_string(),
                file_path: row.get(1)?,
                language: row.get(6)?,
                category: row.get(7)?,
                start_line: row.get(2)?,
                end_line: row.get(3)?,
                content: row.get(5)?,
                metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
                incoming_definitions: incoming,
            });
        }
        Ok(out)
    }

    async fn prepare_embedding_staging(&self, snapshot_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM staging_embeddings WHERE snapshot_id = ?1", params![snapshot_id])?;
        Ok(())
    }

    async fn load_staging_data(&self, rows: &[StagingRow]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO staging_embeddings (id, chunk_id, snapshot_id, vector_hash, embedding, file_path, language, category, start_line, end_line, model_name, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.id,
                    r.chunk_id,
                    r.snapshot_id,
                    r.vector_hash,
                    r.embedding.as_ref().map(|v| encode_vector(v)),
                    r.file_path,
                    r.language,
                    r.category,
                    r.start_line,
                    r.end_line,
                    r.model_name,
                    r.content,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn backfill_staging_vectors(&self, snapshot_id: &str) -> Result<usize> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE staging_embeddings
             SET embedding = (
                 SELECT e.embedding FROM embeddings e
                 WHERE e.vector_hash = staging_embeddings.vector_hash
                 LIMIT 1
             )
             WHERE snapshot_id = ?1
               AND embedding IS NULL
               AND EXISTS (SELECT 1 FROM embeddings e WHERE e.vector_hash = staging_embeddings.vector_hash)",
            params![snapshot_id],
        )?;
        Ok(updated)
    }

    async fn flush_staged_hits(&self, snapshot_id: &str) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut count = 0usize;
        {
            let mut select_stmt = tx.prepare(
                "SELECT id, chunk_id, snapshot_id, vector_hash, embedding, file_path, language, category, start_line, end_line, model_name
                 FROM staging_embeddings WHERE snapshot_id = ?1 AND embedding IS NOT NULL",
            )?;
            let mut insert_stmt = tx.prepare(
                "INSERT INTO embeddings (id, chunk_id, snapshot_id, vector_hash, model_name, embedding, file_path, language, category, start_line, end_line, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            let now = Utc::now().to_rfc3339();
            let mut rows = select_stmt.query(params![snapshot_id])?;
            while let Some(row) = rows.next()? {
                let embedding_bytes: Vec<u8> = row.get(4)?;
                insert_stmt.execute(params![
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(10)?,
                    embedding_bytes,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, u32>(8)?,
                    row.get::<_, u32>(9)?,
                    now,
                ])?;
                count += 1;
            }
        }
        tx.execute(
            "DELETE FROM staging_embeddings WHERE snapshot_id = ?1 AND embedding IS NOT NULL",
            params![snapshot_id],
        )?;
        tx.commit()?;
        Ok(count)
    }

    async fn fetch_staging_delta(&self, snapshot_id: &str, batch_size: usize) -> Result<Vec<StagingRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, chunk_id, snapshot_id, vector_hash, embedding, file_path, language, category, start_line, end_line, model_name, content
             FROM staging_embeddings WHERE snapshot_id = ?1 AND embedding IS NULL LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![snapshot_id, batch_size as i64], |row| {
            let embedding_bytes: Option<Vec<u8>> = row.get(4)?;
            Ok(StagingRow {
                id: row.get(0)?,
                chunk_id: row.get(1)?,
                snapshot_id: row.get(2)?,
                vector_hash: row.get(3)?,
                embedding: embedding_bytes.map(|b| decode_vector(&b)),
                file_path: row.get(5)?,
                language: row.get(6)?,
                category: row.get(7)?,
                start_line: row.get(8)?,
                end_line: row.get(9)?,
                model_name: row.get(10)?,
                content: row.get(11)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn save_embeddings_direct(&self, embeddings: &[Embedding]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO embeddings (id, chunk_id, snapshot_id, vector_hash, model_name, embedding, file_path, language, category, start_line, end_line, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for e in embeddings {
                stmt.execute(params![
                    e.id,
                    e.chunk_id,
                    e.snapshot_id,
                    e.vector_hash,
                    e.model_name,
                    encode_vector(&e.embedding),
                    e.file_path,
                    e.language,
                    e.category,
                    e.start_line,
                    e.end_line,
                    e.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn cleanup_staging(&self, snapshot_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM staging_embeddings WHERE snapshot_id = ?1", params![snapshot_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FileCategory, ParsingStatus};

    fn seed_file(store: &SqliteSnapshotStore, snapshot_id: &str, path: &str) -> String {
        let conn = store.lock();
        let file_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO files (id, snapshot_id, path, file_hash, commit_hash, language, size_bytes, category, parsing_status, parsing_error)
             VALUES (?1, ?2, ?3, 'h', 'c', 'python', 100, 'source', 'success', NULL)",
            params![file_id, snapshot_id, path],
        )
        .unwrap();
        file_id
    }

    #[tokio::test]
    async fn repository_is_idempotent_by_url_branch() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        let a = store.ensure_repository("https://x/y.git", "main", "y").await.unwrap();
        let b = store.ensure_repository("https://x/y.git", "main", "y").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn only_one_indexing_snapshot_per_repository() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        let repo = store.ensure_repository("https://x/y.git", "main", "y").await.unwrap();
        store.create_snapshot(&repo.id, "c1").await.unwrap();
        let second = store.create_snapshot(&repo.id, "c2").await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn activate_snapshot_repoints_current_pointer() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        let repo = store.ensure_repository("https://x/y.git", "main", "y").await.unwrap();
        let snap = store.create_snapshot(&repo.id, "c1").await.unwrap();
        store.activate_snapshot(&snap.id, serde_json::json!({"nodes": 10})).await.unwrap();
        let active = store.get_active_snapshot_id(&repo.id).await.unwrap();
        assert_eq!(active, Some(snap.id.clone()));
        let refreshed = store.get_snapshot(&snap.id).await.unwrap();
        assert_eq!(refreshed.status, SnapshotStatus::Completed);
    }

    #[tokio::test]
    async fn activate_snapshot_fails_if_already_resolved() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        let repo = store.ensure_repository("https://x/y.git", "main", "y").await.unwrap();
        let snap = store.create_snapshot(&repo.id, "c1").await.unwrap();
        store.fail_snapshot(&snap.id, "boom").await.unwrap();
        let result = store.activate_snapshot(&snap.id, serde_json::json!({})).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::SnapshotRaceLost);
    }

    #[tokio::test]
    async fn chunk_roundtrip_and_spatial_lookup() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        let repo = store.ensure_repository("https://x/y.git", "main", "y").await.unwrap();
        let snap = store.create_snapshot(&repo.id, "c1").await.unwrap();
        let file_id = seed_file(&store, &snap.id, "a.py");
        store
            .add_files(&[FileRecord {
                id: file_id.clone(),
                snapshot_id: snap.id.clone(),
                path: "a.py".into(),
                file_hash: "h".into(),
                commit_hash: "c1".into(),
                language: "python".into(),
                size_bytes: 100,
                category: FileCategory::Source,
                parsing_status: ParsingStatus::Success,
                parsing_error: None,
            }])
            .await
            .ok(); // already seeded directly; duplicate insert tolerated in this smoke test

        let chunk_hash = crate::domain::content_hash("def f():\n    pass\n");
        store
            .add_contents(&[ChunkContent {
                chunk_hash: chunk_hash.clone(),
                content: "def f():\n    pass\n".into(),
            }])
            .await
            .unwrap();
        store
            .add_nodes(&[ChunkNode {
                id: "chunk1".into(),
                file_id: file_id.clone(),
                file_path: "a.py".into(),
                start_line: 1,
                end_line: 2,
                byte_range: ByteRange::new(0, 18),
                chunk_hash,
                metadata: serde_json::json!({}),
            }])
            .await
            .unwrap();

        let found = store.find_chunk_id(&snap.id, "a.py", 5).await.unwrap();
        assert_eq!(found, Some("chunk1".to_string()));
        let not_found = store.find_chunk_id(&snap.id, "a.py", 50).await.unwrap();
        assert_eq!(not_found, None);

        let chunk = store.get_chunk("chunk1").await.unwrap();
        assert_eq!(chunk.start_line, 1);
    }

    #[tokio::test]
    async fn prune_refuses_active_snapshot() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        let repo = store.ensure_repository("https://x/y.git", "main", "y").await.unwrap();
        let snap = store.create_snapshot(&repo.id, "c1").await.unwrap();
        store.activate_snapshot(&snap.id, serde_json::json!({})).await.unwrap();
        let result = store.prune_snapshot(&snap.id).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reindex_flag_round_trips() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        let repo = store.ensure_repository("https://x/y.git", "main", "y").await.unwrap();
        assert!(!store.check_and_reset_reindex_flag(&repo.id).await.unwrap());
        store.request_reindex(&repo.id).await.unwrap();
        assert!(store.check_and_reset_reindex_flag(&repo.id).await.unwrap());
        assert!(!store.check_and_reset_reindex_flag(&repo.id).await.unwrap());
    }

    #[test]
    fn vector_encode_decode_round_trips() {
        let v = vec![0.1f32, -0.5, 2.0, 0.0];
        let decoded = decode_vector(&encode_vector(&v));
        assert_eq!(v, decoded);
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }
}
