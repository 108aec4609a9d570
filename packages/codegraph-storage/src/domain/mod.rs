//! Domain model for the Code Property Graph.
//!
//! A snapshot is an immutable, fully-indexed view of a repository at one
//! commit. Everything below hangs off a `(repository_id, snapshot_id)` pair;
//! `ChunkContent` is the one table shared across snapshots, keyed by content
//! hash rather than by snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of UTF-8 text. Used for both `chunk_hash` and
/// `vector_hash` so the chunker and the embedding pipeline never disagree
/// about what "the same content" means.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub url: String,
    pub branch: String,
    pub name: String,
    pub current_snapshot_id: Option<String>,
    pub reindex_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    /// Deterministic id derived from `(url, branch)` so re-registering the
    /// same remote is idempotent without a round-trip.
    pub fn derive_id(url: &str, branch: &str) -> String {
        content_hash(&format!("{url}\u{0}{branch}"))
    }

    pub fn new(url: impl Into<String>, branch: impl Into<String>, name: impl Into<String>) -> Self {
        let url = url.into();
        let branch = branch.into();
        let id = Self::derive_id(&url, &branch);
        let now = Utc::now();
        Self {
            id,
            url,
            branch,
            name: name.into(),
            current_snapshot_id: None,
            reindex_requested_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Indexing,
    Completed,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Indexing => "indexing",
            SnapshotStatus::Completed => "completed",
            SnapshotStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SnapshotStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indexing" => Ok(SnapshotStatus::Indexing),
            "completed" => Ok(SnapshotStatus::Completed),
            "failed" => Ok(SnapshotStatus::Failed),
            other => Err(format!("unknown snapshot status: {other}")),
        }
    }
}

/// An immutable, fully-indexed view of a repository at one commit.
///
/// Unlike the simple `Snapshot` this replaces, `id` is a freshly generated
/// identifier (not the commit hash) — a repository may attempt to index the
/// same commit twice (e.g. after a failed run) and each attempt gets its own
/// row, with only one ever reachable through `current_snapshot_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub repository_id: String,
    pub commit_hash: String,
    pub status: SnapshotStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Node/edge/embedding counts, stage timings.
    pub stats: serde_json::Value,
    /// Nested `dir -> children` tree for O(1) directory listings.
    pub file_manifest: serde_json::Value,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, repository_id: impl Into<String>, commit_hash: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            repository_id: repository_id.into(),
            commit_hash: commit_hash.into(),
            status: SnapshotStatus::Indexing,
            created_at: Utc::now(),
            completed_at: None,
            stats: serde_json::json!({}),
            file_manifest: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Source,
    Test,
    Config,
    Docs,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Source => "source",
            FileCategory::Test => "test",
            FileCategory::Config => "config",
            FileCategory::Docs => "docs",
        }
    }
}

impl std::str::FromStr for FileCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(FileCategory::Source),
            "test" => Ok(FileCategory::Test),
            "config" => Ok(FileCategory::Config),
            "docs" => Ok(FileCategory::Docs),
            other => Err(format!("unknown file category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsingStatus {
    Success,
    Skipped,
    Failed,
}

impl ParsingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParsingStatus::Success => "success",
            ParsingStatus::Skipped => "skipped",
            ParsingStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ParsingStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ParsingStatus::Success),
            "skipped" => Ok(ParsingStatus::Skipped),
            "failed" => Ok(ParsingStatus::Failed),
            other => Err(format!("unknown parsing status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub snapshot_id: String,
    /// POSIX-relative, no leading `./`.
    pub path: String,
    pub file_hash: String,
    pub commit_hash: String,
    pub language: String,
    pub size_bytes: u64,
    pub category: FileCategory,
    pub parsing_status: ParsingStatus,
    pub parsing_error: Option<String>,
}

/// Half-open byte range `[start, end)` into a file's raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True if `self` fully contains `other`.
    pub fn contains(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkNode {
    pub id: String,
    pub file_id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub byte_range: ByteRange,
    pub chunk_hash: String,
    /// `{semantic_matches: [...], tags: [...]}`.
    pub metadata: serde_json::Value,
}

impl ChunkNode {
    /// Well-formed range and hash-content agreement, the two chunk
    /// invariants the rest of the pipeline relies on.
    pub fn validate(&self, file_size: u64, content: &str) -> Result<(), String> {
        if self.byte_range.start >= self.byte_range.end {
            return Err(format!(
                "chunk {} has empty/negative byte range {:?}",
                self.id, self.byte_range
            ));
        }
        if self.byte_range.end as u64 > file_size {
            return Err(format!(
                "chunk {} byte_range.end {} exceeds file size {}",
                self.id, self.byte_range.end, file_size
            ));
        }
        let expected = content_hash(content);
        if expected != self.chunk_hash {
            return Err(format!(
                "chunk {} hash mismatch: expected {}, got {}",
                self.id, expected, self.chunk_hash
            ));
        }
        Ok(())
    }
}

/// Content-addressed blob, insert-only and shared across every snapshot and
/// file that happens to produce the same chunk text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkContent {
    pub chunk_hash: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    ChildOf,
    Calls,
    References,
    Instantiates,
    Imports,
    Overrides,
    Implements,
    ReadsFrom,
    WritesTo,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::ChildOf => "child_of",
            RelationType::Calls => "calls",
            RelationType::References => "references",
            RelationType::Instantiates => "instantiates",
            RelationType::Imports => "imports",
            RelationType::Overrides => "overrides",
            RelationType::Implements => "implements",
            RelationType::ReadsFrom => "reads_from",
            RelationType::WritesTo => "writes_to",
        }
    }
}

impl std::str::FromStr for RelationType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "child_of" => Ok(RelationType::ChildOf),
            "calls" => Ok(RelationType::Calls),
            "references" => Ok(RelationType::References),
            "instantiates" => Ok(RelationType::Instantiates),
            "imports" => Ok(RelationType::Imports),
            "overrides" => Ok(RelationType::Overrides),
            "implements" => Ok(RelationType::Implements),
            "reads_from" => Ok(RelationType::ReadsFrom),
            "writes_to" => Ok(RelationType::WritesTo),
            other => Err(format!("unknown relation type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source_chunk_id: String,
    pub target_chunk_id: String,
    pub relation_type: RelationType,
    /// `{tool, symbol, is_external}`.
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub id: String,
    pub chunk_id: String,
    pub snapshot_id: String,
    pub vector_hash: String,
    pub model_name: String,
    pub embedding: Vec<f32>,
    pub file_path: String,
    pub language: String,
    pub category: String,
    pub start_line: u32,
    pub end_line: u32,
    pub created_at: DateTime<Utc>,
}

/// A row pending embedding, as yielded by `get_nodes_to_embed`. Carries
/// enough context (incoming call symbols) to build the prompt without a
/// second round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEmbeddingRow {
    pub chunk_id: String,
    pub snapshot_id: String,
    pub file_path: String,
    pub language: String,
    pub category: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub metadata: serde_json::Value,
    pub incoming_definitions: Vec<String>,
}

/// A scratch row in the staging table — ephemeral, per indexing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRow {
    pub id: String,
    pub chunk_id: String,
    pub snapshot_id: String,
    pub vector_hash: String,
    pub embedding: Option<Vec<f32>>,
    pub file_path: String,
    pub language: String,
    pub category: String,
    pub start_line: u32,
    pub end_line: u32,
    pub model_name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDoc {
    pub node_id: String,
    pub file_path: String,
    pub semantic_tags: String,
    pub content: String,
}

/// One hit from either search strategy, keyed by `chunk_id` in the
/// Retriever's candidate dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub file_path: String,
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
    pub language: String,
    pub category: String,
    pub metadata: serde_json::Value,
    pub score: f32,
}

/// Filter grammar shared by `search_vectors` and `search_fts`. Every field is
/// optional; an empty list is a no-op, never a SQL error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub path_prefix: Vec<String>,
    pub language: Vec<String>,
    pub exclude_language: Vec<String>,
    pub category: Vec<String>,
    pub exclude_category: Vec<String>,
    pub role: Vec<String>,
    pub exclude_role: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborRef {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeighborMetadata {
    pub next: Option<NeighborRef>,
    pub prev: Option<NeighborRef>,
    pub parent: Option<NeighborRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash("fn main() {}"), content_hash("fn main() {}"));
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[test]
    fn repository_id_is_stable_per_url_branch() {
        let a = Repository::derive_id("https://example.com/repo.git", "main");
        let b = Repository::derive_id("https://example.com/repo.git", "main");
        let c = Repository::derive_id("https://example.com/repo.git", "dev");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn byte_range_contains_and_overlaps() {
        let outer = ByteRange::new(0, 100);
        let inner = ByteRange::new(10, 20);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.overlaps(&inner));
        assert!(!ByteRange::new(0, 5).overlaps(&ByteRange::new(5, 10)));
    }

    #[test]
    fn chunk_validate_catches_hash_mismatch() {
        let chunk = ChunkNode {
            id: "c1".into(),
            file_id: "f1".into(),
            file_path: "a.py".into(),
            start_line: 1,
            end_line: 1,
            byte_range: ByteRange::new(0, 5),
            chunk_hash: "deadbeef".into(),
            metadata: serde_json::json!({}),
        };
        assert!(chunk.validate(100, "hello").is_err());
        let good = ChunkNode {
            chunk_hash: content_hash("hello"),
            ..chunk
        };
        assert!(good.validate(100, "hello").is_ok());
    }

    #[test]
    fn chunk_validate_rejects_out_of_bounds_range() {
        let chunk = ChunkNode {
            id: "c1".into(),
            file_id: "f1".into(),
            file_path: "a.py".into(),
            start_line: 1,
            end_line: 1,
            byte_range: ByteRange::new(0, 200),
            chunk_hash: content_hash("hello"),
            metadata: serde_json::json!({}),
        };
        assert!(chunk.validate(100, "hello").is_err());
    }

    #[test]
    fn snapshot_status_round_trips() {
        for s in ["indexing", "completed", "failed"] {
            let parsed: SnapshotStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!("bogus".parse::<SnapshotStatus>().is_err());
    }

    #[test]
    fn file_category_and_parsing_status_round_trip() {
        for c in ["source", "test", "config", "docs"] {
            assert_eq!(c.parse::<FileCategory>().unwrap().as_str(), c);
        }
        for s in ["success", "skipped", "failed"] {
            assert_eq!(s.parse::<ParsingStatus>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn relation_type_round_trips() {
        for r in [
            "child_of",
            "calls",
            "references",
            "instantiates",
            "imports",
            "overrides",
            "implements",
            "reads_from",
            "writes_to",
        ] {
            assert_eq!(r.parse::<RelationType>().unwrap().as_str(), r);
        }
    }
}
