//! Error types for codegraph-storage.
//!
//! Kinds mirror the error-handling taxonomy: transient infra failures are
//! retryable, the rest end a job (or a single file, for parse failures)
//! without retry.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable: DB connection drop, lock timeout, disk full.
    TransientInfra,
    /// A single file failed to parse; the rest of the snapshot proceeds.
    FileLevelParse,
    /// An external indexer tool (e.g. an SCIP producer) exited non-zero.
    IndexerToolFailure,
    /// The embedding provider returned an error or a malformed vector.
    EmbeddingProviderFailure,
    /// Lost the race to activate a snapshot (another writer got there first).
    SnapshotRaceLost,
    /// A stored invariant was violated (bad byte range, hash mismatch, dim mismatch).
    InvariantViolation,
    Database,
    Serialization,
    SnapshotNotFound,
    RepositoryNotFound,
    ChunkNotFound,
    Transaction,
    Config,
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientInfra => "transient_infra",
            ErrorKind::FileLevelParse => "file_level_parse",
            ErrorKind::IndexerToolFailure => "indexer_tool_failure",
            ErrorKind::EmbeddingProviderFailure => "embedding_provider_failure",
            ErrorKind::SnapshotRaceLost => "snapshot_race_lost",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::SnapshotNotFound => "snapshot_not_found",
            ErrorKind::RepositoryNotFound => "repository_not_found",
            ErrorKind::ChunkNotFound => "chunk_not_found",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Config => "config",
            ErrorKind::IO => "io",
        }
    }

    /// Whether the orchestrator should retry the enclosing operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientInfra | ErrorKind::SnapshotRaceLost)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn snapshot_not_found(snapshot_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::SnapshotNotFound,
            format!("snapshot not found: {}", snapshot_id.into()),
        )
    }

    pub fn repository_not_found(repo_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::RepositoryNotFound,
            format!("repository not found: {}", repo_id.into()),
        )
    }

    pub fn chunk_not_found(chunk_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ChunkNotFound,
            format!("chunk not found: {}", chunk_id.into()),
        )
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn transient_infra(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientInfra, message)
    }

    pub fn snapshot_race_lost(snapshot_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::SnapshotRaceLost,
            format!("lost the race to activate snapshot: {}", snapshot_id.into()),
        )
    }

    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolation, message)
    }

    pub fn embedding_provider_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EmbeddingProviderFailure, message)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        let kind = match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                ErrorKind::TransientInfra
            }
            rusqlite::Error::QueryReturnedNoRows => ErrorKind::Database,
            _ => ErrorKind::Database,
        };
        StorageError::new(kind, format!("sqlite error: {err}")).with_source(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("json error: {err}")).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("io error: {err}")).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = StorageError::snapshot_not_found("abc123def");
        let msg = format!("{}", err);
        assert!(msg.contains("snapshot_not_found"));
        assert!(msg.contains("abc123def"));
    }

    #[test]
    fn test_database_error() {
        let err = StorageError::database("connection failed");
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.source.is_none());
        assert_eq!(format!("{}", err), "[database] connection failed");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::TransientInfra.is_retryable());
        assert!(ErrorKind::SnapshotRaceLost.is_retryable());
        assert!(!ErrorKind::InvariantViolation.is_retryable());
        assert!(!ErrorKind::FileLevelParse.is_retryable());
    }

    #[test]
    fn test_with_source() {
        use std::io;
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = StorageError::database("db file missing").with_source(io_err);
        assert!(err.source.is_some());
        assert!(err.source().unwrap().to_string().contains("file not found"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_from_rusqlite_error() {
        let sqlite_err = rusqlite::Error::QueryReturnedNoRows;
        let err: StorageError = sqlite_err.into();
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.source.is_some());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json")
            .err()
            .unwrap();
        let err: StorageError = json_err.into();
        assert_eq!(err.kind, ErrorKind::Serialization);
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> Result<()> {
            Err(StorageError::snapshot_not_found("test"))
        }
        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }
        assert_eq!(outer().unwrap_err().kind, ErrorKind::SnapshotNotFound);
    }
}
