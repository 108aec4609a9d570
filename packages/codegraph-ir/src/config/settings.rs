//! The indexer's actual settings: chunking thresholds, cross-reference
//! resolver toggles, embedding provider knobs, storage locations, and the
//! orphan-snapshot garbage collector's cadence. Defaults mirror the ground
//! truth Python implementation's constants; every field is individually
//! overridable from a TOML file or an environment variable.

use serde::{Deserialize, Serialize};

use super::error::ConfigResult;
use super::validation::Validatable;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub max_chunk_size: usize,
    pub chunk_tolerance: usize,
    pub max_file_size_bytes: u64,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: 800,
            chunk_tolerance: 400,
            max_file_size_bytes: 1024 * 1024,
        }
    }
}

impl Validatable for ChunkingSettings {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_chunk_size == 0 {
            return Err(super::error::ConfigError::range_with_hint(
                "chunking.max_chunk_size",
                self.max_chunk_size,
                1,
                usize::MAX,
                "chunks must have a positive size budget",
            ));
        }
        if self.chunk_tolerance > self.max_chunk_size {
            return Err(super::error::ConfigError::Custom(format!(
                "chunking.chunk_tolerance ({}) must not exceed chunking.max_chunk_size ({})",
                self.chunk_tolerance, self.max_chunk_size
            )));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "ChunkingSettings"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub model_name: String,
    pub max_concurrency: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model_name: "text-embedding-3-small".to_string(),
            max_concurrency: 8,
            batch_size: 200,
        }
    }
}

impl Validatable for EmbeddingSettings {
    fn validate(&self) -> ConfigResult<()> {
        if self.model_name.trim().is_empty() {
            return Err(super::error::ConfigError::Custom("embedding.model_name must not be empty".into()));
        }
        if self.max_concurrency == 0 {
            return Err(super::error::ConfigError::range_with_hint(
                "embedding.max_concurrency",
                self.max_concurrency,
                1,
                1024,
                "at least one worker is required to make progress",
            ));
        }
        if self.batch_size == 0 {
            return Err(super::error::ConfigError::range_with_hint(
                "embedding.batch_size",
                self.batch_size,
                1,
                100_000,
                "batches must contain at least one chunk",
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "EmbeddingSettings"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossRefSettings {
    pub enabled: bool,
    pub subprocess_timeout_secs: u64,
}

impl Default for CrossRefSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            subprocess_timeout_secs: 30,
        }
    }
}

impl Validatable for CrossRefSettings {
    fn validate(&self) -> ConfigResult<()> {
        if self.enabled && self.subprocess_timeout_secs == 0 {
            return Err(super::error::ConfigError::range_with_hint(
                "cross_ref.subprocess_timeout_secs",
                self.subprocess_timeout_secs,
                1,
                3600,
                "a zero timeout would kill the resolver subprocess instantly",
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "CrossRefSettings"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: String,
    pub worktree_cache_root: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "./codegraph.db".to_string(),
            worktree_cache_root: "./.codegraph/worktrees".to_string(),
        }
    }
}

impl Validatable for StorageSettings {
    fn validate(&self) -> ConfigResult<()> {
        if self.database_path.trim().is_empty() {
            return Err(super::error::ConfigError::Custom("storage.database_path must not be empty".into()));
        }
        if self.worktree_cache_root.trim().is_empty() {
            return Err(super::error::ConfigError::Custom(
                "storage.worktree_cache_root must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "StorageSettings"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanGcSettings {
    pub interval_secs: u64,
    pub stale_threshold_secs: u64,
}

impl Default for OrphanGcSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            stale_threshold_secs: 86_400,
        }
    }
}

impl Validatable for OrphanGcSettings {
    fn validate(&self) -> ConfigResult<()> {
        if self.interval_secs == 0 {
            return Err(super::error::ConfigError::range_with_hint(
                "orphan_gc.interval_secs",
                self.interval_secs,
                1,
                u64::MAX,
                "a zero interval would spin the GC loop continuously",
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "OrphanGcSettings"
    }
}

/// Top-level settings object, assembled from defaults, an optional preset,
/// an optional TOML file, and environment variable overrides (in that
/// ascending order of precedence).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub chunking: ChunkingSettings,
    pub embedding: EmbeddingSettings,
    pub cross_ref: CrossRefSettings,
    pub storage: StorageSettings,
    pub orphan_gc: OrphanGcSettings,
}

impl IndexerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.chunking.validate()?;
        self.embedding.validate()?;
        self.cross_ref.validate()?;
        self.storage.validate()?;
        self.orphan_gc.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(IndexerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_tolerance_larger_than_chunk_size() {
        let cfg = ChunkingSettings {
            max_chunk_size: 100,
            chunk_tolerance: 200,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let cfg = EmbeddingSettings {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeout_when_cross_ref_enabled() {
        let cfg = CrossRefSettings {
            enabled: true,
            subprocess_timeout_secs: 0,
        };
        assert!(cfg.validate().is_err());
        let disabled = CrossRefSettings {
            enabled: false,
            subprocess_timeout_secs: 0,
        };
        assert!(disabled.validate().is_ok());
    }
}
