//! Level-3 configuration: a committed TOML file, plus environment-variable
//! overrides applied on top of whatever preset/file produced the base
//! config. Both layers are optional and both record their provenance.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{ConfigError, ConfigResult};
use super::provenance::{ConfigProvenance, ConfigSource};
use super::settings::{ChunkingSettings, CrossRefSettings, EmbeddingSettings, IndexerConfig, OrphanGcSettings, StorageSettings};

const SUPPORTED_VERSION: u32 = 1;

/// On-disk schema. Every section is optional — an absent section leaves
/// whatever the preset (or defaults) already produced untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFileV1 {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunking: Option<ChunkingSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<EmbeddingSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_ref: Option<CrossRefSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphan_gc: Option<OrphanGcSettings>,
}

pub fn load_from_file(path: impl AsRef<Path>, config: &mut IndexerConfig, provenance: &mut ConfigProvenance) -> ConfigResult<()> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let file: ConfigFileV1 = toml::from_str(&raw)?;

    if file.version != SUPPORTED_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            found: file.version,
            supported: vec![SUPPORTED_VERSION],
        });
    }

    let source = path.display().to_string();
    if let Some(chunking) = file.chunking {
        config.chunking = chunking;
        provenance.record("chunking", ConfigSource::File(source.clone()));
    }
    if let Some(embedding) = file.embedding {
        config.embedding = embedding;
        provenance.record("embedding", ConfigSource::File(source.clone()));
    }
    if let Some(cross_ref) = file.cross_ref {
        config.cross_ref = cross_ref;
        provenance.record("cross_ref", ConfigSource::File(source.clone()));
    }
    if let Some(storage) = file.storage {
        config.storage = storage;
        provenance.record("storage", ConfigSource::File(source.clone()));
    }
    if let Some(orphan_gc) = file.orphan_gc {
        config.orphan_gc = orphan_gc;
        provenance.record("orphan_gc", ConfigSource::File(source));
    }

    Ok(())
}

macro_rules! env_override {
    ($config:expr, $provenance:expr, $var:literal, $field_path:expr, $parse:expr) => {
        if let Ok(raw) = std::env::var($var) {
            match $parse(&raw) {
                Ok(value) => {
                    $field_path(value);
                    $provenance.record($var, ConfigSource::Env($var.to_string()));
                }
                Err(_) => {
                    tracing::warn!(var = $var, raw = %raw, "ignoring malformed environment override");
                }
            }
        }
    };
}

/// Applies `CODEGRAPH_*` environment variables on top of the config built so
/// far — the highest-precedence layer.
pub fn apply_env_overrides(config: &mut IndexerConfig, provenance: &mut ConfigProvenance) {
    env_override!(config, provenance, "CODEGRAPH_MAX_CHUNK_SIZE", |v: usize| config.chunking.max_chunk_size = v, |s: &str| s
        .parse::<usize>());
    env_override!(config, provenance, "CODEGRAPH_CHUNK_TOLERANCE", |v: usize| config.chunking.chunk_tolerance = v, |s: &str| s
        .parse::<usize>());
    env_override!(config, provenance, "CODEGRAPH_EMBEDDING_MODEL", |v: String| config.embedding.model_name = v, |s: &str| {
        Ok::<String, std::convert::Infallible>(s.to_string())
    });
    env_override!(
        config,
        provenance,
        "CODEGRAPH_EMBEDDING_CONCURRENCY",
        |v: usize| config.embedding.max_concurrency = v,
        |s: &str| s.parse::<usize>()
    );
    env_override!(config, provenance, "CODEGRAPH_EMBEDDING_BATCH_SIZE", |v: usize| config.embedding.batch_size = v, |s: &str| s
        .parse::<usize>());
    env_override!(config, provenance, "CODEGRAPH_CROSS_REF_ENABLED", |v: bool| config.cross_ref.enabled = v, |s: &str| s
        .parse::<bool>());
    env_override!(
        config,
        provenance,
        "CODEGRAPH_CROSS_REF_TIMEOUT_SECS",
        |v: u64| config.cross_ref.subprocess_timeout_secs = v,
        |s: &str| s.parse::<u64>()
    );
    env_override!(config, provenance, "CODEGRAPH_DB_PATH", |v: String| config.storage.database_path = v, |s: &str| {
        Ok::<String, std::convert::Infallible>(s.to_string())
    });
    env_override!(
        config,
        provenance,
        "CODEGRAPH_WORKTREE_CACHE_ROOT",
        |v: String| config.storage.worktree_cache_root = v,
        |s: &str| Ok::<String, std::convert::Infallible>(s.to_string())
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_partial_overrides_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "version = 1\n\n[chunking]\nmax_chunk_size = 600\nchunk_tolerance = 300\nmax_file_size_bytes = 1048576\n").unwrap();

        let mut config = IndexerConfig::default();
        let mut provenance = ConfigProvenance::new();
        load_from_file(file.path(), &mut config, &mut provenance).unwrap();

        assert_eq!(config.chunking.max_chunk_size, 600);
        assert_eq!(config.embedding.max_concurrency, EmbeddingSettings::default().max_concurrency);
        assert!(matches!(provenance.source_of("chunking"), Some(ConfigSource::File(_))));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "version = 2\n").unwrap();

        let mut config = IndexerConfig::default();
        let mut provenance = ConfigProvenance::new();
        let err = load_from_file(file.path(), &mut config, &mut provenance).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { .. }));
    }

    #[test]
    fn env_override_wins_over_defaults() {
        std::env::set_var("CODEGRAPH_MAX_CHUNK_SIZE", "777");
        let mut config = IndexerConfig::default();
        let mut provenance = ConfigProvenance::new();
        apply_env_overrides(&mut config, &mut provenance);
        std::env::remove_var("CODEGRAPH_MAX_CHUNK_SIZE");

        assert_eq!(config.chunking.max_chunk_size, 777);
        assert!(matches!(provenance.source_of("CODEGRAPH_MAX_CHUNK_SIZE"), Some(ConfigSource::Env(_))));
    }
}
