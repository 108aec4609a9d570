//! Level-1 configuration: a single named preset covering the 90% case,
//! with [`IndexerConfig::validate`] and closures (`.chunking(|c| ...)`)
//! available for the remaining 9%, and [`super::io::load_from_file`] for
//! the 1% that wants a committed TOML file.

use std::str::FromStr;

use super::error::{ConfigError, ConfigResult};
use super::provenance::{ConfigProvenance, ConfigSource};
use super::settings::{EmbeddingSettings, IndexerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Smaller chunks, fewer embedding workers — favors a tight feedback
    /// loop over thoroughness (local dev, CI smoke indexing).
    Fast,
    /// The shipped defaults.
    Balanced,
    /// Larger batches, more concurrency — favors coverage over latency
    /// (scheduled full reindex of a large monorepo).
    Thorough,
}

impl FromStr for Preset {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Preset::Fast),
            "balanced" => Ok(Preset::Balanced),
            "thorough" => Ok(Preset::Thorough),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Fast => "fast",
            Preset::Balanced => "balanced",
            Preset::Thorough => "thorough",
        }
    }

    pub fn apply(&self, config: &mut IndexerConfig, provenance: &mut ConfigProvenance) {
        match self {
            Preset::Fast => {
                config.chunking.max_chunk_size = 500;
                config.chunking.chunk_tolerance = 250;
                config.embedding.max_concurrency = 4;
                config.embedding.batch_size = 64;
            }
            Preset::Balanced => {
                // Shipped defaults — nothing to override.
            }
            Preset::Thorough => {
                config.embedding.max_concurrency = 16;
                config.embedding.batch_size = 500;
            }
        }
        for field in [
            "chunking.max_chunk_size",
            "chunking.chunk_tolerance",
            "embedding.max_concurrency",
            "embedding.batch_size",
        ] {
            provenance.record(field, ConfigSource::Preset(self.as_str().to_string()));
        }
    }
}

impl IndexerConfig {
    pub fn preset(preset: Preset) -> (Self, ConfigProvenance) {
        let mut config = Self::default();
        let mut provenance = ConfigProvenance::new();
        preset.apply(&mut config, &mut provenance);
        (config, provenance)
    }

    pub fn embedding(mut self, f: impl FnOnce(EmbeddingSettings) -> EmbeddingSettings) -> Self {
        self.embedding = f(self.embedding);
        self
    }

    pub fn build(self) -> ConfigResult<Self> {
        self.validate()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_preset_shrinks_chunk_budget() {
        let (config, provenance) = IndexerConfig::preset(Preset::Fast);
        assert_eq!(config.chunking.max_chunk_size, 500);
        assert!(matches!(provenance.source_of("chunking.max_chunk_size"), Some(ConfigSource::Preset(_))));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn thorough_preset_raises_embedding_concurrency() {
        let (config, _) = IndexerConfig::preset(Preset::Thorough);
        assert_eq!(config.embedding.max_concurrency, 16);
    }

    #[test]
    fn unknown_preset_name_is_rejected() {
        assert!("ultra".parse::<Preset>().is_err());
        assert_eq!("fast".parse::<Preset>().unwrap(), Preset::Fast);
    }

    #[test]
    fn closure_override_composes_with_preset() {
        let (config, _) = IndexerConfig::preset(Preset::Balanced);
        let config = config.embedding(|e| EmbeddingSettings { max_concurrency: 2, ..e }).build().unwrap();
        assert_eq!(config.embedding.max_concurrency, 2);
    }
}
