//! Field-level provenance tracking: where did each setting actually come
//! from (compiled-in default, a named preset, a TOML file, an environment
//! variable)? Surfaced by the indexer's `--print-config` diagnostic so a
//! confusing value can be traced back to its source instead of guessed at.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    Default,
    Preset(String),
    File(String),
    Env(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigProvenance {
    sources: BTreeMap<String, ConfigSource>,
}

impl ConfigProvenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, field: impl Into<String>, source: ConfigSource) {
        self.sources.insert(field.into(), source);
    }

    pub fn source_of(&self, field: &str) -> Option<&ConfigSource> {
        self.sources.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_looks_up_field_sources() {
        let mut prov = ConfigProvenance::new();
        prov.record("chunking.max_chunk_size", ConfigSource::Default);
        prov.record("embedding.model_name", ConfigSource::Env("CODEGRAPH_EMBEDDING_MODEL".into()));

        assert_eq!(prov.source_of("chunking.max_chunk_size"), Some(&ConfigSource::Default));
        assert!(matches!(prov.source_of("embedding.model_name"), Some(ConfigSource::Env(_))));
        assert_eq!(prov.source_of("unknown.field"), None);
    }
}
