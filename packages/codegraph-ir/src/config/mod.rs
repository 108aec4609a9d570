//! Configuration system.
//!
//! Three tiers, increasing in precedence and decreasing in how often most
//! users need them:
//!
//! 1. **Preset** (90% of users) — `IndexerConfig::preset(Preset::Balanced)`.
//! 2. **Closure override** (9%) — `.embedding(|e| EmbeddingSettings { max_concurrency: 2, ..e })`.
//! 3. **TOML file + environment** (1%) — [`io::load_from_file`] then [`io::apply_env_overrides`].
//!
//! Every field's origin is tracked in a [`provenance::ConfigProvenance`] so a
//! surprising value can be traced back to where it came from.
//!
//! ```rust
//! use codegraph_ir::config::{IndexerConfig, Preset};
//!
//! let (config, _provenance) = IndexerConfig::preset(Preset::Balanced);
//! assert!(config.validate().is_ok());
//! ```

pub mod error;
pub mod io;
pub mod preset;
pub mod provenance;
pub mod settings;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use preset::Preset;
pub use provenance::{ConfigProvenance, ConfigSource};
pub use settings::{ChunkingSettings, CrossRefSettings, EmbeddingSettings, IndexerConfig, OrphanGcSettings, StorageSettings};
pub use validation::{Validatable, ValidatableCollection};
