//! Code property graph construction: chunking, language configuration, and
//! cross-reference resolution for a single worktree snapshot.
//!
//! This crate produces the domain objects defined in `codegraph_storage`
//! ([`codegraph_storage::FileRecord`], [`codegraph_storage::ChunkNode`],
//! [`codegraph_storage::Edge`], …) but never talks to storage directly
//! except through [`codegraph_storage::SnapshotStore`] — orchestration
//! (staging the pipeline, scheduling workers, activating the snapshot)
//! lives in `codegraph-orchestration`.

pub mod config;
pub mod errors;
pub mod features;

pub use errors::{CodegraphError, Result};
pub use features::chunking::{process_file, ChunkingConfig, ChunkingOutput};
pub use features::cross_ref::{CrossRefResolver, ResolutionStats};
pub use features::language::{self, Lang};
