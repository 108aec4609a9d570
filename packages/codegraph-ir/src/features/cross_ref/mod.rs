//! Cross-reference resolution: dispatches external SCIP-family indexers
//! over a worktree, two-pass resolves their occurrences against an
//! ephemeral on-disk symbol table, and turns the result into graph
//! [`codegraph_storage::Edge`]s keyed by chunk id.
//!
//! The heavy lifting — subprocess dispatch, streaming decode, symbol table,
//! byte-offset resolution — lives in [`runner`] and [`resolver`]; this
//! module only wires them together behind [`CrossRefResolver`].

pub mod resolver;
pub mod runner;
pub mod symbol;

pub use resolver::{CrossRefResolver, ResolutionStats};
pub use runner::{DocumentEnvelope, IndexArtifact, IndexTask, ScipRunner};
pub use symbol::{relation_verb, DiskSymbolTable, SymbolRange};
