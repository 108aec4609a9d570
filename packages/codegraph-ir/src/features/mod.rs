//! Feature modules.
//!
//! - `language`  — per-language tree-sitter config (barrier/glue node kinds, queries)
//! - `chunking`  — barrier/glue/group recursive-descent chunker + file filtering
//! - `cross_ref` — two-pass (definition, occurrence) cross-file resolver
//!
//! Lexical search itself (tokenizing and querying chunk text) lives in
//! `codegraph_storage`'s SQLite FTS5 `search_index` table — there is no
//! separate lexical engine here.

pub mod chunking;
pub mod cross_ref;
pub mod language;
