//! Two-pass cross-file reference resolver.
//!
//! Pass 1 streams every document and records each `DEFINITION` occurrence
//! into a [`DiskSymbolTable`]. Pass 2 streams again and, for every
//! non-definition occurrence, looks the symbol up and emits a resolved
//! [`Edge`] — or an external placeholder when the symbol is non-local and
//! unresolved. `(line, col)` positions are converted to byte offsets via a
//! per-file line-start table, cached lazily and bounded to the last 64
//! files touched, then resolved to chunk ids through
//! [`SnapshotStore::find_chunk_id`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codegraph_storage::{Edge, RelationType, SnapshotStore};
use serde_json::Value;

use crate::errors::{CodegraphError, Result};

use super::runner::ScipRunner;
use super::symbol::{relation_verb, DiskSymbolTable, SymbolRange, ROLE_DEFINITION};

const LINE_CACHE_CAPACITY: usize = 64;

/// Outcome of a resolver run, surfaced for telemetry/logging at the call
/// site — the pipeline itself never treats cross-ref failures as fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResolutionStats {
    pub definitions_found: usize,
    pub relations_resolved: usize,
    pub relations_external: usize,
    pub relations_skipped_unresolved_local: usize,
}

pub struct CrossRefResolver {
    runner: ScipRunner,
    line_cache: HashMap<String, Arc<Vec<usize>>>,
    line_cache_order: Vec<String>,
}

impl CrossRefResolver {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            runner: ScipRunner::new(repo_root),
            line_cache: HashMap::new(),
            line_cache_order: Vec::new(),
        }
    }

    /// Runs indexer discovery, the two-pass extraction, resolves every
    /// occurrence to chunk ids, and bulk-ingests the result. Returns
    /// `Ok(ResolutionStats::default())` with no edges written when no
    /// indexer tools are discovered or installed — this is a normal,
    /// expected outcome, not an error.
    pub async fn resolve(&mut self, store: &dyn SnapshotStore, snapshot_id: &str, subprocess_timeout: Duration) -> Result<ResolutionStats> {
        let tasks = self.runner.discover_tasks();
        if tasks.is_empty() {
            tracing::info!("cross-ref: no project markers found, skipping resolution");
            return Ok(ResolutionStats::default());
        }

        let artifacts = self.runner.prepare_indices(tasks, subprocess_timeout).await;
        if artifacts.is_empty() {
            tracing::info!("cross-ref: no indexer produced output, skipping resolution");
            return Ok(ResolutionStats::default());
        }

        let mut table = DiskSymbolTable::new()?;

        let definition_docs = self.runner.stream_documents(&artifacts).await?;
        for envelope in &definition_docs {
            self.record_definitions(envelope, &mut table)?;
        }
        table.flush()?;
        let definitions_found = table.definitions_found();

        let occurrence_docs = self.runner.stream_documents(&artifacts).await?;
        let mut stats = ResolutionStats {
            definitions_found,
            ..Default::default()
        };
        let mut edges = Vec::new();
        for envelope in &occurrence_docs {
            self.resolve_occurrences(envelope, &table, store, snapshot_id, &mut edges, &mut stats).await?;
        }

        if !edges.is_empty() {
            store
                .ingest_scip_relations(snapshot_id, &edges)
                .await
                .map_err(|e| CodegraphError::internal(format!("ingesting cross-ref edges: {e}")))?;
        }

        self.runner.cleanup(&artifacts);
        Ok(stats)
    }

    fn relative_path(&self, project_root: &Path, relative_in_project: &str) -> Option<String> {
        let abs = project_root.join(relative_in_project);
        let rel = abs.strip_prefix(self.runner.repo_root()).ok()?;
        Some(rel.to_string_lossy().replace('\\', "/"))
    }

    fn record_definitions(&mut self, envelope: &super::runner::DocumentEnvelope, table: &mut DiskSymbolTable) -> Result<()> {
        let doc = &envelope.document;
        let Some(relative_path) = doc.get("relative_path").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let Some(norm_path) = self.relative_path(&envelope.project_root, relative_path) else {
            return Ok(());
        };

        for occurrence in doc.get("occurrences").and_then(|v| v.as_array()).into_iter().flatten() {
            let roles = occurrence.get("symbol_roles").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
            if roles & ROLE_DEFINITION == 0 {
                continue;
            }
            let Some(symbol) = occurrence.get("symbol").and_then(|v| v.as_str()) else { continue };
            let Some(range) = parse_range(occurrence.get("range")) else { continue };
            let is_local = symbol.starts_with("local");
            table.add(symbol, &norm_path, range, is_local)?;
        }
        Ok(())
    }

    async fn resolve_occurrences(
        &mut self,
        envelope: &super::runner::DocumentEnvelope,
        table: &DiskSymbolTable,
        store: &dyn SnapshotStore,
        snapshot_id: &str,
        edges: &mut Vec<Edge>,
        stats: &mut ResolutionStats,
    ) -> Result<()> {
        let doc = &envelope.document;
        let Some(relative_path) = doc.get("relative_path").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let Some(norm_path) = self.relative_path(&envelope.project_root, relative_path) else {
            return Ok(());
        };

        for occurrence in doc.get("occurrences").and_then(|v| v.as_array()).into_iter().flatten() {
            let roles = occurrence.get("symbol_roles").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
            if roles & ROLE_DEFINITION != 0 {
                continue;
            }
            let Some(symbol) = occurrence.get("symbol").and_then(|v| v.as_str()) else { continue };
            let Some(range) = parse_range(occurrence.get("range")) else { continue };
            let is_local = symbol.starts_with("local");

            let lookup = table.get(symbol, &norm_path)?;
            let (target_path, target_range, is_external) = match lookup {
                Some((path, range)) => (path, Some(range), false),
                None if !is_local => {
                    let Some(placeholder) = external_placeholder(symbol) else { continue };
                    (placeholder, None, true)
                }
                None => {
                    stats.relations_skipped_unresolved_local += 1;
                    continue;
                }
            };

            let verb = relation_verb(roles);
            let source_offset = self.byte_offset(&norm_path, range.start_line, range.start_col)?;
            let Some(source_offset) = source_offset else { continue };
            let Some(source_chunk_id) = store
                .find_chunk_id(snapshot_id, &norm_path, source_offset)
                .await
                .map_err(|e| CodegraphError::internal(format!("resolving source chunk: {e}")))?
            else {
                continue;
            };

            let target_chunk_id = if is_external {
                None
            } else {
                let target_range = target_range.expect("non-external lookups always carry a range");
                match self.byte_offset(&target_path, target_range.start_line, target_range.start_col)? {
                    Some(offset) => store
                        .find_chunk_id(snapshot_id, &target_path, offset)
                        .await
                        .map_err(|e| CodegraphError::internal(format!("resolving target chunk: {e}")))?,
                    None => None,
                }
            };

            let Some(target_chunk_id) = target_chunk_id.or_else(|| is_external.then(|| target_path.clone())) else {
                continue;
            };

            let Ok(relation_type) = verb.parse::<RelationType>() else { continue };

            edges.push(Edge {
                source_chunk_id,
                target_chunk_id,
                relation_type,
                metadata: serde_json::json!({"tool": "scip", "symbol": clean_symbol(symbol), "is_external": is_external}),
            });

            if is_external {
                stats.relations_external += 1;
            } else {
                stats.relations_resolved += 1;
            }
        }
        Ok(())
    }

    /// Converts `(line, col)` to an absolute byte offset using a per-file
    /// line-start table, built lazily on first touch and evicted
    /// least-recently-used once the cache holds more than
    /// [`LINE_CACHE_CAPACITY`] files.
    fn byte_offset(&mut self, rel_path: &str, line: u32, col: u32) -> Result<Option<usize>> {
        if !self.line_cache.contains_key(rel_path) {
            let abs_path = self.runner.repo_root().join(rel_path);
            let Ok(bytes) = std::fs::read(&abs_path) else { return Ok(None) };
            let mut starts = vec![0usize];
            for (i, b) in bytes.iter().enumerate() {
                if *b == b'\n' {
                    starts.push(i + 1);
                }
            }
            self.line_cache.insert(rel_path.to_string(), Arc::new(starts));
            self.line_cache_order.push(rel_path.to_string());
            if self.line_cache_order.len() > LINE_CACHE_CAPACITY {
                let evicted = self.line_cache_order.remove(0);
                self.line_cache.remove(&evicted);
            }
        }
        let Some(starts) = self.line_cache.get(rel_path) else { return Ok(None) };
        Ok(starts.get(line as usize).map(|line_start| line_start + col as usize))
    }
}

fn parse_range(value: Option<&Value>) -> Option<SymbolRange> {
    let arr = value?.as_array()?;
    let nums: Vec<u32> = arr.iter().filter_map(|v| v.as_u64()).map(|v| v as u32).collect();
    match nums.len() {
        3 => Some(SymbolRange {
            start_line: nums[0],
            start_col: nums[1],
            end_line: nums[0],
            end_col: nums[2],
        }),
        4 => Some(SymbolRange {
            start_line: nums[0],
            start_col: nums[1],
            end_line: nums[2],
            end_col: nums[3],
        }),
        _ => None,
    }
}

/// Builds `EXTERNAL::<manager>::<package>` from a SCIP symbol descriptor
/// (`scheme manager package version descriptor...`) so references to
/// dependencies outside the repo still produce a navigable node.
fn external_placeholder(raw_symbol: &str) -> Option<String> {
    let parts: Vec<&str> = raw_symbol.split_whitespace().collect();
    if parts.len() >= 4 {
        Some(format!("EXTERNAL::{}::{}", parts[2], parts[3]))
    } else {
        Some("EXTERNAL::UNKNOWN".to_string())
    }
}

fn clean_symbol(raw: &str) -> String {
    let Some(descriptor) = raw.split_whitespace().last() else {
        return raw.to_string();
    };
    let mut descriptor = descriptor.to_string();
    for marker in [".py/", ".ts/", ".js/", ".java/", ".go/"] {
        if let Some(idx) = descriptor.find(marker) {
            descriptor = descriptor[idx + marker.len()..].to_string();
            break;
        }
    }
    descriptor.replace('/', ".").replace('#', ".").trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_and_four_element_ranges() {
        let three = parse_range(Some(&serde_json::json!([3, 0, 5]))).unwrap();
        assert_eq!((three.start_line, three.end_line, three.end_col), (3, 3, 5));

        let four = parse_range(Some(&serde_json::json!([3, 0, 4, 2]))).unwrap();
        assert_eq!((four.start_line, four.end_line, four.end_col), (3, 4, 2));

        assert!(parse_range(Some(&serde_json::json!([1]))).is_none());
    }

    #[test]
    fn external_placeholder_extracts_manager_and_package() {
        let placeholder = external_placeholder("semanticdb maven org.apache.commons commons-lang3 3.12 StringUtils#").unwrap();
        assert_eq!(placeholder, "EXTERNAL::org.apache.commons::commons-lang3");
    }

    #[test]
    fn clean_symbol_strips_language_path_prefix_and_trailing_dot() {
        assert_eq!(clean_symbol("scip-python python . . mypkg/mod.py/MyClass#method()."), "MyClass.method()");
    }
}
