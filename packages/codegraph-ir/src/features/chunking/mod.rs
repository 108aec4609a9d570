//! Barrier/glue/group recursive-descent chunker.
//!
//! Walks a tree-sitter concrete syntax tree and groups statements into
//! size-bounded [`ChunkNode`]s while keeping related code — decorators,
//! docstrings, a short run of top-level statements — attached to whatever
//! comes next. Three kinds of tree nodes drive the walk:
//!
//! - **barrier** — a class, function, impl block: substantial enough to
//!   become its own chunk (and recurse into, if it's too big on its own).
//! - **glue** — a comment or decorator: never its own chunk, always
//!   prepended to the next barrier or statement group.
//! - everything else — accumulated into a "group" of plain statements,
//!   flushed as its own chunk once it grows past the size budget (unless
//!   only a small tail of the scope remains, in which case it's left to
//!   absorb the rest).
//!
//! A barrier too large to chunk whole is split into a header chunk plus a
//! recursive descent into its body (`handle_large_node`), and a node with no
//! separable body at all falls back to a newline-aware hard split
//! (`create_hard_split`).

pub mod file_filter;

use std::collections::BTreeSet;
use std::path::Path;

use codegraph_storage::{content_hash, ByteRange, ChunkContent, ChunkNode, Edge, FileRecord, ParsingStatus, RelationType};
use serde_json::Value;
use tree_sitter::{Node, Parser, Query, QueryCursor};
use uuid::Uuid;

use crate::errors::{CodegraphError, Result};
use crate::features::language::{self, Lang};

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    pub chunk_tolerance: usize,
    pub max_file_size_bytes: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 800,
            chunk_tolerance: 400,
            max_file_size_bytes: file_filter::MAX_FILE_SIZE_BYTES,
        }
    }
}

/// A semantic query match (e.g. `role.entry_point`, `type.class`) overlapping
/// a byte range, folded into whichever chunk(s) that range intersects.
#[derive(Debug, Clone)]
pub struct SemanticCapture {
    pub start: usize,
    pub end: usize,
    pub metadata: Value,
}

pub struct ChunkingOutput {
    pub file: FileRecord,
    pub chunks: Vec<ChunkNode>,
    pub contents: Vec<ChunkContent>,
    pub edges: Vec<Edge>,
}

/// Reads, filters, parses and chunks a single repo-relative file. Read and
/// parse failures never propagate as `Err` — they become a `Skipped` or
/// `Failed` `FileRecord` with an explanation, so one bad file never aborts a
/// snapshot's indexing run.
pub fn process_file(
    snapshot_id: &str,
    repo_root: &Path,
    rel_path: &str,
    commit_hash: &str,
    config: &ChunkingConfig,
) -> Result<ChunkingOutput> {
    let full_path = repo_root.join(rel_path);
    let ext = Path::new(rel_path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()));
    let category = file_filter::classify_category(rel_path);
    let lang_name = ext.as_deref().and_then(language::lang_for_extension).map(|l| l.as_str());

    let content = match file_filter::safe_read_file(&full_path, config.max_file_size_bytes) {
        Ok(c) => c,
        Err(reason) => {
            return Ok(ChunkingOutput {
                file: skipped_record(snapshot_id, rel_path, commit_hash, lang_name, category, reason),
                chunks: Vec::new(),
                contents: Vec::new(),
                edges: Vec::new(),
            })
        }
    };

    if file_filter::is_minified_or_generated(&content) {
        return Ok(ChunkingOutput {
            file: skipped_record(
                snapshot_id,
                rel_path,
                commit_hash,
                lang_name,
                category,
                "Minified/Generated".to_string(),
            ),
            chunks: Vec::new(),
            contents: Vec::new(),
            edges: Vec::new(),
        });
    }

    let file_id = Uuid::new_v4().to_string();
    let file_hash = content_hash(&String::from_utf8_lossy(&content));
    let lang = ext.as_deref().and_then(language::lang_for_extension);

    let (mut chunks, contents, edges) = match lang {
        Some(lang) => match parse_and_chunk(lang, &file_id, rel_path, &content, config) {
            Ok(result) => result,
            Err(err) => {
                return Ok(ChunkingOutput {
                    file: failed_record(
                        snapshot_id,
                        &file_id,
                        rel_path,
                        commit_hash,
                        lang_name,
                        category,
                        content.len() as u64,
                        file_hash,
                        err.to_string(),
                    ),
                    chunks: Vec::new(),
                    contents: Vec::new(),
                    edges: Vec::new(),
                })
            }
        },
        None => {
            // No grammar for this extension: still chunk it as unstructured
            // text via the same hard-split fallback, rather than dropping it.
            let mut engine = ChunkEngine::new(&file_id, rel_path, &content, config, &[]);
            engine.create_hard_split(&content, 0, None);
            engine.finish()
        }
    };

    chunks.sort_by_key(|c| c.byte_range.start);

    Ok(ChunkingOutput {
        file: FileRecord {
            id: file_id,
            snapshot_id: snapshot_id.to_string(),
            path: rel_path.to_string(),
            file_hash,
            commit_hash: commit_hash.to_string(),
            language: lang_name.unwrap_or("unknown").to_string(),
            size_bytes: content.len() as u64,
            category,
            parsing_status: ParsingStatus::Success,
            parsing_error: None,
        },
        chunks,
        contents,
        edges,
    })
}

fn skipped_record(
    snapshot_id: &str,
    rel_path: &str,
    commit_hash: &str,
    lang_name: Option<&str>,
    category: codegraph_storage::FileCategory,
    reason: String,
) -> FileRecord {
    FileRecord {
        id: Uuid::new_v4().to_string(),
        snapshot_id: snapshot_id.to_string(),
        path: rel_path.to_string(),
        file_hash: String::new(),
        commit_hash: commit_hash.to_string(),
        language: lang_name.unwrap_or("unknown").to_string(),
        size_bytes: 0,
        category,
        parsing_status: ParsingStatus::Skipped,
        parsing_error: Some(reason),
    }
}

#[allow(clippy::too_many_arguments)]
fn failed_record(
    snapshot_id: &str,
    file_id: &str,
    rel_path: &str,
    commit_hash: &str,
    lang_name: Option<&str>,
    category: codegraph_storage::FileCategory,
    size_bytes: u64,
    file_hash: String,
    error: String,
) -> FileRecord {
    FileRecord {
        id: file_id.to_string(),
        snapshot_id: snapshot_id.to_string(),
        path: rel_path.to_string(),
        file_hash,
        commit_hash: commit_hash.to_string(),
        language: lang_name.unwrap_or("unknown").to_string(),
        size_bytes,
        category,
        parsing_status: ParsingStatus::Failed,
        parsing_error: Some(error),
    }
}

fn parse_and_chunk(
    lang: Lang,
    file_id: &str,
    rel_path: &str,
    content: &[u8],
    config: &ChunkingConfig,
) -> Result<(Vec<ChunkNode>, Vec<ChunkContent>, Vec<Edge>)> {
    let mut parser = Parser::new();
    parser
        .set_language(&lang.grammar())
        .map_err(|e| CodegraphError::Parse(format!("grammar init failed for {}: {e}", lang.as_str())))?;
    let tree = parser
        .parse(content, None)
        .ok_or_else(|| CodegraphError::Parse(format!("tree-sitter parse returned no tree for {rel_path}")))?;

    let semantic_captures = semantic_captures_for(lang, &tree, content, rel_path);

    let mut engine = ChunkEngine::new(file_id, rel_path, content, config, &semantic_captures);
    engine.process_scope(tree.root_node(), Vec::new(), None, false, None);
    Ok(engine.finish())
}

/// Runs `lang`'s S-expression query (see [`language::semantic_query_source`])
/// over the parsed tree and turns each match into a [`SemanticCapture`]: the
/// tagged definition node's own `type.*` capture, plus a heuristic `role.*`
/// capture layered on top when [`classify_role`] recognizes the definition's
/// name (entry points, test cases, API handlers, data schemas).
///
/// A missing or malformed query for a language is not a parse failure — it
/// just means that language's chunks carry no `semantic_matches` yet.
fn semantic_captures_for(lang: Lang, tree: &tree_sitter::Tree, content: &[u8], rel_path: &str) -> Vec<SemanticCapture> {
    let Some(query_src) = language::semantic_query_source(lang) else {
        return Vec::new();
    };

    let query = match Query::new(&lang.grammar(), query_src) {
        Ok(q) => q,
        Err(err) => {
            tracing::warn!(lang = lang.as_str(), %err, "invalid semantic query, skipping semantic capture extraction");
            return Vec::new();
        }
    };

    let name_idx = query.capture_index_for_name("name");
    let mut cursor = QueryCursor::new();
    let mut captures = Vec::new();

    for m in cursor.matches(&query, tree.root_node(), content) {
        let mut def: Option<(&str, Node)> = None;
        let mut name_text: Option<&str> = None;

        for cap in m.captures {
            let capture_name = query.capture_names()[cap.index as usize];
            if Some(cap.index) == name_idx {
                name_text = cap.node.utf8_text(content).ok();
            } else if capture_name.starts_with("type.") {
                def = Some((capture_name, cap.node));
            }
        }

        let Some((capture_name, node)) = def else { continue };
        let Some((category, value)) = capture_name.split_once('.') else { continue };

        captures.push(SemanticCapture {
            start: node.start_byte(),
            end: node.end_byte(),
            metadata: semantic_match_value(category, value),
        });

        if let Some(name) = name_text {
            if let Some(role_value) = classify_role(value, name) {
                captures.push(SemanticCapture {
                    start: node.start_byte(),
                    end: node.end_byte(),
                    metadata: semantic_match_value("role", role_value),
                });
            }
        }
    }

    tracing::debug!(lang = lang.as_str(), path = rel_path, count = captures.len(), "semantic captures extracted");
    captures
}

fn semantic_match_value(category: &str, value: &str) -> Value {
    serde_json::json!({
        "category": category,
        "value": value,
        "label": semantic_label(category, value),
    })
}

/// Mirrors the human-readable label table used elsewhere in this pipeline's
/// lineage for the same `(category, value)` pairs, falling back to a
/// title-cased rendering of the value for anything not in the table.
fn semantic_label(category: &str, value: &str) -> String {
    match (category, value) {
        ("role", "entry_point") => "Application Entry Point".to_string(),
        ("role", "test_suite") => "Test Suite Class".to_string(),
        ("role", "test_case") => "Unit/Integration Test Case".to_string(),
        ("role", "api_endpoint") => "API Route Handler".to_string(),
        ("role", "data_schema") => "Data Model / Schema".to_string(),
        ("type", "class") => "Class Definition".to_string(),
        ("type", "function") => "Function Definition".to_string(),
        _ => {
            let mut out = String::new();
            for (i, word) in value.split('_').enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                let mut chars = word.chars();
                if let Some(first) = chars.next() {
                    out.extend(first.to_uppercase());
                    out.extend(chars);
                }
            }
            out
        }
    }
}

/// Heuristic role classification from a definition's kind (`class`/`function`)
/// and its identifier text: no decorator/annotation inspection, just the
/// naming conventions common across the supported languages.
fn classify_role(type_value: &str, name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    match type_value {
        "function" => {
            if lower == "main" {
                Some("entry_point")
            } else if lower.starts_with("test_") || lower.starts_with("test") {
                Some("test_case")
            } else if lower.starts_with("get_") || lower.starts_with("post_") || lower.starts_with("put_") || lower.starts_with("delete_") || lower.contains("handler") || lower.contains("endpoint") {
                Some("api_endpoint")
            } else {
                None
            }
        }
        "class" => {
            if lower.starts_with("test") || lower.ends_with("test") || lower.ends_with("tests") {
                Some("test_suite")
            } else if lower.ends_with("schema") || lower.ends_with("model") || lower.ends_with("dto") {
                Some("data_schema")
            } else {
                None
            }
        }
        _ => None,
    }
}

struct ChunkEngine<'a> {
    file_id: &'a str,
    file_path: &'a str,
    full_content: &'a [u8],
    config: &'a ChunkingConfig,
    semantic_captures: &'a [SemanticCapture],
    nodes: Vec<ChunkNode>,
    contents: std::collections::HashMap<String, ChunkContent>,
    edges: Vec<Edge>,
}

impl<'a> ChunkEngine<'a> {
    fn new(
        file_id: &'a str,
        file_path: &'a str,
        full_content: &'a [u8],
        config: &'a ChunkingConfig,
        semantic_captures: &'a [SemanticCapture],
    ) -> Self {
        Self {
            file_id,
            file_path,
            full_content,
            config,
            semantic_captures,
            nodes: Vec::new(),
            contents: std::collections::HashMap::new(),
            edges: Vec::new(),
        }
    }

    fn finish(self) -> (Vec<ChunkNode>, Vec<ChunkContent>, Vec<Edge>) {
        (self.nodes, self.contents.into_values().collect(), self.edges)
    }

    fn process_scope(
        &mut self,
        parent_node: Node,
        initial_glue: Vec<u8>,
        initial_glue_start: Option<usize>,
        is_breakdown_mode: bool,
        parent_chunk_id: Option<String>,
    ) {
        let body_node = parent_node
            .child_by_field_name("body")
            .or_else(|| parent_node.child_by_field_name("block"))
            .or_else(|| parent_node.child_by_field_name("consequence"));
        let iterator_node = body_node.unwrap_or(parent_node);

        let mut cursor = iterator_node.start_byte();
        let mut glue_buffer = initial_glue;
        let mut glue_start_byte = initial_glue_start.or(if !glue_buffer.is_empty() {
            Some(iterator_node.start_byte())
        } else {
            None
        });

        let mut group_buffer: Vec<u8> = Vec::new();
        let mut group_start_byte: Option<usize> = None;
        let mut group_end_byte: Option<usize> = None;
        let mut current_active_parent = parent_chunk_id;
        let mut first_chunk_created_in_scope = false;

        let mut tc = iterator_node.walk();
        let children: Vec<Node> = iterator_node.children(&mut tc).collect();

        for child in children {
            if child.start_byte() > cursor {
                glue_buffer.extend_from_slice(&self.full_content[cursor..child.start_byte()]);
                if glue_start_byte.is_none() {
                    glue_start_byte = Some(cursor);
                }
            }

            let kind = child.kind();
            let is_glue = language::is_glue(kind);
            let is_barrier = language::is_barrier(kind);
            let child_bytes = &self.full_content[child.start_byte()..child.end_byte()];

            if is_glue {
                glue_buffer.extend_from_slice(child_bytes);
                if glue_start_byte.is_none() {
                    glue_start_byte = Some(child.start_byte());
                }
            } else if is_barrier {
                self.flush_group(
                    &mut group_buffer,
                    &mut group_start_byte,
                    &mut group_end_byte,
                    &mut current_active_parent,
                    &mut first_chunk_created_in_scope,
                    is_breakdown_mode,
                );

                let barrier_start = glue_start_byte.unwrap_or(child.start_byte());
                let barrier_end = child.end_byte();
                let full_len = glue_buffer.len() + child_bytes.len();

                if full_len > self.config.max_chunk_size {
                    let prefix_bytes = glue_buffer.clone();
                    self.handle_large_node(child, prefix_bytes, barrier_start, current_active_parent.clone());
                    if is_breakdown_mode && !first_chunk_created_in_scope {
                        first_chunk_created_in_scope = true;
                    }
                } else {
                    let mut combined = glue_buffer.clone();
                    combined.extend_from_slice(child_bytes);
                    let tags = extract_tags(&child);
                    if let Some(cid) = self.create_chunk(&combined, barrier_start, barrier_end, current_active_parent.clone(), tags)
                    {
                        if is_breakdown_mode && !first_chunk_created_in_scope {
                            current_active_parent = Some(cid);
                            first_chunk_created_in_scope = true;
                        }
                    }
                }

                glue_buffer = Vec::new();
                glue_start_byte = None;
            } else {
                if group_buffer.is_empty() {
                    group_start_byte = Some(glue_start_byte.unwrap_or(child.start_byte()));
                }
                if !glue_buffer.is_empty() {
                    group_buffer.extend_from_slice(&glue_buffer);
                    glue_buffer = Vec::new();
                    glue_start_byte = None;
                }
                group_buffer.extend_from_slice(child_bytes);
                group_end_byte = Some(child.end_byte());

                if group_buffer.len() > self.config.max_chunk_size {
                    let remaining = iterator_node.end_byte() - child.end_byte();
                    if remaining > self.config.chunk_tolerance {
                        self.flush_group(
                            &mut group_buffer,
                            &mut group_start_byte,
                            &mut group_end_byte,
                            &mut current_active_parent,
                            &mut first_chunk_created_in_scope,
                            is_breakdown_mode,
                        );
                    }
                }
            }

            cursor = child.end_byte();
        }

        self.flush_group(
            &mut group_buffer,
            &mut group_start_byte,
            &mut group_end_byte,
            &mut current_active_parent,
            &mut first_chunk_created_in_scope,
            is_breakdown_mode,
        );

        if cursor < iterator_node.end_byte() {
            glue_buffer.extend_from_slice(&self.full_content[cursor..iterator_node.end_byte()]);
        }

        if !glue_buffer.is_empty() {
            if std::str::from_utf8(&glue_buffer).map(|s| s.trim().is_empty()).unwrap_or(false) {
                return;
            }
            let start = glue_start_byte.unwrap_or(cursor);
            self.create_chunk(&glue_buffer, start, iterator_node.end_byte(), current_active_parent, Vec::new());
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn flush_group(
        &mut self,
        group_buffer: &mut Vec<u8>,
        group_start_byte: &mut Option<usize>,
        group_end_byte: &mut Option<usize>,
        current_active_parent: &mut Option<String>,
        first_chunk_created_in_scope: &mut bool,
        is_breakdown_mode: bool,
    ) {
        if group_buffer.is_empty() {
            return;
        }
        let start = group_start_byte.unwrap_or(0);
        let end = group_end_byte.unwrap_or(start);
        if let Some(cid) = self.create_chunk(group_buffer, start, end, current_active_parent.clone(), Vec::new()) {
            if is_breakdown_mode && !*first_chunk_created_in_scope {
                *current_active_parent = Some(cid);
                *first_chunk_created_in_scope = true;
            }
        }
        *group_buffer = Vec::new();
        *group_start_byte = None;
        *group_end_byte = None;
    }

    fn handle_large_node(&mut self, node: Node, prefix: Vec<u8>, prefix_start: usize, parent_chunk_id: Option<String>) {
        let mut target_node = node;
        if node.kind() == "decorated_definition" {
            if let Some(definition) = node.child_by_field_name("definition") {
                target_node = definition;
            }
        } else if node.kind() == "export_statement" {
            if let Some(d) = node
                .child_by_field_name("declaration")
                .or_else(|| node.child_by_field_name("value"))
            {
                target_node = d;
            }
        }

        let body_node = target_node
            .child_by_field_name("body")
            .or_else(|| target_node.child_by_field_name("block"));

        let Some(body_node) = body_node else {
            let mut full = prefix;
            full.extend_from_slice(&self.full_content[node.start_byte()..node.end_byte()]);
            self.create_hard_split(&full, prefix_start, parent_chunk_id);
            return;
        };

        let header_bytes = &self.full_content[node.start_byte()..body_node.start_byte()];
        let full_header_len = prefix.len() + header_bytes.len();

        if full_header_len as f64 > self.config.max_chunk_size as f64 * 0.6 {
            let mut header_buf = prefix;
            header_buf.extend_from_slice(header_bytes);
            let tags = extract_tags(&node);
            let header_id = self.create_chunk(
                &header_buf,
                prefix_start,
                body_node.start_byte(),
                parent_chunk_id,
                tags,
            );
            self.process_scope(target_node, Vec::new(), None, false, header_id);
        } else {
            let mut new_glue = prefix;
            new_glue.extend_from_slice(header_bytes);
            self.process_scope(target_node, new_glue, Some(prefix_start), true, parent_chunk_id);
        }
    }

    fn create_hard_split(&mut self, text_bytes: &[u8], start_offset: usize, parent_chunk_id: Option<String>) {
        let total = text_bytes.len();
        let mut cursor = 0usize;
        let mut first_fragment_id: Option<String> = None;

        while cursor < total {
            let mut end = (cursor + self.config.max_chunk_size).min(total);
            if end < total {
                if let Some(rel_nl) = text_bytes[cursor..end].iter().rposition(|&b| b == b'\n') {
                    let nl = cursor + rel_nl;
                    if nl > cursor + self.config.max_chunk_size / 2 {
                        end = nl + 1;
                    }
                }
            }
            let chunk = &text_bytes[cursor..end];
            let current_pid = first_fragment_id.clone().or_else(|| parent_chunk_id.clone());
            if let Some(cid) = self.create_chunk(chunk, start_offset + cursor, start_offset + end, current_pid, Vec::new()) {
                if first_fragment_id.is_none() {
                    first_fragment_id = Some(cid);
                }
            }
            cursor = end;
        }
    }

    fn create_chunk(
        &mut self,
        text_bytes: &[u8],
        start_byte: usize,
        end_byte: usize,
        parent_chunk_id: Option<String>,
        tags: Vec<String>,
    ) -> Option<String> {
        let text = String::from_utf8_lossy(text_bytes).into_owned();
        if text.trim().is_empty() {
            return None;
        }

        let hash = content_hash(&text);
        self.contents.entry(hash.clone()).or_insert_with(|| ChunkContent {
            chunk_hash: hash.clone(),
            content: text.clone(),
        });

        let cid = Uuid::new_v4().to_string();
        let start_byte = start_byte.max(0);

        let start_line = self.full_content[..start_byte.min(self.full_content.len())]
            .iter()
            .filter(|&&b| b == b'\n')
            .count() as u32
            + 1;
        let end_line = start_line + text.matches('\n').count() as u32;

        let matches: Vec<&Value> = self
            .semantic_captures
            .iter()
            .filter(|cap| {
                (start_byte >= cap.start && end_byte <= cap.end) || (cap.start >= start_byte && cap.end <= end_byte)
            })
            .map(|cap| &cap.metadata)
            .collect();

        let mut metadata = serde_json::Map::new();
        if !matches.is_empty() {
            metadata.insert("semantic_matches".to_string(), Value::Array(matches.into_iter().cloned().collect()));
        }
        if !tags.is_empty() {
            metadata.insert("tags".to_string(), Value::Array(tags.iter().map(|t| Value::String(t.clone())).collect()));
        }

        self.nodes.push(ChunkNode {
            id: cid.clone(),
            file_id: self.file_id.to_string(),
            file_path: self.file_path.to_string(),
            start_line,
            end_line,
            byte_range: ByteRange::new(start_byte, end_byte),
            chunk_hash: hash,
            metadata: Value::Object(metadata),
        });

        if let Some(pid) = parent_chunk_id {
            self.edges.push(Edge {
                source_chunk_id: cid.clone(),
                target_chunk_id: pid,
                relation_type: RelationType::ChildOf,
                metadata: serde_json::json!({"tool": "chunker"}),
            });
        }

        Some(cid)
    }
}

/// Classification tags derived from a barrier node's own shape, independent
/// of the semantic query captures: `async`, `decorated`, `exported`,
/// `constructor`, `static`.
fn extract_tags(node: &Node) -> Vec<String> {
    let mut tags = BTreeSet::new();
    let mut cursor = node.walk();

    if node.kind().starts_with("async_") || node.children(&mut cursor).any(|c| c.kind() == "async") {
        tags.insert("async".to_string());
    }
    if node.kind() == "decorated_definition" || node.children(&mut cursor).any(|c| c.kind() == "decorator") {
        tags.insert("decorated".to_string());
    }
    if node.kind() == "export_statement" || node.parent().map(|p| p.kind() == "export_statement").unwrap_or(false) {
        tags.insert("exported".to_string());
    }
    if node.kind().contains("constructor") {
        tags.insert("constructor".to_string());
    }
    for child in node.children(&mut cursor) {
        if child.kind() == "static" {
            tags.insert("static".to_string());
        }
    }

    tags.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_rust_source(source: &str, config: &ChunkingConfig) -> (Vec<ChunkNode>, Vec<ChunkContent>, Vec<Edge>) {
        parse_and_chunk(Lang::Rust, "file-1", "lib.rs", source.as_bytes(), config).unwrap()
    }

    #[test]
    fn small_functions_stay_as_single_chunks() {
        let source = "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n\nfn sub(a: i32, b: i32) -> i32 {\n    a - b\n}\n";
        let (chunks, contents, _edges) = chunk_rust_source(source, &ChunkingConfig::default());
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            let content = contents.iter().find(|c| c.chunk_hash == chunk.chunk_hash).unwrap();
            assert_eq!(content_hash(&content.content), chunk.chunk_hash);
        }
    }

    #[test]
    fn large_function_splits_into_header_and_body_chunks_with_child_of_edge() {
        let mut body = String::new();
        for i in 0..200 {
            body.push_str(&format!("    let x{i} = {i};\n"));
        }
        let source = format!("fn big() {{\n{body}}}\n");
        let config = ChunkingConfig::default();
        let (chunks, _contents, edges) = chunk_rust_source(&source, &config);
        assert!(chunks.len() > 1, "expected the oversized function to be split into multiple chunks");
        assert!(!edges.is_empty(), "expected at least one child_of edge linking body chunks to the header");
        assert!(edges.iter().all(|e| e.relation_type == RelationType::ChildOf));
    }

    #[test]
    fn entry_point_function_gets_a_role_semantic_match() {
        let source = "fn main() {\n    println!(\"hi\");\n}\n";
        let (chunks, _contents, _edges) = chunk_rust_source(source, &ChunkingConfig::default());
        let matches: Vec<&Value> = chunks
            .iter()
            .filter_map(|c| c.metadata.get("semantic_matches"))
            .flat_map(|v| v.as_array().unwrap())
            .collect();
        assert!(matches.iter().any(|m| m["category"] == "type" && m["value"] == "function"));
        assert!(matches.iter().any(|m| m["category"] == "role" && m["value"] == "entry_point"));
    }

    #[test]
    fn plain_helper_function_gets_no_role_match() {
        let source = "fn helper() {\n    let _ = 1;\n}\n";
        let (chunks, _contents, _edges) = chunk_rust_source(source, &ChunkingConfig::default());
        let matches: Vec<&Value> = chunks
            .iter()
            .filter_map(|c| c.metadata.get("semantic_matches"))
            .flat_map(|v| v.as_array().unwrap())
            .collect();
        assert!(matches.iter().any(|m| m["category"] == "type" && m["value"] == "function"));
        assert!(!matches.iter().any(|m| m["category"] == "role"));
    }

    #[test]
    fn every_chunk_byte_range_is_well_formed() {
        let source = "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n";
        let (chunks, _contents, _edges) = chunk_rust_source(source, &ChunkingConfig::default());
        for chunk in chunks {
            assert!(chunk.byte_range.start < chunk.byte_range.end);
            assert!(chunk.byte_range.end <= source.len());
        }
    }

    #[test]
    fn unstructured_file_with_no_grammar_falls_back_to_hard_split() {
        let mut engine_source = String::new();
        for i in 0..500 {
            engine_source.push_str(&format!("line {i} of plain text with some padding to grow the file\n"));
        }
        let config = ChunkingConfig::default();
        let mut engine = ChunkEngine::new("file-1", "notes.txt", engine_source.as_bytes(), &config, &[]);
        engine.create_hard_split(engine_source.as_bytes(), 0, None);
        let (chunks, _contents, _edges) = engine.finish();
        assert!(chunks.len() > 1);
        for w in chunks.windows(2) {
            assert!(w[0].byte_range.end <= w[1].byte_range.start + 1);
        }
    }
}
