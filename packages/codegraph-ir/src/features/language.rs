//! Per-language tree-sitter configuration: which grammar a file extension
//! maps to, and which node kinds count as chunk "barriers" (classes,
//! functions — things worth their own chunk) versus "glue" (comments,
//! decorators — things that travel with whatever barrier follows them).

use std::collections::HashSet;

use once_cell::sync::Lazy;
use tree_sitter::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lang {
    Python,
    TypeScript,
    Tsx,
    Java,
    Kotlin,
    Rust,
    Go,
}

impl Lang {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lang::Python => "python",
            Lang::TypeScript => "typescript",
            Lang::Tsx => "tsx",
            Lang::Java => "java",
            Lang::Kotlin => "kotlin",
            Lang::Rust => "rust",
            Lang::Go => "go",
        }
    }

    pub fn grammar(&self) -> Language {
        match self {
            Lang::Python => tree_sitter_python::language(),
            Lang::TypeScript => tree_sitter_typescript::language_typescript(),
            Lang::Tsx => tree_sitter_typescript::language_tsx(),
            Lang::Java => tree_sitter_java::language(),
            Lang::Kotlin => tree_sitter_kotlin::language(),
            Lang::Rust => tree_sitter_rust::language(),
            Lang::Go => tree_sitter_go::language(),
        }
    }
}

/// Maps a file extension (with leading dot, e.g. `.py`) to its language, or
/// `None` for extensions we have no grammar for (the chunker then falls back
/// to treating the file as unstructured text, still subject to the same size
/// limits via a hard split).
pub fn lang_for_extension(ext: &str) -> Option<Lang> {
    match ext {
        ".py" => Some(Lang::Python),
        ".ts" => Some(Lang::TypeScript),
        ".tsx" => Some(Lang::Tsx),
        ".java" => Some(Lang::Java),
        ".kt" | ".kts" => Some(Lang::Kotlin),
        ".rs" => Some(Lang::Rust),
        ".go" => Some(Lang::Go),
        _ => None,
    }
}

/// Node kinds that are substantial enough to become their own chunk and
/// trigger recursive descent when they're too large. Shared across grammars
/// where tree-sitter's node kind names happen to coincide; each grammar also
/// has language-specific variants layered in below.
pub static CONTAINER_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "class_definition",
        "class_declaration",
        "class_body",
        "function_definition",
        "method_definition",
        "function_declaration",
        "function_item",
        "arrow_function",
        "interface_declaration",
        "interface_body",
        "impl_item",
        "trait_item",
        "mod_item",
        "struct_item",
        "enum_item",
        "async_function_definition",
        "decorated_definition",
        "export_statement",
        "method_declaration",
        "constructor_declaration",
        "object_declaration",
        "class_decl",
        "func_literal",
    ]
    .into_iter()
    .collect()
});

/// Node kinds treated as "glue": carried along with whatever barrier follows
/// (so a docstring or decorator stays attached to the function it
/// documents), never chunked on their own.
pub static GLUE_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["comment", "decorator", "line_comment", "block_comment", "string_literal"]
        .into_iter()
        .collect()
})
;

pub fn is_barrier(node_kind: &str) -> bool {
    CONTAINER_TYPES.contains(node_kind)
}

pub fn is_glue(node_kind: &str) -> bool {
    GLUE_TYPES.contains(node_kind) || node_kind.starts_with("comment")
}

/// The S-expression query used to extract semantic captures for a language:
/// each pattern tags a definition node with a `type.*` capture and its name
/// with a plain `name` capture, which [`chunking::classify_role`] then
/// inspects to layer heuristic `role.*` captures (entry point, test case,
/// API handler, data schema) on top of the same byte range.
///
/// Returns `None` for languages with no query defined yet, in which case the
/// chunker falls back to producing no semantic captures for that file (its
/// chunks simply carry no `semantic_matches`).
pub fn semantic_query_source(lang: Lang) -> Option<&'static str> {
    match lang {
        Lang::Python => Some(
            "(function_definition name: (identifier) @name) @type.function\n\
             (class_definition name: (identifier) @name) @type.class",
        ),
        Lang::TypeScript | Lang::Tsx => Some(
            "(function_declaration name: (identifier) @name) @type.function\n\
             (method_definition name: (property_identifier) @name) @type.function\n\
             (class_declaration name: (type_identifier) @name) @type.class",
        ),
        Lang::Java => Some(
            "(method_declaration name: (identifier) @name) @type.function\n\
             (class_declaration name: (identifier) @name) @type.class",
        ),
        Lang::Kotlin => Some(
            "(function_declaration (simple_identifier) @name) @type.function\n\
             (class_declaration (type_identifier) @name) @type.class",
        ),
        Lang::Rust => Some(
            "(function_item name: (identifier) @name) @type.function\n\
             (struct_item name: (type_identifier) @name) @type.class\n\
             (enum_item name: (type_identifier) @name) @type.class",
        ),
        Lang::Go => Some(
            "(function_declaration name: (identifier) @name) @type.function\n\
             (method_declaration name: (field_identifier) @name) @type.function",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_mapping_covers_supported_languages() {
        assert_eq!(lang_for_extension(".py"), Some(Lang::Python));
        assert_eq!(lang_for_extension(".rs"), Some(Lang::Rust));
        assert_eq!(lang_for_extension(".go"), Some(Lang::Go));
        assert_eq!(lang_for_extension(".unknown"), None);
    }

    #[test]
    fn barrier_and_glue_classification() {
        assert!(is_barrier("function_definition"));
        assert!(!is_barrier("identifier"));
        assert!(is_glue("comment"));
        assert!(is_glue("line_comment"));
        assert!(!is_glue("function_definition"));
    }

    #[test]
    fn every_supported_language_has_a_semantic_query() {
        for lang in [Lang::Python, Lang::TypeScript, Lang::Tsx, Lang::Java, Lang::Kotlin, Lang::Rust, Lang::Go] {
            assert!(semantic_query_source(lang).is_some(), "{lang:?} has no semantic query");
        }
    }
}
