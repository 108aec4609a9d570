//! Noise-control policy for the chunker: which directories and files never
//! get read at all, and lightweight content heuristics for binaries and
//! generated/minified blobs that slipped past extension filtering.
//!
//! The chunker deliberately chunks test files — role classification happens
//! downstream via `FileRecord.category` — so only `GLOBAL_IGNORE_DIRS` (pure
//! technical noise: VCS dirs, caches, build output) applies here.
//! `SEMANTIC_NOISE_DIRS` is exposed for the cross-reference resolver's
//! workspace prune, which additionally drops fixtures/mocks/vendor/docs
//! before symbol resolution.

use std::collections::HashSet;
use std::path::Path;

use codegraph_storage::FileCategory;
use once_cell::sync::Lazy;

pub static GLOBAL_IGNORE_DIRS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        ".git",
        ".svn",
        ".hg",
        ".cvs",
        ".vscode",
        ".idea",
        ".eclipse",
        ".settings",
        "node_modules",
        "venv",
        ".venv",
        "env",
        ".env",
        "site-packages",
        "jspm_packages",
        "bower_components",
        "dist",
        "build",
        "out",
        "target",
        "bin",
        "obj",
        "wheels",
        "eggs",
        ".eggs",
        "develop-eggs",
        "__pycache__",
        ".pytest_cache",
        ".mypy_cache",
        ".ruff_cache",
        ".npm",
        ".yarn",
        ".cache",
        ".coverage",
        "htmlcov",
        "logs",
        "tmp",
        "temp",
    ]
    .into_iter()
    .collect()
});

/// Directories with code but low structural value — not consulted by the
/// chunker, only by the cross-reference resolver's workspace prune.
pub static SEMANTIC_NOISE_DIRS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "migrations",
        "fixture",
        "fixtures",
        "mock",
        "mocks",
        "spec",
        "specs",
        "locales",
        "translations",
        "vendor",
        "assets",
        "static",
        "public",
        "docs",
        "documentation",
        "examples",
        "*test*",
    ]
    .into_iter()
    .collect()
});

pub const MAX_FILE_SIZE_BYTES: u64 = 1024 * 1024;
pub const MAX_LINE_LENGTH: usize = 1000;

pub struct LangFilterConfig {
    pub exclude_extensions: &'static [&'static str],
}

fn ext_to_lang_config(ext: &str) -> Option<&'static str> {
    match ext {
        ".py" => Some("python"),
        ".js" | ".jsx" | ".ts" | ".tsx" => Some("javascript"),
        ".java" => Some("java"),
        ".go" => Some("go"),
        ".html" | ".css" | ".json" => Some("web"),
        _ => None,
    }
}

fn language_specific_filters(lang_key: &str) -> Option<LangFilterConfig> {
    match lang_key {
        "python" => Some(LangFilterConfig {
            exclude_extensions: &[".pyc", ".pyo", ".pyd", ".pyi"],
        }),
        "javascript" => Some(LangFilterConfig {
            exclude_extensions: &[".map", ".d.ts"],
        }),
        "java" => Some(LangFilterConfig {
            exclude_extensions: &[".class", ".jar", ".war"],
        }),
        "go" => Some(LangFilterConfig {
            exclude_extensions: &[".exe"],
        }),
        "web" => Some(LangFilterConfig {
            exclude_extensions: &[".css.map", ".js.map", ".ico", ".svg", ".png", ".jpg"],
        }),
        _ => None,
    }
}

/// True if `rel_path` should be read and chunked at all. Applies the
/// directory blacklist, per-language excluded extensions, and a final
/// dotfile/lockfile sweep. Test/fixture/vendor patterns are intentionally
/// *not* rejected here — those only thin the cross-reference graph, not the
/// chunk set.
pub fn should_chunk_file(rel_path: &str) -> bool {
    let path = Path::new(rel_path);
    let filename = path.file_name().and_then(|f| f.to_str()).unwrap_or("");

    let components: Vec<_> = path.iter().collect();
    for component in components.iter().take(components.len().saturating_sub(1)) {
        let part = component.to_string_lossy();
        if GLOBAL_IGNORE_DIRS.contains(part.as_ref()) || part.starts_with('.') {
            return false;
        }
    }

    if let Some(ext) = path.extension().map(|e| format!(".{}", e.to_string_lossy().to_lowercase())) {
        if let Some(lang_key) = ext_to_lang_config(&ext) {
            if let Some(cfg) = language_specific_filters(lang_key) {
                if cfg.exclude_extensions.contains(&ext.as_str()) {
                    return false;
                }
            }
        }
    }

    if filename.starts_with('.') || filename.ends_with(".lock") {
        return false;
    }

    true
}

pub fn is_binary(sample: &[u8]) -> bool {
    sample.contains(&0)
}

/// Content-based heuristic for minified/generated files that still passed
/// the extension filter: overlong first lines, or a header disclaimer.
pub fn is_minified_or_generated(content: &[u8]) -> bool {
    let sample = &content[..content.len().min(2048)];
    for line in sample.split(|&b| b == b'\n').take(5) {
        if line.len() > MAX_LINE_LENGTH {
            return true;
        }
    }
    let header_len = content.len().min(500);
    let header = String::from_utf8_lossy(&content[..header_len]).to_lowercase();
    header.contains("generated by") || header.contains("auto-generated") || header.contains("do not edit")
}

/// Reads a file, enforcing the size cap and rejecting binaries up front.
/// Errors are caller-facing strings, not a hard failure — the chunker turns
/// them into a `Skipped` `FileRecord` rather than aborting the whole run.
pub fn safe_read_file(path: &Path, max_size: u64) -> Result<Vec<u8>, String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("Read Error: {e}"))?;
    if meta.len() > max_size {
        return Err(format!("File too large ({:.2} MB)", meta.len() as f64 / 1024.0 / 1024.0));
    }
    let content = std::fs::read(path).map_err(|e| format!("Read Error: {e}"))?;
    let head_len = content.len().min(1024);
    if is_binary(&content[..head_len]) {
        return Err("Binary file detected".to_string());
    }
    Ok(content)
}

pub fn classify_category(rel_path: &str) -> FileCategory {
    let lower = rel_path.to_lowercase();
    if ["test", "spec", "__tests__"].iter().any(|x| lower.contains(x)) {
        return FileCategory::Test;
    }
    if [".json", ".yaml", ".yml", ".env", ".toml", ".xml"]
        .iter()
        .any(|ext| lower.ends_with(ext))
    {
        return FileCategory::Config;
    }
    if [".md", ".txt", ".rst"].iter().any(|ext| lower.ends_with(ext)) {
        return FileCategory::Docs;
    }
    FileCategory::Source
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_technical_noise_directories() {
        assert!(!should_chunk_file("node_modules/lodash/index.js"));
        assert!(!should_chunk_file("target/debug/build.rs"));
        assert!(!should_chunk_file(".git/HEAD"));
    }

    #[test]
    fn keeps_test_files_for_chunking() {
        assert!(should_chunk_file("src/tests/test_parser.py"));
        assert!(should_chunk_file("pkg/auth_test.go"));
    }

    #[test]
    fn rejects_lockfiles_and_dotfiles() {
        assert!(!should_chunk_file("src/yarn.lock"));
        assert!(!should_chunk_file("src/.gitignore"));
    }

    #[test]
    fn rejects_language_specific_excluded_extensions() {
        assert!(!should_chunk_file("pkg/module.pyc"));
        assert!(!should_chunk_file("dist-out/bundle.min.js.map"));
    }

    #[test]
    fn detects_binary_and_generated_content() {
        assert!(is_binary(b"abc\0def"));
        assert!(!is_binary(b"plain text"));
        assert!(is_minified_or_generated(b"// Code generated by protoc. DO NOT EDIT.\npackage foo"));
        assert!(!is_minified_or_generated(b"fn main() {}\n"));
    }

    #[test]
    fn classifies_file_categories() {
        assert_eq!(classify_category("src/foo_test.py"), FileCategory::Test);
        assert_eq!(classify_category("config/settings.yaml"), FileCategory::Config);
        assert_eq!(classify_category("README.md"), FileCategory::Docs);
        assert_eq!(classify_category("src/lib.rs"), FileCategory::Source);
    }
}
