//! Runs external SCIP-family indexers (`scip-python`, `scip-typescript`, …)
//! over a worktree and streams their decoded output back as JSON documents.
//!
//! Project discovery is marker-file driven: the presence of a
//! `pyproject.toml`, `package.json`, `go.mod`, etc. at a directory selects
//! which indexer runs there. Before invoking a tool, the project root is
//! pruned of everything outside the global/semantic noise filters so the
//! indexer doesn't waste time walking fixtures, vendored code, and build
//! output.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::errors::Result;
use crate::features::chunking::file_filter::{GLOBAL_IGNORE_DIRS, SEMANTIC_NOISE_DIRS};

/// Marker file -> indexer binary name. Checked in directory-walk order; the
/// first marker found in a directory claims that subtree (no nested
/// indexing of the same project).
const PROJECT_MARKERS: &[(&str, &str)] = &[
    ("pyproject.toml", "scip-python"),
    ("requirements.txt", "scip-python"),
    ("setup.py", "scip-python"),
    ("package.json", "scip-typescript"),
    ("tsconfig.json", "scip-typescript"),
    ("pom.xml", "scip-java"),
    ("build.gradle", "scip-java"),
    ("go.mod", "scip-go"),
    ("Cargo.toml", "scip-rust"),
];

/// Extension -> indexer, used only when no marker file was found anywhere
/// in the tree (a workspace with loose source files and no manifest).
const EXTENSION_FALLBACK: &[(&str, &str)] = &[
    (".py", "scip-python"),
    (".ts", "scip-typescript"),
    (".js", "scip-typescript"),
    (".java", "scip-java"),
    (".go", "scip-go"),
    (".rs", "scip-rust"),
];

const MAX_PARALLEL_INDEXERS: usize = 4;

/// One project root paired with the indexer that should run over it.
#[derive(Debug, Clone)]
pub struct IndexTask {
    pub indexer: &'static str,
    pub project_root: PathBuf,
}

/// A project root's completed index: the `.scip` file `scip print --json`
/// can stream back into documents.
#[derive(Debug, Clone)]
pub struct IndexArtifact {
    pub project_root: PathBuf,
    pub index_path: PathBuf,
}

/// One document from a streamed index, with the project root it came from
/// so its `relative_path` can be rebased onto the repo root.
#[derive(Debug, Clone)]
pub struct DocumentEnvelope {
    pub project_root: PathBuf,
    pub document: Value,
}

pub struct ScipRunner {
    repo_root: PathBuf,
    ignore_dirs: HashSet<&'static str>,
}

impl ScipRunner {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let mut ignore_dirs = HashSet::new();
        ignore_dirs.extend(GLOBAL_IGNORE_DIRS.iter().copied());
        ignore_dirs.extend(SEMANTIC_NOISE_DIRS.iter().copied());
        Self {
            repo_root: repo_root.into(),
            ignore_dirs,
        }
    }

    /// Walks the repository looking for marker files; falls back to
    /// extension sniffing over the whole tree if none are found. Does not
    /// check whether the indexer binaries actually exist on `PATH` — the
    /// caller should treat a `NotFound` from `prepare_indices` as "no tools
    /// installed, skip cross-ref resolution" rather than a hard failure.
    pub fn discover_tasks(&self) -> Vec<IndexTask> {
        let mut tasks = Vec::new();
        let mut claimed: Vec<PathBuf> = Vec::new();
        self.walk_for_markers(&self.repo_root, &mut tasks, &mut claimed);

        if tasks.is_empty() {
            let mut detected = HashSet::new();
            self.walk_for_extensions(&self.repo_root, &mut detected);
            for indexer in detected {
                tasks.push(IndexTask {
                    indexer,
                    project_root: self.repo_root.clone(),
                });
            }
        }
        tasks
    }

    fn walk_for_markers(&self, dir: &Path, tasks: &mut Vec<IndexTask>, claimed: &mut Vec<PathBuf>) {
        if claimed.iter().any(|c| dir.starts_with(c)) {
            return;
        }
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        let mut file_names = HashSet::new();
        let mut subdirs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if name.starts_with('.') || self.ignore_dirs.contains(name.as_str()) {
                    continue;
                }
                subdirs.push(path);
            } else {
                file_names.insert(name);
            }
        }

        for (marker, indexer) in PROJECT_MARKERS {
            if file_names.contains(*marker) {
                tasks.push(IndexTask {
                    indexer,
                    project_root: dir.to_path_buf(),
                });
                claimed.push(dir.to_path_buf());
                return;
            }
        }

        for sub in subdirs {
            self.walk_for_markers(&sub, tasks, claimed);
        }
    }

    fn walk_for_extensions(&self, dir: &Path, detected: &mut HashSet<&'static str>) {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if name.starts_with('.') || self.ignore_dirs.contains(name.as_str()) {
                    continue;
                }
                self.walk_for_extensions(&path, detected);
            } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                let dotted = format!(".{ext}");
                if let Some((_, indexer)) = EXTENSION_FALLBACK.iter().find(|(e, _)| *e == dotted) {
                    detected.insert(indexer);
                }
            }
        }
    }

    /// Deletes everything under `project_root` that isn't a marker file or
    /// a recognized source extension, so the external indexer spends its
    /// time on code instead of fixtures and binary assets. Only ever
    /// touches the ephemeral worktree, never the caller's real checkout.
    pub fn prune_workspace(&self, project_root: &Path) -> (usize, usize) {
        let valid_exts: HashSet<&str> = EXTENSION_FALLBACK.iter().map(|(e, _)| e.trim_start_matches('.')).collect();
        let valid_markers: HashSet<&str> = PROJECT_MARKERS.iter().map(|(m, _)| *m).collect();
        let mut removed_dirs = 0;
        let mut removed_files = 0;
        self.prune_dir(project_root, &valid_exts, &valid_markers, &mut removed_dirs, &mut removed_files);
        (removed_dirs, removed_files)
    }

    fn prune_dir(&self, dir: &Path, valid_exts: &HashSet<&str>, valid_markers: &HashSet<&str>, removed_dirs: &mut usize, removed_files: &mut usize) {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if name.starts_with('.') || self.ignore_dirs.contains(name.as_str()) {
                    if std::fs::remove_dir_all(&path).is_ok() {
                        *removed_dirs += 1;
                    }
                    continue;
                }
                self.prune_dir(&path, valid_exts, valid_markers, removed_dirs, removed_files);
            } else {
                if valid_markers.contains(name.as_str()) {
                    continue;
                }
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                if valid_exts.contains(ext) {
                    continue;
                }
                if std::fs::remove_file(&path).is_ok() {
                    *removed_files += 1;
                }
            }
        }
    }

    /// Runs every discovered task, bounded to `MAX_PARALLEL_INDEXERS`
    /// concurrent subprocesses, pruning each project root first. Tasks
    /// whose indexer binary is missing or that exit non-zero are dropped
    /// silently — cross-ref resolution degrades to "no edges from that
    /// project" rather than failing the whole pipeline.
    pub async fn prepare_indices(&self, tasks: Vec<IndexTask>, timeout: std::time::Duration) -> Vec<IndexArtifact> {
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(MAX_PARALLEL_INDEXERS));
        let mut set = tokio::task::JoinSet::new();
        for task in tasks {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let repo_root = self.repo_root.clone();
            let ignore_dirs = self.ignore_dirs.clone();
            set.spawn(async move {
                let _permit = permit;
                let runner = ScipRunner { repo_root, ignore_dirs };
                runner.run_single_index(&task, timeout).await
            });
        }
        let mut out = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(artifact)) = joined {
                out.push(artifact);
            }
        }
        out
    }

    async fn run_single_index(&self, task: &IndexTask, timeout: std::time::Duration) -> Option<IndexArtifact> {
        if which(task.indexer).is_none() {
            tracing::debug!(indexer = task.indexer, "cross-ref indexer not on PATH, skipping");
            return None;
        }

        self.prune_workspace(&task.project_root);

        let out_path = std::env::temp_dir().join(format!("codegraph-scip-{}.scip", uuid::Uuid::new_v4()));
        let run = Command::new(task.indexer)
            .args(["index", ".", "--output"])
            .arg(&out_path)
            .current_dir(&task.project_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                tracing::warn!(indexer = task.indexer, root = %task.project_root.display(), error = %err, "failed to launch indexer");
                return None;
            }
            Err(_) => {
                tracing::warn!(indexer = task.indexer, root = %task.project_root.display(), "indexer timed out");
                return None;
            }
        };

        if !output.status.success() {
            tracing::warn!(
                indexer = task.indexer,
                root = %task.project_root.display(),
                code = ?output.status.code(),
                "indexer exited non-zero"
            );
            return None;
        }

        match std::fs::metadata(&out_path) {
            Ok(meta) if meta.len() > 10 => Some(IndexArtifact {
                project_root: task.project_root.clone(),
                index_path: out_path,
            }),
            _ => None,
        }
    }

    /// Streams `scip print --json` output line by line, yielding one
    /// document per line, rebased so paths outside the repo are dropped.
    pub async fn stream_documents(&self, artifacts: &[IndexArtifact]) -> Result<Vec<DocumentEnvelope>> {
        let mut out = Vec::new();
        for artifact in artifacts {
            let mut child = match Command::new("scip")
                .args(["print", "--json"])
                .arg(&artifact.index_path)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => child,
                Err(err) => {
                    tracing::warn!(index = %artifact.index_path.display(), error = %err, "failed to spawn scip print");
                    continue;
                }
            };
            let Some(stdout) = child.stdout.take() else { continue };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(payload) = serde_json::from_str::<Value>(&line) else { continue };
                let docs: Vec<Value> = match payload {
                    Value::Array(items) => items,
                    Value::Object(ref map) if map.contains_key("documents") => {
                        payload.get("documents").and_then(|d| d.as_array()).cloned().unwrap_or_default()
                    }
                    other => vec![other],
                };
                for doc in docs {
                    out.push(DocumentEnvelope {
                        project_root: artifact.project_root.clone(),
                        document: doc,
                    });
                }
            }
            let _ = child.wait().await;
        }
        Ok(out)
    }

    pub fn cleanup(&self, artifacts: &[IndexArtifact]) {
        for artifact in artifacts {
            let _ = std::fs::remove_file(&artifact.index_path);
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

fn which(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(binary)).find(|candidate| candidate.is_file())
}
