//! Hybrid retrieval: fan out to vector/keyword search, fuse with Reciprocal
//! Rank Fusion, then enrich each surviving hit by walking its graph
//! neighborhood.

use crate::error::{OrchestratorError, Result};
use crate::stages::EmbeddingProvider;
use codegraph_storage::{Edge, NeighborMetadata, NeighborRef, SearchFilters, SearchHit, SnapshotStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrievalMethod {
    Vector,
    Keyword,
}

impl RetrievalMethod {
    fn as_str(&self) -> &'static str {
        match self {
            RetrievalMethod::Vector => "vector",
            RetrievalMethod::Keyword => "keyword",
        }
    }
}

/// Which strategies to fan out to for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStrategy {
    Vector,
    Keyword,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct NavRef {
    pub id: String,
    pub label: String,
}

impl From<NeighborRef> for NavRef {
    fn from(n: NeighborRef) -> Self {
        NavRef { id: n.id, label: n.label }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NavHints {
    pub next: Option<NavRef>,
    pub prev: Option<NavRef>,
    pub parent: Option<NavRef>,
}

impl From<NeighborMetadata> for NavHints {
    fn from(n: NeighborMetadata) -> Self {
        NavHints {
            next: n.next.map(Into::into),
            prev: n.prev.map(Into::into),
            parent: n.parent.map(Into::into),
        }
    }
}

/// One enriched retrieval result, ready for display.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub node_id: String,
    pub snapshot_id: String,
    pub repo_id: String,
    pub branch: String,
    pub file_path: String,
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: f32,
    pub retrieval_method: String,
    pub semantic_labels: Vec<String>,
    pub parent_context: Option<String>,
    pub outgoing_definitions: Vec<String>,
    pub language: String,
    pub nav_hints: NavHints,
}

struct Candidate {
    hit: SearchHit,
    methods: HashSet<RetrievalMethod>,
    rrf_ranks: HashMap<RetrievalMethod, usize>,
}

/// The read-path façade: resolve a target snapshot, fan out search
/// strategies, fuse, and enrich via graph navigation.
pub struct Retriever {
    store: Arc<dyn SnapshotStore>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
}

impl Retriever {
    pub fn new(store: Arc<dyn SnapshotStore>, embedding_provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            store,
            embedding_provider,
        }
    }

    /// Resolves the target snapshot: the explicit id if given, else the
    /// repository's active snapshot. Returns `Ok(None)` if there is none,
    /// which callers should treat as an empty result set rather than an
    /// error.
    async fn resolve_target(&self, repo_id: &str, snapshot_id: Option<&str>) -> Result<Option<String>> {
        if let Some(id) = snapshot_id {
            return Ok(Some(id.to_string()));
        }
        Ok(self.store.get_active_snapshot_id(repo_id).await.map_err(OrchestratorError::Storage)?)
    }

    pub async fn search(
        &self,
        repo_id: &str,
        snapshot_id: Option<&str>,
        query: &str,
        strategy: RetrievalStrategy,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<RetrievedChunk>> {
        let Some(snapshot_id) = self.resolve_target(repo_id, snapshot_id).await? else {
            return Ok(vec![]);
        };

        let repository = self.store.get_repository(repo_id).await.map_err(OrchestratorError::Storage)?;

        let fetch_k = limit.saturating_mul(2).max(1);
        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        let run_vector = matches!(strategy, RetrievalStrategy::Vector | RetrievalStrategy::Hybrid);
        let run_keyword = matches!(strategy, RetrievalStrategy::Keyword | RetrievalStrategy::Hybrid);

        let (vector_hits, keyword_hits) = if run_vector && run_keyword {
            tokio::try_join!(
                self.run_vector_search(&snapshot_id, query, fetch_k, filters),
                self.run_keyword_search(&snapshot_id, query, fetch_k, filters),
            )?
        } else if run_vector {
            (self.run_vector_search(&snapshot_id, query, fetch_k, filters).await?, vec![])
        } else {
            (vec![], self.run_keyword_search(&snapshot_id, query, fetch_k, filters).await?)
        };

        merge_method(&mut candidates, RetrievalMethod::Vector, vector_hits);
        merge_method(&mut candidates, RetrievalMethod::Keyword, keyword_hits);

        let mut ranked: Vec<Candidate> = candidates.into_values().collect();

        if strategy == RetrievalStrategy::Hybrid {
            ranked.sort_by(|a, b| rrf_score(b).partial_cmp(&rrf_score(a)).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            ranked.sort_by(|a, b| b.hit.score.partial_cmp(&a.hit.score).unwrap_or(std::cmp::Ordering::Equal));
        }
        ranked.truncate(limit);

        let mut results = Vec::with_capacity(ranked.len());
        for candidate in ranked {
            let score = if strategy == RetrievalStrategy::Hybrid {
                rrf_score(&candidate) as f32
            } else {
                candidate.hit.score
            };
            let method_label = method_label(&candidate.methods);
            results.push(self.enrich(&repository, &snapshot_id, candidate.hit, score, method_label).await?);
        }

        Ok(results)
    }

    async fn run_vector_search(
        &self,
        snapshot_id: &str,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        let query_vector = self
            .embedding_provider
            .embed_async(&[query.to_string()])
            .await
            .map_err(|e| OrchestratorError::StageExecutionFailed(format!("query embedding failed: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::StageExecutionFailed("embedding provider returned no vector".into()))?;

        self.store
            .search_vectors(snapshot_id, &query_vector, top_k, filters)
            .await
            .map_err(OrchestratorError::Storage)
    }

    async fn run_keyword_search(
        &self,
        snapshot_id: &str,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        self.store
            .search_fts(snapshot_id, query, top_k, filters)
            .await
            .map_err(OrchestratorError::Storage)
    }

    async fn enrich(
        &self,
        repository: &codegraph_storage::Repository,
        snapshot_id: &str,
        hit: SearchHit,
        score: f32,
        retrieval_method: String,
    ) -> Result<RetrievedChunk> {
        let neighbors = self
            .store
            .get_context_neighbors(&hit.chunk_id)
            .await
            .map_err(OrchestratorError::Storage)?;

        let parent_context = match &neighbors.parent {
            Some(parent) if !is_whole_module_label(&parent.label) => Some(format!("{} {}", parent.label, parent.id)),
            _ => None,
        };

        let outgoing_edges = self
            .store
            .get_outgoing_calls(&hit.chunk_id, 25)
            .await
            .map_err(OrchestratorError::Storage)?;
        let outgoing_definitions = top_outgoing_definitions(&outgoing_edges);

        let semantic_labels = hit
            .metadata
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        Ok(RetrievedChunk {
            node_id: hit.chunk_id,
            snapshot_id: snapshot_id.to_string(),
            repo_id: repository.id.clone(),
            branch: repository.branch.clone(),
            file_path: hit.file_path,
            content: hit.content,
            start_line: hit.start_line,
            end_line: hit.end_line,
            score,
            retrieval_method,
            semantic_labels,
            parent_context,
            outgoing_definitions,
            language: hit.language,
            nav_hints: neighbors.into(),
        })
    }
}

fn merge_method(candidates: &mut HashMap<String, Candidate>, method: RetrievalMethod, hits: Vec<SearchHit>) {
    for (rank, hit) in hits.into_iter().enumerate() {
        let entry = candidates.entry(hit.chunk_id.clone()).or_insert_with(|| Candidate {
            hit: hit.clone(),
            methods: HashSet::new(),
            rrf_ranks: HashMap::new(),
        });
        entry.methods.insert(method);
        entry.rrf_ranks.insert(method, rank);
    }
}

fn rrf_score(candidate: &Candidate) -> f64 {
    candidate
        .rrf_ranks
        .values()
        .map(|rank| 1.0 / (RRF_K + *rank as f64 + 1.0))
        .sum()
}

fn method_label(methods: &HashSet<RetrievalMethod>) -> String {
    let mut labels: Vec<&str> = methods.iter().map(RetrievalMethod::as_str).collect();
    labels.sort_unstable();
    labels.join("+")
}

fn is_whole_module_label(label: &str) -> bool {
    label.eq_ignore_ascii_case("module") || label.eq_ignore_ascii_case("file")
}

fn top_outgoing_definitions(edges: &[Edge]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for edge in edges {
        let Some(symbol) = edge.metadata.get("symbol").and_then(|v| v.as_str()) else {
            continue;
        };
        if symbol == "unknown" || symbol.contains('<') {
            continue;
        }
        if seen.insert(symbol.to_string()) {
            out.push(symbol.to_string());
        }
        if out.len() == 5 {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegraph_storage::RelationType;
    use serde_json::json;

    fn edge(symbol: &str) -> Edge {
        Edge {
            source_chunk_id: "a".into(),
            target_chunk_id: "b".into(),
            relation_type: RelationType::Calls,
            metadata: json!({ "symbol": symbol, "tool": "test", "is_external": false }),
        }
    }

    #[test]
    fn top_outgoing_definitions_dedupes_and_filters() {
        let edges = vec![edge("foo"), edge("foo"), edge("unknown"), edge("Vec<T>"), edge("bar")];
        let result = top_outgoing_definitions(&edges);
        assert_eq!(result, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn top_outgoing_definitions_caps_at_five() {
        let edges: Vec<Edge> = (0..10).map(|i| edge(&format!("sym{i}"))).collect();
        assert_eq!(top_outgoing_definitions(&edges).len(), 5);
    }

    #[test]
    fn rrf_score_rewards_agreement_across_methods() {
        let mut ranks = HashMap::new();
        ranks.insert(RetrievalMethod::Vector, 0usize);
        ranks.insert(RetrievalMethod::Keyword, 0usize);
        let both = Candidate {
            hit: sample_hit(),
            methods: HashSet::new(),
            rrf_ranks: ranks,
        };

        let mut single_rank = HashMap::new();
        single_rank.insert(RetrievalMethod::Vector, 0usize);
        let one = Candidate {
            hit: sample_hit(),
            methods: HashSet::new(),
            rrf_ranks: single_rank,
        };

        assert!(rrf_score(&both) > rrf_score(&one));
    }

    #[test]
    fn method_label_is_sorted_and_joined() {
        let mut methods = HashSet::new();
        methods.insert(RetrievalMethod::Keyword);
        methods.insert(RetrievalMethod::Vector);
        assert_eq!(method_label(&methods), "keyword+vector");
    }

    #[test]
    fn whole_module_parent_is_filtered() {
        assert!(is_whole_module_label("Module"));
        assert!(is_whole_module_label("file"));
        assert!(!is_whole_module_label("Function"));
    }

    fn sample_hit() -> SearchHit {
        SearchHit {
            chunk_id: "c1".into(),
            file_path: "a.py".into(),
            content: "def f(): pass".into(),
            start_line: 1,
            end_line: 1,
            language: "python".into(),
            category: "source".into(),
            metadata: json!({}),
            score: 1.0,
        }
    }
}
