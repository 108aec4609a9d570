use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use std::collections::{HashMap, HashSet};

/// Cache key manager: derives deterministic checkpoint keys per repo/snapshot.
#[derive(Debug, Clone)]
pub struct CacheKeyManager {
    repo_id: String,
    snapshot_id: String,
}

impl CacheKeyManager {
    pub fn new(repo_id: String, snapshot_id: String) -> Self {
        Self {
            repo_id,
            snapshot_id,
        }
    }

    pub fn chunk_key(&self) -> String {
        format!("chunks:{}:{}", self.repo_id, self.snapshot_id)
    }

    pub fn cross_ref_key(&self) -> String {
        format!("cross_ref:{}:{}", self.repo_id, self.snapshot_id)
    }

    pub fn embedding_key(&self) -> String {
        format!("embedding:{}:{}", self.repo_id, self.snapshot_id)
    }

    /// Get cache key for a stage
    pub fn key_for_stage(&self, stage: StageId) -> String {
        match stage {
            StageId::Chunk => self.chunk_key(),
            StageId::CrossRef => self.cross_ref_key(),
            StageId::Embedding => self.embedding_key(),
        }
    }
}

/// Stage node in DAG
#[derive(Debug, Clone)]
pub struct StageNode {
    pub id: StageId,
    pub name: &'static str,
    pub dependencies: Vec<StageId>,
    pub optional: bool,
    pub timeout_ms: u64,
}

// Make StageNode cloneable for orchestrator
impl StageNode {
    pub fn clone_node(&self) -> Self {
        self.clone()
    }
}

impl StageNode {
    pub fn new(
        id: StageId,
        name: &'static str,
        dependencies: Vec<StageId>,
        optional: bool,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id,
            name,
            dependencies,
            optional,
            timeout_ms,
        }
    }
}

/// Pipeline DAG with topological sort
#[derive(Debug, Clone)]
pub struct PipelineDAG {
    stages: HashMap<StageId, StageNode>,
    execution_order: Vec<Vec<StageId>>, // Vec of parallel groups
}

impl PipelineDAG {
    /// Create a new DAG from stage definitions
    pub fn new(stages: Vec<StageNode>) -> Result<Self> {
        let mut stage_map = HashMap::new();
        for stage in stages {
            stage_map.insert(stage.id, stage);
        }

        // Validate dependencies exist
        for stage in stage_map.values() {
            for dep in &stage.dependencies {
                if !stage_map.contains_key(dep) {
                    return Err(OrchestratorError::MissingDependency(format!(
                        "Stage {:?} depends on non-existent stage {:?}",
                        stage.id, dep
                    )));
                }
            }
        }

        // Compute execution order via topological sort
        let execution_order = Self::topological_sort(&stage_map)?;

        Ok(Self {
            stages: stage_map,
            execution_order,
        })
    }

    /// Default pipeline: Chunk → CrossRef (optional) → Embedding.
    ///
    /// Cross-ref resolution is optional because no indexer tool being
    /// installed for a project's language is a normal, non-fatal outcome.
    pub fn default_pipeline() -> Result<Self> {
        let stages = vec![
            StageNode::new(
                StageId::Chunk,
                "Chunking",
                vec![],
                false,
                300_000, // 5 minutes
            ),
            StageNode::new(
                StageId::CrossRef,
                "Cross-Reference Resolution",
                vec![StageId::Chunk],
                true, // Optional: indexer tools may not be installed
                180_000,
            ),
            StageNode::new(
                StageId::Embedding,
                "Embedding Pipeline",
                vec![StageId::Chunk],
                true, // Optional: provider failures still complete the snapshot
                600_000,
            ),
        ];

        Self::new(stages)
    }

    /// Topological sort with parallel group detection
    fn topological_sort(stages: &HashMap<StageId, StageNode>) -> Result<Vec<Vec<StageId>>> {
        let mut in_degree: HashMap<StageId, usize> = stages.keys().map(|&id| (id, 0)).collect();

        // Calculate in-degrees
        for stage in stages.values() {
            for &_dep in &stage.dependencies {
                *in_degree.get_mut(&stage.id).unwrap() += 1;
            }
        }

        let mut result = Vec::new();
        let mut processed = HashSet::new();

        while processed.len() < stages.len() {
            // Find all stages with in-degree 0 (can run in parallel)
            let ready: Vec<StageId> = in_degree
                .iter()
                .filter(|(id, &degree)| degree == 0 && !processed.contains(*id))
                .map(|(&id, _)| id)
                .collect();

            if ready.is_empty() {
                return Err(OrchestratorError::DagCycleDetected);
            }

            result.push(ready.clone());

            // Mark as processed and decrement dependents
            for &stage_id in &ready {
                processed.insert(stage_id);
                in_degree.remove(&stage_id);

                // Decrement dependents
                for dependent in stages.values() {
                    if dependent.dependencies.contains(&stage_id) {
                        *in_degree.get_mut(&dependent.id).unwrap() -= 1;
                    }
                }
            }
        }

        Ok(result)
    }

    /// Get execution order
    pub fn execution_order(&self) -> &[Vec<StageId>] {
        &self.execution_order
    }

    /// Get stage node
    pub fn get_stage(&self, id: StageId) -> Option<&StageNode> {
        self.stages.get(&id)
    }

    /// Get execution plan as string (for logging)
    pub fn execution_plan(&self) -> String {
        self.execution_order
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let stage_names: Vec<_> = group.iter().map(|id| self.stages[id].name).collect();

                if group.len() > 1 {
                    format!("Phase {}: {} (parallel)", i + 1, stage_names.join(" ∥ "))
                } else {
                    format!("Phase {}: {}", i + 1, stage_names[0])
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Get required cache keys for a stage
    pub fn required_cache_keys(
        &self,
        stage_id: StageId,
        cache_mgr: &CacheKeyManager,
    ) -> Vec<String> {
        let stage = match self.stages.get(&stage_id) {
            Some(s) => s,
            None => return vec![],
        };

        stage
            .dependencies
            .iter()
            .map(|dep_id| cache_mgr.key_for_stage(*dep_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_generation() {
        let mgr = CacheKeyManager::new("repo123".to_string(), "snap456".to_string());
        assert_eq!(mgr.chunk_key(), "chunks:repo123:snap456");
        assert_eq!(mgr.cross_ref_key(), "cross_ref:repo123:snap456");
        assert_eq!(mgr.embedding_key(), "embedding:repo123:snap456");
    }

    #[test]
    fn test_cache_key_for_stage() {
        let mgr = CacheKeyManager::new("repo1".to_string(), "snap1".to_string());
        assert_eq!(mgr.key_for_stage(StageId::Chunk), "chunks:repo1:snap1");
        assert_eq!(mgr.key_for_stage(StageId::CrossRef), "cross_ref:repo1:snap1");
    }

    #[test]
    fn test_dag_topological_sort_simple() {
        let stages = vec![
            StageNode::new(StageId::Chunk, "Chunk", vec![], false, 1000),
            StageNode::new(
                StageId::CrossRef,
                "CrossRef",
                vec![StageId::Chunk],
                true,
                1000,
            ),
        ];

        let dag = PipelineDAG::new(stages).unwrap();
        let order = dag.execution_order();

        assert_eq!(order.len(), 2);
        assert_eq!(order[0], vec![StageId::Chunk]);
        assert_eq!(order[1], vec![StageId::CrossRef]);
    }

    #[test]
    fn test_dag_parallel_detection() {
        let stages = vec![
            StageNode::new(
                StageId::CrossRef,
                "CrossRef",
                vec![StageId::Chunk],
                true,
                1000,
            ),
            StageNode::new(
                StageId::Embedding,
                "Embedding",
                vec![StageId::Chunk],
                true,
                1000,
            ),
            StageNode::new(StageId::Chunk, "Chunk", vec![], false, 1000),
        ];

        let dag = PipelineDAG::new(stages).unwrap();
        let order = dag.execution_order();

        assert_eq!(order.len(), 2);
        assert_eq!(order[0], vec![StageId::Chunk]);
        assert_eq!(order[1].len(), 2); // CrossRef and Embedding run in parallel
        assert!(order[1].contains(&StageId::CrossRef));
        assert!(order[1].contains(&StageId::Embedding));
    }

    #[test]
    fn test_dag_default_pipeline() {
        let dag = PipelineDAG::default_pipeline().unwrap();
        let order = dag.execution_order();

        // Phase 1: Chunk
        assert_eq!(order.len(), 2);
        assert_eq!(order[0], vec![StageId::Chunk]);

        // Phase 2: CrossRef ∥ Embedding
        assert_eq!(order[1].len(), 2);
        assert!(order[1].contains(&StageId::CrossRef));
        assert!(order[1].contains(&StageId::Embedding));
    }

    #[test]
    fn test_dag_cycle_detection() {
        // Missing dependency is rejected before topological sort runs
        let stages = vec![StageNode::new(
            StageId::CrossRef,
            "CrossRef",
            vec![StageId::Chunk], // Chunk not in stages
            true,
            1000,
        )];

        let result = PipelineDAG::new(stages);
        assert!(result.is_err());
    }

    #[test]
    fn test_dag_execution_plan_string() {
        let dag = PipelineDAG::default_pipeline().unwrap();
        let plan = dag.execution_plan();

        assert!(plan.contains("Phase 1:"));
        assert!(plan.contains("Chunking"));
        assert!(plan.contains("parallel"));
    }

    #[test]
    fn test_dag_required_cache_keys() {
        let dag = PipelineDAG::default_pipeline().unwrap();
        let mgr = CacheKeyManager::new("repo1".to_string(), "snap1".to_string());

        // Chunk has no dependencies
        let chunk_keys = dag.required_cache_keys(StageId::Chunk, &mgr);
        assert_eq!(chunk_keys.len(), 0);

        // CrossRef depends on Chunk
        let cross_ref_keys = dag.required_cache_keys(StageId::CrossRef, &mgr);
        assert_eq!(cross_ref_keys.len(), 1);
        assert_eq!(cross_ref_keys[0], "chunks:repo1:snap1");

        // Embedding depends on Chunk
        let embedding_keys = dag.required_cache_keys(StageId::Embedding, &mgr);
        assert_eq!(embedding_keys.len(), 1);
        assert_eq!(embedding_keys[0], "chunks:repo1:snap1");
    }
}
