// Stage implementations
pub mod chunk_stage;
pub mod cross_ref_stage;
pub mod embedding_stage;

// Re-exports
pub use chunk_stage::ChunkStage;
pub use cross_ref_stage::CrossRefStage;
pub use embedding_stage::{EmbeddingProvider, EmbeddingProviderError, EmbeddingStage, ProgressEvent};
