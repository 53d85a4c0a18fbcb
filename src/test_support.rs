//! Fake capabilities shared by the service-surface tests.

use std::sync::Arc;

use crate::{
    chunk::{Chunk, EmbeddedChunk},
    context::PromptTemplates,
    embedding::QueryEmbedder,
    error::{Error, Result},
    generation::Generator,
    index,
    pipeline::{PipelineOptions, QueryPipeline},
    reranker::PairScorer,
    search::VectorSearchEngine,
};

pub const LONG_TEXT: &str =
    "Hoid is a worldhopper who appears on many worlds of the Cosmere under different names.";

/// Embeds every question to the first corpus vector.
pub struct FixedEmbedder;

impl QueryEmbedder for FixedEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0])
    }
}

/// Produces vectors one dimension short of [`engine`]'s.
pub struct ShortEmbedder;

impl QueryEmbedder for ShortEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

pub struct SameScore;

impl PairScorer for SameScore {
    fn score(&self, _query: &str, _text: &str) -> Result<f32> {
        Ok(1.0)
    }
}

pub struct CannedGenerator(pub &'static str);

impl Generator for CannedGenerator {
    fn generate(&self, _prompt: &str, _max_tokens: usize) -> Result<String> {
        Ok(self.0.to_string())
    }
}

pub struct FailingGenerator;

impl Generator for FailingGenerator {
    fn generate(&self, _prompt: &str, _max_tokens: usize) -> Result<String> {
        Err(Error::Generation("provider unavailable".to_string()))
    }
}

/// Blocks for longer than any test deadline.
pub struct SlowGenerator;

impl Generator for SlowGenerator {
    fn generate(&self, _prompt: &str, _max_tokens: usize) -> Result<String> {
        std::thread::sleep(std::time::Duration::from_millis(500));
        Ok("too late".to_string())
    }
}

/// Three chunks `hoid:0` (long), `roshar:0`, `scadrial:0`, ranked in that
/// order for every question.
pub fn engine() -> Arc<VectorSearchEngine> {
    let chunks = vec![
        EmbeddedChunk::new(Chunk::new("hoid", 0, LONG_TEXT), vec![1.0, 0.0, 0.0]),
        EmbeddedChunk::new(Chunk::new("roshar", 0, "Storms."), vec![0.8, 0.6, 0.0]),
        EmbeddedChunk::new(Chunk::new("scadrial", 0, "Ash."), vec![0.0, 0.0, 1.0]),
    ];
    let (index, metadata) = index::build(chunks).unwrap();
    Arc::new(VectorSearchEngine::from_parts(index, metadata).unwrap())
}

pub fn pipeline(generator: Arc<dyn Generator>) -> Arc<QueryPipeline> {
    pipeline_with(Arc::new(FixedEmbedder), generator)
}

pub fn pipeline_with(
    embedder: Arc<dyn QueryEmbedder>,
    generator: Arc<dyn Generator>,
) -> Arc<QueryPipeline> {
    Arc::new(
        QueryPipeline::new(
            engine(),
            embedder,
            Arc::new(SameScore),
            generator,
            PromptTemplates::default(),
            PipelineOptions::default(),
        )
        .unwrap(),
    )
}
