//! The question-answering state machine.
//!
//! A run moves strictly forward through
//! `Received -> Searched -> Reranked -> Assembled -> Synthesized -> Done`.
//! The first failing stage aborts the run; nothing computed before it is
//! returned.

use std::sync::Arc;

use serde::Serialize;

use crate::{
    chunk::RerankedCandidate,
    context::{self, PromptTemplates, TemplateKind},
    embedding::QueryEmbedder,
    error::{Error, Result},
    generation::{self, Generator},
    reranker::{self, PairScorer},
    search::VectorSearchEngine,
};

pub const DEFAULT_CANDIDATE_POOL: usize = 20;
pub const DEFAULT_ANSWER_TOP_K: usize = 3;
pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Vector search retrieves at least this many times the rerank output size.
const POOL_FACTOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Received,
    Searched,
    Reranked,
    Assembled,
    Synthesized,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Searched => "searched",
            Stage::Reranked => "reranked",
            Stage::Assembled => "assembled",
            Stage::Synthesized => "synthesized",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Minimum number of vector-search candidates handed to the reranker.
    pub candidate_pool: usize,
    /// Chunks kept after reranking when answering.
    pub answer_top_k: usize,
    pub max_tokens: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            candidate_pool: DEFAULT_CANDIDATE_POOL,
            answer_top_k: DEFAULT_ANSWER_TOP_K,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl PipelineOptions {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("candidate_pool", self.candidate_pool),
            ("answer_top_k", self.answer_top_k),
            ("max_tokens", self.max_tokens),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// How many candidates vector search should return for a rerank that
    /// keeps `top_k`.
    pub fn search_breadth(&self, top_k: usize) -> usize {
        self.candidate_pool.max(top_k.saturating_mul(POOL_FACTOR))
    }
}

/// The outcome of a successful [`QueryPipeline::ask`].
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub template: TemplateKind,
    /// Reranked chunks that were considered for the prompt, best first.
    pub sources: Vec<RerankedCandidate>,
}

/// Search, rerank, assemble and synthesize behind one call.
///
/// Holds only shared, read-only state, so one instance serves any number of
/// concurrent questions.
pub struct QueryPipeline {
    engine: Arc<VectorSearchEngine>,
    embedder: Arc<dyn QueryEmbedder>,
    scorer: Arc<dyn PairScorer>,
    generator: Arc<dyn Generator>,
    templates: PromptTemplates,
    options: PipelineOptions,
}

impl QueryPipeline {
    pub fn new(
        engine: Arc<VectorSearchEngine>,
        embedder: Arc<dyn QueryEmbedder>,
        scorer: Arc<dyn PairScorer>,
        generator: Arc<dyn Generator>,
        templates: PromptTemplates,
        options: PipelineOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            engine,
            embedder,
            scorer,
            generator,
            templates,
            options,
        })
    }

    pub fn engine(&self) -> &VectorSearchEngine {
        &self.engine
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Answer `question` from the index, falling back to the persona's
    /// general knowledge when retrieval finds nothing substantive.
    pub fn ask(&self, question: &str) -> Result<Answer> {
        let mut run = Run::start(question)?;
        let top_k = self.options.answer_top_k;

        let reranked = self.retrieve(&mut run, question, top_k)?;
        let prompt = run.advance(Stage::Assembled, || {
            Ok(context::assemble(question, &reranked, &self.templates))
        })?;
        tracing::debug!(template = %prompt.kind, "assembled prompt");

        let text = run.advance(Stage::Synthesized, || {
            generation::synthesize(self.generator.as_ref(), &prompt, self.options.max_tokens)
        })?;
        run.finish();

        Ok(Answer {
            text,
            template: prompt.kind,
            sources: reranked,
        })
    }

    /// Search and rerank only; the generator is never called.
    pub fn search(&self, question: &str, top_k: usize) -> Result<Vec<RerankedCandidate>> {
        if top_k == 0 {
            return Err(Error::InvalidArgument(
                "top_k must be greater than zero".to_string(),
            ));
        }
        let mut run = Run::start(question)?;
        let reranked = self.retrieve(&mut run, question, top_k)?;
        run.finish();
        Ok(reranked)
    }

    fn retrieve(
        &self,
        run: &mut Run,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<RerankedCandidate>> {
        let breadth = self.options.search_breadth(top_k);
        let candidates = run.advance(Stage::Searched, || {
            let query = self.embedder.embed(question)?;
            self.engine.search(&query, breadth)
        })?;
        tracing::debug!(candidates = candidates.len(), breadth, "vector search done");

        run.advance(Stage::Reranked, || {
            reranker::rerank(self.scorer.as_ref(), question, candidates, top_k)
        })
    }
}

impl std::fmt::Debug for QueryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPipeline")
            .field("engine", &self.engine)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Tracks the current stage of one pipeline run.
struct Run {
    stage: Stage,
}

impl Run {
    fn start(question: &str) -> Result<Self> {
        if question.trim().is_empty() {
            return Err(Error::InvalidArgument("question must not be blank".to_string()));
        }
        tracing::debug!(stage = %Stage::Received, "pipeline started");
        Ok(Self {
            stage: Stage::Received,
        })
    }

    /// Attempt the work that leads to `next`. On failure the error is tagged
    /// with `next`, the stage that could not be reached.
    fn advance<T>(&mut self, next: Stage, work: impl FnOnce() -> Result<T>) -> Result<T> {
        match work() {
            Ok(value) => {
                tracing::trace!(from = %self.stage, to = %next, "stage complete");
                self.stage = next;
                Ok(value)
            }
            Err(source) => {
                tracing::warn!(stage = %next, error = %source, "pipeline failed");
                Err(Error::Pipeline {
                    stage: next,
                    source: Box::new(source),
                })
            }
        }
    }

    fn finish(self) {
        tracing::trace!(from = %self.stage, to = %Stage::Done, "stage complete");
    }
}
