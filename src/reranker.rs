use std::sync::Mutex;

use candle_core::Tensor;

use crate::{
    chunk::{Candidate, RerankedCandidate},
    error::{Error, Result},
    model_manager::ModelManager,
};

/// A pairwise relevance signal: higher means `text` answers `query` better.
///
/// Scores have no absolute scale; they are only compared within one call.
pub trait PairScorer: Send + Sync {
    fn score(&self, query: &str, text: &str) -> Result<f32>;

    /// Score many texts against one query. Must return one score per text,
    /// in input order.
    fn score_batch(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        texts.iter().map(|text| self.score(query, text)).collect()
    }
}

/// Re-order vector-search candidates by pairwise relevance and keep the best
/// `top_k`.
///
/// Sorting is stable: candidates with equal relevance keep the order they had
/// after vector search.
pub fn rerank(
    scorer: &dyn PairScorer,
    query: &str,
    candidates: Vec<Candidate>,
    top_k: usize,
) -> Result<Vec<RerankedCandidate>> {
    if top_k == 0 {
        return Err(Error::InvalidArgument(
            "rerank top_k must be greater than zero".to_string(),
        ));
    }
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<&str> = candidates.iter().map(|c| c.chunk.text.as_str()).collect();
    let scores = scorer.score_batch(query, &texts)?;
    if scores.len() != candidates.len() {
        return Err(Error::Scoring(format!(
            "scorer returned {} scores for {} candidates",
            scores.len(),
            candidates.len()
        )));
    }
    if let Some(pos) = scores.iter().position(|s| !s.is_finite()) {
        return Err(Error::Scoring(format!(
            "scorer returned a non-finite score for candidate {pos}"
        )));
    }

    let mut ranked: Vec<RerankedCandidate> = candidates
        .into_iter()
        .zip(scores)
        .enumerate()
        .map(|(original_rank, (candidate, relevance))| RerankedCandidate {
            chunk: candidate.chunk,
            relevance,
            original_rank,
            score: candidate.score,
        })
        .collect();

    // `sort_by` is stable, which is what keeps ties in vector-search order.
    ranked.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    ranked.truncate(top_k);

    tracing::debug!(kept = ranked.len(), "reranked candidates");
    Ok(ranked)
}

/// Local ColBERT late-interaction scorer.
///
/// The model needs exclusive access while encoding, so concurrent pipeline
/// runs serialize on the lock here rather than anywhere near the index.
#[derive(Debug)]
pub struct ColbertScorer {
    model: Mutex<ModelManager>,
}

impl ColbertScorer {
    pub fn new(model: ModelManager) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }
}

impl PairScorer for ColbertScorer {
    fn score(&self, query: &str, text: &str) -> Result<f32> {
        let scores = self.score_batch(query, &[text])?;
        scores
            .into_iter()
            .next()
            .ok_or_else(|| Error::Scoring("no score produced".to_string()))
    }

    fn score_batch(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| Error::Scoring("reranker model lock poisoned".to_string()))?;

        let query_embedding = model.encode_query(query)?;
        let documents: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let doc_embeddings = model.encode_documents(&documents)?;

        (0..texts.len())
            .map(|i| {
                let doc = doc_embeddings.get(i).map_err(map_candle_err)?;
                maxsim(&query_embedding, &doc)
            })
            .collect()
    }
}

/// Compute the MaxSim score between a query embedding and a document embedding.
///
/// query_embedding: [Q, D] where Q = query tokens, D = embedding dimension
/// doc_embedding: [T, D] where T = document tokens, D = embedding dimension
///
/// MaxSim = sum over query tokens of max(query_token . doc_token for all doc tokens)
fn maxsim(query_embedding: &Tensor, doc_embedding: &Tensor) -> Result<f32> {
    // [Q, T] = query_emb @ doc_emb^T
    let sim_matrix = query_embedding
        .matmul(&doc_embedding.t().map_err(map_candle_err)?)
        .map_err(map_candle_err)?;

    // Best document token per query token.
    let row_maxes = sim_matrix.max(1).map_err(map_candle_err)?;

    row_maxes
        .sum_all()
        .map_err(map_candle_err)?
        .to_scalar::<f32>()
        .map_err(map_candle_err)
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::Scoring(format!("tensor computation error: {e}"))
}
