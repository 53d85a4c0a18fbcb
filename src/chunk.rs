use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A contiguous span of source text, the unit of retrieval.
///
/// Identity is `(doc_id, chunk_index)`. Serialized as one line of the
/// metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: String,
    pub chunk_index: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

impl Chunk {
    pub fn new(doc_id: impl Into<String>, chunk_index: u32, text: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            chunk_index,
            text: text.into(),
            header: None,
        }
    }

    /// Human-readable identity, e.g. `Mistborn:3`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.doc_id, self.chunk_index)
    }
}

/// A chunk paired with its dense embedding, as produced by the embedding
/// stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

impl EmbeddedChunk {
    pub fn new(chunk: Chunk, embedding: Vec<f32>) -> Self {
        Self { chunk, embedding }
    }
}

/// A vector-search hit. `score` is the cosine similarity in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    /// Position of the vector in the index (insertion order).
    pub id: usize,
    pub chunk: Chunk,
    pub score: f32,
}

/// A candidate after reranking.
///
/// `relevance` only orders candidates within a single rerank call; it has no
/// absolute scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankedCandidate {
    pub chunk: Chunk,
    pub relevance: f32,
    /// 0-based rank the candidate had after vector search.
    pub original_rank: usize,
    /// Cosine similarity from vector search.
    pub score: f32,
}

/// Read the embedder's JSONL output.
///
/// Blank lines are skipped. An empty `header` is treated as absent, matching
/// what the embedding stage writes for chunks without a section heading.
pub fn read_embedded_chunks(path: &Path) -> Result<Vec<EmbeddedChunk>> {
    let file = File::open(path)?;
    parse_embedded_chunks(BufReader::new(file))
}

pub fn parse_embedded_chunks<R: BufRead>(reader: R) -> Result<Vec<EmbeddedChunk>> {
    let mut chunks = Vec::new();
    let lines = kdam::tqdm!(reader.lines(), desc = "Reading chunks");

    for (line_no, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mut chunk: EmbeddedChunk =
            serde_json::from_str(&line).map_err(|e| {
                Error::InvalidArgument(format!(
                    "malformed chunk record on line {}: {e}",
                    line_no + 1
                ))
            })?;
        if chunk.chunk.header.as_deref().is_some_and(str::is_empty) {
            chunk.chunk.header = None;
        }
        chunks.push(chunk);
    }

    Ok(chunks)
}
