use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_EMBEDDING_URL: &str = "http://127.0.0.1:8080/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

/// Turns a question into a dense vector in the same space as the index.
///
/// Implementations must use the model that embedded the corpus; the search
/// engine only checks that the dimension matches.
pub trait QueryEmbedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Blocking client for an OpenAI-compatible `/embeddings` endpoint, such as
/// text-embeddings-inference serving the model the corpus was embedded with.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(Error::Config("missing embedding model name".to_string()));
        }
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            Error::Config(format!("failed to build embedding HTTP client: {e}"))
        })?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl QueryEmbedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: [text],
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.trim());
        }

        let resp = request
            .send()
            .map_err(|e| Error::Embedding(format!("failed to call {}: {e}", self.endpoint)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(Error::Embedding(format!(
                "embedding endpoint returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .map_err(|e| Error::Embedding(format!("failed to parse embedding response: {e}")))?;
        parsed.into_single()
    }
}

impl std::fmt::Debug for HttpEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbedder")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

impl EmbeddingResponse {
    fn into_single(mut self) -> Result<Vec<f32>> {
        if self.data.len() != 1 {
            return Err(Error::Embedding(format!(
                "expected 1 embedding, got {}",
                self.data.len()
            )));
        }
        self.data.sort_by_key(|entry| entry.index);
        let embedding = self.data.remove(0).embedding;
        if embedding.is_empty() {
            return Err(Error::Embedding("embedding endpoint returned an empty vector".into()));
        }
        Ok(embedding)
    }
}
