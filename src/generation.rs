use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    context::Prompt,
    error::{Error, Result},
};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// A text-generation capability.
pub trait Generator: Send + Sync {
    /// Generate a completion for `prompt`, producing at most `max_tokens`
    /// tokens. Provider-side failures are reported as [`Error::Generation`].
    fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String>;
}

/// Run one generation call for an assembled prompt.
///
/// The call is atomic: there is no retry and no partial output. Errors that
/// are not already [`Error::Generation`] are wrapped as such.
pub fn synthesize(
    generator: &dyn Generator,
    prompt: &Prompt,
    max_tokens: usize,
) -> Result<String> {
    if max_tokens == 0 {
        return Err(Error::InvalidArgument(
            "max_tokens must be greater than zero".to_string(),
        ));
    }

    match generator.generate(&prompt.text, max_tokens) {
        Ok(text) => Ok(text.trim().to_string()),
        Err(e @ Error::Generation(_)) => Err(e),
        Err(other) => Err(Error::Generation(other.to_string())),
    }
}

/// Settings shared by the HTTP generation providers.
#[derive(Clone)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl std::fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

fn send_json<B: Serialize, R: DeserializeOwned>(
    request: reqwest::blocking::RequestBuilder,
    body: &B,
    provider: &str,
) -> Result<R> {
    let resp = request
        .json(body)
        .send()
        .map_err(|e| Error::Generation(format!("failed to call {provider}: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp
            .text()
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        return Err(Error::Generation(format!("{provider} returned {status}: {text}")));
    }

    resp.json()
        .map_err(|e| Error::Generation(format!("failed to parse {provider} response: {e}")))
}

/// Stands in for a provider that could not be configured. Every call fails
/// with the recorded reason.
#[derive(Debug)]
pub struct UnconfiguredGenerator {
    reason: String,
}

impl UnconfiguredGenerator {
    pub fn new(reason: String) -> Self {
        Self { reason }
    }
}

impl Generator for UnconfiguredGenerator {
    fn generate(&self, _prompt: &str, _max_tokens: usize) -> Result<String> {
        Err(Error::Generation(format!(
            "no generator configured: {}",
            self.reason
        )))
    }
}

// -- Gemini --

/// Google Gemini `generateContent` client.
#[derive(Debug)]
pub struct GeminiGenerator {
    client: Client,
    config: GenerationConfig,
}

impl GeminiGenerator {
    pub fn new(config: GenerationConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::Config("missing Gemini API key".to_string()));
        }
        Ok(Self {
            client: build_client(config.timeout)?,
            config,
        })
    }
}

impl Generator for GeminiGenerator {
    fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: max_tokens,
                temperature: self.config.temperature,
            },
        };

        let request = self
            .client
            .post(url)
            .header("x-goog-api-key", self.config.api_key.trim());
        let parsed: GeminiResponse = send_json(request, &body, "Gemini")?;
        parsed.into_text()
    }
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

impl GeminiResponse {
    fn into_text(self) -> Result<String> {
        let text = self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(Error::Generation(
                "Gemini response missing text content".to_string(),
            ));
        }
        Ok(text)
    }
}

// -- OpenAI-compatible --

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug)]
pub struct OpenAiGenerator {
    client: Client,
    config: GenerationConfig,
}

impl OpenAiGenerator {
    pub fn new(config: GenerationConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::Config("missing OpenAI API key".to_string()));
        }
        Ok(Self {
            client: build_client(config.timeout)?,
            config,
        })
    }
}

impl Generator for OpenAiGenerator {
    fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let request = self.client.post(url).bearer_auth(self.config.api_key.trim());
        let parsed: ChatResponse = send_json(request, &body, "OpenAI")?;
        parsed.into_text()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

impl ChatResponse {
    fn into_text(self) -> Result<String> {
        self.choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| {
                Error::Generation("OpenAI response missing message content".to_string())
            })
    }
}
