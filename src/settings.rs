//! Runtime settings and the capabilities built from them.
//!
//! Each setting resolves from the environment (`ARCHIVIST_<KEY>`), then
//! `config.redb`, then a built-in default. API keys are only ever read from
//! the environment and never stored.

use std::{fmt::Display, str::FromStr, sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    config_db::ConfigDb,
    context::{DEFAULT_FALLBACK_TEMPLATE, DEFAULT_GROUNDED_TEMPLATE, PromptTemplates},
    embedding::{DEFAULT_EMBEDDING_MODEL, DEFAULT_EMBEDDING_URL, HttpEmbedder, QueryEmbedder},
    error::{Error, Result},
    generation::{
        DEFAULT_GEMINI_BASE_URL, DEFAULT_OPENAI_BASE_URL, GeminiGenerator, GenerationConfig,
        Generator, OpenAiGenerator, UnconfiguredGenerator,
    },
    model_manager::{DEFAULT_RERANKER_MODEL, ModelManager},
    pipeline::{DEFAULT_ANSWER_TOP_K, DEFAULT_CANDIDATE_POOL, DEFAULT_MAX_TOKENS, PipelineOptions},
    reranker::{ColbertScorer, PairScorer},
};

pub const EMBEDDING_API_KEY_ENV: &str = "ARCHIVIST_EMBEDDING_API_KEY";
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-lite";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.3;
pub const DEFAULT_SEARCH_TOP_K: usize = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Every recognised setting key, in display order.
pub const KEYS: &[&str] = &[
    "embedding_url",
    "embedding_model",
    "reranker_model",
    "generator",
    "generation_model",
    "generation_url",
    "temperature",
    "max_tokens",
    "candidate_pool",
    "answer_top_k",
    "search_top_k",
    "request_timeout_secs",
    "grounded_template",
    "fallback_template",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    Gemini,
    OpenAi,
}

impl FromStr for GeneratorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(GeneratorKind::Gemini),
            "openai" => Ok(GeneratorKind::OpenAi),
            other => Err(format!("unknown generator '{other}' (expected gemini or openai)")),
        }
    }
}

impl Display for GeneratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneratorKind::Gemini => f.write_str("gemini"),
            GeneratorKind::OpenAi => f.write_str("openai"),
        }
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Env,
    Config,
    Default,
}

impl Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Env => f.write_str("env"),
            Source::Config => f.write_str("config"),
            Source::Default => f.write_str("default"),
        }
    }
}

/// One line of `archivist config show`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingEntry {
    pub key: &'static str,
    pub value: String,
    pub source: Source,
}

/// Fully resolved, validated settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub embedding_url: String,
    pub embedding_model: String,
    pub reranker_model: String,
    pub generator: GeneratorKind,
    pub generation_model: String,
    pub generation_url: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub candidate_pool: usize,
    pub answer_top_k: usize,
    pub search_top_k: usize,
    pub request_timeout_secs: u64,
    pub grounded_template: String,
    pub fallback_template: String,
}

/// Name of the environment variable overriding `key`.
pub fn env_var_name(key: &str) -> String {
    format!("ARCHIVIST_{}", key.to_ascii_uppercase())
}

/// Fail with [`Error::NotFound`] unless `key` is a recognised setting.
pub fn ensure_known(key: &str) -> Result<()> {
    if KEYS.contains(&key) {
        Ok(())
    } else {
        Err(Error::NotFound {
            kind: "setting",
            name: key.to_string(),
        })
    }
}

struct Resolver<'a, F> {
    db: Option<&'a ConfigDb>,
    env: F,
}

impl<F> Resolver<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Result<Option<(String, Source)>> {
        if let Some(value) = (self.env)(&env_var_name(key)).filter(|v| !v.trim().is_empty()) {
            return Ok(Some((value, Source::Env)));
        }
        match self.db {
            Some(db) => Ok(db.get_setting(key)?.map(|v| (v, Source::Config))),
            None => Ok(None),
        }
    }

    fn string(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .raw(key)?
            .map(|(v, _)| v)
            .unwrap_or_else(|| default.to_string()))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(key)? {
            Some((value, source)) => value.trim().parse().map_err(|e| {
                Error::Config(format!("invalid {key} '{value}' (from {source}): {e}"))
            }),
            None => Ok(default),
        }
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr + PartialEq + Default,
        T::Err: Display,
    {
        let value = self.parse(key, default)?;
        if value == T::default() {
            return Err(Error::Config(format!("{key} must be greater than zero")));
        }
        Ok(value)
    }
}

impl Settings {
    /// Resolve settings from the process environment and `db`.
    pub fn resolve(db: Option<&ConfigDb>) -> Result<Self> {
        Self::resolve_with(db, |name| std::env::var(name).ok())
    }

    /// Resolve settings with an explicit environment lookup.
    pub fn resolve_with<F>(db: Option<&ConfigDb>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let r = Resolver { db, env };

        let generator: GeneratorKind = r.parse("generator", GeneratorKind::Gemini)?;
        let (default_model, default_url) = match generator {
            GeneratorKind::Gemini => (DEFAULT_GEMINI_MODEL, DEFAULT_GEMINI_BASE_URL),
            GeneratorKind::OpenAi => (DEFAULT_OPENAI_MODEL, DEFAULT_OPENAI_BASE_URL),
        };

        let temperature: f32 = r.parse("temperature", DEFAULT_TEMPERATURE)?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::Config(format!(
                "temperature must be between 0 and 2, got {temperature}"
            )));
        }

        let settings = Self {
            embedding_url: r.string("embedding_url", DEFAULT_EMBEDDING_URL)?,
            embedding_model: r.string("embedding_model", DEFAULT_EMBEDDING_MODEL)?,
            reranker_model: r.string("reranker_model", DEFAULT_RERANKER_MODEL)?,
            generator,
            generation_model: r.string("generation_model", default_model)?,
            generation_url: r.string("generation_url", default_url)?,
            temperature,
            max_tokens: r.positive("max_tokens", DEFAULT_MAX_TOKENS)?,
            candidate_pool: r.positive("candidate_pool", DEFAULT_CANDIDATE_POOL)?,
            answer_top_k: r.positive("answer_top_k", DEFAULT_ANSWER_TOP_K)?,
            search_top_k: r.positive("search_top_k", DEFAULT_SEARCH_TOP_K)?,
            request_timeout_secs: r
                .positive("request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            grounded_template: r.string("grounded_template", DEFAULT_GROUNDED_TEMPLATE)?,
            fallback_template: r.string("fallback_template", DEFAULT_FALLBACK_TEMPLATE)?,
        };
        settings.templates()?;
        Ok(settings)
    }

    /// Check that `value` would be accepted for `key` before storing it.
    pub fn validate_value(key: &str, value: &str) -> Result<()> {
        ensure_known(key)?;
        let wanted = env_var_name(key);
        Self::resolve_with(None, |name| (name == wanted).then(|| value.to_string()))?;
        Ok(())
    }

    /// Resolved values for every key along with where each came from.
    pub fn explain(&self, db: Option<&ConfigDb>) -> Result<Vec<SettingEntry>> {
        self.explain_with(db, |name| std::env::var(name).ok())
    }

    fn explain_with<F>(&self, db: Option<&ConfigDb>, env: F) -> Result<Vec<SettingEntry>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let r = Resolver { db, env };
        self.entries()
            .into_iter()
            .map(|(key, value)| {
                let source = r.raw(key)?.map_or(Source::Default, |(_, s)| s);
                Ok(SettingEntry { key, value, source })
            })
            .collect()
    }

    fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("embedding_url", self.embedding_url.clone()),
            ("embedding_model", self.embedding_model.clone()),
            ("reranker_model", self.reranker_model.clone()),
            ("generator", self.generator.to_string()),
            ("generation_model", self.generation_model.clone()),
            ("generation_url", self.generation_url.clone()),
            ("temperature", self.temperature.to_string()),
            ("max_tokens", self.max_tokens.to_string()),
            ("candidate_pool", self.candidate_pool.to_string()),
            ("answer_top_k", self.answer_top_k.to_string()),
            ("search_top_k", self.search_top_k.to_string()),
            ("request_timeout_secs", self.request_timeout_secs.to_string()),
            ("grounded_template", self.grounded_template.clone()),
            ("fallback_template", self.fallback_template.clone()),
        ]
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn templates(&self) -> Result<PromptTemplates> {
        PromptTemplates::new(
            self.grounded_template.clone(),
            self.fallback_template.clone(),
        )
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            candidate_pool: self.candidate_pool,
            answer_top_k: self.answer_top_k,
            max_tokens: self.max_tokens,
        }
    }

    /// Environment variable holding the generator's API key.
    pub fn generator_key_env(&self) -> &'static str {
        match self.generator {
            GeneratorKind::Gemini => GEMINI_API_KEY_ENV,
            GeneratorKind::OpenAi => OPENAI_API_KEY_ENV,
        }
    }

    pub fn build_embedder(&self) -> Result<Arc<dyn QueryEmbedder>> {
        let embedder = HttpEmbedder::new(
            &self.embedding_url,
            self.embedding_model.clone(),
            std::env::var(EMBEDDING_API_KEY_ENV).ok(),
            self.request_timeout(),
        )?;
        Ok(Arc::new(embedder))
    }

    pub fn build_scorer(&self) -> Arc<dyn PairScorer> {
        Arc::new(ColbertScorer::new(ModelManager::with_model_id(
            self.reranker_model.clone(),
        )))
    }

    pub fn build_generator(&self) -> Result<Arc<dyn Generator>> {
        let key_env = self.generator_key_env();
        let api_key = std::env::var(key_env)
            .map_err(|_| Error::Config(format!("{key_env} is not set")))?;
        self.build_generator_with_key(api_key)
    }

    /// Like [`Settings::build_generator`], but a missing API key yields a
    /// generator that fails every call instead of an error, so retrieval-only
    /// commands work without one.
    pub fn build_generator_or_unconfigured(&self) -> Result<Arc<dyn Generator>> {
        let key_env = self.generator_key_env();
        match std::env::var(key_env) {
            Ok(key) if !key.trim().is_empty() => self.build_generator_with_key(key),
            _ => {
                tracing::warn!("{key_env} is not set; answering questions will fail");
                Ok(Arc::new(UnconfiguredGenerator::new(format!(
                    "{key_env} is not set"
                ))))
            }
        }
    }

    pub fn build_generator_with_key(&self, api_key: String) -> Result<Arc<dyn Generator>> {
        let config = GenerationConfig {
            base_url: self.generation_url.clone(),
            model: self.generation_model.clone(),
            api_key,
            temperature: self.temperature,
            timeout: self.request_timeout(),
        };
        let generator: Arc<dyn Generator> = match self.generator {
            GeneratorKind::Gemini => Arc::new(GeminiGenerator::new(config)?),
            GeneratorKind::OpenAi => Arc::new(OpenAiGenerator::new(config)?),
        };
        Ok(generator)
    }
}
