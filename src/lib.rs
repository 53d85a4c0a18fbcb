//! archivist - retrieval-augmented question answering over a fixed lore archive.
//!
//! An offline builder (`archivist-index`) turns embedded chunks into a
//! published index/metadata pair. At query time a question is embedded,
//! matched against the index by exact cosine similarity, reranked with a
//! pairwise scorer, assembled into a grounded or fallback prompt, and handed
//! to a text generator.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use archivist::{ArtifactStore, ConfigDb, DataDir, QueryPipeline, Settings, VectorSearchEngine};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config_db = ConfigDb::open(&data_dir.config_db()).unwrap();
//! let settings = Settings::resolve(Some(&config_db)).unwrap();
//!
//! let store = ArtifactStore::new(data_dir.index_dir().unwrap());
//! let engine = VectorSearchEngine::load_published(&store.current().unwrap()).unwrap();
//!
//! let pipeline = QueryPipeline::new(
//!     Arc::new(engine),
//!     settings.build_embedder().unwrap(),
//!     settings.build_scorer(),
//!     settings.build_generator().unwrap(),
//!     settings.templates().unwrap(),
//!     settings.pipeline_options(),
//! )
//! .unwrap();
//!
//! let answer = pipeline.ask("Who is Hoid?").unwrap();
//! println!("{} ({} context)", answer.text, answer.template);
//! ```

pub mod artifacts;
pub mod chunk;
pub mod cli;
pub mod config_db;
pub mod context;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod http;
pub mod index;
pub mod mcp;
pub mod model_manager;
pub mod pipeline;
pub mod reranker;
pub mod search;
pub mod settings;
pub mod vector;

#[cfg(test)]
mod test_support;

pub use artifacts::ArtifactStore;
pub use chunk::{Candidate, Chunk, EmbeddedChunk, RerankedCandidate};
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use index::{Index, MetadataStore};
pub use model_manager::ModelManager;
pub use pipeline::{Answer, QueryPipeline, Stage};
pub use search::VectorSearchEngine;
pub use settings::Settings;
