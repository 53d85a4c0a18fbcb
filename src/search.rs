use std::{cmp::Ordering, path::Path};

use rayon::prelude::*;

use crate::{
    artifacts::ArtifactPaths,
    chunk::Candidate,
    error::{Error, Result},
    index::{Index, MetadataStore},
    vector,
};

/// Exact nearest-neighbor search over a loaded index/metadata pair.
///
/// The engine owns both artifacts and never mutates them, so a single
/// instance can be shared across threads behind an `Arc` without locking.
#[derive(Debug)]
pub struct VectorSearchEngine {
    index: Index,
    metadata: MetadataStore,
}

impl VectorSearchEngine {
    /// Load a persisted pair, refusing to serve if the two disagree in size.
    pub fn load(index_path: &Path, metadata_path: &Path) -> Result<Self> {
        let index = Index::read(index_path)?;
        let metadata = MetadataStore::read(metadata_path)?;
        let engine = Self::from_parts(index, metadata)?;

        tracing::info!(
            vectors = engine.len(),
            dimension = engine.dimension(),
            index = %index_path.display(),
            "loaded index"
        );
        Ok(engine)
    }

    pub fn load_published(paths: &ArtifactPaths) -> Result<Self> {
        Self::load(&paths.index, &paths.metadata)
    }

    /// Assemble an engine from in-memory artifacts.
    pub fn from_parts(index: Index, metadata: MetadataStore) -> Result<Self> {
        if index.len() != metadata.len() {
            return Err(Error::IndexLoad(format!(
                "index holds {} vectors but metadata holds {} records",
                index.len(),
                metadata.len()
            )));
        }
        Ok(Self { index, metadata })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    /// Return the `top_k` stored chunks most similar to `query`.
    ///
    /// Scores are exact cosine similarities (the query is normalized the same
    /// way vectors were at build time). Results are ordered by score
    /// descending, then by index id ascending, so identical queries always
    /// produce identical output. `top_k` larger than the index clamps.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Candidate>> {
        if top_k == 0 {
            return Err(Error::InvalidArgument(
                "top_k must be greater than zero".to_string(),
            ));
        }
        if query.len() != self.dimension() {
            return Err(Error::DimensionMismatch {
                subject: "query embedding".to_string(),
                expected: self.dimension(),
                found: query.len(),
            });
        }

        let mut query = query.to_vec();
        if !vector::normalize(&mut query) {
            return Err(Error::InvalidArgument(
                "query embedding has zero norm or non-finite values".to_string(),
            ));
        }

        let scores: Vec<f32> = self
            .index
            .as_flat()
            .par_chunks_exact(self.dimension())
            .map(|row| vector::dot(row, &query))
            .collect();

        let ranked = top_k_by_score(&scores, top_k);

        ranked
            .into_iter()
            .map(|id| {
                let chunk = self.metadata.get(id).cloned().ok_or_else(|| {
                    Error::IndexLoad(format!("no metadata for vector {id}"))
                })?;
                Ok(Candidate {
                    id,
                    chunk,
                    score: scores[id],
                })
            })
            .collect()
    }
}

/// Order by score descending, then id ascending.
fn rank_order(scores: &[f32], a: usize, b: usize) -> Ordering {
    scores[b].total_cmp(&scores[a]).then(a.cmp(&b))
}

/// Ids of the `k` best scores, best first.
fn top_k_by_score(scores: &[f32], k: usize) -> Vec<usize> {
    let k = k.min(scores.len());
    let mut ids: Vec<usize> = (0..scores.len()).collect();
    if k == 0 {
        return Vec::new();
    }
    if k < ids.len() {
        ids.select_nth_unstable_by(k - 1, |&a, &b| rank_order(scores, a, b));
        ids.truncate(k);
    }
    ids.sort_unstable_by(|&a, &b| rank_order(scores, a, b));
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifacts::ArtifactStore,
        chunk::{Chunk, EmbeddedChunk},
        index,
    };

    fn engine_from(embeddings: Vec<(&str, Vec<f32>)>) -> VectorSearchEngine {
        let chunks = embeddings
            .into_iter()
            .map(|(doc, emb)| EmbeddedChunk::new(Chunk::new(doc, 0, format!("{doc} text")), emb))
            .collect();
        let (index, metadata) = index::build(chunks).unwrap();
        VectorSearchEngine::from_parts(index, metadata).unwrap()
    }

    fn sample_embeddings() -> Vec<(&'static str, Vec<f32>)> {
        vec![
            ("a", vec![0.9, 0.1, 0.0, 0.2]),
            ("b", vec![0.1, 0.8, 0.3, 0.0]),
            ("c", vec![0.0, 0.2, 0.9, 0.1]),
            ("d", vec![0.3, 0.3, 0.3, 0.9]),
            ("e", vec![-0.5, 0.4, 0.1, 0.6]),
        ]
    }

    #[test]
    fn every_chunk_retrieves_itself_first() {
        let embeddings = sample_embeddings();
        let engine = engine_from(embeddings.clone());

        for (id, (doc, emb)) in embeddings.iter().enumerate() {
            let results = engine.search(emb, 1).unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].id, id);
            assert_eq!(results[0].chunk.doc_id, *doc);
            assert!((results[0].score - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn scores_are_cosine_regardless_of_query_scale() {
        let engine = engine_from(vec![("x", vec![1.0, 0.0]), ("y", vec![1.0, 1.0])]);

        let results = engine.search(&[10.0, 0.0], 2).unwrap();
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert!((results[1].score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn results_are_sorted_descending() {
        let engine = engine_from(sample_embeddings());
        let results = engine.search(&[0.5, 0.5, 0.5, 0.5], 5).unwrap();

        assert_eq!(results.len(), 5);
        for window in results.windows(2) {
            assert!(window[0].score >= window[1].score);
        }
    }

    #[test]
    fn equal_scores_rank_lower_id_first() {
        let engine = engine_from(vec![
            ("far", vec![0.0, 1.0]),
            ("tie-1", vec![1.0, 1.0]),
            ("tie-2", vec![1.0, 1.0]),
            ("tie-3", vec![1.0, 1.0]),
        ]);

        for _ in 0..20 {
            let results = engine.search(&[1.0, 1.0], 3).unwrap();
            let ids: Vec<usize> = results.iter().map(|c| c.id).collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }
    }

    #[test]
    fn tie_break_applies_at_the_cutoff() {
        let engine = engine_from(vec![
            ("tie-a", vec![1.0, 0.0]),
            ("tie-b", vec![1.0, 0.0]),
            ("tie-c", vec![1.0, 0.0]),
        ]);

        let results = engine.search(&[1.0, 0.0], 2).unwrap();
        let ids: Vec<usize> = results.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn top_k_clamps_to_index_size() {
        let engine = engine_from(sample_embeddings());
        let results = engine.search(&[1.0, 0.0, 0.0, 0.0], 50).unwrap();
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn zero_top_k_is_rejected() {
        let engine = engine_from(sample_embeddings());
        assert!(matches!(
            engine.search(&[1.0, 0.0, 0.0, 0.0], 0).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn wrong_query_dimension_is_rejected() {
        let engine = engine_from(sample_embeddings());
        match engine.search(&[1.0, 0.0], 3).unwrap_err() {
            Error::DimensionMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, 4);
                assert_eq!(found, 2);
            }
            other => panic!("expected dimension mismatch, got {other}"),
        }
    }

    #[test]
    fn zero_query_is_rejected() {
        let engine = engine_from(sample_embeddings());
        assert!(matches!(
            engine.search(&[0.0; 4], 1).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn mismatched_parts_refuse_to_load() {
        let (index, _) = index::build(vec![
            EmbeddedChunk::new(Chunk::new("a", 0, "x"), vec![1.0, 0.0]),
            EmbeddedChunk::new(Chunk::new("b", 0, "y"), vec![0.0, 1.0]),
        ])
        .unwrap();
        let metadata = MetadataStore::from(vec![Chunk::new("a", 0, "x")]);

        assert!(matches!(
            VectorSearchEngine::from_parts(index, metadata).unwrap_err(),
            Error::IndexLoad(_)
        ));
    }

    #[test]
    fn loads_published_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (index, metadata) = index::build(
            sample_embeddings()
                .into_iter()
                .map(|(doc, emb)| EmbeddedChunk::new(Chunk::new(doc, 0, "t"), emb))
                .collect(),
        )
        .unwrap();
        let paths = store.publish(&index, &metadata, 1).unwrap();

        let engine = VectorSearchEngine::load_published(&paths).unwrap();
        assert_eq!(engine.len(), 5);
        assert_eq!(engine.dimension(), 4);
    }

    #[test]
    fn torn_pair_on_disk_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (index, metadata) = index::build(
            sample_embeddings()
                .into_iter()
                .map(|(doc, emb)| EmbeddedChunk::new(Chunk::new(doc, 0, "t"), emb))
                .collect(),
        )
        .unwrap();
        let paths = store.publish(&index, &metadata, 1).unwrap();

        // Simulate a metadata file from a different build.
        MetadataStore::from(vec![Chunk::new("only", 0, "one")])
            .write(&paths.metadata)
            .unwrap();

        let err = VectorSearchEngine::load_published(&paths).unwrap_err();
        assert!(matches!(err, Error::IndexLoad(_)));
    }

    #[test]
    fn missing_metadata_file_is_a_load_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (index, _) = index::build(vec![EmbeddedChunk::new(
            Chunk::new("a", 0, "x"),
            vec![1.0],
        )])
        .unwrap();
        let index_path = tmp.path().join("index.redb");
        index.write(&index_path).unwrap();

        let err = VectorSearchEngine::load(&index_path, &tmp.path().join("meta.jsonl"))
            .unwrap_err();
        assert!(matches!(err, Error::IndexLoad(_)));
    }

    #[test]
    fn top_k_selection_matches_full_sort() {
        let scores = vec![0.3, 0.9, 0.1, 0.9, 0.5, 0.3, -0.2];
        let mut full: Vec<usize> = (0..scores.len()).collect();
        full.sort_by(|&a, &b| rank_order(&scores, a, b));

        for k in 1..=scores.len() {
            assert_eq!(top_k_by_score(&scores, k), full[..k].to_vec());
        }
    }
}
