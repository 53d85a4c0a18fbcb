//! Publication of index/metadata pairs.
//!
//! The two files form one logical unit, so they are never replaced in place.
//! Each build is written into a staging directory, renamed into a new
//! generation directory, and then made current by atomically swapping the
//! `CURRENT` pointer file:
//!
//! ```text
//! index/
//!   CURRENT                 -> "gen-1718000000000000000"
//!   gen-1718000000000000000/
//!     index.redb
//!     meta.jsonl
//! ```
//!
//! A reader that resolves `CURRENT` sees either the previous complete pair or
//! the new complete pair. The generation that was current before a publish is
//! never pruned by that publish, so a reader that resolved the old pointer can
//! still open both of its files. A crash before the pointer swap leaves an
//! orphaned directory that a later publish prunes.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    error::{Error, Result},
    index::{Index, MetadataStore},
};

pub const CURRENT_FILE: &str = "CURRENT";
pub const INDEX_FILE: &str = "index.redb";
pub const METADATA_FILE: &str = "meta.jsonl";

const GENERATION_PREFIX: &str = "gen-";
const STAGING_PREFIX: &str = ".staging-";

/// Paths of one published index/metadata pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub generation: String,
    pub index: PathBuf,
    pub metadata: PathBuf,
}

/// A directory of published index generations.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths_for(&self, generation: &str) -> ArtifactPaths {
        let dir = self.root.join(generation);
        ArtifactPaths {
            generation: generation.to_string(),
            index: dir.join(INDEX_FILE),
            metadata: dir.join(METADATA_FILE),
        }
    }

    /// Whether a `CURRENT` pointer exists, valid or not.
    pub fn has_published(&self) -> bool {
        self.root.join(CURRENT_FILE).is_file()
    }

    /// Resolve the currently published pair.
    pub fn current(&self) -> Result<ArtifactPaths> {
        let pointer = self.root.join(CURRENT_FILE);
        let generation = match fs::read_to_string(&pointer) {
            Ok(contents) => contents.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::IndexLoad(format!(
                    "no index has been published in {}",
                    self.root.display()
                )));
            }
            Err(e) => {
                return Err(Error::IndexLoad(format!(
                    "{}: {e}",
                    pointer.display()
                )));
            }
        };

        if !is_generation_name(&generation) {
            return Err(Error::IndexLoad(format!(
                "{} names an invalid generation '{generation}'",
                pointer.display()
            )));
        }

        Ok(self.paths_for(&generation))
    }

    /// Write both artifacts and make them current.
    ///
    /// Generations beyond the newest `keep` (at least the new one) are removed
    /// afterwards, except the one that was current until now. Failing to
    /// remove one is logged and otherwise ignored.
    pub fn publish(
        &self,
        index: &Index,
        metadata: &MetadataStore,
        keep: usize,
    ) -> Result<ArtifactPaths> {
        if index.len() != metadata.len() {
            return Err(Error::InvalidArgument(format!(
                "index has {} vectors but metadata has {} records",
                index.len(),
                metadata.len()
            )));
        }

        fs::create_dir_all(&self.root)
            .map_err(|_| Error::DataDir(self.root.clone()))?;

        let generation = new_generation_name();
        let staging = self.root.join(format!("{STAGING_PREFIX}{generation}"));
        fs::create_dir_all(&staging)?;

        let staged = (|| -> Result<()> {
            index.write(&staging.join(INDEX_FILE))?;
            metadata.write(&staging.join(METADATA_FILE))?;
            Ok(())
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let paths = self.paths_for(&generation);
        fs::rename(&staging, self.root.join(&generation))?;
        sync_dir(&self.root)?;

        let previous = self.current().ok().map(|p| p.generation);

        let pointer_tmp = self.root.join(format!("{CURRENT_FILE}.{generation}.tmp"));
        let swapped = (|| -> Result<()> {
            let mut file = File::create(&pointer_tmp)?;
            writeln!(file, "{generation}")?;
            file.sync_all()?;
            fs::rename(&pointer_tmp, self.root.join(CURRENT_FILE))?;
            Ok(())
        })();
        if let Err(e) = swapped {
            let _ = fs::remove_file(&pointer_tmp);
            return Err(e);
        }
        sync_dir(&self.root)?;

        tracing::info!(
            generation = %generation,
            vectors = index.len(),
            dimension = index.dimension(),
            "published index"
        );

        let protected: Vec<&str> = std::iter::once(generation.as_str())
            .chain(previous.as_deref())
            .collect();
        self.prune(&protected, keep.max(1));
        self.sweep_staging(&generation);
        Ok(paths)
    }

    /// Published generation names, oldest first.
    pub fn generations(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_generation_name(&name) && entry.path().is_dir() {
                names.push(name);
            }
        }
        names.sort_by_key(|name| generation_sort_key(name));
        Ok(names)
    }

    fn prune(&self, protected: &[&str], keep: usize) {
        let generations = match self.generations() {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!("could not list index generations: {e}");
                return;
            }
        };

        let excess = generations.len().saturating_sub(keep);
        for name in generations.iter().take(excess) {
            if protected.contains(&name.as_str()) {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(self.root.join(name)) {
                tracing::warn!(generation = %name, "could not remove old generation: {e}");
            } else {
                tracing::debug!(generation = %name, "removed old generation");
            }
        }
    }

    /// Remove staging directories of interrupted builds that started before
    /// `own`. Newer ones may belong to a build that is still running.
    fn sweep_staging(&self, own: &str) {
        let own_key = generation_sort_key(own);
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(generation) = name.strip_prefix(STAGING_PREFIX) else {
                continue;
            };
            if is_generation_name(generation) && generation_sort_key(generation) < own_key {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
}

fn new_generation_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{GENERATION_PREFIX}{nanos}")
}

fn is_generation_name(name: &str) -> bool {
    name.strip_prefix(GENERATION_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

fn generation_sort_key(name: &str) -> u128 {
    name.strip_prefix(GENERATION_PREFIX)
        .and_then(|rest| rest.parse().ok())
        .unwrap_or_default()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::{Chunk, EmbeddedChunk},
        index,
    };

    fn corpus(n: usize) -> (Index, MetadataStore) {
        let chunks = (0..n)
            .map(|i| {
                let mut embedding = vec![0.1; 4];
                embedding[i % 4] = 1.0;
                EmbeddedChunk::new(Chunk::new(format!("doc{i}"), 0, "text"), embedding)
            })
            .collect();
        index::build(chunks).unwrap()
    }

    #[test]
    fn current_without_publish_is_a_load_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        assert!(matches!(store.current().unwrap_err(), Error::IndexLoad(_)));
        assert!(!store.has_published());
    }

    #[test]
    fn publish_makes_pair_current() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (index, metadata) = corpus(3);

        let published = store.publish(&index, &metadata, 1).unwrap();
        let current = store.current().unwrap();

        assert_eq!(published, current);
        assert!(store.has_published());
        assert!(current.index.is_file());
        assert!(current.metadata.is_file());
        assert_eq!(Index::read(&current.index).unwrap(), index);
        assert_eq!(MetadataStore::read(&current.metadata).unwrap(), metadata);
    }

    #[test]
    fn republish_keeps_the_pair_readers_may_still_hold() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());

        let (index, metadata) = corpus(2);
        let first = store.publish(&index, &metadata, 1).unwrap();
        // A reader resolves CURRENT just before the next publish.
        let resolved = store.current().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let (index, metadata) = corpus(5);
        let second = store.publish(&index, &metadata, 1).unwrap();

        assert_ne!(first.generation, second.generation);
        assert_eq!(store.current().unwrap(), second);
        assert_eq!(
            store.generations().unwrap(),
            vec![first.generation.clone(), second.generation.clone()]
        );
        assert_eq!(Index::read(&resolved.index).unwrap().len(), 2);
        assert_eq!(MetadataStore::read(&resolved.metadata).unwrap().len(), 2);
    }

    #[test]
    fn third_publish_prunes_the_oldest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (index, metadata) = corpus(2);

        let first = store.publish(&index, &metadata, 1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.publish(&index, &metadata, 1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let third = store.publish(&index, &metadata, 1).unwrap();

        assert_eq!(
            store.generations().unwrap(),
            vec![second.generation, third.generation]
        );
        assert!(!first.index.exists());
    }

    #[test]
    fn publish_only_sweeps_older_staging_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let stale = tmp.path().join(format!("{STAGING_PREFIX}{GENERATION_PREFIX}1"));
        let running = tmp
            .path()
            .join(format!("{STAGING_PREFIX}{GENERATION_PREFIX}{}", u128::MAX));
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::create_dir_all(&running).unwrap();

        let (index, metadata) = corpus(2);
        store.publish(&index, &metadata, 1).unwrap();

        assert!(!stale.exists());
        assert!(running.exists());
    }

    #[test]
    fn publish_leaves_no_pointer_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (index, metadata) = corpus(2);
        store.publish(&index, &metadata, 1).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        assert!(store.has_published());
    }

    #[test]
    fn keep_retains_previous_generations() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (index, metadata) = corpus(2);

        let first = store.publish(&index, &metadata, 2).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.publish(&index, &metadata, 2).unwrap();

        assert_eq!(
            store.generations().unwrap(),
            vec![first.generation, second.generation]
        );
    }

    #[test]
    fn publish_rejects_misaligned_pair() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (index, _) = corpus(3);
        let (_, metadata) = corpus(2);

        assert!(store.publish(&index, &metadata, 1).is_err());
        assert!(store.current().is_err());
        assert!(store.generations().unwrap().is_empty());
    }

    #[test]
    fn failed_build_publishes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let chunks = vec![
            EmbeddedChunk::new(Chunk::new("a", 0, "x"), vec![1.0; 128]),
            EmbeddedChunk::new(Chunk::new("b", 0, "y"), vec![1.0; 384]),
        ];

        let result = index::build(chunks)
            .and_then(|(index, metadata)| store.publish(&index, &metadata, 1));

        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
        assert!(store.current().is_err());
        assert!(store.generations().unwrap().is_empty());
    }

    #[test]
    fn pointer_to_bogus_generation_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CURRENT_FILE), "../../etc\n").unwrap();
        let store = ArtifactStore::new(tmp.path());
        assert!(matches!(store.current().unwrap_err(), Error::IndexLoad(_)));
    }
}
