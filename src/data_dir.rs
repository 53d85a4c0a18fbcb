use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "ARCHIVIST_DATA_DIR";

const APP_PREFIX: &str = "archivist";
const CONFIG_DB_FILE: &str = "config.redb";
const INDEX_DIR: &str = "index";

/// Root of everything archivist persists: `config.redb` and the published
/// index generations under `index/`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// `--data-dir`, then `ARCHIVIST_DATA_DIR`, then the XDG data home
    /// (`~/.local/share/archivist`). The directory is created if missing.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        Self::resolve_from(explicit, std::env::var(DATA_DIR_ENV_VAR).ok())
    }

    fn resolve_from(explicit: Option<&Path>, env: Option<String>) -> Result<Self> {
        let root = match (explicit, env.filter(|v| !v.trim().is_empty())) {
            (Some(path), _) => path.to_path_buf(),
            (None, Some(val)) => PathBuf::from(val),
            (None, None) => xdg::BaseDirectories::with_prefix(APP_PREFIX)
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config("could not determine XDG data home directory".into())
                })?,
        };

        ensure_dir(&root)?;
        tracing::debug!(root = %root.display(), "resolved data directory");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join(CONFIG_DB_FILE)
    }

    /// Directory holding published index generations and `CURRENT`.
    pub fn index_dir(&self) -> Result<PathBuf> {
        let path = self.root.join(INDEX_DIR);
        ensure_dir(&path)?;
        Ok(path)
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|_| Error::DataDir(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins_over_env() {
        let tmp = tempfile::tempdir().unwrap();
        let other = tmp.path().join("from-env");
        let dir = DataDir::resolve_from(
            Some(tmp.path()),
            Some(other.display().to_string()),
        )
        .unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.config_db(), tmp.path().join("config.redb"));
        assert!(!other.exists());
    }

    #[test]
    fn env_path_is_used_and_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = DataDir::resolve_from(None, Some(nested.display().to_string())).unwrap();

        assert_eq!(dir.root(), nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn index_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let index = dir.index_dir().unwrap();

        assert!(index.is_dir());
        assert_eq!(index, tmp.path().join("index"));
    }

    #[test]
    fn unwritable_root_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain-file");
        std::fs::write(&file, "x").unwrap();

        let err = DataDir::resolve(Some(&file.join("below"))).unwrap_err();
        assert!(matches!(err, Error::DataDir(_)));
    }
}
