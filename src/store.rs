//! Patch-file artifact store.
//!
//! Blobs live at `<dir>/<key>.delta`.  Writes go to a hidden temp file in the
//! same directory and are renamed into place, so a reader never observes a
//! partial artifact and a failed build leaves nothing behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tracing::{debug, info};

use crate::reference::DeltaKey;
use crate::{Error, Result};

const ARTIFACT_EXTENSION: &str = "delta";
const PARTIAL_PREFIX: &str = ".partial-";

pub struct ArtifactStore {
    dir: PathBuf,
}

/// An opened artifact ready to stream.
pub struct StoredArtifact {
    pub file: File,
    pub len: u64,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::Config(format!("failed to create store dir {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &DeltaKey) -> PathBuf {
        self.dir
            .join(format!("{}.{ARTIFACT_EXTENSION}", key.file_stem()))
    }

    pub async fn exists(&self, key: &DeltaKey) -> Result<bool> {
        Ok(fs::try_exists(self.path(key)).await?)
    }

    /// Copy `source` into the store under `key`.  Returns the stored size.
    pub async fn put_file(&self, key: &DeltaKey, source: &Path) -> Result<u64> {
        let partial = self.dir.join(format!(
            "{PARTIAL_PREFIX}{}-{}",
            key.file_stem(),
            uuid::Uuid::now_v7()
        ));

        let copied = match fs::copy(source, &partial).await {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };

        if let Err(e) = fs::rename(&partial, self.path(key)).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }

        debug!(%key, bytes = copied, "stored artifact");
        Ok(copied)
    }

    /// Open the artifact for `key`, failing with [`Error::NotFound`] if it was
    /// never stored.
    pub async fn open(&self, key: &DeltaKey) -> Result<StoredArtifact> {
        let file = match File::open(self.path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        Ok(StoredArtifact { file, len })
    }

    /// Remove temp files left by a process that died mid-write.
    pub fn clear_partial(&self) -> Result<usize> {
        let mut cleared = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
                continue;
            }
            std::fs::remove_file(entry.path())?;
            info!(path = %entry.path().display(), "removed partial artifact");
            cleared += 1;
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn key() -> DeltaKey {
        DeltaKey::parse("bbbbbbbb:delta-aaaaaaaaaaaaaaaa").unwrap()
    }

    #[tokio::test]
    async fn put_then_open_round_trips_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("store")).unwrap();
        let source = tmp.path().join("patch");
        std::fs::write(&source, vec![7u8; 4096]).unwrap();

        assert!(!store.exists(&key()).await.unwrap());
        assert_eq!(store.put_file(&key(), &source).await.unwrap(), 4096);
        assert!(store.exists(&key()).await.unwrap());

        let mut stored = store.open(&key()).await.unwrap();
        assert_eq!(stored.len, 4096);
        let mut buf = Vec::new();
        stored.file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, vec![7u8; 4096]);
    }

    #[tokio::test]
    async fn open_unknown_key_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path()).unwrap();
        let err = store.open(&key()).await.err().unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_put_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("store")).unwrap();
        let err = store.put_file(&key(), &tmp.path().join("missing")).await;
        assert!(err.is_err());
        assert!(!store.exists(&key()).await.unwrap());
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[test]
    fn clear_partial_keeps_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path()).unwrap();
        std::fs::write(tmp.path().join(".partial-x-1"), b"half").unwrap();
        std::fs::write(tmp.path().join("bbbb_delta-aaaa.delta"), b"whole").unwrap();

        assert_eq!(store.clear_partial().unwrap(), 1);
        assert!(tmp.path().join("bbbb_delta-aaaa.delta").exists());
    }
}
