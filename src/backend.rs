//! Artifact formats.
//!
//! Both formats share parsing, locking, caching and the pull → compute
//! pipeline; they differ only in where the artifact lives and how a caller
//! reaches it:
//!
//! - [`ImageBackend`]: the delta is a tagged image in the registry, which is
//!   also the cache.
//! - [`PatchBackend`]: the delta is a blob in the local [`ArtifactStore`],
//!   fetched through a companion download route.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::compute::DeltaComputer;
use crate::executor::pull_and_compute;
use crate::reference::{DeltaKey, ResolvedDelta};
use crate::registry::Registry;
use crate::store::{ArtifactStore, StoredArtifact};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Image,
    Patch,
}

impl ArtifactFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactFormat::Image => "image",
            ArtifactFormat::Patch => "patch",
        }
    }
}

/// How a caller reaches a finished artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Pull this image reference.
    Image { name: String },
    /// Download from this location.
    Download { location: String },
}

#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    fn format(&self) -> ArtifactFormat;

    /// Whether the artifact for `delta` has already been published.
    async fn exists(&self, delta: &ResolvedDelta) -> Result<bool>;

    /// Run the full pipeline for `delta` inside `workdir`.  Called with the
    /// build lock held.
    async fn build(&self, delta: &ResolvedDelta, build_id: &str, workdir: &Path) -> Result<()>;

    /// Where a caller finds the published artifact.
    fn fetch(&self, delta: &ResolvedDelta) -> Artifact;

    /// Open the stored bytes for `key`, for formats served by this process.
    async fn open(&self, key: &DeltaKey) -> Result<StoredArtifact> {
        Err(Error::NotFound(key.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Image-native
// ---------------------------------------------------------------------------

pub struct ImageBackend {
    registry: Arc<dyn Registry>,
    computer: Arc<dyn DeltaComputer>,
}

impl ImageBackend {
    pub fn new(registry: Arc<dyn Registry>, computer: Arc<dyn DeltaComputer>) -> Self {
        Self { registry, computer }
    }

    async fn publish(&self, local: &str, delta: &ResolvedDelta) -> Result<()> {
        self.registry.tag(local, &delta.path).await?;
        self.registry.push(&delta.path).await?;
        info!(key = %delta.key, path = %delta.path, "delta image pushed");
        Ok(())
    }
}

#[async_trait]
impl ArtifactBackend for ImageBackend {
    fn format(&self) -> ArtifactFormat {
        ArtifactFormat::Image
    }

    async fn exists(&self, delta: &ResolvedDelta) -> Result<bool> {
        self.registry.tag_exists(&delta.path).await
    }

    async fn build(&self, delta: &ResolvedDelta, build_id: &str, workdir: &Path) -> Result<()> {
        let artifact =
            pull_and_compute(&*self.registry, &*self.computer, delta, build_id, workdir).await?;

        let published = self.publish(&artifact.0, delta).await;

        // The registry is the durable copy; local images go either way.
        let local = vec![artifact.0.clone(), delta.path.clone()];
        if let Err(e) = self.registry.remove_local(&local).await {
            warn!(key = %delta.key, error = %e, "failed to remove local delta images");
        }

        published
    }

    fn fetch(&self, delta: &ResolvedDelta) -> Artifact {
        Artifact::Image {
            name: delta.path.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Patch-file
// ---------------------------------------------------------------------------

pub struct PatchBackend {
    registry: Arc<dyn Registry>,
    computer: Arc<dyn DeltaComputer>,
    store: Arc<ArtifactStore>,
    download_route: String,
}

impl PatchBackend {
    /// `download_route` is the path of the download endpoint; the key is
    /// appended as the `delta` query parameter.
    pub fn new(
        registry: Arc<dyn Registry>,
        computer: Arc<dyn DeltaComputer>,
        store: Arc<ArtifactStore>,
        download_route: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            computer,
            store,
            download_route: download_route.into(),
        }
    }
}

#[async_trait]
impl ArtifactBackend for PatchBackend {
    fn format(&self) -> ArtifactFormat {
        ArtifactFormat::Patch
    }

    async fn exists(&self, delta: &ResolvedDelta) -> Result<bool> {
        self.store.exists(&delta.key).await
    }

    async fn build(&self, delta: &ResolvedDelta, build_id: &str, workdir: &Path) -> Result<()> {
        let artifact =
            pull_and_compute(&*self.registry, &*self.computer, delta, build_id, workdir).await?;
        let bytes = self.store.put_file(&delta.key, Path::new(&artifact.0)).await?;
        info!(key = %delta.key, bytes, "delta patch stored");
        Ok(())
    }

    fn fetch(&self, delta: &ResolvedDelta) -> Artifact {
        Artifact::Download {
            location: format!("{}?delta={}", self.download_route, delta.key),
        }
    }

    async fn open(&self, key: &DeltaKey) -> Result<StoredArtifact> {
        self.store.open(key).await
    }
}
