//! Build execution.
//!
//! A build runs as a detached task tracked by the [`BuildSupervisor`], never
//! as part of the request that triggered it: the caller may have been
//! answered (or disconnected) long before the build finishes.  Each build
//! owns its lock guard and a fresh scratch directory, both released on every
//! exit path.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backend::ArtifactBackend;
use crate::compute::{ArtifactId, DeltaComputer, DeltaEvent, DeltaJob};
use crate::lock::BuildLock;
use crate::reference::ResolvedDelta;
use crate::registry::Registry;
use crate::{Error, Result};

/// Prefix of per-build scratch directories under the work dir.
pub const WORKDIR_PREFIX: &str = "delta-build-";

/// Pull both images concurrently, then drive the computer to completion.
pub async fn pull_and_compute(
    registry: &dyn Registry,
    computer: &dyn DeltaComputer,
    delta: &ResolvedDelta,
    build_id: &str,
    workdir: &Path,
) -> Result<ArtifactId> {
    tokio::try_join!(
        registry.pull(delta.src.as_str()),
        registry.pull(delta.dest.as_str())
    )?;
    info!(key = %delta.key, "source and destination pulled");

    let mut events = computer.compute(DeltaJob {
        src: delta.src.as_str().to_string(),
        dest: delta.dest.as_str().to_string(),
        build_id: build_id.to_string(),
        workdir: workdir.to_path_buf(),
    });

    while let Some(event) = events.next().await {
        match event? {
            DeltaEvent::Progress { step, detail } => {
                info!(key = %delta.key, step, detail = %detail, "delta progress");
            }
            DeltaEvent::Complete(artifact) => {
                debug!(key = %delta.key, artifact = %artifact.0, "delta computed");
                return Ok(artifact);
            }
        }
    }

    Err(Error::Build(
        "delta computation ended without an artifact".into(),
    ))
}

/// Runs the pipeline of one backend under a held lock.
pub struct BuildExecutor {
    backend: Arc<dyn ArtifactBackend>,
    work_dir: PathBuf,
}

impl BuildExecutor {
    pub fn new(backend: Arc<dyn ArtifactBackend>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            work_dir: work_dir.into(),
        }
    }

    /// Build `delta`, then release `lock` whatever the outcome.
    pub async fn execute(&self, delta: ResolvedDelta, lock: BuildLock, build_id: String) -> Result<()> {
        let started = Instant::now();
        info!(
            format = self.backend.format().as_str(),
            src = %delta.src,
            dest = %delta.dest,
            key = %delta.key,
            build_id = %build_id,
            "delta build started"
        );

        let result = self.run_in_workdir(&delta, &build_id).await;

        if let Err(e) = lock.release().await {
            warn!(key = %delta.key, error = %e, "failed to release build lock");
        }

        match &result {
            Ok(()) => info!(
                key = %delta.key,
                build_id = %build_id,
                elapsed = ?started.elapsed(),
                "delta build finished"
            ),
            Err(e) => error!(
                src = %delta.src,
                dest = %delta.dest,
                key = %delta.key,
                build_id = %build_id,
                elapsed = ?started.elapsed(),
                error = %e,
                "delta build failed"
            ),
        }
        result
    }

    async fn run_in_workdir(&self, delta: &ResolvedDelta, build_id: &str) -> Result<()> {
        let workdir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir_in(&self.work_dir)?;
        debug!(path = %workdir.path().display(), "build workdir created");

        let result = self.backend.build(delta, build_id, workdir.path()).await;

        if let Err(e) = workdir.close() {
            warn!(key = %delta.key, error = %e, "failed to remove build workdir");
        }
        result
    }
}

/// Remove scratch directories left behind by a process that died mid-build.
pub fn sweep_work_dir(work_dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(work_dir)?;
    let mut removed = 0;
    for entry in std::fs::read_dir(work_dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(WORKDIR_PREFIX) {
            continue;
        }
        std::fs::remove_dir_all(entry.path())?;
        info!(path = %entry.path().display(), "removed orphaned build workdir");
        removed += 1;
    }
    Ok(removed)
}

/// Registry of detached build tasks.
#[derive(Clone, Default)]
pub struct BuildSupervisor {
    tracker: TaskTracker,
}

impl BuildSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `build` detached from the caller.  Awaiting the handle is
    /// optional; dropping it does not cancel the build.
    pub fn spawn<F>(&self, build: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(build)
    }

    /// Builds currently running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting builds and wait for the running ones to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(active = self.tracker.len(), "waiting for running builds");
        }
        self.tracker.wait().await;
    }
}
