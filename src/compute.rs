//! Delta computation capability.
//!
//! A [`DeltaComputer`] turns a (src, dest) pair into an artifact.  The
//! coordinator never looks inside: it drains the event stream, logs progress
//! and keeps the terminal [`ArtifactId`] (or error).  Streams are lazy; no
//! work starts until the first poll.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};

use crate::process;
use crate::registry::Buildah;
use crate::{Error, Result};

/// Stage reference emitted by `deltaimage docker-file`, rewritten to the
/// build context where the binary is copied.
const DELTAIMAGE_STAGE: &str = "--from=deltaimage/deltaimage:0.1.0 /opt";

/// Output of a computation: a local image name or a file path, depending on
/// the computer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactId(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaEvent {
    Progress { step: &'static str, detail: String },
    Complete(ArtifactId),
}

pub type DeltaStream = BoxStream<'static, Result<DeltaEvent>>;

/// Inputs for one computation.
#[derive(Debug, Clone)]
pub struct DeltaJob {
    /// Source image as pulled.
    pub src: String,
    /// Destination image as pulled.
    pub dest: String,
    /// Unique per build attempt; used to name intermediate images.
    pub build_id: String,
    /// Scratch directory owned by this build.
    pub workdir: PathBuf,
}

pub trait DeltaComputer: Send + Sync {
    fn compute(&self, job: DeltaJob) -> DeltaStream;
}

// ---------------------------------------------------------------------------
// deltaimage
// ---------------------------------------------------------------------------

/// Produces an image-native delta with `deltaimage` + `buildah`:
/// diff Dockerfile → diff image → apply Dockerfile → delta image.
pub struct DeltaimageComputer {
    deltaimage: PathBuf,
    buildah: Arc<Buildah>,
}

impl DeltaimageComputer {
    pub fn new(deltaimage: impl Into<PathBuf>, buildah: Arc<Buildah>) -> Self {
        Self {
            deltaimage: deltaimage.into(),
            buildah,
        }
    }
}

impl DeltaComputer for DeltaimageComputer {
    fn compute(&self, job: DeltaJob) -> DeltaStream {
        let run = DeltaimageRun {
            stage: Stage::Diff,
            diff_tag: format!("localhost/delta-diff-{}", job.build_id),
            delta_tag: format!("localhost/delta-{}", job.build_id),
            job,
            deltaimage: self.deltaimage.clone(),
            buildah: Arc::clone(&self.buildah),
        };

        stream::unfold(Some(run), |state| async move {
            let mut run = state?;
            match run.advance().await {
                Ok(Some(event)) => Some((Ok(event), Some(run))),
                Ok(None) => None,
                Err(e) => {
                    run.discard_diff_image().await;
                    Some((Err(e), None))
                }
            }
        })
        .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Diff,
    BuildDiff,
    Apply,
    BuildDelta,
    Done,
}

struct DeltaimageRun {
    stage: Stage,
    job: DeltaJob,
    diff_tag: String,
    delta_tag: String,
    deltaimage: PathBuf,
    buildah: Arc<Buildah>,
}

impl DeltaimageRun {
    async fn advance(&mut self) -> Result<Option<DeltaEvent>> {
        let workdir = self.job.workdir.clone();
        let event = match self.stage {
            Stage::Diff => {
                let dockerfile = process::run(
                    &self.deltaimage,
                    &["docker-file", "diff", self.job.src.as_str(), self.job.dest.as_str()],
                    None,
                )
                .await?;
                tokio::fs::write(workdir.join("Dockerfile.diff"), rewrite_stage(&dockerfile)).await?;
                tokio::fs::copy(&self.deltaimage, workdir.join("deltaimage")).await?;
                self.stage = Stage::BuildDiff;
                progress("diff", "generated diff Dockerfile")
            }
            Stage::BuildDiff => {
                self.buildah
                    .build(&workdir.join("Dockerfile.diff"), &self.diff_tag, &workdir)
                    .await?;
                self.stage = Stage::Apply;
                progress("build-diff", &self.diff_tag)
            }
            Stage::Apply => {
                let dockerfile = process::run(
                    &self.deltaimage,
                    &["docker-file", "apply", self.diff_tag.as_str()],
                    None,
                )
                .await?;
                tokio::fs::write(workdir.join("Dockerfile.delta"), rewrite_stage(&dockerfile)).await?;
                self.stage = Stage::BuildDelta;
                progress("apply", "generated delta Dockerfile")
            }
            Stage::BuildDelta => {
                self.buildah
                    .build(&workdir.join("Dockerfile.delta"), &self.delta_tag, &workdir)
                    .await?;
                self.discard_diff_image().await;
                self.stage = Stage::Done;
                DeltaEvent::Complete(ArtifactId(self.delta_tag.clone()))
            }
            Stage::Done => return Ok(None),
        };
        Ok(Some(event))
    }

    /// The diff image is only an input to the delta build.
    async fn discard_diff_image(&self) {
        if matches!(self.stage, Stage::Diff | Stage::BuildDiff) {
            return;
        }
        if let Err(e) = self.buildah.rmi(&[self.diff_tag.clone()]).await {
            tracing::warn!(image = %self.diff_tag, error = %e, "failed to remove diff image");
        }
    }
}

fn rewrite_stage(dockerfile: &[u8]) -> String {
    String::from_utf8_lossy(dockerfile).replace(DELTAIMAGE_STAGE, ".")
}

fn progress(step: &'static str, detail: &str) -> DeltaEvent {
    DeltaEvent::Progress {
        step,
        detail: detail.to_string(),
    }
}

// ---------------------------------------------------------------------------
// External patch command
// ---------------------------------------------------------------------------

/// Produces a patch file by running `<program> [args…] <src> <dest> <output>`.
pub struct CommandPatchComputer {
    program: PathBuf,
    args: Vec<String>,
}

/// File name of the patch inside the build workdir.
pub const PATCH_FILE_NAME: &str = "delta.patch";

impl CommandPatchComputer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl DeltaComputer for CommandPatchComputer {
    fn compute(&self, job: DeltaJob) -> DeltaStream {
        let program = self.program.clone();
        let output = job.workdir.join(PATCH_FILE_NAME);
        let mut args = self.args.clone();
        args.extend([
            job.src.clone(),
            job.dest.clone(),
            output.to_string_lossy().into_owned(),
        ]);

        let started = stream::once(async move {
            Ok::<_, Error>(progress("diff", &format!("running {}", program.display())))
        });
        let program = self.program.clone();
        let finished = stream::once(async move {
            process::run(&program, &args, None).await?;
            let meta = tokio::fs::metadata(&output).await.map_err(|e| {
                Error::Build(format!("patch command produced no output file: {e}"))
            })?;
            if !meta.is_file() {
                return Err(Error::Build("patch output is not a file".into()));
            }
            Ok(DeltaEvent::Complete(ArtifactId(
                output.to_string_lossy().into_owned(),
            )))
        });

        started.chain(finished).boxed()
    }
}
