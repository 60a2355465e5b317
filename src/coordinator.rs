//! Delta build coordination.
//!
//! One [`Coordinator`] per artifact format.  For a request it decides,
//! in order:
//!
//! | cache | lock  | wait  | outcome                                             |
//! |-------|-------|-------|-----------------------------------------------------|
//! | hit   | any   | any   | `Ready`                                             |
//! | miss  | free  | false | start build, `Pending`                              |
//! | miss  | free  | true  | start build, await it, `Ready` or `Error::Build`    |
//! | miss  | held  | false | poll up to the short budget, `Ready` or `Pending`   |
//! | miss  | held  | true  | poll up to the long budget, `Ready` or `Error::Build` |
//!
//! The lock is taken with a single atomic create, so two requests racing on
//! a free key cannot both start a build; the loser follows the "held" rows.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth::AuthVerifier;
use crate::backend::{Artifact, ArtifactBackend, ArtifactFormat};
use crate::executor::{BuildExecutor, BuildSupervisor};
use crate::lock::BuildLocks;
use crate::reference::{self, DeltaKey, ImageReference, ResolvedDelta};
use crate::store::StoredArtifact;
use crate::{Error, Result};

/// How long a caller may be held on a build that is already running.
#[derive(Debug, Clone, Copy)]
pub struct WaitBudgets {
    /// Budget for callers that did not ask to wait.
    pub short: Duration,
    /// Budget for callers that asked to wait for completion.
    pub long: Duration,
}

impl Default for WaitBudgets {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(45),
            long: Duration::from_secs(900),
        }
    }
}

/// One delta request as received.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub src: Option<String>,
    pub dest: Option<String>,
    /// Raw `Authorization` header value.
    pub authorization: Option<String>,
    pub wait: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready(Artifact),
    /// A build is running; retry later.
    Pending,
}

pub struct Coordinator {
    auth: Arc<AuthVerifier>,
    locks: Arc<BuildLocks>,
    backend: Arc<dyn ArtifactBackend>,
    executor: Arc<BuildExecutor>,
    supervisor: BuildSupervisor,
    budgets: WaitBudgets,
    registry_host: Option<String>,
}

impl Coordinator {
    pub fn new(
        auth: Arc<AuthVerifier>,
        locks: Arc<BuildLocks>,
        backend: Arc<dyn ArtifactBackend>,
        executor: Arc<BuildExecutor>,
        supervisor: BuildSupervisor,
        budgets: WaitBudgets,
    ) -> Self {
        Self {
            auth,
            locks,
            backend,
            executor,
            supervisor,
            budgets,
            registry_host: None,
        }
    }

    /// Only accept images hosted on `host`.  Registry credentials are sent
    /// to that host, so nothing else may be pulled or probed on its behalf.
    pub fn with_registry_host(mut self, host: Option<String>) -> Self {
        self.registry_host = host;
        self
    }

    pub fn format(&self) -> ArtifactFormat {
        self.backend.format()
    }

    pub async fn handle(&self, request: BuildRequest) -> Result<Outcome> {
        let (src, dest) = match (request.src.as_deref(), request.dest.as_deref()) {
            (Some(src), Some(dest)) if !src.is_empty() && !dest.is_empty() => (src, dest),
            _ => {
                return Err(Error::Validation(
                    "src and dest url params must be provided".into(),
                ))
            }
        };

        let src = ImageReference::parse(src)?;
        let dest = ImageReference::parse(dest)?;
        self.check_registry(&src)?;
        self.check_registry(&dest)?;
        self.auth.verify(request.authorization.as_deref())?;
        let delta = reference::resolve(src, dest)?;

        debug!(
            format = self.format().as_str(),
            key = %delta.key,
            wait = request.wait,
            "delta requested"
        );

        if self.backend.exists(&delta).await? {
            debug!(key = %delta.key, "delta cached");
            return Ok(Outcome::Ready(self.backend.fetch(&delta)));
        }

        let build_id = uuid::Uuid::now_v7().to_string();
        match self.locks.acquire(&delta.key, &build_id).await {
            Ok(lock) => {
                // A build may have finished between the cache check and the
                // acquire; don't redo it.
                if self.backend.exists(&delta).await? {
                    lock.release().await?;
                    return Ok(Outcome::Ready(self.backend.fetch(&delta)));
                }

                let executor = Arc::clone(&self.executor);
                let build = delta.clone();
                let handle = self
                    .supervisor
                    .spawn(async move { executor.execute(build, lock, build_id).await });

                if !request.wait {
                    info!(key = %delta.key, "delta build triggered");
                    return Ok(Outcome::Pending);
                }

                match handle.await {
                    Ok(Ok(())) => Ok(Outcome::Ready(self.backend.fetch(&delta))),
                    Ok(Err(e)) => Err(Error::Build(build_failure_reason(&e))),
                    Err(e) => {
                        warn!(key = %delta.key, error = %e, "build task did not complete");
                        Err(Error::Build("build task aborted".into()))
                    }
                }
            }
            Err(Error::AlreadyBuilding { .. }) => self.await_running(&delta, request.wait).await,
            Err(e) => Err(e),
        }
    }

    fn check_registry(&self, image: &ImageReference) -> Result<()> {
        let Some(allowed) = &self.registry_host else {
            return Ok(());
        };
        let authority = image
            .registry_host
            .split('/')
            .next()
            .unwrap_or(&image.registry_host);
        if authority.eq_ignore_ascii_case(allowed) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "image {image} is not hosted on {allowed}"
            )))
        }
    }

    /// Another actor holds the lock: poll it within the caller's budget and
    /// report what the finished build left in the cache.
    async fn await_running(&self, delta: &ResolvedDelta, wait: bool) -> Result<Outcome> {
        let budget = if wait {
            self.budgets.long
        } else {
            self.budgets.short
        };
        debug!(key = %delta.key, ?budget, "delta build already running");

        let still_held = self.locks.wait_until_free(&delta.key, budget).await;
        if !still_held && self.backend.exists(delta).await? {
            return Ok(Outcome::Ready(self.backend.fetch(delta)));
        }

        match (wait, still_held) {
            (false, _) => Ok(Outcome::Pending),
            (true, true) => Err(Error::Build(format!(
                "timed out after {} waiting for running build",
                humantime::format_duration(budget)
            ))),
            (true, false) => Err(Error::Build(
                "running build finished without producing a delta".into(),
            )),
        }
    }

    /// Open a stored artifact for download.
    pub async fn download(
        &self,
        authorization: Option<&str>,
        key: Option<&str>,
    ) -> Result<StoredArtifact> {
        self.auth.verify(authorization)?;
        let key = key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Validation("delta url param must be provided".into()))?;
        let key = DeltaKey::parse(key)?;
        self.backend.open(&key).await
    }
}

fn build_failure_reason(e: &Error) -> String {
    match e {
        Error::Build(msg) => msg.clone(),
        other => other.public_message(),
    }
}
