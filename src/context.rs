//! Application context.
//!
//! Everything that would otherwise be process-wide state (verifier, lock
//! sets, store, registry client, build supervisor) is constructed once here
//! and handed to the router.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::auth::AuthVerifier;
use crate::backend::{ArtifactBackend, ArtifactFormat, ImageBackend, PatchBackend};
use crate::compute::{CommandPatchComputer, DeltaComputer, DeltaimageComputer};
use crate::config::ServeConfig;
use crate::coordinator::{Coordinator, WaitBudgets};
use crate::executor::{self, BuildExecutor, BuildSupervisor};
use crate::lock::BuildLocks;
use crate::registry::{Buildah, BuildahRegistry, Registry};
use crate::store::ArtifactStore;
use crate::Result;

/// Route of the patch-file download endpoint; the patch backend points
/// redirects at it.
pub const DOWNLOAD_ROUTE: &str = "/api/v2/delta/download";

pub struct AppContext {
    pub auth: Arc<AuthVerifier>,
    /// Image-native format.
    pub image: Coordinator,
    /// Patch-file format.
    pub patch: Coordinator,
    pub supervisor: BuildSupervisor,
}

/// Parts needed to assemble a context, real or fake.
pub struct ContextParts {
    pub auth: AuthVerifier,
    pub registry: Arc<dyn Registry>,
    pub image_computer: Arc<dyn DeltaComputer>,
    pub patch_computer: Arc<dyn DeltaComputer>,
    pub store: Arc<ArtifactStore>,
    pub image_locks: BuildLocks,
    pub patch_locks: BuildLocks,
    pub work_dir: std::path::PathBuf,
    pub budgets: WaitBudgets,
    /// Only images on this registry are accepted.  `None` accepts any.
    pub registry_host: Option<String>,
}

impl AppContext {
    /// Build the production context: create state directories, recover from
    /// a previous crash, log in to the registry and wire the real tools.
    pub async fn from_config(config: &ServeConfig) -> Result<Self> {
        let auth = AuthVerifier::from_config(config.auth_config()?)?;

        let image_locks = BuildLocks::new(config.lock_dir(ArtifactFormat::Image))?
            .with_poll_interval(config.poll_interval);
        let patch_locks = BuildLocks::new(config.lock_dir(ArtifactFormat::Patch))?
            .with_poll_interval(config.poll_interval);
        let store = ArtifactStore::new(config.store_dir())?;

        recover(&[&image_locks, &patch_locks], &store, &config.work_dir)?;

        let mut buildah = Buildah::new(&config.buildah, &config.storage_driver);
        let registry_host = config.registry_host();
        let credentials = config.credentials();
        if let Some(creds) = &credentials {
            buildah = buildah.with_authfile(config.authfile());
            buildah
                .login(&creds.registry, &creds.username, &creds.password)
                .await?;
        } else if config.registry_username.is_some() && registry_host.is_none() {
            warn!("registry credentials set without a registry host; skipping login");
        }
        let buildah = Arc::new(buildah);

        let registry: Arc<dyn Registry> =
            Arc::new(BuildahRegistry::new(Arc::clone(&buildah), credentials)?);
        let image_computer: Arc<dyn DeltaComputer> =
            Arc::new(DeltaimageComputer::new(&config.deltaimage, Arc::clone(&buildah)));
        let patch_computer: Arc<dyn DeltaComputer> = Arc::new(CommandPatchComputer::new(
            &config.patch_command,
            config.patch_args.clone(),
        ));

        Ok(Self::assemble(ContextParts {
            auth,
            registry,
            image_computer,
            patch_computer,
            store: Arc::new(store),
            image_locks,
            patch_locks,
            work_dir: config.work_dir.clone(),
            budgets: config.budgets(),
            registry_host,
        }))
    }

    /// Wire the coordinators from already constructed capabilities.
    pub fn assemble(parts: ContextParts) -> Self {
        let auth = Arc::new(parts.auth);
        let supervisor = BuildSupervisor::new();

        let image_backend: Arc<dyn ArtifactBackend> = Arc::new(ImageBackend::new(
            Arc::clone(&parts.registry),
            parts.image_computer,
        ));
        let patch_backend: Arc<dyn ArtifactBackend> = Arc::new(PatchBackend::new(
            parts.registry,
            parts.patch_computer,
            parts.store,
            DOWNLOAD_ROUTE,
        ));

        let coordinator = |backend: Arc<dyn ArtifactBackend>, locks: BuildLocks| {
            Coordinator::new(
                Arc::clone(&auth),
                Arc::new(locks),
                Arc::clone(&backend),
                Arc::new(BuildExecutor::new(backend, &parts.work_dir)),
                supervisor.clone(),
                parts.budgets,
            )
            .with_registry_host(parts.registry_host.clone())
        };
        let image = coordinator(image_backend, parts.image_locks);
        let patch = coordinator(patch_backend, parts.patch_locks);

        Self {
            auth,
            image,
            patch,
            supervisor,
        }
    }

    pub fn active_builds(&self) -> usize {
        self.supervisor.active()
    }

    /// Wait up to `grace` for running builds.  Builds still running after
    /// that are abandoned; their locks are swept at the next start.
    pub async fn shutdown(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.supervisor.shutdown())
            .await
            .is_err()
        {
            warn!(
                active = self.supervisor.active(),
                "shutdown grace period elapsed with builds still running"
            );
        }
    }
}

/// Clear what a crashed previous process left behind.  Only valid before
/// this process starts building.
fn recover(locks: &[&BuildLocks], store: &ArtifactStore, work_dir: &Path) -> Result<()> {
    let mut stale_locks = 0;
    for set in locks {
        stale_locks += set.clear_stale()?;
    }
    let partial = store.clear_partial()?;
    let workdirs = executor::sweep_work_dir(work_dir)?;
    if stale_locks + partial + workdirs > 0 {
        info!(stale_locks, partial, workdirs, "recovered state from previous run");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recover_sweeps_every_kind_of_leftover() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = BuildLocks::new(tmp.path().join("locks")).unwrap();
        let store = ArtifactStore::new(tmp.path().join("store")).unwrap();
        let work = tmp.path().join("work");

        std::fs::write(locks.dir().join("k.lock"), b"{}").unwrap();
        std::fs::write(store.dir().join(".partial-k-1"), b"half").unwrap();
        std::fs::create_dir_all(work.join(format!("{}x", executor::WORKDIR_PREFIX))).unwrap();

        recover(&[&locks], &store, &work).unwrap();

        assert_eq!(std::fs::read_dir(locks.dir()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }
}
