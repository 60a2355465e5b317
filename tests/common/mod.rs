#![allow(dead_code)]

//! In-memory registry and delta computer for driving the coordinator
//! without buildah or a real registry.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use secrecy::SecretString;
use tokio::sync::Semaphore;

use delta_server::auth::{AuthConfig, AuthVerifier, KeyMaterial};
use delta_server::compute::{ArtifactId, DeltaComputer, DeltaEvent, DeltaJob, DeltaStream};
use delta_server::context::{AppContext, ContextParts};
use delta_server::coordinator::{BuildRequest, WaitBudgets};
use delta_server::lock::BuildLocks;
use delta_server::registry::Registry;
use delta_server::store::ArtifactStore;
use delta_server::{Error, Result};

pub const REGISTRY_HOST: &str = "registry.example.io";
pub const SRC: &str = "registry.example.io/v2/aaaaaaaaaaaaaaaa1111";
pub const DEST: &str = "registry.example.io/v2/bbbbbbbb";
pub const KEY: &str = "bbbbbbbb:delta-aaaaaaaaaaaaaaaa";
pub const DELTA_PATH: &str = "registry.example.io/v2/bbbbbbbb:delta-aaaaaaaaaaaaaaaa";
pub const JWT_SECRET: &str = "integration-secret";

const OPEN: usize = Semaphore::MAX_PERMITS / 2;

// ──────────────────────────────────────────────────────────────────────────────
// Fakes
// ──────────────────────────────────────────────────────────────────────────────

pub struct FakeRegistry {
    pub pulls: AtomicUsize,
    pub pushes: AtomicUsize,
    pub removals: AtomicUsize,
    fail_pulls: AtomicBool,
    published: Mutex<HashSet<String>>,
    gate: Semaphore,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_permits(OPEN))
    }

    /// Pulls block until [`FakeRegistry::open_gate`] is called.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::with_permits(0))
    }

    fn with_permits(permits: usize) -> Self {
        Self {
            pulls: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            removals: AtomicUsize::new(0),
            fail_pulls: AtomicBool::new(false),
            published: Mutex::new(HashSet::new()),
            gate: Semaphore::new(permits),
        }
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(OPEN);
    }

    pub fn fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    pub fn publish(&self, image: &str) {
        self.published.lock().unwrap().insert(image.to_string());
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn pull(&self, image: &str) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| Error::Build(e.to_string()))?;
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(Error::Command {
                program: "buildah".into(),
                status: "exit status: 125".into(),
                stderr: format!("manifest unknown: {image}"),
            });
        }
        Ok(())
    }

    async fn tag(&self, _source: &str, _target: &str) -> Result<()> {
        Ok(())
    }

    async fn push(&self, image: &str) -> Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.publish(image);
        Ok(())
    }

    async fn remove_local(&self, _images: &[String]) -> Result<()> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn tag_exists(&self, image: &str) -> Result<bool> {
        Ok(self.published.lock().unwrap().contains(image))
    }
}

/// Yields one progress event and then either a local image name or, when a
/// payload is set, a patch file written into the build workdir.
pub struct FakeComputer {
    pub computes: AtomicUsize,
    payload: Option<Vec<u8>>,
}

impl FakeComputer {
    pub fn image() -> Arc<Self> {
        Arc::new(Self {
            computes: AtomicUsize::new(0),
            payload: None,
        })
    }

    pub fn patch(payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            computes: AtomicUsize::new(0),
            payload: Some(payload.to_vec()),
        })
    }

    pub fn computes(&self) -> usize {
        self.computes.load(Ordering::SeqCst)
    }
}

impl DeltaComputer for FakeComputer {
    fn compute(&self, job: DeltaJob) -> DeltaStream {
        self.computes.fetch_add(1, Ordering::SeqCst);
        let payload = self.payload.clone();

        let progress = stream::once(async {
            Ok::<_, Error>(DeltaEvent::Progress {
                step: "diff",
                detail: "fake".into(),
            })
        });
        let complete = stream::once(async move {
            let id = match payload {
                Some(bytes) => {
                    let out = job.workdir.join("delta.patch");
                    tokio::fs::write(&out, bytes).await?;
                    out.to_string_lossy().into_owned()
                }
                None => format!("localhost/delta-{}", job.build_id),
            };
            Ok::<_, Error>(DeltaEvent::Complete(ArtifactId(id)))
        });
        progress.chain(complete).boxed()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Harness
// ──────────────────────────────────────────────────────────────────────────────

pub struct Harness {
    pub ctx: Arc<AppContext>,
    pub registry: Arc<FakeRegistry>,
    pub image_computer: Arc<FakeComputer>,
    pub patch_computer: Arc<FakeComputer>,
    pub dir: tempfile::TempDir,
}

pub struct HarnessBuilder {
    registry: Arc<FakeRegistry>,
    payload: Vec<u8>,
    budgets: WaitBudgets,
    auth: Option<&'static str>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            registry: FakeRegistry::new(),
            payload: b"delta-bytes".to_vec(),
            budgets: WaitBudgets {
                short: Duration::from_millis(200),
                long: Duration::from_secs(5),
            },
            auth: None,
        }
    }

    pub fn registry(mut self, registry: Arc<FakeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn long_wait(mut self, long: Duration) -> Self {
        self.budgets.long = long;
        self
    }

    pub fn jwt_secret(mut self, secret: &'static str) -> Self {
        self.auth = Some(secret);
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let image_computer = FakeComputer::image();
        let patch_computer = FakeComputer::patch(&self.payload);

        let auth = AuthVerifier::from_config(AuthConfig {
            algorithm: "HS256".into(),
            material: self
                .auth
                .map(|s| KeyMaterial::Secret(SecretString::from(s.to_string()))),
        })
        .unwrap();

        let locks = |name: &str| {
            BuildLocks::new(dir.path().join("locks").join(name))
                .unwrap()
                .with_poll_interval(Duration::from_millis(10))
        };

        let ctx = Arc::new(AppContext::assemble(ContextParts {
            auth,
            registry: self.registry.clone(),
            image_computer: image_computer.clone(),
            patch_computer: patch_computer.clone(),
            store: Arc::new(ArtifactStore::new(dir.path().join("store")).unwrap()),
            image_locks: locks("image"),
            patch_locks: locks("patch"),
            work_dir: dir.path().join("work"),
            budgets: self.budgets,
            registry_host: Some(REGISTRY_HOST.to_string()),
        }));
        std::fs::create_dir_all(dir.path().join("work")).unwrap();

        Harness {
            ctx,
            registry: self.registry,
            image_computer,
            patch_computer,
            dir,
        }
    }
}

impl Harness {
    pub fn lock_files(&self, format: &str) -> usize {
        std::fs::read_dir(self.dir.path().join("locks").join(format))
            .unwrap()
            .count()
    }

    /// Wait until every detached build has finished.
    pub async fn settle(&self) {
        for _ in 0..500 {
            if self.ctx.active_builds() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("builds still running after 5s");
    }
}

pub fn request(src: &str, dest: &str, wait: bool) -> BuildRequest {
    BuildRequest {
        src: Some(src.to_string()),
        dest: Some(dest.to_string()),
        authorization: None,
        wait,
    }
}

pub fn bearer(secret: &str) -> String {
    let token = encode(
        &Header::new(Algorithm::HS256),
        &serde_json::json!({ "sub": "device-1" }),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap();
    format!("Bearer {token}")
}

pub fn workdir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}
