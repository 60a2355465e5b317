//! Registry capability.
//!
//! The coordinator only needs four things from a registry: get an image into
//! local storage, give a local image a remote name, publish it, and ask
//! whether a remote tag already exists.  [`BuildahRegistry`] does the first
//! three through `buildah` and answers the last one over the registry HTTP
//! API, so cache hits survive restarts.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use delta_oci::{Credentials, ImageRef, RegistryClient};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::process;
use crate::Result;

#[async_trait]
pub trait Registry: Send + Sync {
    /// Pull `image` into local storage.
    async fn pull(&self, image: &str) -> Result<()>;

    /// Give the local image `source` the additional name `target`.
    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    /// Push the local image `image` to its registry.
    async fn push(&self, image: &str) -> Result<()>;

    /// Remove local copies.  Missing images are not an error.
    async fn remove_local(&self, images: &[String]) -> Result<()>;

    /// Whether `image` currently resolves to a manifest in its registry.
    async fn tag_exists(&self, image: &str) -> Result<bool>;
}

/// Thin wrapper over the `buildah` CLI.
#[derive(Debug, Clone)]
pub struct Buildah {
    program: PathBuf,
    storage_driver: String,
    authfile: Option<PathBuf>,
}

impl Buildah {
    pub fn new(program: impl Into<PathBuf>, storage_driver: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            storage_driver: storage_driver.into(),
            authfile: None,
        }
    }

    pub fn with_authfile(mut self, authfile: impl Into<PathBuf>) -> Self {
        self.authfile = Some(authfile.into());
        self
    }

    fn command(&self, subcommand: &str, authenticated: bool) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--storage-driver".into(),
            self.storage_driver.clone().into(),
            subcommand.into(),
        ];
        if authenticated {
            if let Some(authfile) = &self.authfile {
                args.push("--authfile".into());
                args.push(authfile.clone().into());
            }
        }
        args
    }

    /// Log in to `host`, writing the credentials into the configured authfile.
    /// The password is piped over stdin and never appears in argv or logs.
    pub async fn login(&self, host: &str, username: &str, password: &SecretString) -> Result<()> {
        let mut args = self.command("login", true);
        args.extend([
            "--username".into(),
            username.into(),
            "--password-stdin".into(),
            host.into(),
        ]);
        process::run(&self.program, &args, Some(password.expose_secret().as_bytes())).await?;
        info!(host, username, "registry login succeeded");
        Ok(())
    }

    pub async fn pull(&self, image: &str) -> Result<()> {
        let mut args = self.command("pull", true);
        args.extend(["--quiet".into(), image.into()]);
        process::run(&self.program, &args, None).await?;
        Ok(())
    }

    pub async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let mut args = self.command("tag", false);
        args.extend([source.into(), target.into()]);
        process::run(&self.program, &args, None).await?;
        Ok(())
    }

    pub async fn push(&self, image: &str) -> Result<()> {
        let mut args = self.command("push", true);
        args.extend(["--quiet".into(), image.into()]);
        process::run(&self.program, &args, None).await?;
        Ok(())
    }

    pub async fn rmi(&self, images: &[String]) -> Result<()> {
        if images.is_empty() {
            return Ok(());
        }
        let mut args = self.command("rmi", false);
        args.push("--force".into());
        args.extend(images.iter().map(OsString::from));
        process::run(&self.program, &args, None).await?;
        Ok(())
    }

    /// `buildah bud -f <dockerfile> -t <tag> <context>`
    pub async fn build(&self, dockerfile: &Path, tag: &str, context: &Path) -> Result<()> {
        let mut args = self.command("bud", true);
        args.extend([
            "--no-cache".into(),
            "--quiet".into(),
            "-f".into(),
            dockerfile.into(),
            "-t".into(),
            tag.into(),
            context.into(),
        ]);
        process::run(&self.program, &args, None).await?;
        Ok(())
    }
}

/// [`Registry`] backed by `buildah` for image movement and the OCI HTTP
/// client for tag lookups.
pub struct BuildahRegistry {
    buildah: Arc<Buildah>,
    client: RegistryClient,
}

impl BuildahRegistry {
    pub fn new(buildah: Arc<Buildah>, credentials: Option<Credentials>) -> Result<Self> {
        let client = RegistryClient::new()?;
        let client = match credentials {
            Some(creds) => client.with_credentials(creds),
            None => client,
        };
        Ok(Self { buildah, client })
    }
}

#[async_trait]
impl Registry for BuildahRegistry {
    async fn pull(&self, image: &str) -> Result<()> {
        debug!(image, "pulling");
        self.buildah.pull(image).await
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.buildah.tag(source, target).await
    }

    async fn push(&self, image: &str) -> Result<()> {
        debug!(image, "pushing");
        self.buildah.push(image).await
    }

    async fn remove_local(&self, images: &[String]) -> Result<()> {
        self.buildah.rmi(images).await
    }

    async fn tag_exists(&self, image: &str) -> Result<bool> {
        let image_ref = ImageRef::parse(image)?;
        Ok(self.client.manifest_exists(&image_ref).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_driver_precedes_subcommand() {
        let buildah = Buildah::new("buildah", "vfs").with_authfile("/state/auth.json");
        let args = buildah.command("push", true);
        assert_eq!(
            args,
            vec![
                OsString::from("--storage-driver"),
                OsString::from("vfs"),
                OsString::from("push"),
                OsString::from("--authfile"),
                OsString::from("/state/auth.json"),
            ]
        );
    }

    #[test]
    fn authfile_only_for_authenticated_commands() {
        let buildah = Buildah::new("buildah", "overlay").with_authfile("/state/auth.json");
        let args = buildah.command("tag", false);
        assert_eq!(args.len(), 3);
    }

    #[tokio::test]
    async fn rmi_with_nothing_is_noop() {
        let buildah = Buildah::new("/nonexistent/buildah", "vfs");
        buildah.rmi(&[]).await.unwrap();
    }
}
