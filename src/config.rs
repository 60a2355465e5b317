//! Service configuration.
//!
//! Every option can be given on the command line or through the environment.
//! The registry variables keep the names fleet deployments already export
//! (`REGISTRY_HOST`, `BALENAOS_USERNAME`, `BALENAOS_APIKEY`); everything else
//! lives under `DELTA_*`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use delta_oci::Credentials;
use secrecy::{ExposeSecret, SecretString};

use crate::auth::{AuthConfig, KeyMaterial};
use crate::backend::ArtifactFormat;
use crate::coordinator::WaitBudgets;
use crate::{Error, Result};

#[derive(Args, Clone)]
pub struct ServeConfig {
    /// Address to listen on
    #[arg(long, env = "DELTA_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Registry the delta images are pushed to and pulled from
    #[arg(long, env = "REGISTRY_HOST")]
    pub registry_host: Option<String>,

    /// Fleet base domain; the registry defaults to `registry2.<domain>`
    #[arg(long, env = "DELTA_BASE_DOMAIN")]
    pub base_domain: Option<String>,

    /// Registry username
    #[arg(long, env = "BALENAOS_USERNAME")]
    pub registry_username: Option<String>,

    /// Registry password or API key
    #[arg(long, env = "BALENAOS_APIKEY", hide_env_values = true, value_parser = parse_secret)]
    pub registry_password: Option<SecretString>,

    /// Signing algorithm accepted on bearer tokens
    #[arg(long, env = "DELTA_JWT_ALGORITHM", default_value = "HS256")]
    pub jwt_algorithm: String,

    /// Shared secret for HMAC-signed tokens
    #[arg(
        long,
        env = "DELTA_JWT_SECRET",
        hide_env_values = true,
        conflicts_with = "jwt_public_key",
        value_parser = parse_secret
    )]
    pub jwt_secret: Option<SecretString>,

    /// PEM public key for RSA, ECDSA or EdDSA-signed tokens
    #[arg(long, env = "DELTA_JWT_PUBLIC_KEY")]
    pub jwt_public_key: Option<PathBuf>,

    /// Holds build locks, stored patch files and the registry authfile
    #[arg(long, env = "DELTA_STATE_DIR", default_value = "/var/lib/deltad")]
    pub state_dir: PathBuf,

    /// Parent of the per-build scratch directories
    #[arg(long, env = "DELTA_WORK_DIR", default_value = "/tmp/deltad")]
    pub work_dir: PathBuf,

    /// How long a non-waiting request polls a running build
    #[arg(long, env = "DELTA_SHORT_WAIT", default_value = "45s", value_parser = humantime::parse_duration)]
    pub short_wait: Duration,

    /// How long a waiting request polls a running build
    #[arg(long, env = "DELTA_LONG_WAIT", default_value = "15m", value_parser = humantime::parse_duration)]
    pub long_wait: Duration,

    /// Interval between build lock polls
    #[arg(long, env = "DELTA_POLL_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    #[arg(long, env = "DELTA_BUILDAH", default_value = "buildah")]
    pub buildah: PathBuf,

    #[arg(long, env = "DELTA_DELTAIMAGE", default_value = "/usr/local/bin/deltaimage")]
    pub deltaimage: PathBuf,

    /// Storage driver passed to every buildah call
    #[arg(long, env = "DELTA_STORAGE_DRIVER", default_value = "vfs")]
    pub storage_driver: String,

    /// Patch-file command, run as `<command> [args..] <src> <dest> <output>`
    #[arg(long, env = "DELTA_PATCH_COMMAND", default_value = "/usr/local/bin/delta-patch")]
    pub patch_command: PathBuf,

    /// Extra leading arguments for the patch command
    #[arg(long = "patch-arg", env = "DELTA_PATCH_ARGS", value_delimiter = ' ')]
    pub patch_args: Vec<String>,
}

impl ServeConfig {
    /// The configured registry, falling back to the base domain convention.
    pub fn registry_host(&self) -> Option<String> {
        self.registry_host.clone().or_else(|| {
            self.base_domain
                .as_deref()
                .map(|domain| format!("registry2.{domain}"))
        })
    }

    /// Credentials for the configured registry, when both halves and a
    /// registry host are present.  They are never offered to another host.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self.registry_username.as_deref().filter(|u| !u.is_empty())?;
        let password = self
            .registry_password
            .clone()
            .filter(|p| !p.expose_secret().is_empty())?;
        Some(Credentials::new(self.registry_host()?, username, password))
    }

    /// Verifier inputs.  No material means auth is disabled.
    pub fn auth_config(&self) -> Result<AuthConfig> {
        let material = match (&self.jwt_secret, &self.jwt_public_key) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "set either a JWT secret or a JWT public key, not both".into(),
                ))
            }
            (Some(secret), None) if !secret.expose_secret().is_empty() => {
                Some(KeyMaterial::Secret(secret.clone()))
            }
            (_, Some(path)) => {
                let pem = std::fs::read(path).map_err(|e| {
                    Error::Config(format!("failed to read JWT public key {}: {e}", path.display()))
                })?;
                Some(KeyMaterial::PublicKeyPem(pem))
            }
            _ => None,
        };
        Ok(AuthConfig {
            algorithm: self.jwt_algorithm.clone(),
            material,
        })
    }

    pub fn budgets(&self) -> WaitBudgets {
        WaitBudgets {
            short: self.short_wait,
            long: self.long_wait,
        }
    }

    /// Each format gets its own lock directory so the same key in both
    /// formats never blocks across.
    pub fn lock_dir(&self, format: ArtifactFormat) -> PathBuf {
        self.state_dir.join("locks").join(format.as_str())
    }

    pub fn store_dir(&self) -> PathBuf {
        self.state_dir.join("patches")
    }

    pub fn authfile(&self) -> PathBuf {
        self.state_dir.join("auth.json")
    }
}

fn parse_secret(value: &str) -> std::result::Result<SecretString, std::convert::Infallible> {
    Ok(SecretString::from(value.to_string()))
}
