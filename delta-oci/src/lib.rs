//! Minimal OCI Distribution client.
//!
//! Only the slice of the registry API the delta server needs lives here:
//! parsing references to registry-hosted images and asking a registry
//! whether a tag currently resolves to a manifest.  Pulling, pushing and
//! tagging go through the container tooling on the host instead.

pub mod error;
pub mod manifest;
pub mod registry;

pub use error::{OciError, Result};
pub use registry::{Credentials, ImageRef, RegistryClient};
