//! Image references and delta keys.
//!
//! Fleet images are addressed as `<registry>/v<N>/<hex-id>[@sha256:<hex>]`.
//! A delta between two such images is keyed by the destination id plus a
//! 16-character prefix of the source id:
//!
//! ```text
//! src  = registry.example.io/v2/aaaaaaaaaaaaaaaa1111
//! dest = registry.example.io/v2/bbbbbbbb
//! key  = bbbbbbbb:delta-aaaaaaaaaaaaaaaa
//! path = registry.example.io/v2/bbbbbbbb:delta-aaaaaaaaaaaaaaaa
//! ```
//!
//! The prefix truncation means two sources sharing their first 16 hex
//! characters map to the same key.  Image ids are content hashes, so this is
//! accepted rather than guarded against.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

/// Number of source-id hex characters folded into a delta tag.
pub const SOURCE_PREFIX_LEN: usize = 16;

static IMAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<host>.+?)/v(?P<version>[0-9]+)/(?P<base>[0-9a-f]+)(?:@(?P<digest>sha256:[0-9a-f]{32,}))?$")
        .expect("image reference pattern is valid")
});

static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]+:delta-[0-9a-f]{1,16}$").expect("delta key pattern is valid")
});

/// A validated fleet image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, possibly with a port or path prefix.
    pub registry_host: String,
    /// Digits of the `v<N>` path segment.
    pub version: String,
    /// Hex image id.
    pub image_base: String,
    /// Optional `sha256:<hex>` pin.
    pub digest: Option<String>,
    raw: String,
}

impl ImageReference {
    /// Parse and validate `raw`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let caps = IMAGE_PATTERN.captures(raw).ok_or_else(|| {
            Error::Validation(format!(
                "invalid image reference '{raw}', expected <registry>/v<N>/<hex-id>[@sha256:<hex>]"
            ))
        })?;

        Ok(Self {
            registry_host: caps["host"].to_string(),
            version: caps["version"].to_string(),
            image_base: caps["base"].to_string(),
            digest: caps.name("digest").map(|m| m.as_str().to_string()),
            raw: raw.to_string(),
        })
    }

    /// The reference exactly as supplied (digest included), suitable for pulls.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `<registry>/v<N>/<hex-id>` without the digest pin.
    pub fn repository(&self) -> String {
        format!("{}/v{}/{}", self.registry_host, self.version, self.image_base)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Canonical identifier of a (source, destination) delta.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeltaKey(String);

impl DeltaKey {
    /// Validate an externally supplied key, e.g. the `delta` download
    /// parameter.  Keys double as file names, so anything outside the
    /// generated shape is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        if KEY_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::Validation(format!("invalid delta key '{raw}'")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `delta-<prefix>` tag part of the key.
    pub fn tag(&self) -> &str {
        self.0.split_once(':').map(|(_, tag)| tag).unwrap_or(&self.0)
    }

    /// File-system safe rendering used for lock and store entries.
    pub fn file_stem(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl fmt::Display for DeltaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated (src, dest) pair with its derived key and remote path.
#[derive(Debug, Clone)]
pub struct ResolvedDelta {
    pub src: ImageReference,
    pub dest: ImageReference,
    pub key: DeltaKey,
    /// `<dest registry>/v<N>/<dest id>:delta-<prefix>`
    pub path: String,
}

/// Parse both references and derive the delta key and path.
pub fn resolve_key(src: &str, dest: &str) -> Result<ResolvedDelta> {
    let src = ImageReference::parse(src)?;
    let dest = ImageReference::parse(dest)?;
    resolve(src, dest)
}

/// Derive the delta key and path for two already parsed references.
pub fn resolve(src: ImageReference, dest: ImageReference) -> Result<ResolvedDelta> {
    if src.version != dest.version {
        return Err(Error::Validation(format!(
            "src and dest must share a version segment (v{} != v{})",
            src.version, dest.version
        )));
    }

    let prefix_len = src.image_base.len().min(SOURCE_PREFIX_LEN);
    let tag = format!("delta-{}", &src.image_base[..prefix_len]);
    let key = DeltaKey(format!("{}:{}", dest.image_base, tag));
    let path = format!("{}:{}", dest.repository(), tag);

    Ok(ResolvedDelta {
        src,
        dest,
        key,
        path,
    })
}
