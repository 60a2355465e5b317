use serde::Deserialize;

use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// `Accept` header value sent on manifest requests.
pub fn accept_header() -> String {
    [
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST,
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    ]
    .join(", ")
}

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

// ---------------------------------------------------------------------------
// ManifestKind
// ---------------------------------------------------------------------------

/// What a manifest endpoint returned for a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Manifest,
    Index,
}

/// Only the fields needed to classify a manifest body.
#[derive(Debug, Deserialize)]
struct ManifestHead {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,

    #[serde(rename = "mediaType", default)]
    media_type: String,

    #[serde(default)]
    manifests: Option<serde_json::Value>,

    #[serde(default)]
    layers: Option<serde_json::Value>,
}

/// Classify a manifest body.  The `Content-Type` header wins when the body
/// omits `mediaType` (schema 2 Docker manifests sometimes do).
pub fn classify(body: &[u8], content_type: Option<&str>) -> Result<ManifestKind> {
    let head: ManifestHead = serde_json::from_slice(body)?;
    if head.schema_version != 2 {
        return Err(OciError::Manifest(format!(
            "unsupported schemaVersion {}",
            head.schema_version
        )));
    }

    let media_type = if head.media_type.is_empty() {
        content_type.unwrap_or_default()
    } else {
        head.media_type.as_str()
    };

    if is_index_media_type(media_type) || head.manifests.is_some() {
        Ok(ManifestKind::Index)
    } else if is_manifest_media_type(media_type) || head.layers.is_some() {
        Ok(ManifestKind::Manifest)
    } else {
        Err(OciError::Manifest(format!(
            "unrecognised manifest media type '{media_type}'"
        )))
    }
}
