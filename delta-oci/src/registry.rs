use crate::error::{OciError, Result};
use crate::manifest::{self, ManifestKind};
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.  Delta images always live in a private
/// registry, so the host component is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname, optionally with a port (e.g. "registry.example.io:5000").
    pub registry: String,
    /// Repository path (e.g. "v2/0a1b2c").
    pub repository: String,
    /// Tag or digest reference (e.g. "delta-0011223344556677" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `registry.example.io/v2/0a1b2c`
    /// - `registry.example.io/v2/0a1b2c:delta-0011223344556677`
    /// - `localhost:5000/v3/0a1b2c@sha256:abc123`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::Reference("empty image reference".to_string()));
        }

        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            (&raw[..at_pos], raw[at_pos + 1..].to_string())
        } else if let Some(colon_pos) = raw.rfind(':') {
            // A tag colon always comes after the last '/'; anything earlier
            // belongs to a "host:port" prefix.
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon_pos > after_last_slash {
                (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
            } else {
                (raw, "latest".to_string())
            }
        } else {
            (raw, "latest".to_string())
        };

        let (registry, repository) = name_part
            .split_once('/')
            .ok_or_else(|| OciError::Reference(format!("'{raw}' has no registry host")))?;

        if registry.is_empty() || repository.is_empty() || reference.is_empty() {
            return Err(OciError::Reference(format!("'{raw}' is incomplete")));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference,
        })
    }

    fn manifest_url(&self) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            registry_scheme(&self.registry),
            self.registry,
            self.repository,
            self.reference,
        )
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = if self.reference.contains(':') { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Username/password for one registry host.  The password never appears in
/// `Debug`, and is only ever sent for images hosted on `registry`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub registry: String,
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(
        registry: impl Into<String>,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            registry: registry.into(),
            username: username.into(),
            password,
        }
    }

    /// Whether these credentials belong to the registry serving `image_ref`.
    pub fn applies_to(&self, image_ref: &ImageRef) -> bool {
        self.registry.eq_ignore_ascii_case(&image_ref.registry)
    }

    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        req.basic_auth(&self.username, Some(self.password.expose_secret()))
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Low-level OCI Distribution HTTP client.
pub struct RegistryClient {
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("delta-oci/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            credentials: None,
        })
    }

    /// Use `credentials` for basic auth challenges and token requests on
    /// their registry.  Other hosts only ever see anonymous requests.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn credentials_for(&self, image_ref: &ImageRef) -> Option<&Credentials> {
        self.credentials
            .as_ref()
            .filter(|creds| creds.applies_to(image_ref))
    }

    // -- public API ---------------------------------------------------------

    /// Check whether a manifest exists for `image_ref`.
    ///
    /// Returns `Ok(false)` on 404, `Ok(true)` when a well-formed manifest or
    /// image index is served, and an error for anything else (including
    /// auth failures, which must not be mistaken for a cache miss).
    pub async fn manifest_exists(&self, image_ref: &ImageRef) -> Result<bool> {
        let url = image_ref.manifest_url();
        let resp = self.authenticated_get(&url, image_ref).await?;

        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!(%image_ref, "manifest not found");
                Ok(false)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(OciError::Unauthorized(image_ref.to_string()))
            }
            status if status.is_success() => {
                let content_type = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = resp.bytes().await?;
                let kind = manifest::classify(&body, content_type.as_deref())?;
                debug!(%image_ref, ?kind, "manifest found");
                Ok(matches!(kind, ManifestKind::Manifest | ManifestKind::Index))
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(OciError::Registry(format!(
                    "GET {} returned {}: {}",
                    url, status, body
                )))
            }
        }
    }

    // -- internals ----------------------------------------------------------

    /// GET with the anonymous → basic → bearer-token challenge flow.  The
    /// final response is returned as-is so callers can interpret 404.
    async fn authenticated_get(&self, url: &str, image_ref: &ImageRef) -> Result<Response> {
        let accept = manifest::accept_header();
        let resp = self.client.get(url).header(ACCEPT, &accept).send().await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let retry = self.client.get(url).header(ACCEPT, &accept);
        let retry = if challenge.to_ascii_lowercase().starts_with("basic") {
            let creds = self
                .credentials_for(image_ref)
                .ok_or_else(|| OciError::Unauthorized(image_ref.to_string()))?;
            creds.apply(retry)
        } else {
            let token = self.fetch_bearer_token(&challenge, image_ref).await?;
            retry.bearer_auth(token)
        };

        Ok(retry.send().await?)
    }

    /// Parse a `www-authenticate: Bearer realm="…",service="…",scope="…"`
    /// header and fetch a token, presenting credentials when configured.
    async fn fetch_bearer_token(&self, www_auth: &str, image_ref: &ImageRef) -> Result<String> {
        let realm = extract_param(www_auth, "realm").unwrap_or_default();
        let service = extract_param(www_auth, "service").unwrap_or_default();
        let scope = extract_param(www_auth, "scope")
            .unwrap_or_else(|| format!("repository:{}:pull", image_ref.repository));

        if realm.is_empty() {
            return Err(OciError::Registry(
                "www-authenticate header missing realm".to_string(),
            ));
        }

        debug!(%realm, %service, %scope, "fetching bearer token");

        let mut req = self
            .client
            .get(&realm)
            .query(&[("service", service.as_str()), ("scope", scope.as_str())]);
        if let Some(creds) = self.credentials_for(image_ref) {
            req = creds.apply(req);
        }

        let resp = req.send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(OciError::Unauthorized(image_ref.to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Registry(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| OciError::Registry("token response missing token field".to_string()))?;

        Ok(token.to_string())
    }
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    let start = header.find(&search)? + search.len();
    let end = header[start..].find('"')?;
    Some(header[start..start + end].to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn parse_versioned_repository() {
        let r = ImageRef::parse("registry.example.io/v2/0a1b2c").unwrap();
        assert_eq!(r.registry, "registry.example.io");
        assert_eq!(r.repository, "v2/0a1b2c");
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn parse_delta_tag() {
        let r = ImageRef::parse("registry.example.io/v3/bbbb:delta-aaaaaaaaaaaaaaaa").unwrap();
        assert_eq!(r.repository, "v3/bbbb");
        assert_eq!(r.reference, "delta-aaaaaaaaaaaaaaaa");
        assert_eq!(r.to_string(), "registry.example.io/v3/bbbb:delta-aaaaaaaaaaaaaaaa");
    }

    #[test]
    fn parse_digest_and_port() {
        let r = ImageRef::parse("localhost:5000/v2/abcd@sha256:abc123").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "v2/abcd");
        assert_eq!(r.reference, "sha256:abc123");
        assert_eq!(r.to_string(), "localhost:5000/v2/abcd@sha256:abc123");
    }

    #[test]
    fn parse_requires_host() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("alpine").is_err());
        assert!(ImageRef::parse("registry.example.io/").is_err());
    }

    #[test]
    fn registry_scheme_by_host() {
        assert_eq!(registry_scheme("localhost:5000"), "http");
        assert_eq!(registry_scheme("127.0.0.1:5000"), "http");
        assert_eq!(registry_scheme("registry.example.io"), "https");
    }

    #[test]
    fn extract_param_works() {
        let header = r#"Bearer realm="https://api.example.io/auth/v1/token",service="registry.example.io",scope="repository:v2/abcd:pull""#;
        assert_eq!(
            extract_param(header, "realm"),
            Some("https://api.example.io/auth/v1/token".to_string())
        );
        assert_eq!(
            extract_param(header, "scope"),
            Some("repository:v2/abcd:pull".to_string())
        );
        assert_eq!(extract_param(header, "missing"), None);
    }

    fn local_ref(server: &MockServer, tag: &str) -> ImageRef {
        ImageRef::parse(&format!("127.0.0.1:{}/v2/bbbb:{}", server.port(), tag)).unwrap()
    }

    #[tokio::test]
    async fn manifest_exists_true_on_manifest() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/v2/bbbb/manifests/delta-1");
                then.status(200)
                    .header("content-type", manifest::MEDIA_TYPE_OCI_MANIFEST)
                    .body(r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","layers":[]}"#);
            })
            .await;

        let client = RegistryClient::new().unwrap();
        assert!(client.manifest_exists(&local_ref(&server, "delta-1")).await.unwrap());
    }

    #[tokio::test]
    async fn manifest_exists_false_on_404() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/v2/bbbb/manifests/delta-2");
                then.status(404)
                    .body(r#"{"errors":[{"code":"MANIFEST_UNKNOWN"}]}"#);
            })
            .await;

        let client = RegistryClient::new().unwrap();
        assert!(!client.manifest_exists(&local_ref(&server, "delta-2")).await.unwrap());
    }

    #[tokio::test]
    async fn manifest_exists_follows_bearer_challenge() {
        let server = MockServer::start_async().await;
        let realm = format!("http://127.0.0.1:{}/auth/v1/token", server.port());

        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/v2/bbbb/manifests/delta-3")
                    .header("authorization", "Bearer tok-123");
                then.status(200)
                    .body(r#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","layers":[]}"#);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/v2/bbbb/manifests/delta-3")
                    .header_missing("authorization");
                then.status(401).header(
                    "www-authenticate",
                    format!(r#"Bearer realm="{realm}",service="registry""#),
                );
            })
            .await;
        let token = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/auth/v1/token")
                    .query_param("service", "registry")
                    .query_param("scope", "repository:v2/bbbb:pull")
                    .header_exists("authorization");
                then.status(200).body(r#"{"token":"tok-123"}"#);
            })
            .await;

        let host = format!("127.0.0.1:{}", server.port());
        let client = RegistryClient::new().unwrap().with_credentials(Credentials::new(
            host,
            "user",
            SecretString::from("pass".to_string()),
        ));
        assert!(client.manifest_exists(&local_ref(&server, "delta-3")).await.unwrap());
        token.assert_async().await;
    }

    fn fleet_credentials() -> Credentials {
        Credentials::new(
            "registry.example.io",
            "fleet-user",
            SecretString::from("fleet-key".to_string()),
        )
    }

    #[tokio::test]
    async fn basic_challenge_from_other_host_gets_no_credentials() {
        let server = MockServer::start_async().await;
        let authorized = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/v2/bbbb/manifests/delta-5")
                    .header_exists("authorization");
                then.status(200)
                    .body(r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","layers":[]}"#);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/v2/bbbb/manifests/delta-5")
                    .header_missing("authorization");
                then.status(401)
                    .header("www-authenticate", r#"Basic realm="registry""#);
            })
            .await;

        let client = RegistryClient::new()
            .unwrap()
            .with_credentials(fleet_credentials());
        let err = client
            .manifest_exists(&local_ref(&server, "delta-5"))
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::Unauthorized(_)));
        assert_eq!(authorized.hits_async().await, 0);
    }

    #[tokio::test]
    async fn token_for_other_host_is_fetched_anonymously() {
        let server = MockServer::start_async().await;
        let realm = format!("http://127.0.0.1:{}/auth/v1/token", server.port());

        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/v2/bbbb/manifests/delta-6")
                    .header("authorization", "Bearer anon-tok");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/v2/bbbb/manifests/delta-6")
                    .header_missing("authorization");
                then.status(401).header(
                    "www-authenticate",
                    format!(r#"Bearer realm="{realm}",service="registry""#),
                );
            })
            .await;
        let leaked = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/auth/v1/token")
                    .header_exists("authorization");
                then.status(200).body(r#"{"token":"leaked-tok"}"#);
            })
            .await;
        let anonymous = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/auth/v1/token")
                    .header_missing("authorization");
                then.status(200).body(r#"{"token":"anon-tok"}"#);
            })
            .await;

        let client = RegistryClient::new()
            .unwrap()
            .with_credentials(fleet_credentials());
        assert!(!client.manifest_exists(&local_ref(&server, "delta-6")).await.unwrap());
        anonymous.assert_async().await;
        assert_eq!(leaked.hits_async().await, 0);
    }

    #[test]
    fn credentials_match_their_registry_only() {
        let creds = fleet_credentials();
        assert!(creds.applies_to(&ImageRef::parse("registry.example.io/v2/bbbb").unwrap()));
        assert!(creds.applies_to(&ImageRef::parse("Registry.Example.IO/v2/bbbb").unwrap()));
        assert!(!creds.applies_to(&ImageRef::parse("evil.example.net/v2/bbbb").unwrap()));
        assert!(!creds.applies_to(&ImageRef::parse("registry.example.io:5000/v2/bbbb").unwrap()));
    }

    #[tokio::test]
    async fn manifest_exists_errors_when_forbidden() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/v2/bbbb/manifests/delta-4");
                then.status(403);
            })
            .await;

        let client = RegistryClient::new().unwrap();
        let err = client
            .manifest_exists(&local_ref(&server, "delta-4"))
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::Unauthorized(_)));
    }
}
