//! Bearer token verification.
//!
//! The verifier is either enforced (verification material configured) or
//! disabled (every request accepted).  Disabled mode is how the service runs
//! behind a trusted proxy; it is selected once at startup.

use std::str::FromStr;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{Error, Result};

/// Verification material for enforced mode.
pub enum KeyMaterial {
    /// Shared secret for the HMAC family.
    Secret(SecretString),
    /// PEM-encoded public key for the RSA, ECDSA and EdDSA families.
    PublicKeyPem(Vec<u8>),
}

/// Startup inputs for the verifier.
pub struct AuthConfig {
    pub algorithm: String,
    pub material: Option<KeyMaterial>,
}

/// Claims of an accepted token.  Empty in disabled mode.
pub type Claims = Map<String, Value>;

pub enum AuthVerifier {
    Disabled,
    Enforced {
        key: DecodingKey,
        validation: Validation,
    },
}

impl AuthVerifier {
    /// Build the verifier.  Fails when the algorithm is unknown or does not
    /// fit the kind of material supplied.
    pub fn from_config(config: AuthConfig) -> Result<Self> {
        let Some(material) = config.material else {
            return Ok(Self::Disabled);
        };

        let algorithm = Algorithm::from_str(config.algorithm.trim())
            .map_err(|_| Error::Config(format!("unknown JWT algorithm '{}'", config.algorithm)))?;

        let key = match (algorithm_family(algorithm), material) {
            (Family::Hmac, KeyMaterial::Secret(secret)) => {
                DecodingKey::from_secret(secret.expose_secret().as_bytes())
            }
            (Family::Rsa, KeyMaterial::PublicKeyPem(pem)) => DecodingKey::from_rsa_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid RSA public key: {e}")))?,
            (Family::Ec, KeyMaterial::PublicKeyPem(pem)) => DecodingKey::from_ec_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid EC public key: {e}")))?,
            (Family::Ed, KeyMaterial::PublicKeyPem(pem)) => DecodingKey::from_ed_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid Ed25519 public key: {e}")))?,
            (_, KeyMaterial::Secret(_)) => {
                return Err(Error::Config(format!(
                    "{algorithm:?} needs a public key, not a shared secret"
                )))
            }
            (_, KeyMaterial::PublicKeyPem(_)) => {
                return Err(Error::Config(format!(
                    "{algorithm:?} needs a shared secret, not a public key"
                )))
            }
        };

        // Only the configured algorithm is accepted; `exp`/`nbf` are checked
        // when present but not required.
        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims.clear();
        validation.validate_aud = false;

        Ok(Self::Enforced { key, validation })
    }

    pub fn is_enforced(&self) -> bool {
        matches!(self, Self::Enforced { .. })
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enforced { .. } => "enforced",
        }
    }

    /// Verify the raw `Authorization` header value.
    pub fn verify(&self, authorization: Option<&str>) -> Result<Claims> {
        let Self::Enforced { key, validation } = self else {
            return Ok(Claims::new());
        };

        let header = authorization
            .ok_or_else(|| Error::Auth("authorization header must be provided".into()))?;
        let token = bearer_token(header)
            .ok_or_else(|| Error::Auth("authorization header is not a bearer token".into()))?;

        let data = decode::<Claims>(token, key, validation)
            .map_err(|e| Error::Auth(format!("token rejected: {e}")))?;

        debug!(
            sub = data.claims.get("sub").and_then(serde_json::Value::as_str).unwrap_or("-"),
            "token accepted"
        );
        Ok(data.claims)
    }
}

enum Family {
    Hmac,
    Rsa,
    Ec,
    Ed,
}

fn algorithm_family(algorithm: Algorithm) -> Family {
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Family::Hmac,
        Algorithm::ES256 | Algorithm::ES384 => Family::Ec,
        Algorithm::EdDSA => Family::Ed,
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => Family::Rsa,
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
