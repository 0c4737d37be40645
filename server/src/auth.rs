//! Bearer token verification. Tokens are minted by an external identity
//! service that shares the HS256 secret; `issue_jwt` exists for tooling and
//! tests.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

/// Claims stored within issued JWTs.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub name: String,
    pub exp: usize,
}

/// The authenticated caller, inserted into request extensions by the middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub display_name: String,
}

impl From<Claims> for AuthUser {
    fn from(c: Claims) -> Self {
        Self {
            user_id: c.sub,
            display_name: c.name,
        }
    }
}

/// Issue a JWT for a given subject valid for the provided duration.
pub fn issue_jwt(secret: &[u8], sub: Uuid, name: &str, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub,
        name: name.into(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(data.claims)
}

/// Decode the configured secret, or load/create one under `data_dir`.
pub fn resolve_secret(configured: Option<&str>, data_dir: &Path) -> Result<Vec<u8>> {
    if let Some(b64) = configured {
        return STANDARD.decode(b64.trim()).context("jwt_secret is not valid base64");
    }
    let path = data_dir.join("jwt_secret");
    if let Ok(stored) = std::fs::read_to_string(&path) {
        return STANDARD
            .decode(stored.trim())
            .context("stored jwt secret is corrupt");
    }
    let mut secret = Vec::with_capacity(32);
    secret.extend_from_slice(Uuid::new_v4().as_bytes());
    secret.extend_from_slice(Uuid::new_v4().as_bytes());
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, STANDARD.encode(&secret))?;
    info!(path = %path.display(), "generated jwt secret");
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_issue_and_verify() {
        let secret = b"secret";
        let user = Uuid::new_v4();
        let token = issue_jwt(secret, user, "Alice", Duration::seconds(60)).unwrap();
        let claims = verify_jwt(secret, &token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.name, "Alice");
        assert!(verify_jwt(b"other", &token).is_err());
    }

    #[test]
    fn jwt_expiry() {
        let secret = b"secret";
        let token = issue_jwt(secret, Uuid::new_v4(), "a", Duration::seconds(-10)).unwrap();
        // Validation should fail because exp is in the past
        assert!(verify_jwt(secret, &token).is_err());
    }

    #[test]
    fn generated_secret_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = resolve_secret(None, dir.path()).unwrap();
        let second = resolve_secret(None, dir.path()).unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(first, second);
        assert_eq!(
            resolve_secret(Some("c2VjcmV0"), dir.path()).unwrap(),
            b"secret".to_vec()
        );
        assert!(resolve_secret(Some("not base64!"), dir.path()).is_err());
    }
}
