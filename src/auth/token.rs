//! Signed bearer tokens.
//!
//! Tokens are `base64url(claims JSON) "." base64url(HMAC-SHA256 tag)` over a
//! shared secret.  Raw tokens are never persisted; the revocation store is
//! keyed by a SHA-256 hex digest of the full token string.

use anyhow::{anyhow, bail, Context, Result};
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Signed claims carried by a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identifier of the acting identity.
    pub sub: String,
    /// Capabilities granted to the subject.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Expiry as unix seconds.
    pub exp: i64,
}

impl Claims {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Sign `claims` into a token string.  Exists for operators and tests; the
/// server itself only verifies.
pub fn sign_token(claims: &Claims, secret: &[u8]) -> Result<String> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).context("claims encode")?);
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| anyhow!("invalid secret"))?;
    mac.update(payload.as_bytes());
    let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{payload}.{tag}"))
}

/// Verify a token's signature and expiry and return its claims.
pub fn verify_token(token: &str, secret: &[u8]) -> Result<Claims> {
    let (payload, tag) = token.split_once('.').context("malformed token")?;

    let tag_bytes = URL_SAFE_NO_PAD
        .decode(tag)
        .context("malformed token signature")?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| anyhow!("invalid secret"))?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&tag_bytes)
        .map_err(|_| anyhow!("invalid token signature"))?;

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .context("malformed token payload")?;
    let claims: Claims =
        serde_json::from_slice(&claims_bytes).context("malformed token claims")?;

    if claims.exp <= Utc::now().timestamp() {
        bail!("token expired");
    }
    Ok(claims)
}

/// SHA-256 hex digest of the raw token, the key used by the revocation store.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Pull the bearer token out of `Authorization` or the configured alternate
/// header.
pub fn extract_bearer(headers: &HeaderMap, alt_header: &str) -> Option<String> {
    let value = headers
        .get(header::AUTHORIZATION)
        .or_else(|| headers.get(alt_header))?
        .to_str()
        .ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    fn claims(capabilities: &[&str], exp_offset: i64) -> Claims {
        Claims {
            sub: "user-1".to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            exp: Utc::now().timestamp() + exp_offset,
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let token = sign_token(&claims(&["manage_workdir"], 3600), SECRET).unwrap();
        let verified = verify_token(&token, SECRET).unwrap();
        assert_eq!(verified.sub, "user-1");
        assert!(verified.has_capability("manage_workdir"));
        assert!(!verified.has_capability("admin"));
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = sign_token(&claims(&[], 3600), SECRET).unwrap();
        let err = verify_token(&token, b"other-secret").unwrap_err();
        assert!(err.to_string().contains("invalid token signature"));
    }

    #[test]
    fn rejects_tampered_payload() {
        let token = sign_token(&claims(&[], 3600), SECRET).unwrap();
        let (_, tag) = token.split_once('.').unwrap();
        let forged_claims = claims(&["manage_workdir"], 3600);
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        let forged = format!("{forged_payload}.{tag}");
        assert!(verify_token(&forged, SECRET).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let token = sign_token(&claims(&[], -10), SECRET).unwrap();
        let err = verify_token(&token, SECRET).unwrap_err();
        assert!(err.to_string().contains("token expired"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(verify_token("nonsense", SECRET).is_err());
        assert!(verify_token("a.b", SECRET).is_err());
        assert!(verify_token("", SECRET).is_err());
    }

    #[test]
    fn token_hash_is_stable_hex() {
        let hash = token_hash("abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, token_hash("abc"));
        assert_ne!(hash, token_hash("abd"));
    }

    #[test]
    fn extracts_from_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok123".parse().unwrap());
        assert_eq!(
            extract_bearer(&headers, "authorization-x").as_deref(),
            Some("tok123")
        );
    }

    #[test]
    fn extracts_from_alternate_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization-x", "Bearer tok456".parse().unwrap());
        assert_eq!(
            extract_bearer(&headers, "authorization-x").as_deref(),
            Some("tok456")
        );
    }

    #[test]
    fn missing_or_malformed_header_is_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers, "authorization-x"), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(extract_bearer(&headers, "authorization-x"), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(extract_bearer(&headers, "authorization-x"), None);
    }
}
