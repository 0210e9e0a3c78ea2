//! Signed access tokens.
//!
//! Access tokens are RS256 JWTs signed by [`JwksManager`]. They embed the subject, a unique
//! `jti`, the subject's flattened roles and permissions at mint time, and for OAuth-issued
//! tokens the client id and the space-delimited granted scopes. Validation reports exactly
//! which check failed so callers can branch on it.

use crate::errors::GateError;
use crate::jwks::JwksManager;
use crate::settings::Tokens;
use crate::storage;
use base64ct::{Base64UrlUnpadded, Encoding};
use josekit::jwt::JwtPayload;
use josekit::JoseError;
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const CLAIM_NAME: &str = "name";
const CLAIM_EMAIL: &str = "email";
const CLAIM_EXT_ISSUER: &str = "ext_iss";
const CLAIM_EXT_SUBJECT: &str = "ext_sub";
const CLAIM_ROLES: &str = "roles";
const CLAIM_PERMISSIONS: &str = "permissions";
const CLAIM_CLIENT_ID: &str = "client_id";
const CLAIM_SCOPE: &str = "scope";

/// Everything that goes into a freshly minted access token besides the time window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessTokenInput {
    pub subject_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub external_issuer: Option<String>,
    pub external_subject_id: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MintedAccessToken {
    pub token: String,
    pub jti: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl MintedAccessToken {
    pub fn expires_in(&self) -> i64 {
        self.expires_at - self.issued_at
    }
}

/// Claims reconstructed from a token that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    pub subject_id: String,
    pub jti: String,
    pub issued_at: Option<i64>,
    pub expires_at: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub external_issuer: Option<String>,
    pub external_subject_id: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token uses an unsupported signing algorithm")]
    BadAlgorithm,
    #[error("token was issued by an unexpected issuer")]
    BadIssuer,
    #[error("token is not intended for this audience")]
    BadAudience,
    #[error("token is not valid yet")]
    NotYetValid,
    #[error("token is malformed")]
    Malformed,
    #[error("token could not be validated")]
    Unknown,
}

impl TokenValidationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::BadSignature => "bad_signature",
            Self::BadAlgorithm => "bad_algorithm",
            Self::BadIssuer => "bad_issuer",
            Self::BadAudience => "bad_audience",
            Self::NotYetValid => "not_yet_valid",
            Self::Malformed => "malformed",
            Self::Unknown => "unknown",
        }
    }
}

/// An opaque refresh token: the plaintext goes to the client once, only the hash is stored.
#[derive(Debug, Clone)]
pub struct OpaqueToken {
    pub plaintext: String,
    pub hash: String,
}

#[derive(Clone)]
pub struct TokenCodec {
    jwks: JwksManager,
    issuer: String,
    audience: String,
    access_ttl_secs: i64,
    clock_skew_secs: i64,
}

impl TokenCodec {
    pub fn new(jwks: JwksManager, issuer: impl Into<String>, cfg: &Tokens) -> Self {
        Self {
            jwks,
            issuer: issuer.into(),
            audience: cfg.audience.clone(),
            access_ttl_secs: cfg.access_token_ttl_secs,
            clock_skew_secs: cfg.clock_skew_secs,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Seconds from `now` until [`validate`](Self::validate) stops accepting a token that
    /// expires at `expires_at`, clock skew included. Never negative.
    pub fn acceptance_remaining(&self, expires_at: i64, now: i64) -> i64 {
        // validate accepts through the whole final second
        (expires_at + self.clock_skew_secs + 1 - now).max(0)
    }

    pub fn mint(&self, input: &AccessTokenInput, now: i64) -> Result<MintedAccessToken, GateError> {
        let jti = storage::new_id();
        let expires_at = now + self.access_ttl_secs;

        let mut payload = JwtPayload::new();
        payload.set_subject(&input.subject_id);
        payload.set_jwt_id(&jti);
        payload.set_issuer(&self.issuer);
        payload.set_audience(vec![self.audience.clone()]);
        payload.set_issued_at(&to_system_time(now));
        payload.set_not_before(&to_system_time(now));
        payload.set_expires_at(&to_system_time(expires_at));

        set_optional(&mut payload, CLAIM_NAME, input.name.as_deref())?;
        set_optional(&mut payload, CLAIM_EMAIL, input.email.as_deref())?;
        set_optional(&mut payload, CLAIM_EXT_ISSUER, input.external_issuer.as_deref())?;
        set_optional(
            &mut payload,
            CLAIM_EXT_SUBJECT,
            input.external_subject_id.as_deref(),
        )?;
        payload.set_claim(CLAIM_ROLES, Some(json!(input.roles)))?;
        payload.set_claim(CLAIM_PERMISSIONS, Some(json!(input.permissions)))?;
        if let Some(client_id) = &input.client_id {
            payload.set_claim(CLAIM_CLIENT_ID, Some(json!(client_id)))?;
            payload.set_claim(CLAIM_SCOPE, Some(json!(input.scopes.join(" "))))?;
        }

        let token = self.jwks.sign_jwt_rs256(&payload)?;
        Ok(MintedAccessToken {
            token,
            jti,
            issued_at: now,
            expires_at,
        })
    }

    pub fn validate(&self, token: &str, now: i64) -> Result<AccessClaims, TokenValidationError> {
        check_header_alg(token)?;

        let payload = self.jwks.verify_jwt_rs256(token).map_err(|e| match e {
            JoseError::InvalidSignature(_) => TokenValidationError::BadSignature,
            JoseError::UnsupportedSignatureAlgorithm(_) => TokenValidationError::BadAlgorithm,
            JoseError::InvalidJwtFormat(_) => TokenValidationError::Malformed,
            _ => TokenValidationError::Unknown,
        })?;

        if payload.issuer() != Some(self.issuer.as_str()) {
            return Err(TokenValidationError::BadIssuer);
        }
        let audience_ok = payload
            .audience()
            .map(|aud| aud.iter().any(|a| *a == self.audience))
            .unwrap_or(false);
        if !audience_ok {
            return Err(TokenValidationError::BadAudience);
        }

        let expires_at = payload
            .expires_at()
            .and_then(from_system_time)
            .ok_or(TokenValidationError::Malformed)?;
        if now > expires_at + self.clock_skew_secs {
            return Err(TokenValidationError::Expired);
        }
        if let Some(nbf) = payload.not_before().and_then(from_system_time) {
            if now + self.clock_skew_secs < nbf {
                return Err(TokenValidationError::NotYetValid);
            }
        }

        let subject_id = payload
            .subject()
            .ok_or(TokenValidationError::Malformed)?
            .to_string();
        let jti = payload
            .jwt_id()
            .ok_or(TokenValidationError::Malformed)?
            .to_string();

        Ok(AccessClaims {
            subject_id,
            jti,
            issued_at: payload.issued_at().and_then(from_system_time),
            expires_at,
            name: string_claim(&payload, CLAIM_NAME),
            email: string_claim(&payload, CLAIM_EMAIL),
            external_issuer: string_claim(&payload, CLAIM_EXT_ISSUER),
            external_subject_id: string_claim(&payload, CLAIM_EXT_SUBJECT),
            roles: list_claim(&payload, CLAIM_ROLES),
            permissions: list_claim(&payload, CLAIM_PERMISSIONS),
            client_id: string_claim(&payload, CLAIM_CLIENT_ID),
            scopes: string_claim(&payload, CLAIM_SCOPE)
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    pub fn generate_refresh_token(&self) -> OpaqueToken {
        let plaintext = storage::random_token();
        let hash = storage::hash_token(&plaintext);
        OpaqueToken { plaintext, hash }
    }
}

/// Reject anything but RS256 before the verifier sees it, so an `alg` swap is reported as such.
fn check_header_alg(token: &str) -> Result<(), TokenValidationError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(TokenValidationError::Malformed)?;
    if parts.count() != 2 {
        return Err(TokenValidationError::Malformed);
    }
    let raw = Base64UrlUnpadded::decode_vec(header_b64.trim_end_matches('='))
        .map_err(|_| TokenValidationError::Malformed)?;
    let header: Value =
        serde_json::from_slice(&raw).map_err(|_| TokenValidationError::Malformed)?;
    match header.get("alg").and_then(Value::as_str) {
        Some("RS256") => Ok(()),
        Some(_) => Err(TokenValidationError::BadAlgorithm),
        None => Err(TokenValidationError::Malformed),
    }
}

fn set_optional(payload: &mut JwtPayload, key: &str, value: Option<&str>) -> Result<(), GateError> {
    if let Some(v) = value {
        payload.set_claim(key, Some(json!(v)))?;
    }
    Ok(())
}

fn string_claim(payload: &JwtPayload, key: &str) -> Option<String> {
    payload
        .claim(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn list_claim(payload: &JwtPayload, key: &str) -> Vec<String> {
    payload
        .claim(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn to_system_time(ts: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64)
}

fn from_system_time(t: SystemTime) -> Option<i64> {
    t.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Keys;
    use tempfile::TempDir;

    async fn codec(dir: &TempDir, issuer: &str, audience: &str) -> TokenCodec {
        let keys = Keys {
            jwks_path: dir.path().join("jwks.json"),
            key_id: Some("test-key".to_string()),
            alg: "RS256".to_string(),
            private_key_path: dir.path().join("private.json"),
        };
        let jwks = JwksManager::new(keys).await.expect("keys");
        let cfg = Tokens {
            audience: audience.to_string(),
            ..Tokens::default()
        };
        TokenCodec::new(jwks, issuer, &cfg)
    }

    fn input() -> AccessTokenInput {
        AccessTokenInput {
            subject_id: "sub-1".to_string(),
            name: Some("Alice".to_string()),
            email: Some("alice@example.com".to_string()),
            roles: vec!["readable".to_string()],
            permissions: vec!["*:*:read".to_string()],
            client_id: Some("xdrip".to_string()),
            scopes: vec!["entries.read".to_string(), "treatments.read".to_string()],
            ..AccessTokenInput::default()
        }
    }

    #[tokio::test]
    async fn test_mint_and_validate_carries_claims() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, "https://ns.example.com", "nightscout").await;
        let now = storage::now();

        let minted = codec.mint(&input(), now).unwrap();
        assert_eq!(minted.expires_in(), 3600);

        let claims = codec.validate(&minted.token, now).unwrap();
        assert_eq!(claims.subject_id, "sub-1");
        assert_eq!(claims.jti, minted.jti);
        assert_eq!(claims.name.as_deref(), Some("Alice"));
        assert_eq!(claims.roles, vec!["readable"]);
        assert_eq!(claims.permissions, vec!["*:*:read"]);
        assert_eq!(claims.client_id.as_deref(), Some("xdrip"));
        assert_eq!(claims.scopes, vec!["entries.read", "treatments.read"]);
        assert!(claims.external_issuer.is_none());
    }

    #[tokio::test]
    async fn test_expiry_respects_clock_skew() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, "https://ns.example.com", "nightscout").await;
        let now = storage::now();
        let minted = codec.mint(&input(), now).unwrap();

        // within the 30s skew window
        assert!(codec.validate(&minted.token, minted.expires_at + 10).is_ok());
        assert_eq!(
            codec.validate(&minted.token, minted.expires_at + 31),
            Err(TokenValidationError::Expired)
        );
        assert_eq!(
            codec.validate(&minted.token, now - 120),
            Err(TokenValidationError::NotYetValid)
        );
    }

    #[tokio::test]
    async fn test_acceptance_remaining_covers_skew_window() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, "https://ns.example.com", "nightscout").await;
        let now = storage::now();
        let minted = codec.mint(&input(), now).unwrap();

        assert_eq!(codec.acceptance_remaining(minted.expires_at, now), 3600 + 30 + 1);
        // past exp but still accepted
        let late = minted.expires_at + 30;
        assert!(codec.validate(&minted.token, late).is_ok());
        assert_eq!(codec.acceptance_remaining(minted.expires_at, late), 1);
        assert_eq!(codec.acceptance_remaining(minted.expires_at, late + 5), 0);
    }

    #[tokio::test]
    async fn test_issuer_and_audience_mismatch_are_distinguished() {
        let dir = TempDir::new().unwrap();
        let codec_a = codec(&dir, "https://a.example.com", "nightscout").await;
        // same key files, different expectations
        let codec_b = codec(&dir, "https://b.example.com", "nightscout").await;
        let codec_c = codec(&dir, "https://a.example.com", "other").await;
        let now = storage::now();
        let token = codec_a.mint(&input(), now).unwrap().token;

        assert_eq!(
            codec_b.validate(&token, now),
            Err(TokenValidationError::BadIssuer)
        );
        assert_eq!(
            codec_c.validate(&token, now),
            Err(TokenValidationError::BadAudience)
        );
    }

    #[tokio::test]
    async fn test_foreign_key_is_bad_signature() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let codec_a = codec(&dir_a, "https://ns.example.com", "nightscout").await;
        let codec_b = codec(&dir_b, "https://ns.example.com", "nightscout").await;
        let now = storage::now();
        let token = codec_a.mint(&input(), now).unwrap().token;

        assert_eq!(
            codec_b.validate(&token, now),
            Err(TokenValidationError::BadSignature)
        );
    }

    #[tokio::test]
    async fn test_malformed_and_alg_none() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, "https://ns.example.com", "nightscout").await;
        let now = storage::now();

        assert_eq!(
            codec.validate("not-a-jwt", now),
            Err(TokenValidationError::Malformed)
        );

        let header = Base64UrlUnpadded::encode_string(br#"{"alg":"none","typ":"JWT"}"#);
        let body = Base64UrlUnpadded::encode_string(br#"{"sub":"x"}"#);
        let forged = format!("{header}.{body}.");
        assert_eq!(
            codec.validate(&forged, now),
            Err(TokenValidationError::BadAlgorithm)
        );
    }

    #[tokio::test]
    async fn test_refresh_tokens_are_unique_and_hashed() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, "https://ns.example.com", "nightscout").await;
        let a = codec.generate_refresh_token();
        let b = codec.generate_refresh_token();
        assert_ne!(a.plaintext, b.plaintext);
        assert_eq!(a.hash, storage::hash_token(&a.plaintext));
        assert_ne!(a.hash, a.plaintext);
    }
}
