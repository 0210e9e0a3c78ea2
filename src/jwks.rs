use crate::errors::GateError;
use crate::settings::Keys;
use base64ct::Encoding;
use josekit::jwk::Jwk;
use josekit::jws::{JwsHeader, RS256};
use josekit::jwt;
use josekit::jwt::JwtPayload;
use rand::RngCore;
use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;

/// Signing key material for access tokens. The key pair is generated on first start and
/// persisted as JSON JWKs so that tokens survive restarts.
#[derive(Clone)]
pub struct JwksManager {
    public_jwks_value: Arc<Value>,
    private_jwk: Arc<Jwk>,
    public_jwk: Arc<Jwk>,
}

impl JwksManager {
    pub async fn new(cfg: Keys) -> Result<Self, GateError> {
        if let Some(parent) = cfg.jwks_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = cfg.private_key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let private_jwk = if cfg.private_key_path.exists() {
            let s = fs::read_to_string(&cfg.private_key_path)?;
            serde_json::from_str::<Jwk>(&s)?
        } else {
            let mut jwk = Jwk::generate_rsa_key(2048)?;
            let kid = cfg.key_id.clone().unwrap_or_else(random_kid);
            jwk.set_key_id(&kid);
            jwk.set_algorithm(cfg.alg.as_str());
            jwk.set_key_use("sig");
            fs::write(&cfg.private_key_path, serde_json::to_string_pretty(&jwk)?)?;
            tracing::info!(kid = %kid, "Generated new access-token signing key");
            jwk
        };

        let public_jwk = private_jwk.to_public_key()?;

        // The published set is always derived from the private key in use.
        let jwks = json!({ "keys": [serde_json::to_value(&public_jwk)?] });
        fs::write(&cfg.jwks_path, serde_json::to_string_pretty(&jwks)?)?;

        Ok(Self {
            public_jwks_value: Arc::new(jwks),
            private_jwk: Arc::new(private_jwk),
            public_jwk: Arc::new(public_jwk),
        })
    }

    pub fn jwks_json(&self) -> Value {
        (*self.public_jwks_value).clone()
    }

    pub fn sign_jwt_rs256(&self, payload: &JwtPayload) -> Result<String, GateError> {
        let signer = RS256.signer_from_jwk(&self.private_jwk)?;
        let mut header = JwsHeader::new();
        if let Some(kid) = self.private_jwk.key_id() {
            header.set_key_id(kid);
        }
        header.set_token_type("JWT");
        header.set_algorithm("RS256");
        Ok(jwt::encode_with_signer(payload, &header, &signer)?)
    }

    /// Verify an RS256 signature and return the payload. Claims are not checked here.
    pub fn verify_jwt_rs256(&self, token: &str) -> Result<JwtPayload, josekit::JoseError> {
        let verifier = RS256.verifier_from_jwk(&self.public_jwk)?;
        let (payload, _header) = jwt::decode_with_verifier(token, &verifier)?;
        Ok(payload)
    }
}

fn random_kid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}
