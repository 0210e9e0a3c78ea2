use crate::audit::{AuditEvent, AuditEventType};
use crate::clients;
use crate::entities::auth_code;
use crate::errors::GateError;
use crate::grants;
use crate::storage;
use base64ct::{Base64UrlUnpadded, Encoding};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const PKCE_METHOD_S256: &str = "S256";

#[derive(Debug, Clone)]
pub struct NewAuthCode<'a> {
    pub client_id: &'a str,
    pub subject_id: &'a str,
    pub scopes: &'a [String],
    pub redirect_uri: &'a str,
    pub code_challenge: &'a str,
    pub code_challenge_method: &'a str,
}

#[derive(Debug, Clone)]
pub struct RedeemedCode {
    pub client_id: String,
    pub subject_id: String,
    pub scopes: Vec<String>,
}

/// Every variant surfaces as `invalid_grant`; the variant only goes to the log.
#[derive(Debug, Error)]
pub enum AuthCodeError {
    #[error("authorization code rejected: {0}")]
    Rejected(&'static str),
    #[error(transparent)]
    Internal(#[from] GateError),
}

impl From<sea_orm::DbErr> for AuthCodeError {
    fn from(value: sea_orm::DbErr) -> Self {
        AuthCodeError::Internal(value.into())
    }
}

pub fn pkce_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    Base64UrlUnpadded::encode_string(&digest)
}

/// RFC 7636 section 4.1: 43 to 128 characters from the unreserved set.
pub fn is_valid_code_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

fn verify_pkce(verifier: &str, challenge: &str) -> bool {
    if !is_valid_code_verifier(verifier) {
        return false;
    }
    pkce_s256(verifier)
        .as_bytes()
        .ct_eq(challenge.as_bytes())
        .into()
}

/// Store a single-use code and return its plaintext. Only S256 challenges are accepted.
pub async fn generate_code<C: ConnectionTrait>(
    db: &C,
    ttl_secs: i64,
    req: NewAuthCode<'_>,
    now: i64,
) -> Result<String, GateError> {
    if req.code_challenge_method != PKCE_METHOD_S256 {
        return Err(GateError::Validation(
            "code_challenge_method must be S256".into(),
        ));
    }
    // base64url of a SHA-256 digest
    if req.code_challenge.len() != 43 {
        return Err(GateError::Validation("code_challenge is malformed".into()));
    }

    let client_id = clients::normalize_client_id(req.client_id);
    let scopes = grants::merge_scopes(&[], req.scopes);
    let code = storage::random_token();

    auth_code::ActiveModel {
        id: Set(storage::new_id()),
        code_hash: Set(storage::hash_token(&code)),
        client_id: Set(client_id.clone()),
        subject_id: Set(req.subject_id.to_string()),
        scopes: Set(storage::encode_list(&scopes)?),
        redirect_uri: Set(req.redirect_uri.to_string()),
        code_challenge: Set(req.code_challenge.to_string()),
        code_challenge_method: Set(req.code_challenge_method.to_string()),
        created_at: Set(now),
        expires_at: Set(now + ttl_secs),
        redeemed_at: Set(None),
    }
    .insert(db)
    .await?;

    AuditEvent::new(AuditEventType::AuthCodeIssued)
        .subject(req.subject_id)
        .client(Some(&client_id))
        .scopes(&scopes)
        .emit();
    Ok(code)
}

/// Mark the code redeemed and validate every binding. Run inside the caller's transaction:
/// the grant and tokens derived from it commit together, and rolling back after a rejection
/// leaves the code unredeemed.
pub async fn redeem<C: ConnectionTrait>(
    db: &C,
    code: &str,
    client_id: &str,
    redirect_uri: &str,
    code_verifier: &str,
    now: i64,
) -> Result<RedeemedCode, AuthCodeError> {
    let code_hash = storage::hash_token(code);
    // Claim before reading so concurrent redeemers queue on the write lock. A rejection below
    // leaves the claim to the caller's rollback.
    let claimed = auth_code::Entity::update_many()
        .col_expr(auth_code::Column::RedeemedAt, Expr::value(now))
        .filter(auth_code::Column::CodeHash.eq(code_hash.clone()))
        .filter(auth_code::Column::RedeemedAt.is_null())
        .filter(auth_code::Column::ExpiresAt.gte(now))
        .exec(db)
        .await?;

    let model = auth_code::Entity::find()
        .filter(auth_code::Column::CodeHash.eq(code_hash))
        .one(db)
        .await?
        .ok_or(AuthCodeError::Rejected("unknown code"))?;

    if claimed.rows_affected != 1 {
        return Err(AuthCodeError::Rejected(if model.expires_at < now {
            "code expired"
        } else {
            "code already redeemed"
        }));
    }
    if model.client_id != clients::normalize_client_id(client_id) {
        return Err(AuthCodeError::Rejected("client_id mismatch"));
    }
    if model.redirect_uri != redirect_uri {
        return Err(AuthCodeError::Rejected("redirect_uri mismatch"));
    }
    if model.code_challenge_method != PKCE_METHOD_S256
        || !verify_pkce(code_verifier, &model.code_challenge)
    {
        return Err(AuthCodeError::Rejected("PKCE verification failed"));
    }

    Ok(RedeemedCode {
        client_id: model.client_id,
        subject_id: model.subject_id,
        scopes: storage::decode_list(&model.scopes)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 appendix B
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn test_pkce_rfc_vector() {
        assert_eq!(pkce_s256(VERIFIER), CHALLENGE);
        assert!(verify_pkce(VERIFIER, CHALLENGE));
    }

    #[test]
    fn test_pkce_rejects_wrong_or_short_verifier() {
        assert!(!verify_pkce(
            "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXj",
            CHALLENGE
        ));
        assert!(!verify_pkce("short", &pkce_s256("short")));
    }

    #[test]
    fn test_verifier_charset() {
        assert!(is_valid_code_verifier(VERIFIER));
        assert!(!is_valid_code_verifier(&"a".repeat(129)));
        assert!(!is_valid_code_verifier(&format!("{}+", "a".repeat(43))));
    }
}
