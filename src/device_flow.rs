//! OAuth 2.0 Device Authorization Grant (RFC 8628).
//!
//! A device receives an opaque device code (stored hashed) and a short user code the human
//! types on another screen. The device polls the token endpoint; polling faster than the
//! current interval raises the interval instead of failing harder.

use crate::audit::{AuditEvent, AuditEventType};
use crate::clients;
use crate::entities::device_code;
use crate::errors::GateError;
use crate::grants;
use crate::settings::Device as DeviceCfg;
use crate::storage;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, SqlErr,
    TransactionTrait,
};
use serde::Serialize;
use thiserror::Error;

/// Consonants only: no vowels (no accidental words), no digits (no 0/O or 1/I confusion).
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";
const USER_CODE_LEN: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub expires_in: i64,
    pub interval: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Approved,
    Denied,
    Consumed,
    Expired,
}

/// What the device receives once its code has been approved and consumed.
#[derive(Debug, Clone)]
pub struct ApprovedDevice {
    pub grant_id: String,
    pub subject_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DeviceFlowError {
    #[error("the user has not yet approved the request")]
    AuthorizationPending,
    #[error("polling too frequently, new interval is {interval}s")]
    SlowDown { interval: i64 },
    #[error("the user denied the request")]
    AccessDenied,
    #[error("the device code has expired")]
    ExpiredToken,
    #[error("invalid device code: {0}")]
    InvalidGrant(&'static str),
    #[error("unknown user code")]
    UnknownUserCode,
    #[error("request was already approved")]
    AlreadyApproved,
    #[error("request was already denied")]
    AlreadyDenied,
    #[error(transparent)]
    Internal(#[from] GateError),
}

impl DeviceFlowError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown { .. } => "slow_down",
            Self::AccessDenied => "access_denied",
            Self::ExpiredToken => "expired_token",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnknownUserCode => "unknown_user_code",
            Self::AlreadyApproved => "already_approved",
            Self::AlreadyDenied => "already_denied",
            Self::Internal(_) => "server_error",
        }
    }
}

impl From<sea_orm::DbErr> for DeviceFlowError {
    fn from(value: sea_orm::DbErr) -> Self {
        DeviceFlowError::Internal(value.into())
    }
}

pub fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(USER_CODE_LEN + 1);
    for i in 0..USER_CODE_LEN {
        if i == USER_CODE_LEN / 2 {
            code.push('-');
        }
        let idx = rng.gen_range(0..USER_CODE_ALPHABET.len());
        code.push(USER_CODE_ALPHABET[idx] as char);
    }
    code
}

/// Canonical `XXXX-XXXX` form of user input: case, hyphens and whitespace are ignored.
pub fn normalize_user_code(input: &str) -> Option<String> {
    let chars: Vec<char> = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if chars.len() != USER_CODE_LEN || !chars.iter().all(|c| USER_CODE_ALPHABET.contains(&(*c as u8)))
    {
        return None;
    }
    let (left, right) = chars.split_at(USER_CODE_LEN / 2);
    Some(format!(
        "{}-{}",
        left.iter().collect::<String>(),
        right.iter().collect::<String>()
    ))
}

pub fn status(model: &device_code::Model, now: i64) -> DeviceStatus {
    if model.consumed_at.is_some() {
        DeviceStatus::Consumed
    } else if model.denied_at.is_some() {
        DeviceStatus::Denied
    } else if model.expires_at < now {
        DeviceStatus::Expired
    } else if model.approved_at.is_some() {
        DeviceStatus::Approved
    } else {
        DeviceStatus::Pending
    }
}

pub async fn create_device_code<C: ConnectionTrait>(
    db: &C,
    cfg: &DeviceCfg,
    client_id: &str,
    scopes: &[String],
    now: i64,
) -> Result<DeviceAuthorization, GateError> {
    create_device_code_with(db, cfg, client_id, scopes, now, generate_user_code).await
}

/// Like [`create_device_code`] with a pluggable user-code source.
pub async fn create_device_code_with<C, G>(
    db: &C,
    cfg: &DeviceCfg,
    client_id: &str,
    scopes: &[String],
    now: i64,
    mut next_user_code: G,
) -> Result<DeviceAuthorization, GateError>
where
    C: ConnectionTrait,
    G: FnMut() -> String,
{
    let client = clients::find_or_create(db, client_id).await?;
    let scopes = grants::merge_scopes(&[], scopes);
    let device_code = storage::random_token();

    for attempt in 1..=cfg.user_code_max_attempts {
        let user_code = next_user_code();

        // Expired codes keep their slot until the cleanup sweep removes them.
        let taken = device_code::Entity::find()
            .filter(device_code::Column::UserCode.eq(user_code.clone()))
            .one(db)
            .await?;
        if taken.is_some() {
            tracing::debug!(attempt, "User code collision, regenerating");
            continue;
        }

        let inserted = device_code::ActiveModel {
            id: Set(storage::new_id()),
            device_code_hash: Set(storage::hash_token(&device_code)),
            user_code: Set(user_code.clone()),
            client_id: Set(client.client_id.clone()),
            scopes: Set(storage::encode_list(&scopes)?),
            created_at: Set(now),
            expires_at: Set(now + cfg.code_ttl_secs),
            interval: Set(cfg.poll_interval_secs),
            last_poll_at: Set(None),
            approved_at: Set(None),
            denied_at: Set(None),
            consumed_at: Set(None),
            subject_id: Set(None),
            grant_id: Set(None),
        }
        .insert(db)
        .await;

        match inserted {
            Ok(_) => {
                tracing::info!(client_id = %client.client_id, "Issued device code");
                return Ok(DeviceAuthorization {
                    device_code,
                    user_code,
                    expires_in: cfg.code_ttl_secs,
                    interval: cfg.poll_interval_secs,
                });
            }
            // a concurrent request took the same user code between check and insert
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                tracing::debug!(attempt, "User code insert conflict, regenerating");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::error!(
        attempts = cfg.user_code_max_attempts,
        "Exhausted user code generation attempts"
    );
    Err(GateError::UserCodeSpaceExhausted {
        attempts: cfg.user_code_max_attempts,
    })
}

pub async fn find_by_user_code<C: ConnectionTrait>(
    db: &C,
    user_code: &str,
) -> Result<Option<device_code::Model>, GateError> {
    let Some(code) = normalize_user_code(user_code) else {
        return Ok(None);
    };
    Ok(device_code::Entity::find()
        .filter(device_code::Column::UserCode.eq(code))
        .one(db)
        .await?)
}

fn check_decidable(model: &device_code::Model, now: i64) -> Result<(), DeviceFlowError> {
    match status(model, now) {
        DeviceStatus::Pending => Ok(()),
        DeviceStatus::Approved | DeviceStatus::Consumed => Err(DeviceFlowError::AlreadyApproved),
        DeviceStatus::Denied => Err(DeviceFlowError::AlreadyDenied),
        DeviceStatus::Expired => Err(DeviceFlowError::ExpiredToken),
    }
}

/// Approve a pending request: create or extend the subject's grant for the client and link it.
pub async fn approve<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    user_code: &str,
    subject_id: &str,
    now: i64,
) -> Result<device_code::Model, DeviceFlowError> {
    let model = find_by_user_code(db, user_code)
        .await?
        .ok_or(DeviceFlowError::UnknownUserCode)?;
    check_decidable(&model, now)?;

    let txn = db.begin().await?;
    let scopes = storage::decode_list(&model.scopes)?;
    let grant = grants::create_or_update(&txn, &model.client_id, subject_id, &scopes).await?;

    let updated = device_code::Entity::update_many()
        .col_expr(device_code::Column::ApprovedAt, Expr::value(now))
        .col_expr(device_code::Column::SubjectId, Expr::value(subject_id))
        .col_expr(device_code::Column::GrantId, Expr::value(grant.id.clone()))
        .filter(device_code::Column::Id.eq(model.id.clone()))
        .filter(device_code::Column::ApprovedAt.is_null())
        .filter(device_code::Column::DeniedAt.is_null())
        .exec(&txn)
        .await?;

    if updated.rows_affected != 1 {
        txn.rollback().await?;
        let current = find_by_user_code(db, user_code)
            .await?
            .ok_or(DeviceFlowError::UnknownUserCode)?;
        check_decidable(&current, now)?;
        return Err(DeviceFlowError::AlreadyApproved);
    }
    txn.commit().await?;

    AuditEvent::new(AuditEventType::DeviceApproved)
        .grant(&grant.id)
        .subject(subject_id)
        .client(Some(&model.client_id))
        .scopes(&scopes)
        .emit();

    Ok(find_by_user_code(db, user_code)
        .await?
        .ok_or(DeviceFlowError::UnknownUserCode)?)
}

pub async fn deny<C: ConnectionTrait>(
    db: &C,
    user_code: &str,
    subject_id: &str,
    now: i64,
) -> Result<(), DeviceFlowError> {
    let model = find_by_user_code(db, user_code)
        .await?
        .ok_or(DeviceFlowError::UnknownUserCode)?;
    check_decidable(&model, now)?;

    let updated = device_code::Entity::update_many()
        .col_expr(device_code::Column::DeniedAt, Expr::value(now))
        .col_expr(device_code::Column::SubjectId, Expr::value(subject_id))
        .filter(device_code::Column::Id.eq(model.id.clone()))
        .filter(device_code::Column::ApprovedAt.is_null())
        .filter(device_code::Column::DeniedAt.is_null())
        .exec(db)
        .await?;
    if updated.rows_affected != 1 {
        return Err(DeviceFlowError::AlreadyApproved);
    }

    AuditEvent::new(AuditEventType::DeviceDenied)
        .subject(subject_id)
        .client(Some(&model.client_id))
        .emit();
    Ok(())
}

/// Token-endpoint side of the flow: apply RFC 8628 polling rules and, once approved,
/// consume the code exactly once.
pub async fn exchange<C: ConnectionTrait>(
    db: &C,
    cfg: &DeviceCfg,
    device_code_plain: &str,
    client_id: &str,
    now: i64,
) -> Result<ApprovedDevice, DeviceFlowError> {
    let model = device_code::Entity::find()
        .filter(device_code::Column::DeviceCodeHash.eq(storage::hash_token(device_code_plain)))
        .one(db)
        .await?
        .ok_or(DeviceFlowError::InvalidGrant("unknown device code"))?;

    if model.client_id != clients::normalize_client_id(client_id) {
        return Err(DeviceFlowError::InvalidGrant("client mismatch"));
    }
    if model.consumed_at.is_some() {
        return Err(DeviceFlowError::InvalidGrant("device code already used"));
    }
    if model.expires_at < now {
        return Err(DeviceFlowError::ExpiredToken);
    }
    // a final answer is never hidden behind back-off
    if matches!(status(&model, now), DeviceStatus::Denied) {
        return Err(DeviceFlowError::AccessDenied);
    }

    if let Some(last_poll) = model.last_poll_at {
        if now - last_poll < model.interval {
            let interval = model.interval + cfg.slow_down_increment_secs;
            device_code::Entity::update_many()
                .col_expr(device_code::Column::Interval, Expr::value(interval))
                .col_expr(device_code::Column::LastPollAt, Expr::value(now))
                .filter(device_code::Column::Id.eq(model.id.clone()))
                .exec(db)
                .await?;
            return Err(DeviceFlowError::SlowDown { interval });
        }
    }

    device_code::Entity::update_many()
        .col_expr(device_code::Column::LastPollAt, Expr::value(now))
        .filter(device_code::Column::Id.eq(model.id.clone()))
        .exec(db)
        .await?;

    match status(&model, now) {
        DeviceStatus::Denied => return Err(DeviceFlowError::AccessDenied),
        DeviceStatus::Pending => return Err(DeviceFlowError::AuthorizationPending),
        DeviceStatus::Expired => return Err(DeviceFlowError::ExpiredToken),
        DeviceStatus::Consumed => return Err(DeviceFlowError::InvalidGrant("device code already used")),
        DeviceStatus::Approved => {}
    }

    let (Some(subject_id), Some(grant_id)) = (model.subject_id.clone(), model.grant_id.clone())
    else {
        return Err(DeviceFlowError::InvalidGrant("approved code without grant"));
    };

    let consumed = device_code::Entity::update_many()
        .col_expr(device_code::Column::ConsumedAt, Expr::value(now))
        .filter(device_code::Column::Id.eq(model.id.clone()))
        .filter(device_code::Column::ConsumedAt.is_null())
        .exec(db)
        .await?;
    if consumed.rows_affected != 1 {
        return Err(DeviceFlowError::InvalidGrant("device code already used"));
    }

    Ok(ApprovedDevice {
        grant_id,
        subject_id,
        client_id: model.client_id,
        scopes: storage::decode_list(&model.scopes)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_code_format() {
        for _ in 0..100 {
            let code = generate_user_code();
            assert_eq!(code.len(), 9);
            assert_eq!(code.chars().nth(4), Some('-'));
            assert!(code
                .chars()
                .filter(|c| *c != '-')
                .all(|c| USER_CODE_ALPHABET.contains(&(c as u8))));
        }
    }

    #[test]
    fn test_alphabet_has_no_vowels_or_digits() {
        for c in USER_CODE_ALPHABET {
            assert!(!b"AEIOUY0123456789".contains(c));
        }
    }

    #[test]
    fn test_normalize_user_code() {
        assert_eq!(normalize_user_code("bcdf-ghjk").as_deref(), Some("BCDF-GHJK"));
        assert_eq!(normalize_user_code(" BCDF GHJK ").as_deref(), Some("BCDF-GHJK"));
        assert_eq!(normalize_user_code("bcdfghjk").as_deref(), Some("BCDF-GHJK"));
        assert_eq!(normalize_user_code("BCDF-GHJ"), None);
        assert_eq!(normalize_user_code("ABCD-EFGH"), None);
    }

    #[test]
    fn test_status_precedence() {
        let base = device_code::Model {
            id: "id".into(),
            device_code_hash: "h".into(),
            user_code: "BCDF-GHJK".into(),
            client_id: "xdrip".into(),
            scopes: "[]".into(),
            created_at: 0,
            expires_at: 100,
            interval: 5,
            last_poll_at: None,
            approved_at: None,
            denied_at: None,
            consumed_at: None,
            subject_id: None,
            grant_id: None,
        };
        assert_eq!(status(&base, 50), DeviceStatus::Pending);
        assert_eq!(status(&base, 101), DeviceStatus::Expired);
        let approved = device_code::Model {
            approved_at: Some(10),
            ..base.clone()
        };
        assert_eq!(status(&approved, 50), DeviceStatus::Approved);
        let denied = device_code::Model {
            denied_at: Some(10),
            ..base
        };
        assert_eq!(status(&denied, 500), DeviceStatus::Denied);
    }
}
