//! Follower invites: a subject shares read-only access to their data with another subject by
//! handing out a link. Accepting the link creates a follower grant.

use crate::audit::{AuditEvent, AuditEventType};
use crate::entities::{follower_invite, grant};
use crate::errors::GateError;
use crate::grants;
use crate::storage;
use crate::subjects;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use thiserror::Error;

/// The only scopes an invite can carry.
pub const FOLLOWER_SCOPES: &[&str] = &[
    "entries.read",
    "treatments.read",
    "devicestatus.read",
    "profile.read",
    "food.read",
    "activity.read",
];

#[derive(Debug, Error)]
pub enum InviteError {
    #[error("an invite needs at least one scope")]
    EmptyScopes,
    #[error("scope {0} cannot be shared with followers")]
    DisallowedScope(String),
    #[error("max_uses must be at least 1")]
    InvalidMaxUses,
    #[error("invite not found")]
    NotFound,
    #[error("invite has expired")]
    Expired,
    #[error("invite has been revoked")]
    Revoked,
    #[error("invite has no uses left")]
    Exhausted,
    #[error("cannot follow yourself")]
    SelfFollow,
    #[error("already following this subject")]
    AlreadyFollowing,
    #[error(transparent)]
    Internal(#[from] GateError),
}

impl InviteError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyScopes => "empty_scopes",
            Self::DisallowedScope(_) => "disallowed_scope",
            Self::InvalidMaxUses => "invalid_max_uses",
            Self::NotFound => "invite_not_found",
            Self::Expired => "invite_expired",
            Self::Revoked => "invite_revoked",
            Self::Exhausted => "invite_exhausted",
            Self::SelfFollow => "self_follow",
            Self::AlreadyFollowing => "already_following",
            Self::Internal(_) => "server_error",
        }
    }
}

impl From<sea_orm::DbErr> for InviteError {
    fn from(value: sea_orm::DbErr) -> Self {
        Self::Internal(value.into())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewInvite {
    pub scopes: Vec<String>,
    pub label: Option<String>,
    pub expires_in_secs: Option<i64>,
    pub max_uses: Option<i64>,
    pub limit_to_24_hours: bool,
}

#[derive(Debug, Clone)]
pub struct CreatedInvite {
    pub invite: follower_invite::Model,
    /// Shown once; only its hash is stored.
    pub token: String,
}

/// What a prospective follower sees before accepting.
#[derive(Debug, Clone, Serialize)]
pub struct InviteInfo {
    pub owner_subject_id: String,
    pub owner_name: Option<String>,
    pub scopes: Vec<String>,
    pub label: Option<String>,
    pub expires_at: Option<i64>,
    pub limit_to_24_hours: bool,
    pub usable: bool,
}

/// Normalized scope set, or the first scope outside [`FOLLOWER_SCOPES`].
pub fn validate_scopes(requested: &[String]) -> Result<Vec<String>, InviteError> {
    let scopes = grants::merge_scopes(&[], requested);
    if scopes.is_empty() {
        return Err(InviteError::EmptyScopes);
    }
    if let Some(bad) = scopes.iter().find(|s| !FOLLOWER_SCOPES.contains(&s.as_str())) {
        return Err(InviteError::DisallowedScope(bad.clone()));
    }
    Ok(scopes)
}

fn check_usable(invite: &follower_invite::Model, now: i64) -> Result<(), InviteError> {
    if invite.revoked_at.is_some() {
        return Err(InviteError::Revoked);
    }
    if invite.expires_at.is_some_and(|exp| exp < now) {
        return Err(InviteError::Expired);
    }
    if invite.max_uses.is_some_and(|max| invite.use_count >= max) {
        return Err(InviteError::Exhausted);
    }
    Ok(())
}

async fn find_by_token<C: ConnectionTrait>(
    db: &C,
    token: &str,
) -> Result<Option<follower_invite::Model>, GateError> {
    Ok(follower_invite::Entity::find()
        .filter(follower_invite::Column::TokenHash.eq(storage::hash_token(token)))
        .one(db)
        .await?)
}

pub async fn create_invite<C: ConnectionTrait>(
    db: &C,
    owner_subject_id: &str,
    input: NewInvite,
) -> Result<CreatedInvite, InviteError> {
    let scopes = validate_scopes(&input.scopes)?;
    if input.max_uses.is_some_and(|m| m < 1) {
        return Err(InviteError::InvalidMaxUses);
    }
    subjects::require_subject(db, owner_subject_id).await?;

    let now = storage::now();
    let token = storage::random_token();
    let invite = follower_invite::ActiveModel {
        id: Set(storage::new_id()),
        owner_subject_id: Set(owner_subject_id.to_string()),
        token_hash: Set(storage::hash_token(&token)),
        scopes: Set(storage::encode_list(&scopes)?),
        label: Set(input.label),
        expires_at: Set(input.expires_in_secs.map(|ttl| now + ttl)),
        max_uses: Set(input.max_uses),
        use_count: Set(0),
        revoked_at: Set(None),
        limit_to_24_hours: Set(input.limit_to_24_hours),
        created_at: Set(now),
    }
    .insert(db)
    .await?;

    AuditEvent::new(AuditEventType::InviteCreated)
        .subject(owner_subject_id)
        .scopes(&scopes)
        .detail(format!("invite {}", invite.id))
        .emit();
    Ok(CreatedInvite { invite, token })
}

/// Redeem an invite for `follower_subject_id`. The use-count increment and the grant insert
/// commit together.
pub async fn accept_invite<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    token: &str,
    follower_subject_id: &str,
) -> Result<grant::Model, InviteError> {
    let now = storage::now();
    let txn = db.begin().await?;

    let invite = find_by_token(&txn, token)
        .await?
        .ok_or(InviteError::NotFound)?;
    check_usable(&invite, now)?;
    if invite.owner_subject_id == follower_subject_id {
        return Err(InviteError::SelfFollow);
    }
    subjects::require_subject(&txn, follower_subject_id).await?;
    if grants::find_active_follower_grant(&txn, &invite.owner_subject_id, follower_subject_id)
        .await?
        .is_some()
    {
        return Err(InviteError::AlreadyFollowing);
    }

    let used = follower_invite::Entity::update_many()
        .col_expr(
            follower_invite::Column::UseCount,
            Expr::col(follower_invite::Column::UseCount).add(1),
        )
        .filter(follower_invite::Column::Id.eq(invite.id.clone()))
        .filter(follower_invite::Column::RevokedAt.is_null())
        .filter(
            Condition::any()
                .add(follower_invite::Column::MaxUses.is_null())
                .add(
                    Expr::col(follower_invite::Column::UseCount)
                        .lt(Expr::col(follower_invite::Column::MaxUses)),
                ),
        )
        .exec(&txn)
        .await?;
    if used.rows_affected != 1 {
        return Err(InviteError::Exhausted);
    }

    let scopes = storage::decode_list(&invite.scopes)?;
    // a concurrent accept can slip past the lookup above; the unique index catches it
    let created = match grants::create_follower_grant(
        &txn,
        &invite.owner_subject_id,
        follower_subject_id,
        &scopes,
        invite.label.clone(),
        invite.limit_to_24_hours,
    )
    .await
    {
        Ok(created) => created,
        Err(GateError::Conflict(_)) => return Err(InviteError::AlreadyFollowing),
        Err(e) => return Err(e.into()),
    };
    txn.commit().await?;

    AuditEvent::new(AuditEventType::InviteAccepted)
        .grant(&created.id)
        .subject(&invite.owner_subject_id)
        .scopes(&scopes)
        .detail(format!("follower {follower_subject_id} via invite {}", invite.id))
        .emit();
    Ok(created)
}

pub async fn list_invites<C: ConnectionTrait>(
    db: &C,
    owner_subject_id: &str,
) -> Result<Vec<follower_invite::Model>, GateError> {
    Ok(follower_invite::Entity::find()
        .filter(follower_invite::Column::OwnerSubjectId.eq(owner_subject_id))
        .order_by_desc(follower_invite::Column::CreatedAt)
        .all(db)
        .await?)
}

/// Only the owner may revoke. Returns false if it was already revoked.
pub async fn revoke_invite<C: ConnectionTrait>(
    db: &C,
    invite_id: &str,
    owner_subject_id: &str,
) -> Result<bool, InviteError> {
    let exists = follower_invite::Entity::find_by_id(invite_id.to_string())
        .one(db)
        .await?
        .is_some_and(|i| i.owner_subject_id == owner_subject_id);
    if !exists {
        return Err(InviteError::NotFound);
    }

    let updated = follower_invite::Entity::update_many()
        .col_expr(follower_invite::Column::RevokedAt, Expr::value(storage::now()))
        .filter(follower_invite::Column::Id.eq(invite_id))
        .filter(follower_invite::Column::RevokedAt.is_null())
        .exec(db)
        .await?;
    if updated.rows_affected == 1 {
        AuditEvent::new(AuditEventType::InviteRevoked)
            .subject(owner_subject_id)
            .detail(format!("invite {invite_id}"))
            .emit();
    }
    Ok(updated.rows_affected == 1)
}

pub async fn inspect_invite<C: ConnectionTrait>(
    db: &C,
    token: &str,
) -> Result<Option<InviteInfo>, GateError> {
    let Some(invite) = find_by_token(db, token).await? else {
        return Ok(None);
    };
    let owner = subjects::get_subject(db, &invite.owner_subject_id).await?;
    Ok(Some(InviteInfo {
        usable: check_usable(&invite, storage::now()).is_ok(),
        owner_subject_id: invite.owner_subject_id,
        owner_name: owner.map(|o| o.name),
        scopes: storage::decode_list(&invite.scopes)?,
        label: invite.label,
        expires_at: invite.expires_at,
        limit_to_24_hours: invite.limit_to_24_hours,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_scope_allow_list() {
        assert_eq!(
            validate_scopes(&s(&["treatments.read", "entries.read", "entries.read"])).unwrap(),
            s(&["entries.read", "treatments.read"])
        );
        assert!(matches!(
            validate_scopes(&s(&["careportal:*"])),
            Err(InviteError::DisallowedScope(ref scope)) if scope == "careportal:*"
        ));
        assert!(matches!(
            validate_scopes(&s(&["entries.read", "entries.write"])),
            Err(InviteError::DisallowedScope(_))
        ));
        assert!(matches!(validate_scopes(&[]), Err(InviteError::EmptyScopes)));
    }

    fn invite(now: i64) -> follower_invite::Model {
        follower_invite::Model {
            id: "i1".into(),
            owner_subject_id: "owner".into(),
            token_hash: "h".into(),
            scopes: "[\"entries.read\"]".into(),
            label: None,
            expires_at: Some(now + 60),
            max_uses: Some(2),
            use_count: 0,
            revoked_at: None,
            limit_to_24_hours: false,
            created_at: now,
        }
    }

    #[test]
    fn test_usability_checks() {
        let now = 1_000;
        assert!(check_usable(&invite(now), now).is_ok());
        assert!(matches!(
            check_usable(&invite(now), now + 61),
            Err(InviteError::Expired)
        ));
        let exhausted = follower_invite::Model {
            use_count: 2,
            ..invite(now)
        };
        assert!(matches!(check_usable(&exhausted, now), Err(InviteError::Exhausted)));
        let revoked = follower_invite::Model {
            revoked_at: Some(now),
            ..invite(now)
        };
        assert!(matches!(check_usable(&revoked, now), Err(InviteError::Revoked)));
    }
}
