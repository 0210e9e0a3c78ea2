//! Grant ledger: the durable record that a subject authorized a client (or a follower) for a
//! set of scopes. Revoking a grant revokes every refresh token issued under it.

use crate::audit::{AuditEvent, AuditEventType};
use crate::entities::{grant, refresh_token};
use crate::errors::GateError;
use crate::storage;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set, SqlErr, TransactionTrait,
};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    /// An OAuth client acting for the subject.
    App,
    /// Another subject granted read access to the owner's data.
    Follower,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::App => "app",
            GrantType::Follower => "follower",
        }
    }
}

pub fn scopes(model: &grant::Model) -> Result<Vec<String>, GateError> {
    storage::decode_list(&model.scopes)
}

pub fn is_active(model: &grant::Model) -> bool {
    model.revoked_at.is_none()
}

/// Sorted, deduplicated union.
pub fn merge_scopes(existing: &[String], requested: &[String]) -> Vec<String> {
    existing
        .iter()
        .chain(requested.iter())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub async fn get_grant<C: ConnectionTrait>(
    db: &C,
    grant_id: &str,
) -> Result<Option<grant::Model>, GateError> {
    Ok(grant::Entity::find_by_id(grant_id.to_string()).one(db).await?)
}

pub async fn find_active_app_grant<C: ConnectionTrait>(
    db: &C,
    client_id: &str,
    subject_id: &str,
) -> Result<Option<grant::Model>, GateError> {
    Ok(grant::Entity::find()
        .filter(grant::Column::ClientId.eq(client_id))
        .filter(grant::Column::SubjectId.eq(subject_id))
        .filter(grant::Column::GrantType.eq(GrantType::App.as_str()))
        .filter(grant::Column::RevokedAt.is_null())
        .one(db)
        .await?)
}

/// Create the (client, subject) grant, or union `requested` into the active one.
pub async fn create_or_update<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    client_id: &str,
    subject_id: &str,
    requested: &[String],
) -> Result<grant::Model, GateError> {
    let txn = db.begin().await?;

    let result = match find_active_app_grant(&txn, client_id, subject_id).await? {
        Some(existing) => merge_into(&txn, existing, client_id, subject_id, requested).await?,
        None => insert_or_merge(&txn, client_id, subject_id, requested).await?,
    };

    txn.commit().await?;
    Ok(result)
}

/// Insert a new active app grant. If a concurrent consent created one first, the partial
/// unique index rejects this insert and `requested` is merged into that grant instead.
async fn insert_or_merge<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    client_id: &str,
    subject_id: &str,
    requested: &[String],
) -> Result<grant::Model, GateError> {
    let merged = merge_scopes(&[], requested);
    let savepoint = db.begin().await?;
    match new_grant(client_id, subject_id, &merged)?.insert(&savepoint).await {
        Ok(created) => {
            savepoint.commit().await?;
            AuditEvent::new(AuditEventType::GrantCreated)
                .grant(&created.id)
                .subject(subject_id)
                .client(Some(client_id))
                .scopes(&merged)
                .emit();
            Ok(created)
        }
        Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            savepoint.rollback().await?;
            tracing::debug!(client_id, subject_id, "Active grant created concurrently, merging");
            let existing = find_active_app_grant(db, client_id, subject_id)
                .await?
                .ok_or_else(|| GateError::Conflict(format!("grant for client {client_id}")))?;
            merge_into(db, existing, client_id, subject_id, requested).await
        }
        Err(e) => Err(e.into()),
    }
}

async fn merge_into<C: ConnectionTrait>(
    db: &C,
    existing: grant::Model,
    client_id: &str,
    subject_id: &str,
    requested: &[String],
) -> Result<grant::Model, GateError> {
    let current = scopes(&existing)?;
    let merged = merge_scopes(&current, requested);
    if merged == current {
        return Ok(existing);
    }
    let mut active = existing.into_active_model();
    active.scopes = Set(storage::encode_list(&merged)?);
    let updated = active.update(db).await?;
    AuditEvent::new(AuditEventType::GrantUpdated)
        .grant(&updated.id)
        .subject(subject_id)
        .client(Some(client_id))
        .scopes(&merged)
        .emit();
    Ok(updated)
}

fn new_grant(
    client_id: &str,
    subject_id: &str,
    scopes: &[String],
) -> Result<grant::ActiveModel, GateError> {
    Ok(grant::ActiveModel {
        id: Set(storage::new_id()),
        client_id: Set(Some(client_id.to_string())),
        subject_id: Set(subject_id.to_string()),
        follower_subject_id: Set(None),
        grant_type: Set(GrantType::App.as_str().to_string()),
        scopes: Set(storage::encode_list(scopes)?),
        label: Set(None),
        limit_to_24_hours: Set(false),
        created_at: Set(storage::now()),
        revoked_at: Set(None),
        last_used_at: Set(None),
        last_used_ip: Set(None),
        last_used_user_agent: Set(None),
    })
}

pub async fn find_active_follower_grant<C: ConnectionTrait>(
    db: &C,
    owner_subject_id: &str,
    follower_subject_id: &str,
) -> Result<Option<grant::Model>, GateError> {
    Ok(grant::Entity::find()
        .filter(grant::Column::SubjectId.eq(owner_subject_id))
        .filter(grant::Column::FollowerSubjectId.eq(follower_subject_id))
        .filter(grant::Column::GrantType.eq(GrantType::Follower.as_str()))
        .filter(grant::Column::RevokedAt.is_null())
        .one(db)
        .await?)
}

/// Insert a follower grant. Fails with [`GateError::Conflict`] when the pair already has an
/// active follower grant.
pub async fn create_follower_grant<C: ConnectionTrait>(
    db: &C,
    owner_subject_id: &str,
    follower_subject_id: &str,
    scopes: &[String],
    label: Option<String>,
    limit_to_24_hours: bool,
) -> Result<grant::Model, GateError> {
    let scopes = merge_scopes(&[], scopes);
    let created = grant::ActiveModel {
        id: Set(storage::new_id()),
        client_id: Set(None),
        subject_id: Set(owner_subject_id.to_string()),
        follower_subject_id: Set(Some(follower_subject_id.to_string())),
        grant_type: Set(GrantType::Follower.as_str().to_string()),
        scopes: Set(storage::encode_list(&scopes)?),
        label: Set(label),
        limit_to_24_hours: Set(limit_to_24_hours),
        created_at: Set(storage::now()),
        revoked_at: Set(None),
        last_used_at: Set(None),
        last_used_ip: Set(None),
        last_used_user_agent: Set(None),
    }
    .insert(db)
    .await
    .map_err(|e| match e.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => GateError::Conflict(format!(
            "{follower_subject_id} already follows {owner_subject_id}"
        )),
        _ => e.into(),
    })?;

    AuditEvent::new(AuditEventType::GrantCreated)
        .grant(&created.id)
        .subject(owner_subject_id)
        .scopes(&scopes)
        .detail(format!("follower {follower_subject_id}"))
        .emit();
    Ok(created)
}

/// Revoke a grant and every live refresh token under it, as one unit.
/// Returns false if the grant was unknown or already revoked.
pub async fn revoke<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    grant_id: &str,
    now: i64,
) -> Result<bool, GateError> {
    let txn = db.begin().await?;

    let revoked = grant::Entity::update_many()
        .col_expr(grant::Column::RevokedAt, Expr::value(now))
        .filter(grant::Column::Id.eq(grant_id))
        .filter(grant::Column::RevokedAt.is_null())
        .exec(&txn)
        .await?;

    let tokens = refresh_token::Entity::update_many()
        .col_expr(refresh_token::Column::RevokedAt, Expr::value(now))
        .filter(refresh_token::Column::GrantId.eq(grant_id))
        .filter(refresh_token::Column::RevokedAt.is_null())
        .exec(&txn)
        .await?;

    txn.commit().await?;

    if revoked.rows_affected == 1 {
        AuditEvent::new(AuditEventType::GrantRevoked)
            .grant(grant_id)
            .detail(format!("{} refresh tokens revoked", tokens.rows_affected))
            .emit();
    }
    Ok(revoked.rows_affected == 1)
}

/// Revoke on behalf of a subject; either side of a follower grant may end it.
pub async fn revoke_as<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    grant_id: &str,
    acting_subject_id: &str,
) -> Result<bool, GateError> {
    let Some(existing) = get_grant(db, grant_id).await? else {
        return Ok(false);
    };
    let allowed = existing.subject_id == acting_subject_id
        || existing.follower_subject_id.as_deref() == Some(acting_subject_id);
    if !allowed {
        return Err(GateError::NotFound(format!("grant {grant_id}")));
    }
    revoke(db, grant_id, storage::now()).await
}

/// Record use without touching scopes.
pub async fn update_last_used<C: ConnectionTrait>(
    db: &C,
    grant_id: &str,
    now: i64,
    ip: Option<&str>,
    user_agent: Option<&str>,
) -> Result<(), GateError> {
    grant::Entity::update_many()
        .col_expr(grant::Column::LastUsedAt, Expr::value(now))
        .col_expr(grant::Column::LastUsedIp, Expr::value(ip.map(str::to_string)))
        .col_expr(
            grant::Column::LastUsedUserAgent,
            Expr::value(user_agent.map(str::to_string)),
        )
        .filter(grant::Column::Id.eq(grant_id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn update_label<C: ConnectionTrait>(
    db: &C,
    grant_id: &str,
    owner_subject_id: &str,
    label: Option<String>,
) -> Result<grant::Model, GateError> {
    let existing = get_grant(db, grant_id)
        .await?
        .filter(|g| g.subject_id == owner_subject_id)
        .ok_or_else(|| GateError::NotFound(format!("grant {grant_id}")))?;
    let mut active = existing.into_active_model();
    active.label = Set(label);
    Ok(active.update(db).await?)
}

/// Active grants the subject has handed out (apps and followers).
pub async fn list_for_subject<C: ConnectionTrait>(
    db: &C,
    subject_id: &str,
) -> Result<Vec<grant::Model>, GateError> {
    Ok(grant::Entity::find()
        .filter(grant::Column::SubjectId.eq(subject_id))
        .filter(grant::Column::RevokedAt.is_null())
        .order_by_desc(grant::Column::CreatedAt)
        .all(db)
        .await?)
}

pub async fn list_followers<C: ConnectionTrait>(
    db: &C,
    owner_subject_id: &str,
) -> Result<Vec<grant::Model>, GateError> {
    Ok(grant::Entity::find()
        .filter(grant::Column::SubjectId.eq(owner_subject_id))
        .filter(grant::Column::GrantType.eq(GrantType::Follower.as_str()))
        .filter(grant::Column::RevokedAt.is_null())
        .order_by_desc(grant::Column::CreatedAt)
        .all(db)
        .await?)
}

pub async fn list_following<C: ConnectionTrait>(
    db: &C,
    follower_subject_id: &str,
) -> Result<Vec<grant::Model>, GateError> {
    Ok(grant::Entity::find()
        .filter(grant::Column::FollowerSubjectId.eq(follower_subject_id))
        .filter(grant::Column::GrantType.eq(GrantType::Follower.as_str()))
        .filter(grant::Column::RevokedAt.is_null())
        .order_by_desc(grant::Column::CreatedAt)
        .all(db)
        .await?)
}
