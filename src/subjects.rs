//! Subject identity and permission resolution.
//!
//! Permissions are never stored on a subject; they are flattened from the subject's roles
//! whenever they are needed, so a role change is visible on the next lookup.

use crate::audit::{AuditEvent, AuditEventType};
use crate::entities::{role, subject, subject_role};
use crate::errors::GateError;
use crate::storage;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set, SqlErr,
};
use serde::Serialize;
use std::collections::HashSet;

/// Prefix for static access tokens so they are distinguishable from JWTs at a glance.
pub const ACCESS_TOKEN_PREFIX: &str = "ngat_";

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSubject {
    pub subject: subject::Model,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl ResolvedSubject {
    pub fn has_permission(&self, required: &str) -> bool {
        has_permission(&self.permissions, required)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSubject {
    pub name: String,
    pub email: Option<String>,
    pub is_system: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SubjectUpdate {
    pub name: Option<String>,
    pub email: Option<Option<String>>,
    pub is_active: Option<bool>,
}

/// True if any held permission covers `required`.
///
/// A held permission covers `a:b:c` when it is `a:b:c`, an ancestor wildcard (`a:b:*`, `a:*`),
/// the global `*`, or an action-only wildcard `*:*:c`.
pub fn has_permission(held: &[String], required: &str) -> bool {
    held.iter().any(|p| permission_covers(p, required))
}

fn permission_covers(held: &str, required: &str) -> bool {
    if held == "*" || held == required {
        return true;
    }
    if let Some(action) = held.strip_prefix("*:*:") {
        if !action.contains(':') {
            let segments: Vec<&str> = required.split(':').collect();
            return segments.len() == 3 && (action == "*" || segments[2] == action);
        }
    }
    if let Some(prefix) = held.strip_suffix('*') {
        return prefix.ends_with(':') && required.len() > prefix.len() && required.starts_with(prefix);
    }
    false
}

pub async fn get_subject<C: ConnectionTrait>(
    db: &C,
    id: &str,
) -> Result<Option<subject::Model>, GateError> {
    Ok(subject::Entity::find_by_id(id.to_string()).one(db).await?)
}

pub async fn require_subject<C: ConnectionTrait>(
    db: &C,
    id: &str,
) -> Result<subject::Model, GateError> {
    get_subject(db, id)
        .await?
        .ok_or_else(|| GateError::NotFound(format!("subject {id}")))
}

pub async fn list_subjects<C: ConnectionTrait>(db: &C) -> Result<Vec<subject::Model>, GateError> {
    Ok(subject::Entity::find()
        .order_by_asc(subject::Column::Name)
        .all(db)
        .await?)
}

pub async fn create_subject<C: ConnectionTrait>(
    db: &C,
    input: NewSubject,
) -> Result<subject::Model, GateError> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(GateError::Validation("subject name must not be empty".into()));
    }
    let model = subject::ActiveModel {
        id: Set(storage::new_id()),
        name: Set(name.to_string()),
        email: Set(input.email),
        external_issuer: Set(None),
        external_subject_id: Set(None),
        access_token_hash: Set(None),
        is_active: Set(true),
        is_system: Set(input.is_system),
        created_at: Set(storage::now()),
        last_login_at: Set(None),
    }
    .insert(db)
    .await?;
    Ok(model)
}

pub async fn update_subject<C: ConnectionTrait>(
    db: &C,
    id: &str,
    update: SubjectUpdate,
) -> Result<subject::Model, GateError> {
    let mut active = require_subject(db, id).await?.into_active_model();
    if let Some(name) = update.name {
        active.name = Set(name);
    }
    if let Some(email) = update.email {
        active.email = Set(email);
    }
    if let Some(is_active) = update.is_active {
        active.is_active = Set(is_active);
    }
    Ok(active.update(db).await?)
}

/// System subjects are never deletable.
pub async fn delete_subject<C: ConnectionTrait>(db: &C, id: &str) -> Result<(), GateError> {
    let existing = require_subject(db, id).await?;
    if existing.is_system {
        return Err(GateError::Validation(format!(
            "system subject {} cannot be deleted",
            existing.name
        )));
    }
    subject::Entity::delete_by_id(existing.id).exec(db).await?;
    Ok(())
}

pub async fn record_login<C: ConnectionTrait>(db: &C, id: &str, now: i64) -> Result<(), GateError> {
    subject::Entity::update_many()
        .col_expr(subject::Column::LastLoginAt, Expr::value(now))
        .filter(subject::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// Look up the subject for an external identity, creating it on first sight. Name and email
/// are refreshed when the identity provider reports different values.
pub async fn find_or_create_external<C: ConnectionTrait>(
    db: &C,
    issuer: &str,
    external_id: &str,
    name: &str,
    email: Option<&str>,
) -> Result<subject::Model, GateError> {
    let existing = find_external(db, issuer, external_id).await?;
    let existing = match existing {
        Some(s) => s,
        None => {
            let created = subject::ActiveModel {
                id: Set(storage::new_id()),
                name: Set(name.to_string()),
                email: Set(email.map(str::to_string)),
                external_issuer: Set(Some(issuer.to_string())),
                external_subject_id: Set(Some(external_id.to_string())),
                access_token_hash: Set(None),
                is_active: Set(true),
                is_system: Set(false),
                created_at: Set(storage::now()),
                last_login_at: Set(None),
            }
            .insert(db)
            .await;
            match created {
                Ok(model) => {
                    tracing::info!(subject_id = %model.id, %issuer, "Created subject for external identity");
                    return Ok(model);
                }
                // lost a race against a concurrent first login
                Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    find_external(db, issuer, external_id)
                        .await?
                        .ok_or_else(|| GateError::Db(e))?
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let email = email.map(str::to_string);
    if existing.name != name || existing.email != email {
        let mut active = existing.into_active_model();
        active.name = Set(name.to_string());
        active.email = Set(email);
        return Ok(active.update(db).await?);
    }
    Ok(existing)
}

async fn find_external<C: ConnectionTrait>(
    db: &C,
    issuer: &str,
    external_id: &str,
) -> Result<Option<subject::Model>, GateError> {
    Ok(subject::Entity::find()
        .filter(subject::Column::ExternalIssuer.eq(issuer))
        .filter(subject::Column::ExternalSubjectId.eq(external_id))
        .one(db)
        .await?)
}

/// Generate a static access token for a device or service subject, replacing any previous one.
/// The plaintext is returned once.
pub async fn issue_access_token<C: ConnectionTrait>(db: &C, id: &str) -> Result<String, GateError> {
    let mut active = require_subject(db, id).await?.into_active_model();
    let token = format!("{ACCESS_TOKEN_PREFIX}{}", storage::random_token());
    active.access_token_hash = Set(Some(storage::hash_token(&token)));
    active.update(db).await?;
    Ok(token)
}

/// Resolve an active subject by its static access token.
pub async fn find_by_access_token<C: ConnectionTrait>(
    db: &C,
    token: &str,
) -> Result<Option<subject::Model>, GateError> {
    Ok(subject::Entity::find()
        .filter(subject::Column::AccessTokenHash.eq(storage::hash_token(token)))
        .filter(subject::Column::IsActive.eq(true))
        .one(db)
        .await?)
}

async fn roles_of<C: ConnectionTrait>(db: &C, subject_id: &str) -> Result<Vec<role::Model>, GateError> {
    let role_ids: Vec<String> = subject_role::Entity::find()
        .filter(subject_role::Column::SubjectId.eq(subject_id))
        .all(db)
        .await?
        .into_iter()
        .map(|sr| sr.role_id)
        .collect();
    if role_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(role::Entity::find()
        .filter(role::Column::Id.is_in(role_ids))
        .order_by_asc(role::Column::Name)
        .all(db)
        .await?)
}

pub async fn role_names<C: ConnectionTrait>(db: &C, subject_id: &str) -> Result<Vec<String>, GateError> {
    Ok(roles_of(db, subject_id)
        .await?
        .into_iter()
        .map(|r| r.name)
        .collect())
}

/// Permissions of all attached roles, deduplicated, first occurrence wins.
fn flatten_permissions(roles: &[role::Model]) -> Result<Vec<String>, GateError> {
    let mut seen = HashSet::new();
    let mut flattened = Vec::new();
    for r in roles {
        for p in storage::decode_list(&r.permissions)? {
            if seen.insert(p.clone()) {
                flattened.push(p);
            }
        }
    }
    Ok(flattened)
}

pub async fn permissions_of<C: ConnectionTrait>(
    db: &C,
    subject_id: &str,
) -> Result<Vec<String>, GateError> {
    flatten_permissions(&roles_of(db, subject_id).await?)
}

pub async fn resolve<C: ConnectionTrait>(
    db: &C,
    subject_id: &str,
) -> Result<Option<ResolvedSubject>, GateError> {
    let Some(subject) = get_subject(db, subject_id).await? else {
        return Ok(None);
    };
    let roles = roles_of(db, subject_id).await?;
    let permissions = flatten_permissions(&roles)?;
    Ok(Some(ResolvedSubject {
        subject,
        roles: roles.into_iter().map(|r| r.name).collect(),
        permissions,
    }))
}

pub async fn subject_has_permission<C: ConnectionTrait>(
    db: &C,
    subject_id: &str,
    required: &str,
) -> Result<bool, GateError> {
    Ok(has_permission(&permissions_of(db, subject_id).await?, required))
}

async fn role_by_name<C: ConnectionTrait>(db: &C, name: &str) -> Result<role::Model, GateError> {
    role::Entity::find()
        .filter(role::Column::Name.eq(name))
        .one(db)
        .await?
        .ok_or_else(|| GateError::NotFound(format!("role {name}")))
}

/// Attach a role. Returns false if the subject already held it.
pub async fn assign_role<C: ConnectionTrait>(
    db: &C,
    subject_id: &str,
    role_name: &str,
) -> Result<bool, GateError> {
    require_subject(db, subject_id).await?;
    let role = role_by_name(db, role_name).await?;

    let link = subject_role::ActiveModel {
        subject_id: Set(subject_id.to_string()),
        role_id: Set(role.id),
        assigned_at: Set(storage::now()),
    };
    let inserted = subject_role::Entity::insert(link)
        .on_conflict(
            OnConflict::columns([subject_role::Column::SubjectId, subject_role::Column::RoleId])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    if inserted == 1 {
        AuditEvent::new(AuditEventType::RoleAssigned)
            .subject(subject_id)
            .detail(role_name)
            .emit();
    }
    Ok(inserted == 1)
}

/// Detach a role. Returns false if the subject did not hold it.
pub async fn remove_role<C: ConnectionTrait>(
    db: &C,
    subject_id: &str,
    role_name: &str,
) -> Result<bool, GateError> {
    let role = role_by_name(db, role_name).await?;
    let result = subject_role::Entity::delete_many()
        .filter(subject_role::Column::SubjectId.eq(subject_id))
        .filter(subject_role::Column::RoleId.eq(role.id))
        .exec(db)
        .await?;

    if result.rows_affected > 0 {
        AuditEvent::new(AuditEventType::RoleRemoved)
            .subject(subject_id)
            .detail(role_name)
            .emit();
    }
    Ok(result.rows_affected > 0)
}
