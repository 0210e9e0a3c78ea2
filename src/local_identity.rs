//! Email and password accounts.
//!
//! A local account is a `local_users` row attached to a subject. Registration gates (allowlist,
//! email verification, admin approval) decide whether the account is usable; the very first
//! account bypasses all of them and becomes the administrator.

use crate::audit::{AuditEvent, AuditEventType};
use crate::email::EmailSender;
use crate::entities::{local_user, role, subject_role};
use crate::errors::GateError;
use crate::notifications::{AdminNotification, AdminNotifier};
use crate::password;
use crate::roles::ADMIN_ROLE;
use crate::settings::{LocalIdentity as LocalIdentityCfg, Lockout};
use crate::storage;
use crate::subjects::{self, NewSubject, SubjectUpdate};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

const BOOTSTRAP_OWNER: &str = "system";
const BOOTSTRAP_KEY: &str = "bootstrap_admin";

/// Returned for every reset request, whether or not the address has an account.
pub const RESET_REQUESTED_MESSAGE: &str =
    "If an account exists for this address, a password reset link has been sent.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    PendingEmailVerification,
    PendingApproval,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registered {
    pub subject_id: String,
    pub status: AccountStatus,
    pub is_bootstrap_admin: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginSuccess {
    pub subject_id: String,
    pub must_change_password: bool,
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("local accounts are disabled")]
    Disabled,
    #[error("registration is closed")]
    RegistrationClosed,
    #[error("email address is not valid")]
    InvalidEmail,
    #[error("password does not meet the policy: {}", .0.join(", "))]
    WeakPassword(Vec<&'static str>),
    #[error("this email address is not allowed to register")]
    NotAllowed,
    #[error("an account already exists for this email address")]
    EmailTaken,
    #[error(transparent)]
    Internal(#[from] GateError),
}

impl RegistrationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Disabled => "local_identity_disabled",
            Self::RegistrationClosed => "registration_closed",
            Self::InvalidEmail => "invalid_email",
            Self::WeakPassword(_) => "weak_password",
            Self::NotAllowed => "not_allowed",
            Self::EmailTaken => "email_taken",
            Self::Internal(_) => "server_error",
        }
    }
}

impl From<sea_orm::DbErr> for RegistrationError {
    fn from(value: sea_orm::DbErr) -> Self {
        if matches!(value.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
            return Self::EmailTaken;
        }
        Self::Internal(value.into())
    }
}

#[derive(Debug, Error)]
pub enum LoginFailure {
    #[error("local accounts are disabled")]
    Disabled,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("account is locked until {until}")]
    Locked { until: i64 },
    #[error("account is inactive")]
    Inactive,
    #[error("account is awaiting administrator approval")]
    PendingApproval,
    #[error("email address has not been verified")]
    EmailNotVerified,
    #[error(transparent)]
    Internal(#[from] GateError),
}

impl LoginFailure {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Disabled => "local_identity_disabled",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Locked { .. } => "account_locked",
            Self::Inactive => "account_inactive",
            Self::PendingApproval => "pending_approval",
            Self::EmailNotVerified => "email_not_verified",
            Self::Internal(_) => "server_error",
        }
    }
}

impl From<sea_orm::DbErr> for LoginFailure {
    fn from(value: sea_orm::DbErr) -> Self {
        Self::Internal(value.into())
    }
}

/// Failures of the token- and password-driven account operations.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token is invalid")]
    InvalidToken,
    #[error("token has expired")]
    TokenExpired,
    #[error("current password is incorrect")]
    WrongPassword,
    #[error("password does not meet the policy: {}", .0.join(", "))]
    WeakPassword(Vec<&'static str>),
    #[error("no local account for this subject")]
    UnknownAccount,
    #[error(transparent)]
    Internal(#[from] GateError),
}

impl CredentialError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::WrongPassword => "wrong_password",
            Self::WeakPassword(_) => "weak_password",
            Self::UnknownAccount => "unknown_account",
            Self::Internal(_) => "server_error",
        }
    }
}

impl From<sea_orm::DbErr> for CredentialError {
    fn from(value: sea_orm::DbErr) -> Self {
        Self::Internal(value.into())
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Deliberately loose: one `@`, a non-empty local part, a dotted domain, no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

/// Entries are exact addresses or bare domains. An empty list admits everyone.
pub fn is_allowlisted(email: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();
    allowlist.iter().any(|entry| {
        let entry = normalize_email(entry);
        if entry.contains('@') {
            entry == email
        } else {
            entry.trim_start_matches('@') == domain
        }
    })
}

/// Lock duration after the `lockout_count`-th lockout.
pub fn lockout_duration(cfg: &Lockout, lockout_count: i64) -> i64 {
    if !cfg.exponential_backoff {
        return cfg.lockout_secs;
    }
    let exponent = (lockout_count - 1).clamp(0, 30) as u32;
    cfg.lockout_secs
        .saturating_mul(1_i64 << exponent)
        .min(cfg.max_lockout_secs)
}

#[derive(Clone)]
pub struct LocalIdentityProvider {
    db: DatabaseConnection,
    cfg: LocalIdentityCfg,
    email: Arc<dyn EmailSender>,
    notifier: AdminNotifier,
}

impl LocalIdentityProvider {
    pub fn new(
        db: DatabaseConnection,
        cfg: LocalIdentityCfg,
        email: Arc<dyn EmailSender>,
        notifier: AdminNotifier,
    ) -> Self {
        Self {
            db,
            cfg,
            email,
            notifier,
        }
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Registered, RegistrationError> {
        if !self.cfg.enabled {
            return Err(RegistrationError::Disabled);
        }
        if !self.cfg.allow_registration {
            return Err(RegistrationError::RegistrationClosed);
        }
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            return Err(RegistrationError::InvalidEmail);
        }
        let violations = password::policy_violations(password, &self.cfg.password_policy);
        if !violations.is_empty() {
            return Err(RegistrationError::WeakPassword(violations));
        }
        let allowlisted = is_allowlisted(&email, &self.cfg.allowlist);
        if !allowlisted && !self.cfg.open_registration_with_approval {
            return Err(RegistrationError::NotAllowed);
        }

        let password_hash = password::hash_password(password)?;
        let now = storage::now();
        let txn = self.db.begin().await?;

        if find_by_email(&txn, &email).await?.is_some() {
            return Err(RegistrationError::EmailTaken);
        }

        let is_first = local_user::Entity::find().count(&txn).await? == 0
            && storage::claim_property(
                &txn,
                BOOTSTRAP_OWNER,
                BOOTSTRAP_KEY,
                &serde_json::json!({ "email": email }),
            )
            .await?;

        let name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
        let subject = subjects::create_subject(
            &txn,
            NewSubject {
                name,
                email: Some(email.clone()),
                is_system: false,
            },
        )
        .await?;

        let needs_verification =
            !is_first && self.cfg.require_email_verification && self.email.is_enabled();
        let needs_approval = !is_first && (self.cfg.require_admin_approval || !allowlisted);
        let verification_token = needs_verification.then(storage::random_token);

        local_user::ActiveModel {
            id: Set(storage::new_id()),
            subject_id: Set(subject.id.clone()),
            email: Set(email.clone()),
            password_hash: Set(password_hash),
            email_verified: Set(!needs_verification),
            verification_token_hash: Set(verification_token.as_deref().map(storage::hash_token)),
            verification_token_expires_at: Set(
                needs_verification.then_some(now + self.cfg.verification_token_ttl_secs)
            ),
            reset_token_hash: Set(None),
            reset_token_expires_at: Set(None),
            failed_attempts: Set(0),
            lockout_count: Set(0),
            locked_until: Set(None),
            is_active: Set(true),
            pending_approval: Set(needs_approval),
            must_change_password: Set(false),
            created_at: Set(now),
            password_changed_at: Set(Some(now)),
        }
        .insert(&txn)
        .await?;

        if is_first {
            subjects::assign_role(&txn, &subject.id, ADMIN_ROLE).await?;
        }
        txn.commit().await?;

        AuditEvent::new(AuditEventType::AccountRegistered)
            .subject(&subject.id)
            .detail(if is_first { "bootstrap admin" } else { "local" })
            .emit();
        if is_first {
            tracing::info!(subject_id = %subject.id, "First local account registered as administrator");
        }

        if let Some(token) = &verification_token {
            if let Err(e) = self.email.send_verification(&email, token).await {
                tracing::error!(error = %e, "Failed to send verification email");
            }
        }
        if needs_approval {
            self.request_approval(&subject.id, &email).await;
        }

        let status = if needs_approval {
            AccountStatus::PendingApproval
        } else if needs_verification {
            AccountStatus::PendingEmailVerification
        } else {
            AccountStatus::Active
        };
        Ok(Registered {
            subject_id: subject.id,
            status,
            is_bootstrap_admin: is_first,
        })
    }

    async fn request_approval(&self, subject_id: &str, email: &str) {
        self.notifier
            .notify(AdminNotification::RegistrationPendingApproval {
                subject_id: subject_id.to_string(),
                email: email.to_string(),
            });
        if !self.email.is_enabled() {
            return;
        }
        match admin_emails(&self.db).await {
            Ok(admins) => {
                for admin in admins {
                    if let Err(e) = self.email.send_admin_approval_request(&admin, email).await {
                        tracing::error!(error = %e, "Failed to send approval request");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to look up administrators"),
        }
    }

    /// Lock state is checked before the password, so a correct password during a lockout
    /// still fails. Account-state failures are only revealed to callers holding the password.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginSuccess, LoginFailure> {
        if !self.cfg.enabled {
            return Err(LoginFailure::Disabled);
        }
        let now = storage::now();
        let Some(user) = find_by_email(&self.db, &normalize_email(email)).await? else {
            password::verify_dummy(password);
            return Err(LoginFailure::InvalidCredentials);
        };

        if let Some(until) = user.locked_until.filter(|until| *until > now) {
            return Err(LoginFailure::Locked { until });
        }

        if !password::verify_password(password, &user.password_hash)? {
            return Err(self.record_failure(user, now).await?);
        }

        let subject = subjects::get_subject(&self.db, &user.subject_id).await?;
        if !user.is_active || !subject.as_ref().is_some_and(|s| s.is_active) {
            return Err(LoginFailure::Inactive);
        }
        if user.pending_approval {
            return Err(LoginFailure::PendingApproval);
        }
        if !user.email_verified {
            return Err(LoginFailure::EmailNotVerified);
        }

        local_user::Entity::update_many()
            .col_expr(local_user::Column::FailedAttempts, Expr::value(0_i64))
            .col_expr(local_user::Column::LockoutCount, Expr::value(0_i64))
            .col_expr(local_user::Column::LockedUntil, Expr::value(Option::<i64>::None))
            .filter(local_user::Column::Id.eq(user.id.clone()))
            .exec(&self.db)
            .await?;
        subjects::record_login(&self.db, &user.subject_id, now).await?;

        Ok(LoginSuccess {
            subject_id: user.subject_id,
            must_change_password: user.must_change_password,
        })
    }

    /// Count a failed password. The increment is a single UPDATE so concurrent guesses all
    /// count; of the failures that cross the threshold, only one applies the lock.
    async fn record_failure(
        &self,
        user: local_user::Model,
        now: i64,
    ) -> Result<LoginFailure, GateError> {
        let lockout = &self.cfg.lockout;
        local_user::Entity::update_many()
            .col_expr(
                local_user::Column::FailedAttempts,
                Expr::col(local_user::Column::FailedAttempts).add(1),
            )
            .filter(local_user::Column::Id.eq(user.id.clone()))
            .exec(&self.db)
            .await?;

        let Some(current) = local_user::Entity::find_by_id(user.id)
            .one(&self.db)
            .await?
        else {
            return Ok(LoginFailure::InvalidCredentials);
        };
        if current.failed_attempts < lockout.max_failed_attempts {
            return Ok(LoginFailure::InvalidCredentials);
        }

        let count = current.lockout_count + 1;
        let until = now + lockout_duration(lockout, count);
        let locked = local_user::Entity::update_many()
            .col_expr(local_user::Column::FailedAttempts, Expr::value(0_i64))
            .col_expr(local_user::Column::LockoutCount, Expr::value(count))
            .col_expr(local_user::Column::LockedUntil, Expr::value(until))
            .filter(local_user::Column::Id.eq(current.id.clone()))
            .filter(local_user::Column::LockoutCount.eq(current.lockout_count))
            .filter(local_user::Column::FailedAttempts.gte(lockout.max_failed_attempts))
            .exec(&self.db)
            .await?;

        if locked.rows_affected == 1 {
            AuditEvent::new(AuditEventType::AccountLocked)
                .subject(&current.subject_id)
                .detail(format!("lockout {count}, locked until {until}"))
                .emit();
            self.notifier.notify(AdminNotification::AccountLocked {
                subject_id: current.subject_id,
                locked_until: until,
            });
        }
        Ok(LoginFailure::InvalidCredentials)
    }

    pub async fn verify_email(&self, token: &str) -> Result<String, CredentialError> {
        let now = storage::now();
        let user = local_user::Entity::find()
            .filter(local_user::Column::VerificationTokenHash.eq(storage::hash_token(token)))
            .one(&self.db)
            .await?
            .ok_or(CredentialError::InvalidToken)?;
        if user.verification_token_expires_at.is_some_and(|exp| exp < now) {
            return Err(CredentialError::TokenExpired);
        }

        let subject_id = user.subject_id.clone();
        let mut active = user.into_active_model();
        active.email_verified = Set(true);
        active.verification_token_hash = Set(None);
        active.verification_token_expires_at = Set(None);
        active.update(&self.db).await?;
        tracing::info!(%subject_id, "Email address verified");
        Ok(subject_id)
    }

    /// Issue a fresh verification token. Silent for unknown or already verified addresses.
    pub async fn resend_verification(&self, email: &str) -> Result<(), GateError> {
        let email = normalize_email(email);
        let Some(user) = find_by_email(&self.db, &email).await? else {
            return Ok(());
        };
        if user.email_verified || !self.email.is_enabled() {
            return Ok(());
        }
        let token = storage::random_token();
        let mut active = user.into_active_model();
        active.verification_token_hash = Set(Some(storage::hash_token(&token)));
        active.verification_token_expires_at =
            Set(Some(storage::now() + self.cfg.verification_token_ttl_secs));
        active.update(&self.db).await?;
        self.email.send_verification(&email, &token).await
    }

    /// Always answers with [`RESET_REQUESTED_MESSAGE`].
    pub async fn request_password_reset(&self, email: &str) -> Result<&'static str, GateError> {
        let email = normalize_email(email);
        let Some(user) = find_by_email(&self.db, &email).await? else {
            tracing::debug!("Password reset requested for unknown address");
            return Ok(RESET_REQUESTED_MESSAGE);
        };
        if !user.is_active {
            return Ok(RESET_REQUESTED_MESSAGE);
        }

        let token = storage::random_token();
        let mut active = user.into_active_model();
        active.reset_token_hash = Set(Some(storage::hash_token(&token)));
        active.reset_token_expires_at = Set(Some(storage::now() + self.cfg.reset_token_ttl_secs));
        active.update(&self.db).await?;

        if let Err(e) = self.email.send_password_reset(&email, &token).await {
            tracing::error!(error = %e, "Failed to send password reset email");
        }
        Ok(RESET_REQUESTED_MESSAGE)
    }

    /// Set a new password from a reset token. Clears any lockout.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<String, CredentialError> {
        let now = storage::now();
        let user = local_user::Entity::find()
            .filter(local_user::Column::ResetTokenHash.eq(storage::hash_token(token)))
            .one(&self.db)
            .await?
            .ok_or(CredentialError::InvalidToken)?;
        if user.reset_token_expires_at.map_or(true, |exp| exp < now) {
            return Err(CredentialError::TokenExpired);
        }
        self.check_policy(new_password)?;

        let hash = password::hash_password(new_password)?;
        let subject_id = user.subject_id.clone();
        let consumed = local_user::Entity::update_many()
            .col_expr(local_user::Column::PasswordHash, Expr::value(hash))
            .col_expr(local_user::Column::ResetTokenHash, Expr::value(Option::<String>::None))
            .col_expr(local_user::Column::ResetTokenExpiresAt, Expr::value(Option::<i64>::None))
            .col_expr(local_user::Column::FailedAttempts, Expr::value(0_i64))
            .col_expr(local_user::Column::LockedUntil, Expr::value(Option::<i64>::None))
            .col_expr(local_user::Column::MustChangePassword, Expr::value(false))
            .col_expr(local_user::Column::PasswordChangedAt, Expr::value(now))
            .filter(local_user::Column::Id.eq(user.id.clone()))
            .filter(local_user::Column::ResetTokenHash.eq(storage::hash_token(token)))
            .exec(&self.db)
            .await?;
        if consumed.rows_affected != 1 {
            return Err(CredentialError::InvalidToken);
        }

        AuditEvent::new(AuditEventType::PasswordReset)
            .subject(&subject_id)
            .emit();
        Ok(subject_id)
    }

    pub async fn change_password(
        &self,
        subject_id: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), CredentialError> {
        let user = find_by_subject(&self.db, subject_id)
            .await?
            .ok_or(CredentialError::UnknownAccount)?;
        if !password::verify_password(current_password, &user.password_hash)? {
            return Err(CredentialError::WrongPassword);
        }
        self.check_policy(new_password)?;

        let mut active = user.into_active_model();
        active.password_hash = Set(password::hash_password(new_password)?);
        active.must_change_password = Set(false);
        active.password_changed_at = Set(Some(storage::now()));
        active.update(&self.db).await?;

        AuditEvent::new(AuditEventType::PasswordChanged)
            .subject(subject_id)
            .emit();
        Ok(())
    }

    fn check_policy(&self, candidate: &str) -> Result<(), CredentialError> {
        let violations = password::policy_violations(candidate, &self.cfg.password_policy);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(CredentialError::WeakPassword(violations))
        }
    }

    pub async fn list_pending_approval(&self) -> Result<Vec<local_user::Model>, GateError> {
        Ok(local_user::Entity::find()
            .filter(local_user::Column::PendingApproval.eq(true))
            .filter(local_user::Column::IsActive.eq(true))
            .order_by_asc(local_user::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// Returns false if the account was not awaiting approval.
    pub async fn approve(&self, subject_id: &str, approved_by: &str) -> Result<bool, GateError> {
        let updated = local_user::Entity::update_many()
            .col_expr(local_user::Column::PendingApproval, Expr::value(false))
            .filter(local_user::Column::SubjectId.eq(subject_id))
            .filter(local_user::Column::PendingApproval.eq(true))
            .exec(&self.db)
            .await?;
        if updated.rows_affected == 0 {
            return Ok(false);
        }

        AuditEvent::new(AuditEventType::AccountApproved)
            .subject(subject_id)
            .detail(format!("approved by {approved_by}"))
            .emit();
        self.notifier.notify(AdminNotification::AccountApproved {
            subject_id: subject_id.to_string(),
        });
        Ok(true)
    }

    /// Deactivates both the account and its subject.
    pub async fn reject(&self, subject_id: &str, rejected_by: &str) -> Result<bool, GateError> {
        let txn = self.db.begin().await?;
        let updated = local_user::Entity::update_many()
            .col_expr(local_user::Column::PendingApproval, Expr::value(false))
            .col_expr(local_user::Column::IsActive, Expr::value(false))
            .filter(local_user::Column::SubjectId.eq(subject_id))
            .filter(local_user::Column::PendingApproval.eq(true))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            return Ok(false);
        }
        subjects::update_subject(
            &txn,
            subject_id,
            SubjectUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await?;

        AuditEvent::new(AuditEventType::AccountRejected)
            .subject(subject_id)
            .detail(format!("rejected by {rejected_by}"))
            .emit();
        self.notifier.notify(AdminNotification::AccountRejected {
            subject_id: subject_id.to_string(),
        });
        Ok(true)
    }

    pub async fn set_must_change_password(
        &self,
        subject_id: &str,
        required: bool,
    ) -> Result<(), GateError> {
        let updated = local_user::Entity::update_many()
            .col_expr(local_user::Column::MustChangePassword, Expr::value(required))
            .filter(local_user::Column::SubjectId.eq(subject_id))
            .exec(&self.db)
            .await?;
        if updated.rows_affected == 0 {
            return Err(GateError::NotFound(format!("local account for {subject_id}")));
        }
        Ok(())
    }
}

async fn find_by_email<C: ConnectionTrait>(
    db: &C,
    email: &str,
) -> Result<Option<local_user::Model>, GateError> {
    Ok(local_user::Entity::find()
        .filter(local_user::Column::Email.eq(email))
        .one(db)
        .await?)
}

pub async fn find_by_subject<C: ConnectionTrait>(
    db: &C,
    subject_id: &str,
) -> Result<Option<local_user::Model>, GateError> {
    Ok(local_user::Entity::find()
        .filter(local_user::Column::SubjectId.eq(subject_id))
        .one(db)
        .await?)
}

async fn admin_emails(db: &DatabaseConnection) -> Result<Vec<String>, GateError> {
    let Some(admin) = role::Entity::find()
        .filter(role::Column::Name.eq(ADMIN_ROLE))
        .one(db)
        .await?
    else {
        return Ok(Vec::new());
    };
    let subject_ids: Vec<String> = subject_role::Entity::find()
        .filter(subject_role::Column::RoleId.eq(admin.id))
        .all(db)
        .await?
        .into_iter()
        .map(|sr| sr.subject_id)
        .collect();
    if subject_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(local_user::Entity::find()
        .filter(local_user::Column::SubjectId.is_in(subject_ids))
        .filter(local_user::Column::IsActive.eq(true))
        .all(db)
        .await?
        .into_iter()
        .map(|u| u.email)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("alice@example.com"));
        assert!(!is_valid_email("alice"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("alice@localhost"));
        assert!(!is_valid_email("alice@@example.com"));
        assert!(!is_valid_email("al ice@example.com"));
    }

    #[test]
    fn test_allowlist_matches_address_or_domain() {
        let list = vec!["bob@other.org".to_string(), "Example.com".to_string()];
        assert!(is_allowlisted("alice@example.com", &list));
        assert!(is_allowlisted("bob@other.org", &list));
        assert!(!is_allowlisted("carol@other.org", &list));
        assert!(!is_allowlisted("mallory@notexample.com", &list));
        assert!(is_allowlisted("anyone@anywhere.net", &[]));
    }

    #[test]
    fn test_lockout_backoff_doubles_and_caps() {
        let cfg = Lockout {
            max_failed_attempts: 5,
            lockout_secs: 900,
            exponential_backoff: true,
            max_lockout_secs: 3600,
        };
        assert_eq!(lockout_duration(&cfg, 1), 900);
        assert_eq!(lockout_duration(&cfg, 2), 1800);
        assert_eq!(lockout_duration(&cfg, 3), 3600);
        assert_eq!(lockout_duration(&cfg, 40), 3600);

        let flat = Lockout {
            exponential_backoff: false,
            ..cfg
        };
        assert_eq!(lockout_duration(&flat, 4), 900);
    }
}
