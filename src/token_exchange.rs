//! Token endpoint orchestration: authorization-code exchange, refresh rotation with reuse
//! detection, device-code exchange, revocation, and bearer authentication.
//!
//! Each grant-producing path runs in one database transaction, so a failure part-way never
//! leaves a code consumed without tokens or a refresh token revoked without a successor.

use crate::audit::{AuditEvent, AuditEventType};
use crate::auth_code_flow::{self, AuthCodeError, NewAuthCode};
use crate::clients::{self, RedirectUriError};
use crate::device_flow::{self, DeviceFlowError};
use crate::entities::{grant, refresh_token};
use crate::errors::GateError;
use crate::grants;
use crate::revocation::RevocationCache;
use crate::settings::{Device as DeviceCfg, Tokens as TokensCfg};
use crate::storage;
use crate::subjects::{self, ResolvedSubject};
use crate::token_codec::{AccessTokenInput, TokenCodec, TokenValidationError};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    InvalidScope,
    UnauthorizedClient,
    UnsupportedGrantType,
    AccessDenied,
    ExpiredToken,
    AuthorizationPending,
    SlowDown,
    ServerError,
}

impl OAuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidScope => "invalid_scope",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::AccessDenied => "access_denied",
            Self::ExpiredToken => "expired_token",
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown => "slow_down",
            Self::ServerError => "server_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthError {
    pub code: OAuthErrorCode,
    pub description: String,
}

impl OAuthError {
    pub fn new(code: OAuthErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn invalid_grant() -> Self {
        Self::new(
            OAuthErrorCode::InvalidGrant,
            "The provided grant is invalid, expired, or revoked",
        )
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidRequest, description)
    }

    pub fn server_error() -> Self {
        Self::new(OAuthErrorCode::ServerError, "Internal server error")
    }
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.description)
    }
}

impl std::error::Error for OAuthError {}

/// Internal failures are logged and never echoed.
impl From<GateError> for OAuthError {
    fn from(value: GateError) -> Self {
        tracing::error!(error = %value, "Token endpoint internal error");
        OAuthError::server_error()
    }
}

impl From<sea_orm::DbErr> for OAuthError {
    fn from(value: sea_orm::DbErr) -> Self {
        GateError::from(value).into()
    }
}

impl From<DeviceFlowError> for OAuthError {
    fn from(value: DeviceFlowError) -> Self {
        match value {
            DeviceFlowError::AuthorizationPending => Self::new(
                OAuthErrorCode::AuthorizationPending,
                "The user has not yet completed authorization",
            ),
            DeviceFlowError::SlowDown { interval } => Self::new(
                OAuthErrorCode::SlowDown,
                format!("Polling too frequently; wait at least {interval} seconds"),
            ),
            DeviceFlowError::AccessDenied => {
                Self::new(OAuthErrorCode::AccessDenied, "The user denied the request")
            }
            DeviceFlowError::ExpiredToken => {
                Self::new(OAuthErrorCode::ExpiredToken, "The device code has expired")
            }
            DeviceFlowError::Internal(e) => e.into(),
            other => {
                tracing::warn!(reason = %other, "Device code exchange rejected");
                Self::invalid_grant()
            }
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = match self.code {
            OAuthErrorCode::InvalidClient => StatusCode::UNAUTHORIZED,
            OAuthErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        let mut resp = (
            status,
            Json(json!({
                "error": self.code.as_str(),
                "error_description": self.description,
            })),
        )
            .into_response();
        resp.headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        resp
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

/// Where a request came from, recorded as grant last-use metadata.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    AccessJwt,
    StaticToken,
}

/// The caller behind a bearer credential, with permissions resolved.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject_id: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    pub kind: CredentialKind,
}

impl Principal {
    pub fn has_permission(&self, required: &str) -> bool {
        subjects::has_permission(&self.permissions, required)
    }
}

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error(transparent)]
    InvalidToken(#[from] TokenValidationError),
    #[error("token has been revoked")]
    Revoked,
    #[error("unknown access token")]
    UnknownToken,
    #[error("subject is inactive")]
    Inactive,
    #[error(transparent)]
    Internal(#[from] GateError),
}

impl AuthenticationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidToken(e) => e.reason_code(),
            Self::Revoked => "revoked",
            Self::UnknownToken => "unknown_token",
            Self::Inactive => "inactive",
            Self::Internal(_) => "server_error",
        }
    }
}

#[derive(Clone)]
pub struct TokenService {
    db: DatabaseConnection,
    codec: TokenCodec,
    revocations: RevocationCache,
    tokens: TokensCfg,
    device: DeviceCfg,
}

impl TokenService {
    pub fn new(
        db: DatabaseConnection,
        codec: TokenCodec,
        revocations: RevocationCache,
        tokens: TokensCfg,
        device: DeviceCfg,
    ) -> Self {
        Self {
            db,
            codec,
            revocations,
            tokens,
            device,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn revocations(&self) -> &RevocationCache {
        &self.revocations
    }

    /// Authorization endpoint, after the subject has consented: check the redirect URI against
    /// the client's pinned set and issue a PKCE-bound code.
    pub async fn authorize(
        &self,
        subject_id: &str,
        client_id: &str,
        redirect_uri: &str,
        scopes: &[String],
        code_challenge: &str,
        code_challenge_method: &str,
    ) -> Result<String, OAuthError> {
        if let Err(e) = clients::validate_redirect_uri(&self.db, client_id, redirect_uri).await {
            return Err(match e {
                RedirectUriError::Internal(inner) => inner.into(),
                other => {
                    tracing::warn!(%client_id, reason = other.reason_code(), "Redirect URI rejected");
                    OAuthError::invalid_request(other.to_string())
                }
            });
        }

        let req = NewAuthCode {
            client_id,
            subject_id,
            scopes,
            redirect_uri,
            code_challenge,
            code_challenge_method,
        };
        match auth_code_flow::generate_code(
            &self.db,
            self.tokens.auth_code_ttl_secs,
            req,
            storage::now(),
        )
        .await
        {
            Ok(code) => Ok(code),
            Err(GateError::Validation(msg)) => Err(OAuthError::invalid_request(msg)),
            Err(e) => Err(e.into()),
        }
    }

    /// `grant_type=authorization_code`
    pub async fn exchange_code(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: &str,
        ctx: &RequestContext,
    ) -> Result<TokenPair, OAuthError> {
        let now = storage::now();
        let txn = self.db.begin().await?;

        let redeemed = match auth_code_flow::redeem(
            &txn,
            code,
            client_id,
            redirect_uri,
            code_verifier,
            now,
        )
        .await
        {
            Ok(r) => r,
            Err(AuthCodeError::Rejected(reason)) => {
                tracing::warn!(%client_id, reason, "Authorization code exchange rejected");
                return Err(OAuthError::invalid_grant());
            }
            Err(AuthCodeError::Internal(e)) => return Err(e.into()),
        };

        let grant = grants::create_or_update(
            &txn,
            &redeemed.client_id,
            &redeemed.subject_id,
            &redeemed.scopes,
        )
        .await?;
        let (pair, _) = self.issue_pair(&txn, &grant, ctx, now).await?;
        txn.commit().await?;

        AuditEvent::new(AuditEventType::TokensIssued)
            .grant(&grant.id)
            .subject(&grant.subject_id)
            .client(grant.client_id.as_deref())
            .scopes(&grants::scopes(&grant)?)
            .detail("authorization_code")
            .emit();
        Ok(pair)
    }

    /// `grant_type=refresh_token`. Presenting an already-rotated token revokes the whole grant.
    pub async fn refresh(
        &self,
        presented: &str,
        client_id: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<TokenPair, OAuthError> {
        let now = storage::now();

        let Some(current) = refresh_token::Entity::find()
            .filter(refresh_token::Column::TokenHash.eq(storage::hash_token(presented)))
            .one(&self.db)
            .await?
        else {
            return Err(OAuthError::invalid_grant());
        };

        if current.revoked_at.is_some() {
            if let Some(successor) = &current.replaced_by {
                self.handle_reuse(&current, successor, now).await?;
            }
            return Err(OAuthError::invalid_grant());
        }
        if current.expires_at < now {
            return Err(OAuthError::invalid_grant());
        }

        // The claim is the first statement, so concurrent rotations of one token queue on the
        // write lock instead of failing their snapshot.
        let txn = self.db.begin().await?;
        let revoked = refresh_token::Entity::update_many()
            .col_expr(refresh_token::Column::RevokedAt, Expr::value(now))
            .filter(refresh_token::Column::Id.eq(current.id.clone()))
            .filter(refresh_token::Column::RevokedAt.is_null())
            .exec(&txn)
            .await?;
        if revoked.rows_affected != 1 {
            // a concurrent rotation of the same token won
            return Err(OAuthError::invalid_grant());
        }

        let Some(grant) = grants::get_grant(&txn, &current.grant_id)
            .await?
            .filter(grants::is_active)
        else {
            return Err(OAuthError::invalid_grant());
        };
        if let Some(cid) = client_id {
            if grant.client_id.as_deref() != Some(clients::normalize_client_id(cid).as_str()) {
                tracing::warn!(grant_id = %grant.id, "Refresh token presented by another client");
                return Err(OAuthError::invalid_grant());
            }
        }

        let (pair, successor_id) = self.issue_pair(&txn, &grant, ctx, now).await?;
        refresh_token::Entity::update_many()
            .col_expr(refresh_token::Column::ReplacedBy, Expr::value(successor_id))
            .filter(refresh_token::Column::Id.eq(current.id.clone()))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        AuditEvent::new(AuditEventType::RefreshRotated)
            .grant(&grant.id)
            .subject(&grant.subject_id)
            .client(grant.client_id.as_deref())
            .scopes(&grants::scopes(&grant)?)
            .emit();
        Ok(pair)
    }

    async fn handle_reuse(
        &self,
        replayed: &refresh_token::Model,
        successor: &str,
        now: i64,
    ) -> Result<(), OAuthError> {
        let grant = grants::get_grant(&self.db, &replayed.grant_id).await?;
        let mut event = AuditEvent::new(AuditEventType::RefreshReuseDetected)
            .grant(&replayed.grant_id)
            .detail(format!(
                "rotated token {} replayed after successor {successor}",
                replayed.id
            ));
        if let Some(g) = &grant {
            event = event
                .subject(&g.subject_id)
                .client(g.client_id.as_deref())
                .scopes(&grants::scopes(g)?);
        }
        event.emit();

        grants::revoke(&self.db, &replayed.grant_id, now).await?;
        Ok(())
    }

    /// `grant_type=urn:ietf:params:oauth:grant-type:device_code`
    pub async fn exchange_device_code(
        &self,
        device_code: &str,
        client_id: &str,
        ctx: &RequestContext,
    ) -> Result<TokenPair, OAuthError> {
        let now = storage::now();
        let txn = self.db.begin().await?;

        let approved =
            match device_flow::exchange(&txn, &self.device, device_code, client_id, now).await {
                Ok(a) => a,
                Err(e) => {
                    // keep poll bookkeeping (last poll, slowed interval)
                    txn.commit().await?;
                    return Err(e.into());
                }
            };

        let Some(grant) = grants::get_grant(&txn, &approved.grant_id)
            .await?
            .filter(grants::is_active)
        else {
            return Err(OAuthError::invalid_grant());
        };
        let (pair, _) = self.issue_pair(&txn, &grant, ctx, now).await?;
        txn.commit().await?;

        AuditEvent::new(AuditEventType::TokensIssued)
            .grant(&grant.id)
            .subject(&approved.subject_id)
            .client(Some(&approved.client_id))
            .scopes(&approved.scopes)
            .detail("device_code")
            .emit();
        Ok(pair)
    }

    /// RFC 7009 revocation. Never reports whether the token existed.
    pub async fn revoke(&self, token: &str, token_type_hint: Option<&str>) {
        let now = storage::now();
        let revoked = if token_type_hint == Some("access_token") {
            self.revoke_access_token(token, now) || self.revoke_refresh_token(token, now).await
        } else {
            self.revoke_refresh_token(token, now).await || self.revoke_access_token(token, now)
        };
        if !revoked {
            tracing::debug!("Revocation request for unknown token");
        }
    }

    async fn revoke_refresh_token(&self, token: &str, now: i64) -> bool {
        let result = async {
            let Some(model) = refresh_token::Entity::find()
                .filter(refresh_token::Column::TokenHash.eq(storage::hash_token(token)))
                .one(&self.db)
                .await?
            else {
                return Ok::<bool, GateError>(false);
            };
            let updated = refresh_token::Entity::update_many()
                .col_expr(refresh_token::Column::RevokedAt, Expr::value(now))
                .filter(refresh_token::Column::Id.eq(model.id.clone()))
                .filter(refresh_token::Column::RevokedAt.is_null())
                .exec(&self.db)
                .await?;
            if updated.rows_affected == 1 {
                AuditEvent::new(AuditEventType::RefreshRevoked)
                    .grant(&model.grant_id)
                    .emit();
            }
            Ok(true)
        }
        .await;

        match result {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(error = %e, "Failed to revoke refresh token");
                false
            }
        }
    }

    fn revoke_access_token(&self, token: &str, now: i64) -> bool {
        match self.codec.validate(token, now) {
            Ok(claims) => {
                let remaining = self.codec.acceptance_remaining(claims.expires_at, now);
                self.revocations.revoke(&claims.jti, remaining);
                AuditEvent::new(AuditEventType::AccessTokenRevoked)
                    .subject(&claims.subject_id)
                    .client(claims.client_id.as_deref())
                    .scopes(&claims.scopes)
                    .emit();
                true
            }
            Err(_) => false,
        }
    }

    /// Resolve a bearer credential: an access JWT (checked against the revocation cache) or a
    /// static subject access token.
    pub async fn authenticate(&self, bearer: &str) -> Result<Principal, AuthenticationError> {
        let now = storage::now();

        if bearer.split('.').count() == 3 {
            let claims = self.codec.validate(bearer, now)?;
            if self.revocations.is_revoked(&claims.jti) {
                return Err(AuthenticationError::Revoked);
            }
            return Ok(Principal {
                subject_id: claims.subject_id,
                roles: claims.roles,
                permissions: claims.permissions,
                client_id: claims.client_id,
                scopes: claims.scopes,
                kind: CredentialKind::AccessJwt,
            });
        }

        let subject = subjects::find_by_access_token(&self.db, bearer)
            .await?
            .ok_or(AuthenticationError::UnknownToken)?;
        let resolved = subjects::resolve(&self.db, &subject.id)
            .await?
            .ok_or(AuthenticationError::UnknownToken)?;
        Ok(Principal {
            subject_id: resolved.subject.id,
            roles: resolved.roles,
            permissions: resolved.permissions,
            client_id: None,
            scopes: Vec::new(),
            kind: CredentialKind::StaticToken,
        })
    }

    /// Access token for a first-party sign-in (local password login). No grant and no refresh
    /// token: the session ends when the token expires.
    pub async fn issue_session_token(&self, subject_id: &str) -> Result<TokenPair, OAuthError> {
        let now = storage::now();
        let Some(resolved) = subjects::resolve(&self.db, subject_id)
            .await?
            .filter(|r| r.subject.is_active)
        else {
            return Err(OAuthError::invalid_grant());
        };
        let access = self
            .codec
            .mint(&access_input(&resolved, None, Vec::new()), now)?;
        AuditEvent::new(AuditEventType::TokensIssued)
            .subject(subject_id)
            .detail("local login")
            .emit();
        Ok(TokenPair {
            access_token: access.token.clone(),
            token_type: "Bearer",
            expires_in: access.expires_in(),
            refresh_token: None,
            scope: String::new(),
        })
    }

    /// Mint a fresh access token (current roles and permissions) plus a refresh token for
    /// `grant`, and touch the grant's last-use metadata. Also returns the refresh token's row id.
    async fn issue_pair<C: ConnectionTrait>(
        &self,
        db: &C,
        grant: &grant::Model,
        ctx: &RequestContext,
        now: i64,
    ) -> Result<(TokenPair, String), OAuthError> {
        let resolved = subjects::resolve(db, &grant.subject_id).await?;
        let Some(resolved) = resolved.filter(|r| r.subject.is_active) else {
            tracing::warn!(grant_id = %grant.id, "Token requested for missing or inactive subject");
            return Err(OAuthError::invalid_grant());
        };
        let scopes = grants::scopes(grant)?;

        let refresh = self.codec.generate_refresh_token();
        let refresh_id = storage::new_id();
        refresh_token::ActiveModel {
            id: Set(refresh_id.clone()),
            grant_id: Set(grant.id.clone()),
            token_hash: Set(refresh.hash.clone()),
            issued_at: Set(now),
            expires_at: Set(now + self.tokens.refresh_token_ttl_secs),
            revoked_at: Set(None),
            replaced_by: Set(None),
        }
        .insert(db)
        .await?;

        let access = self.codec.mint(
            &access_input(&resolved, grant.client_id.clone(), scopes.clone()),
            now,
        )?;

        grants::update_last_used(
            db,
            &grant.id,
            now,
            ctx.ip.as_deref(),
            ctx.user_agent.as_deref(),
        )
        .await?;

        let pair = TokenPair {
            access_token: access.token.clone(),
            token_type: "Bearer",
            expires_in: access.expires_in(),
            refresh_token: Some(refresh.plaintext),
            scope: scopes.join(" "),
        };
        Ok((pair, refresh_id))
    }
}

fn access_input(
    resolved: &ResolvedSubject,
    client_id: Option<String>,
    scopes: Vec<String>,
) -> AccessTokenInput {
    let subject = &resolved.subject;
    AccessTokenInput {
        subject_id: subject.id.clone(),
        name: Some(subject.name.clone()),
        email: subject.email.clone(),
        external_issuer: subject.external_issuer.clone(),
        external_subject_id: subject.external_subject_id.clone(),
        roles: resolved.roles.clone(),
        permissions: resolved.permissions.clone(),
        client_id,
        scopes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_map_to_rfc8628_codes() {
        assert_eq!(
            OAuthError::from(DeviceFlowError::AuthorizationPending).code,
            OAuthErrorCode::AuthorizationPending
        );
        assert_eq!(
            OAuthError::from(DeviceFlowError::SlowDown { interval: 10 }).code,
            OAuthErrorCode::SlowDown
        );
        assert_eq!(
            OAuthError::from(DeviceFlowError::AccessDenied).code,
            OAuthErrorCode::AccessDenied
        );
        assert_eq!(
            OAuthError::from(DeviceFlowError::ExpiredToken).code,
            OAuthErrorCode::ExpiredToken
        );
        assert_eq!(
            OAuthError::from(DeviceFlowError::InvalidGrant("client mismatch")).code,
            OAuthErrorCode::InvalidGrant
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err = OAuthError::from(GateError::Other("db path /var/secret".into()));
        assert_eq!(err.code, OAuthErrorCode::ServerError);
        assert!(!err.description.contains("secret"));
    }

    #[test]
    fn test_oauth_error_response_status_and_headers() {
        let resp = OAuthError::invalid_grant().into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-store");

        let resp = OAuthError::new(OAuthErrorCode::InvalidClient, "x").into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            OAuthError::server_error().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
