//! HTTP surface. Handlers only parse requests, authenticate the caller, and translate service
//! results into responses; all authorization logic lives in the service modules.

use crate::device_flow::{self, DeviceFlowError};
use crate::errors::GateError;
use crate::followers::{self, InviteError, NewInvite};
use crate::grants;
use crate::jobs;
use crate::jwks::JwksManager;
use crate::local_identity::{CredentialError, LocalIdentityProvider, LoginFailure, RegistrationError};
use crate::oidc_discovery::DiscoveryCache;
use crate::settings::Settings;
use crate::storage;
use crate::token_exchange::{OAuthError, OAuthErrorCode, Principal, RequestContext, TokenService};
use axum::body::Body;
use axum::extract::{Form, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const MANAGE_USERS_PERMISSION: &str = "admin:users:manage";
const RUN_JOBS_PERMISSION: &str = "admin:jobs:run";

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub jwks: JwksManager,
    pub tokens: TokenService,
    pub local: LocalIdentityProvider,
    pub discovery: DiscoveryCache,
}

async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route("/oauth/authorize", post(authorize))
        .route("/oauth/token", post(token))
        .route("/oauth/revoke", post(token_revoke))
        .route("/oauth/device_authorization", post(device_authorization))
        .route("/oauth/device", get(device_lookup))
        .route("/oauth/device/approve", post(device_approve))
        .route("/oauth/device/deny", post(device_deny))
        .route("/auth/providers", get(list_providers))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/verify-email", post(verify_email))
        .route("/auth/resend-verification", post(resend_verification))
        .route("/auth/password-reset", post(request_password_reset))
        .route("/auth/password-reset/confirm", post(reset_password))
        .route("/auth/password", post(change_password))
        .route("/grants", get(list_grants))
        .route(
            "/grants/{grant_id}",
            delete(revoke_grant).patch(update_grant_label),
        )
        .route("/invites", get(list_invites).post(create_invite))
        .route("/invites/id/{invite_id}", delete(revoke_invite))
        .route("/invites/{token}", get(inspect_invite))
        .route("/invites/{token}/accept", post(accept_invite))
        .route("/admin/local-users/pending", get(list_pending))
        .route("/admin/local-users/{subject_id}/approve", post(approve_user))
        .route("/admin/local-users/{subject_id}/reject", post(reject_user))
        .route("/admin/jobs/{job_name}/run", post(run_job))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    tracing::info!(%addr, issuer = %state.settings.issuer(), "Authorization server listening");
    tracing::warn!("Rate limiting should be configured at the reverse proxy level for production");
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(listener, router(state)).await.into_diagnostic()?;
    Ok(())
}

fn json_with_headers(status: StatusCode, value: Value, headers: &[(&str, String)]) -> Response {
    let mut resp = (status, Json(value)).into_response();
    let h = resp.headers_mut();
    for (name, val) in headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(val),
        ) {
            h.insert(n, v);
        }
    }
    resp
}

/// Policy failures carry a machine-readable reason so clients can render a useful message.
fn policy_error(status: StatusCode, reason: &str, message: impl ToString) -> Response {
    (
        status,
        Json(json!({"error": reason, "error_description": message.to_string()})),
    )
        .into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "Request failed");
    policy_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "server_error",
        "Internal server error",
    )
}

fn unauthorized(reason: &str) -> Response {
    json_with_headers(
        StatusCode::UNAUTHORIZED,
        json!({"error": "invalid_token", "error_description": reason}),
        &[(
            "www-authenticate",
            format!("Bearer error=\"invalid_token\", error_description=\"{reason}\""),
        )],
    )
}

fn gate_error(e: GateError) -> Response {
    match e {
        GateError::NotFound(what) => policy_error(StatusCode::NOT_FOUND, "not_found", what),
        GateError::Validation(msg) => policy_error(StatusCode::BAD_REQUEST, "invalid_request", msg),
        GateError::Conflict(msg) => policy_error(StatusCode::CONFLICT, "conflict", msg),
        other => internal_error(other),
    }
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    RequestContext {
        ip: headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, Response> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| unauthorized("missing bearer token"))?;

    state.tokens.authenticate(bearer).await.map_err(|e| {
        tracing::debug!(reason = e.reason_code(), "Bearer authentication failed");
        match e {
            crate::token_exchange::AuthenticationError::Internal(inner) => internal_error(inner),
            other => unauthorized(other.reason_code()),
        }
    })
}

async fn require_permission(
    state: &AppState,
    headers: &HeaderMap,
    permission: &str,
) -> Result<Principal, Response> {
    let principal = authenticate(state, headers).await?;
    if !principal.has_permission(permission) {
        return Err(policy_error(
            StatusCode::FORBIDDEN,
            "insufficient_permission",
            format!("{permission} is required"),
        ));
    }
    Ok(principal)
}

fn split_scopes(scope: Option<&str>) -> Vec<String> {
    scope
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

async fn discovery(State(state): State<AppState>) -> impl IntoResponse {
    let issuer = state.settings.issuer();
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/oauth/authorize"),
        "token_endpoint": format!("{issuer}/oauth/token"),
        "revocation_endpoint": format!("{issuer}/oauth/revoke"),
        "device_authorization_endpoint": format!("{issuer}/oauth/device_authorization"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "grant_types_supported": ["authorization_code", "refresh_token", DEVICE_CODE_GRANT],
        "response_types_supported": ["code"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none"],
        "id_token_signing_alg_values_supported": [state.settings.keys.alg.clone()],
    }))
}

async fn jwks_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.jwks.jwks_json())
}

#[derive(Debug, Deserialize)]
struct AuthorizeRequest {
    client_id: String,
    redirect_uri: String,
    scope: Option<String>,
    code_challenge: String,
    code_challenge_method: Option<String>,
    state: Option<String>,
}

/// The signed-in subject consents; the response tells the front end where to redirect.
async fn authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AuthorizeRequest>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let scopes = split_scopes(req.scope.as_deref());
    let method = req.code_challenge_method.as_deref().unwrap_or("plain");

    let code = match state
        .tokens
        .authorize(
            &principal.subject_id,
            &req.client_id,
            &req.redirect_uri,
            &scopes,
            &req.code_challenge,
            method,
        )
        .await
    {
        Ok(code) => code,
        Err(e) => return e.into_response(),
    };

    let mut redirect = match url::Url::parse(&req.redirect_uri) {
        Ok(u) => u,
        Err(e) => return internal_error(e),
    };
    {
        let mut query = redirect.query_pairs_mut();
        query.append_pair("code", &code);
        if let Some(s) = &req.state {
            query.append_pair("state", s);
        }
    }
    Json(json!({ "redirect_to": redirect.to_string() })).into_response()
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    code: Option<String>,
    redirect_uri: Option<String>,
    client_id: Option<String>,
    code_verifier: Option<String>,
    refresh_token: Option<String>,
    device_code: Option<String>,
}

fn missing(param: &str) -> OAuthError {
    OAuthError::invalid_request(format!("{param} is required"))
}

async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(req): Form<TokenRequest>,
) -> Response {
    let ctx = request_context(&headers);
    let result = match req.grant_type.as_str() {
        "authorization_code" => {
            let (Some(code), Some(client_id), Some(redirect_uri), Some(verifier)) = (
                req.code.as_deref(),
                req.client_id.as_deref(),
                req.redirect_uri.as_deref(),
                req.code_verifier.as_deref(),
            ) else {
                return missing("code, client_id, redirect_uri and code_verifier").into_response();
            };
            state
                .tokens
                .exchange_code(code, client_id, redirect_uri, verifier, &ctx)
                .await
        }
        "refresh_token" => {
            let Some(refresh) = req.refresh_token.as_deref() else {
                return missing("refresh_token").into_response();
            };
            state
                .tokens
                .refresh(refresh, req.client_id.as_deref(), &ctx)
                .await
        }
        DEVICE_CODE_GRANT => {
            let (Some(device_code), Some(client_id)) =
                (req.device_code.as_deref(), req.client_id.as_deref())
            else {
                return missing("device_code and client_id").into_response();
            };
            state
                .tokens
                .exchange_device_code(device_code, client_id, &ctx)
                .await
        }
        other => Err(OAuthError::new(
            OAuthErrorCode::UnsupportedGrantType,
            format!("grant_type {other} is not supported"),
        )),
    };

    match result {
        Ok(pair) => json_with_headers(
            StatusCode::OK,
            json!(pair),
            &[
                ("cache-control", "no-store".to_string()),
                ("pragma", "no-cache".to_string()),
            ],
        ),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TokenRevokeRequest {
    token: String,
    token_type_hint: Option<String>,
}

/// RFC 7009: 200 whether or not the token was known.
async fn token_revoke(
    State(state): State<AppState>,
    Form(req): Form<TokenRevokeRequest>,
) -> Response {
    state
        .tokens
        .revoke(&req.token, req.token_type_hint.as_deref())
        .await;
    StatusCode::OK.into_response()
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorizationRequest {
    client_id: String,
    scope: Option<String>,
}

#[derive(Serialize)]
struct DeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    verification_uri_complete: String,
    expires_in: i64,
    interval: i64,
}

async fn device_authorization(
    State(state): State<AppState>,
    Form(req): Form<DeviceAuthorizationRequest>,
) -> Response {
    let scopes = split_scopes(req.scope.as_deref());
    let created = device_flow::create_device_code(
        &state.db,
        &state.settings.device,
        &req.client_id,
        &scopes,
        storage::now(),
    )
    .await;

    match created {
        Ok(auth) => {
            let verification_uri = format!("{}/device", state.settings.issuer());
            let verification_uri_complete =
                format!("{verification_uri}?user_code={}", auth.user_code);
            Json(DeviceAuthorizationResponse {
                device_code: auth.device_code,
                user_code: auth.user_code,
                verification_uri,
                verification_uri_complete,
                expires_in: auth.expires_in,
                interval: auth.interval,
            })
            .into_response()
        }
        Err(GateError::Validation(msg)) => OAuthError::invalid_request(msg).into_response(),
        Err(e) => OAuthError::from(e).into_response(),
    }
}

fn device_error(e: DeviceFlowError) -> Response {
    match e {
        DeviceFlowError::Internal(inner) => internal_error(inner),
        DeviceFlowError::UnknownUserCode => {
            policy_error(StatusCode::NOT_FOUND, e.reason_code(), e.to_string())
        }
        other => policy_error(StatusCode::CONFLICT, other.reason_code(), other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct UserCodeQuery {
    user_code: String,
}

/// What the approving user is shown before deciding.
async fn device_lookup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<UserCodeQuery>,
) -> Response {
    if let Err(resp) = authenticate(&state, &headers).await {
        return resp;
    }
    match device_flow::find_by_user_code(&state.db, &q.user_code).await {
        Ok(Some(model)) => {
            let scopes = storage::decode_list(&model.scopes).unwrap_or_default();
            Json(json!({
                "client_id": model.client_id,
                "scopes": scopes,
                "status": device_flow::status(&model, storage::now()),
                "expires_at": model.expires_at,
            }))
            .into_response()
        }
        Ok(None) => device_error(DeviceFlowError::UnknownUserCode),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UserCodeBody {
    user_code: String,
}

async fn device_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UserCodeBody>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match device_flow::approve(&state.db, &body.user_code, &principal.subject_id, storage::now())
        .await
    {
        Ok(model) => Json(json!({"status": "approved", "client_id": model.client_id}))
            .into_response(),
        Err(e) => device_error(e),
    }
}

async fn device_deny(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UserCodeBody>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match device_flow::deny(&state.db, &body.user_code, &principal.subject_id, storage::now()).await
    {
        Ok(()) => Json(json!({"status": "denied"})).into_response(),
        Err(e) => device_error(e),
    }
}

/// Upstream identity providers with their current endpoints. Providers whose discovery
/// document cannot be loaded are listed as unavailable.
async fn list_providers(State(state): State<AppState>) -> Response {
    let mut providers = Vec::new();
    for provider in &state.settings.oidc.providers {
        let entry = match state.discovery.get(&provider.issuer).await {
            Ok(meta) => json!({
                "name": provider.name,
                "issuer": meta.issuer,
                "authorization_endpoint": meta.authorization_endpoint,
                "available": true,
            }),
            Err(e) => {
                tracing::warn!(provider = %provider.name, error = %e, "Discovery document unavailable");
                json!({"name": provider.name, "issuer": provider.issuer, "available": false})
            }
        };
        providers.push(entry);
    }
    Json(json!({ "local": state.settings.local_identity.enabled, "providers": providers }))
        .into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    display_name: Option<String>,
}

async fn register(State(state): State<AppState>, Json(req): Json<RegisterRequest>) -> Response {
    match state
        .local
        .register(&req.email, &req.password, req.display_name.as_deref())
        .await
    {
        Ok(registered) => (StatusCode::CREATED, Json(registered)).into_response(),
        Err(RegistrationError::Internal(e)) => internal_error(e),
        Err(e) => {
            let status = match e {
                RegistrationError::EmailTaken => StatusCode::CONFLICT,
                RegistrationError::Disabled
                | RegistrationError::RegistrationClosed
                | RegistrationError::NotAllowed => StatusCode::FORBIDDEN,
                _ => StatusCode::BAD_REQUEST,
            };
            policy_error(status, e.reason_code(), &e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    let success = match state.local.login(&req.email, &req.password).await {
        Ok(s) => s,
        Err(LoginFailure::Internal(e)) => return internal_error(e),
        Err(e) => return policy_error(StatusCode::UNAUTHORIZED, e.reason_code(), &e),
    };
    match state.tokens.issue_session_token(&success.subject_id).await {
        Ok(pair) => Json(json!({
            "subject_id": success.subject_id,
            "must_change_password": success.must_change_password,
            "access_token": pair.access_token,
            "token_type": pair.token_type,
            "expires_in": pair.expires_in,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

fn credential_error(e: CredentialError) -> Response {
    match e {
        CredentialError::Internal(inner) => internal_error(inner),
        CredentialError::UnknownAccount => {
            policy_error(StatusCode::NOT_FOUND, e.reason_code(), &e)
        }
        other => policy_error(StatusCode::BAD_REQUEST, other.reason_code(), &other),
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: String,
}

async fn verify_email(State(state): State<AppState>, Json(body): Json<TokenBody>) -> Response {
    match state.local.verify_email(&body.token).await {
        Ok(subject_id) => Json(json!({"verified": true, "subject_id": subject_id})).into_response(),
        Err(e) => credential_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct EmailBody {
    email: String,
}

async fn resend_verification(
    State(state): State<AppState>,
    Json(body): Json<EmailBody>,
) -> Response {
    if let Err(e) = state.local.resend_verification(&body.email).await {
        tracing::error!(error = %e, "Failed to resend verification");
    }
    StatusCode::ACCEPTED.into_response()
}

async fn request_password_reset(
    State(state): State<AppState>,
    Json(body): Json<EmailBody>,
) -> Response {
    match state.local.request_password_reset(&body.email).await {
        Ok(message) => (StatusCode::ACCEPTED, Json(json!({"message": message}))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Password reset request failed");
            (
                StatusCode::ACCEPTED,
                Json(json!({"message": crate::local_identity::RESET_REQUESTED_MESSAGE})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResetPasswordRequest {
    token: String,
    new_password: String,
}

async fn reset_password(
    State(state): State<AppState>,
    Json(req): Json<ResetPasswordRequest>,
) -> Response {
    match state.local.reset_password(&req.token, &req.new_password).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => credential_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state
        .local
        .change_password(&principal.subject_id, &req.current_password, &req.new_password)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => credential_error(e),
    }
}

async fn list_grants(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let given = grants::list_for_subject(&state.db, &principal.subject_id).await;
    let following = grants::list_following(&state.db, &principal.subject_id).await;
    match (given, following) {
        (Ok(given), Ok(following)) => {
            Json(json!({"grants": given, "following": following})).into_response()
        }
        (Err(e), _) | (_, Err(e)) => gate_error(e),
    }
}

async fn revoke_grant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(grant_id): Path<String>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match grants::revoke_as(&state.db, &grant_id, &principal.subject_id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => gate_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct GrantLabelRequest {
    label: Option<String>,
}

async fn update_grant_label(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(grant_id): Path<String>,
    Json(req): Json<GrantLabelRequest>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let label = req
        .label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());
    match grants::update_label(&state.db, &grant_id, &principal.subject_id, label).await {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => gate_error(e),
    }
}

fn invite_error(e: InviteError) -> Response {
    let status = match e {
        InviteError::Internal(inner) => return gate_error(inner),
        InviteError::NotFound => StatusCode::NOT_FOUND,
        InviteError::AlreadyFollowing => StatusCode::CONFLICT,
        InviteError::Expired | InviteError::Revoked | InviteError::Exhausted => StatusCode::GONE,
        _ => StatusCode::BAD_REQUEST,
    };
    policy_error(status, e.reason_code(), &e)
}

#[derive(Debug, Deserialize)]
struct CreateInviteRequest {
    scopes: Vec<String>,
    label: Option<String>,
    expires_in_secs: Option<i64>,
    max_uses: Option<i64>,
    #[serde(default)]
    limit_to_24_hours: bool,
}

async fn create_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateInviteRequest>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let input = NewInvite {
        scopes: req.scopes,
        label: req.label,
        expires_in_secs: req.expires_in_secs,
        max_uses: req.max_uses,
        limit_to_24_hours: req.limit_to_24_hours,
    };
    match followers::create_invite(&state.db, &principal.subject_id, input).await {
        Ok(created) => (
            StatusCode::CREATED,
            Json(json!({"invite": created.invite, "token": created.token})),
        )
            .into_response(),
        Err(e) => invite_error(e),
    }
}

async fn list_invites(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match followers::list_invites(&state.db, &principal.subject_id).await {
        Ok(invites) => Json(invites).into_response(),
        Err(e) => gate_error(e),
    }
}

async fn revoke_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invite_id): Path<String>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match followers::revoke_invite(&state.db, &invite_id, &principal.subject_id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => invite_error(e),
    }
}

async fn inspect_invite(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match followers::inspect_invite(&state.db, &token).await {
        Ok(Some(info)) => Json(info).into_response(),
        Ok(None) => invite_error(InviteError::NotFound),
        Err(e) => gate_error(e),
    }
}

async fn accept_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match followers::accept_invite(&state.db, &token, &principal.subject_id).await {
        Ok(grant) => (StatusCode::CREATED, Json(grant)).into_response(),
        Err(e) => invite_error(e),
    }
}

async fn list_pending(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_permission(&state, &headers, MANAGE_USERS_PERMISSION).await {
        return resp;
    }
    match state.local.list_pending_approval().await {
        Ok(users) => Json(users).into_response(),
        Err(e) => gate_error(e),
    }
}

async fn approve_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subject_id): Path<String>,
) -> Response {
    let admin = match require_permission(&state, &headers, MANAGE_USERS_PERMISSION).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.local.approve(&subject_id, &admin.subject_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => policy_error(
            StatusCode::NOT_FOUND,
            "not_pending",
            "no pending account for this subject",
        ),
        Err(e) => gate_error(e),
    }
}

async fn reject_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subject_id): Path<String>,
) -> Response {
    let admin = match require_permission(&state, &headers, MANAGE_USERS_PERMISSION).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.local.reject(&subject_id, &admin.subject_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => policy_error(
            StatusCode::NOT_FOUND,
            "not_pending",
            "no pending account for this subject",
        ),
        Err(e) => gate_error(e),
    }
}

async fn run_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_name): Path<String>,
) -> Response {
    if let Err(resp) = require_permission(&state, &headers, RUN_JOBS_PERMISSION).await {
        return resp;
    }
    match jobs::trigger_job_manually(&state.db, &job_name, &state.settings.cleanup).await {
        Ok(records) => Json(json!({"job": job_name, "records_processed": records})).into_response(),
        Err(GateError::Other(msg)) if msg.starts_with("Unknown job name") => {
            policy_error(StatusCode::NOT_FOUND, "unknown_job", msg)
        }
        Err(e) => internal_error(e),
    }
}
