//! Security audit trail.
//!
//! Every state-changing authorization event is emitted as a structured `tracing` event on the
//! `nightgate::audit` target. The trail is log-only: route that target to durable storage in the
//! subscriber configuration if it must be retained.

use serde::Serialize;

pub const AUDIT_TARGET: &str = "nightgate::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TokensIssued,
    RefreshRotated,
    RefreshReuseDetected,
    RefreshRevoked,
    AccessTokenRevoked,
    GrantCreated,
    GrantUpdated,
    GrantRevoked,
    DeviceApproved,
    DeviceDenied,
    AuthCodeIssued,
    InviteCreated,
    InviteAccepted,
    InviteRevoked,
    AccountRegistered,
    AccountLocked,
    AccountApproved,
    AccountRejected,
    PasswordChanged,
    PasswordReset,
    RoleAssigned,
    RoleRemoved,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokensIssued => "tokens_issued",
            Self::RefreshRotated => "refresh_rotated",
            Self::RefreshReuseDetected => "refresh_reuse_detected",
            Self::RefreshRevoked => "refresh_revoked",
            Self::AccessTokenRevoked => "access_token_revoked",
            Self::GrantCreated => "grant_created",
            Self::GrantUpdated => "grant_updated",
            Self::GrantRevoked => "grant_revoked",
            Self::DeviceApproved => "device_approved",
            Self::DeviceDenied => "device_denied",
            Self::AuthCodeIssued => "auth_code_issued",
            Self::InviteCreated => "invite_created",
            Self::InviteAccepted => "invite_accepted",
            Self::InviteRevoked => "invite_revoked",
            Self::AccountRegistered => "account_registered",
            Self::AccountLocked => "account_locked",
            Self::AccountApproved => "account_approved",
            Self::AccountRejected => "account_rejected",
            Self::PasswordChanged => "password_changed",
            Self::PasswordReset => "password_reset",
            Self::RoleAssigned => "role_assigned",
            Self::RoleRemoved => "role_removed",
        }
    }

    /// Suspicious events and lockouts are logged at `warn`.
    fn is_security_alert(&self) -> bool {
        matches!(self, Self::RefreshReuseDetected | Self::AccountLocked)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub grant_id: Option<String>,
    pub subject_id: Option<String>,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    pub detail: Option<String>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            grant_id: None,
            subject_id: None,
            client_id: None,
            scopes: Vec::new(),
            detail: None,
        }
    }

    #[must_use]
    pub fn grant(mut self, grant_id: &str) -> Self {
        self.grant_id = Some(grant_id.to_string());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject_id: &str) -> Self {
        self.subject_id = Some(subject_id.to_string());
        self
    }

    #[must_use]
    pub fn client(mut self, client_id: Option<&str>) -> Self {
        self.client_id = client_id.map(str::to_string);
        self
    }

    #[must_use]
    pub fn scopes(mut self, scopes: &[String]) -> Self {
        self.scopes = scopes.to_vec();
        self
    }

    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn emit(&self) {
        let scopes = self.scopes.join(" ");
        if self.event_type.is_security_alert() {
            tracing::warn!(
                target: AUDIT_TARGET,
                event = self.event_type.as_str(),
                grant_id = ?self.grant_id,
                subject_id = ?self.subject_id,
                client_id = ?self.client_id,
                scopes = %scopes,
                detail = ?self.detail,
                "security alert"
            );
        } else {
            tracing::info!(
                target: AUDIT_TARGET,
                event = self.event_type.as_str(),
                grant_id = ?self.grant_id,
                subject_id = ?self.subject_id,
                client_id = ?self.client_id,
                scopes = %scopes,
                detail = ?self.detail,
                "audit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_fields() {
        let event = AuditEvent::new(AuditEventType::TokensIssued)
            .grant("g-1")
            .subject("s-1")
            .client(Some("xdrip"))
            .scopes(&["entries.read".to_string()]);

        assert_eq!(event.grant_id.as_deref(), Some("g-1"));
        assert_eq!(event.client_id.as_deref(), Some("xdrip"));
        assert_eq!(event.scopes, vec!["entries.read"]);
        event.emit();
    }

    #[test]
    fn test_alerts_are_flagged() {
        assert!(AuditEventType::RefreshReuseDetected.is_security_alert());
        assert!(!AuditEventType::RefreshRotated.is_security_alert());
        assert_eq!(
            serde_json::to_value(AuditEventType::InviteAccepted).unwrap(),
            serde_json::json!("invite_accepted")
        );
    }
}
