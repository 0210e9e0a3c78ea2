//! Outbound mail is a collaborator: the core only needs to know whether mail works and hand
//! over the plaintext tokens to deliver.

use crate::errors::GateError;
use async_trait::async_trait;

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// When false, verification mail is not required of new accounts.
    fn is_enabled(&self) -> bool;

    async fn send_verification(&self, to: &str, token: &str) -> Result<(), GateError>;

    async fn send_password_reset(&self, to: &str, token: &str) -> Result<(), GateError>;

    /// Tell an administrator that `pending_email` registered and awaits approval.
    async fn send_admin_approval_request(
        &self,
        to: &str,
        pending_email: &str,
    ) -> Result<(), GateError>;
}

/// Default sender for deployments without mail. Every send is a logged no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledEmailSender;

#[async_trait]
impl EmailSender for DisabledEmailSender {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn send_verification(&self, to: &str, _token: &str) -> Result<(), GateError> {
        tracing::debug!(%to, "Email disabled, verification mail not sent");
        Ok(())
    }

    async fn send_password_reset(&self, to: &str, _token: &str) -> Result<(), GateError> {
        tracing::warn!(%to, "Email disabled, password reset mail not sent");
        Ok(())
    }

    async fn send_admin_approval_request(
        &self,
        to: &str,
        _pending_email: &str,
    ) -> Result<(), GateError> {
        tracing::debug!(%to, "Email disabled, approval request not sent");
        Ok(())
    }
}
