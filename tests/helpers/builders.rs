use async_trait::async_trait;
use nightgate::email::EmailSender;
use nightgate::entities::subject;
use nightgate::errors::GateError;
use nightgate::jwks::JwksManager;
use nightgate::revocation::RevocationCache;
use nightgate::settings::{Device, Keys, Tokens};
use nightgate::subjects::{self, NewSubject};
use nightgate::token_codec::TokenCodec;
use nightgate::token_exchange::TokenService;
use sea_orm::DatabaseConnection;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const TEST_ISSUER: &str = "https://gate.test";

/// Builder for creating test subjects
pub struct SubjectBuilder {
    name: String,
    email: Option<String>,
    roles: Vec<String>,
    is_system: bool,
}

impl SubjectBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            email: None,
            roles: Vec::new(),
            is_system: false,
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> subject::Model {
        let created = subjects::create_subject(
            db,
            NewSubject {
                name: self.name,
                email: self.email,
                is_system: self.is_system,
            },
        )
        .await
        .expect("Failed to create test subject");
        for role in &self.roles {
            subjects::assign_role(db, &created.id, role)
                .await
                .expect("Failed to assign role");
        }
        created
    }
}

/// Signing keys in a temporary directory
pub struct TestKeys {
    pub jwks: JwksManager,
    _dir: TempDir,
}

impl TestKeys {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create key dir");
        let jwks = JwksManager::new(Keys {
            jwks_path: dir.path().join("jwks.json"),
            key_id: Some("test-key".to_string()),
            alg: "RS256".to_string(),
            private_key_path: dir.path().join("private_key.json"),
        })
        .await
        .expect("Failed to create signing keys");
        Self { jwks, _dir: dir }
    }
}

/// A token service over `db` with default lifetimes. Keep the returned keys alive.
pub async fn test_token_service(db: &DatabaseConnection) -> (TokenService, TestKeys) {
    test_token_service_with(db, Tokens::default()).await
}

pub async fn test_token_service_with(
    db: &DatabaseConnection,
    tokens: Tokens,
) -> (TokenService, TestKeys) {
    let keys = TestKeys::new().await;
    let codec = TokenCodec::new(keys.jwks.clone(), TEST_ISSUER, &tokens);
    let service = TokenService::new(
        db.clone(),
        codec,
        RevocationCache::new(),
        tokens,
        Device::default(),
    );
    (service, keys)
}

/// RFC 7636 appendix B verifier and its S256 challenge
pub fn pkce_pair() -> (&'static str, &'static str) {
    (
        "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk",
        "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM",
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMail {
    Verification { to: String, token: String },
    PasswordReset { to: String, token: String },
    ApprovalRequest { to: String, pending: String },
}

/// Enabled email sender that keeps every message for inspection
#[derive(Clone, Default)]
pub struct RecordingEmailSender {
    sent: Arc<Mutex<Vec<SentMail>>>,
}

impl RecordingEmailSender {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_verification_token(&self) -> Option<String> {
        self.sent().into_iter().rev().find_map(|m| match m {
            SentMail::Verification { token, .. } => Some(token),
            _ => None,
        })
    }

    pub fn last_reset_token(&self) -> Option<String> {
        self.sent().into_iter().rev().find_map(|m| match m {
            SentMail::PasswordReset { token, .. } => Some(token),
            _ => None,
        })
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn send_verification(&self, to: &str, token: &str) -> Result<(), GateError> {
        self.sent.lock().unwrap().push(SentMail::Verification {
            to: to.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }

    async fn send_password_reset(&self, to: &str, token: &str) -> Result<(), GateError> {
        self.sent.lock().unwrap().push(SentMail::PasswordReset {
            to: to.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }

    async fn send_admin_approval_request(
        &self,
        to: &str,
        pending_email: &str,
    ) -> Result<(), GateError> {
        self.sent.lock().unwrap().push(SentMail::ApprovalRequest {
            to: to.to_string(),
            pending: pending_email.to_string(),
        });
        Ok(())
    }
}
