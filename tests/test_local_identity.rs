//! Local email and password accounts: bootstrap admin, verification, lockout, reset, approval.

mod helpers;

use helpers::{RecordingEmailSender, SentMail, TestDb};
use nightgate::email::DisabledEmailSender;
use nightgate::local_identity::{
    AccountStatus, CredentialError, LocalIdentityProvider, LoginFailure, RegistrationError,
    RESET_REQUESTED_MESSAGE,
};
use nightgate::notifications::{AdminNotification, AdminNotifier};
use nightgate::settings::LocalIdentity;
use nightgate::subjects;
use std::sync::Arc;

const PASSWORD: &str = "correct horse battery";

fn provider(
    db: &TestDb,
    cfg: LocalIdentity,
) -> (LocalIdentityProvider, RecordingEmailSender, AdminNotifier) {
    let mail = RecordingEmailSender::default();
    let notifier = AdminNotifier::new();
    let provider = LocalIdentityProvider::new(
        db.connection().clone(),
        cfg,
        Arc::new(mail.clone()),
        notifier.clone(),
    );
    (provider, mail, notifier)
}

#[tokio::test]
async fn test_first_account_becomes_admin() {
    let db = TestDb::new().await;
    let (local, mail, _) = provider(&db, LocalIdentity::default());

    let first = local.register("Owner@Example.com", PASSWORD, None).await.unwrap();
    assert!(first.is_bootstrap_admin);
    assert_eq!(first.status, AccountStatus::Active);
    assert!(subjects::subject_has_permission(db.connection(), &first.subject_id, "admin:users:manage")
        .await
        .unwrap());
    // the bootstrap admin skips verification
    assert!(mail.last_verification_token().is_none());
    local.login("owner@example.com", PASSWORD).await.unwrap();

    let second = local.register("friend@example.com", PASSWORD, Some("Friend")).await.unwrap();
    assert!(!second.is_bootstrap_admin);
    assert_eq!(second.status, AccountStatus::PendingEmailVerification);
    let roles = subjects::role_names(db.connection(), &second.subject_id).await.unwrap();
    assert!(roles.is_empty());
}

#[tokio::test]
async fn test_duplicate_email_rejected() {
    let db = TestDb::new().await;
    let (local, _, _) = provider(&db, LocalIdentity::default());
    local.register("owner@example.com", PASSWORD, None).await.unwrap();
    assert!(matches!(
        local.register(" OWNER@example.com ", PASSWORD, None).await,
        Err(RegistrationError::EmailTaken)
    ));
}

#[tokio::test]
async fn test_registration_input_checks() {
    let db = TestDb::new().await;
    let (local, _, _) = provider(&db, LocalIdentity::default());
    assert!(matches!(
        local.register("not-an-email", PASSWORD, None).await,
        Err(RegistrationError::InvalidEmail)
    ));
    assert!(matches!(
        local.register("owner@example.com", "short", None).await,
        Err(RegistrationError::WeakPassword(ref v)) if v.contains(&"too_short")
    ));

    let closed = LocalIdentity {
        allow_registration: false,
        ..LocalIdentity::default()
    };
    let (local, _, _) = provider(&db, closed);
    assert!(matches!(
        local.register("owner@example.com", PASSWORD, None).await,
        Err(RegistrationError::RegistrationClosed)
    ));
}

#[tokio::test]
async fn test_email_verification_gates_login() {
    let db = TestDb::new().await;
    let (local, mail, _) = provider(&db, LocalIdentity::default());
    local.register("owner@example.com", PASSWORD, None).await.unwrap();
    local.register("friend@example.com", PASSWORD, None).await.unwrap();

    assert!(matches!(
        local.login("friend@example.com", PASSWORD).await,
        Err(LoginFailure::EmailNotVerified)
    ));
    // a wrong password never reveals the account state
    assert!(matches!(
        local.login("friend@example.com", "wrong password").await,
        Err(LoginFailure::InvalidCredentials)
    ));

    let token = mail.last_verification_token().unwrap();
    local.verify_email(&token).await.unwrap();
    local.login("friend@example.com", PASSWORD).await.unwrap();
    assert!(matches!(
        local.verify_email(&token).await,
        Err(CredentialError::InvalidToken)
    ));
}

#[tokio::test]
async fn test_no_verification_without_email_delivery() {
    let db = TestDb::new().await;
    let local = LocalIdentityProvider::new(
        db.connection().clone(),
        LocalIdentity::default(),
        Arc::new(DisabledEmailSender),
        AdminNotifier::new(),
    );
    local.register("owner@example.com", PASSWORD, None).await.unwrap();
    let second = local.register("friend@example.com", PASSWORD, None).await.unwrap();
    assert_eq!(second.status, AccountStatus::Active);
    local.login("friend@example.com", PASSWORD).await.unwrap();
}

#[tokio::test]
async fn test_lockout_rejects_correct_password() {
    let db = TestDb::new().await;
    let mut cfg = LocalIdentity::default();
    cfg.lockout.max_failed_attempts = 3;
    let (local, _, notifier) = provider(&db, cfg);
    let mut events = notifier.subscribe();
    let owner = local.register("owner@example.com", PASSWORD, None).await.unwrap();

    for _ in 0..3 {
        assert!(matches!(
            local.login("owner@example.com", "wrong password").await,
            Err(LoginFailure::InvalidCredentials)
        ));
    }

    assert!(matches!(
        local.login("owner@example.com", PASSWORD).await,
        Err(LoginFailure::Locked { .. })
    ));
    assert!(matches!(
        events.try_recv(),
        Ok(AdminNotification::AccountLocked { ref subject_id, .. }) if *subject_id == owner.subject_id
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_wrong_passwords_still_lock() {
    let db = TestDb::new().await;
    let mut cfg = LocalIdentity::default();
    cfg.lockout.max_failed_attempts = 3;
    let (local, _, notifier) = provider(&db, cfg);
    let mut events = notifier.subscribe();
    local.register("owner@example.com", PASSWORD, None).await.unwrap();

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let local = local.clone();
            tokio::spawn(async move { local.login("owner@example.com", "wrong password").await })
        })
        .collect();
    for attempt in attempts {
        assert!(matches!(
            attempt.await.unwrap(),
            Err(LoginFailure::InvalidCredentials | LoginFailure::Locked { .. })
        ));
    }

    assert!(matches!(
        local.login("owner@example.com", PASSWORD).await,
        Err(LoginFailure::Locked { .. })
    ));
    assert!(matches!(events.try_recv(), Ok(AdminNotification::AccountLocked { .. })));
}

#[tokio::test]
async fn test_unknown_email_is_invalid_credentials() {
    let db = TestDb::new().await;
    let (local, _, _) = provider(&db, LocalIdentity::default());
    assert!(matches!(
        local.login("nobody@example.com", PASSWORD).await,
        Err(LoginFailure::InvalidCredentials)
    ));
}

#[tokio::test]
async fn test_password_reset_flow() {
    let db = TestDb::new().await;
    let mut cfg = LocalIdentity::default();
    cfg.lockout.max_failed_attempts = 1;
    let (local, mail, _) = provider(&db, cfg);
    local.register("owner@example.com", PASSWORD, None).await.unwrap();

    // same answer whether or not the account exists
    assert_eq!(
        local.request_password_reset("nobody@example.com").await.unwrap(),
        RESET_REQUESTED_MESSAGE
    );
    assert!(mail.sent().is_empty());
    assert_eq!(
        local.request_password_reset("owner@example.com").await.unwrap(),
        RESET_REQUESTED_MESSAGE
    );
    let token = mail.last_reset_token().unwrap();
    assert!(matches!(
        mail.sent().last(),
        Some(SentMail::PasswordReset { to, .. }) if to == "owner@example.com"
    ));

    // locked out, then recovered by the reset
    local.login("owner@example.com", "wrong password").await.unwrap_err();
    assert!(matches!(
        local.login("owner@example.com", PASSWORD).await,
        Err(LoginFailure::Locked { .. })
    ));

    local.reset_password(&token, "a brand new secret").await.unwrap();
    local.login("owner@example.com", "a brand new secret").await.unwrap();
    assert!(matches!(
        local.reset_password(&token, "yet another secret").await,
        Err(CredentialError::InvalidToken)
    ));
}

#[tokio::test]
async fn test_change_password() {
    let db = TestDb::new().await;
    let (local, _, _) = provider(&db, LocalIdentity::default());
    let owner = local.register("owner@example.com", PASSWORD, None).await.unwrap();

    assert!(matches!(
        local.change_password(&owner.subject_id, "wrong password", "another secret").await,
        Err(CredentialError::WrongPassword)
    ));
    local.set_must_change_password(&owner.subject_id, true).await.unwrap();
    assert!(local.login("owner@example.com", PASSWORD).await.unwrap().must_change_password);

    local
        .change_password(&owner.subject_id, PASSWORD, "another secret")
        .await
        .unwrap();
    let success = local.login("owner@example.com", "another secret").await.unwrap();
    assert!(!success.must_change_password);
}

#[tokio::test]
async fn test_allowlist_blocks_without_approval_mode() {
    let db = TestDb::new().await;
    let cfg = LocalIdentity {
        allowlist: vec!["example.com".to_string()],
        ..LocalIdentity::default()
    };
    let (local, _, _) = provider(&db, cfg);
    local.register("owner@example.com", PASSWORD, None).await.unwrap();
    assert!(matches!(
        local.register("stranger@elsewhere.org", PASSWORD, None).await,
        Err(RegistrationError::NotAllowed)
    ));
}

#[tokio::test]
async fn test_approval_flow() {
    let db = TestDb::new().await;
    let cfg = LocalIdentity {
        allowlist: vec!["example.com".to_string()],
        open_registration_with_approval: true,
        require_email_verification: false,
        ..LocalIdentity::default()
    };
    let (local, mail, notifier) = provider(&db, cfg);
    let owner = local.register("owner@example.com", PASSWORD, None).await.unwrap();
    let mut events = notifier.subscribe();

    let allowed = local.register("friend@example.com", PASSWORD, None).await.unwrap();
    assert_eq!(allowed.status, AccountStatus::Active);

    let stranger = local.register("stranger@elsewhere.org", PASSWORD, None).await.unwrap();
    assert_eq!(stranger.status, AccountStatus::PendingApproval);
    assert!(matches!(
        events.try_recv(),
        Ok(AdminNotification::RegistrationPendingApproval { ref email, .. }) if email == "stranger@elsewhere.org"
    ));
    assert!(mail.sent().contains(&SentMail::ApprovalRequest {
        to: "owner@example.com".to_string(),
        pending: "stranger@elsewhere.org".to_string(),
    }));

    assert!(matches!(
        local.login("stranger@elsewhere.org", PASSWORD).await,
        Err(LoginFailure::PendingApproval)
    ));
    let pending = local.list_pending_approval().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].subject_id, stranger.subject_id);

    assert!(local.approve(&stranger.subject_id, &owner.subject_id).await.unwrap());
    assert!(!local.approve(&stranger.subject_id, &owner.subject_id).await.unwrap());
    local.login("stranger@elsewhere.org", PASSWORD).await.unwrap();
}

#[tokio::test]
async fn test_rejection_deactivates_account() {
    let db = TestDb::new().await;
    let cfg = LocalIdentity {
        require_admin_approval: true,
        require_email_verification: false,
        ..LocalIdentity::default()
    };
    let (local, _, _) = provider(&db, cfg);
    let owner = local.register("owner@example.com", PASSWORD, None).await.unwrap();
    let pending = local.register("friend@example.com", PASSWORD, None).await.unwrap();
    assert_eq!(pending.status, AccountStatus::PendingApproval);

    assert!(local.reject(&pending.subject_id, &owner.subject_id).await.unwrap());
    assert!(matches!(
        local.login("friend@example.com", PASSWORD).await,
        Err(LoginFailure::Inactive)
    ));
    let subject = subjects::get_subject(db.connection(), &pending.subject_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!subject.is_active);
}
