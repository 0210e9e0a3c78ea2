//! Subjects, roles and static access tokens.

mod helpers;

use helpers::{test_token_service, SubjectBuilder, TestDb};
use nightgate::roles::{self, DbRoleRepository, RoleRepository};
use nightgate::subjects;
use nightgate::token_exchange::{AuthenticationError, CredentialKind};

#[tokio::test]
async fn test_default_roles_seeded_once() {
    let db = TestDb::new().await;
    let repo = DbRoleRepository::new(db.connection().clone());
    let report = roles::seed_default_roles(&repo).await.unwrap();
    assert!(report.created.is_empty());
    assert_eq!(repo.list().await.unwrap().len(), roles::default_roles().len());
}

#[tokio::test]
async fn test_wildcard_permissions_resolved_from_roles() {
    let db = TestDb::new().await;
    let reader = SubjectBuilder::new("reader")
        .with_role(roles::READABLE_ROLE)
        .create(db.connection())
        .await;
    let uploader = SubjectBuilder::new("rig")
        .with_role(roles::DEVICESTATUS_UPLOAD_ROLE)
        .system()
        .create(db.connection())
        .await;

    let check = |id: String, perm: &'static str| {
        let db = db.connection().clone();
        async move { subjects::subject_has_permission(&db, &id, perm).await.unwrap() }
    };
    assert!(check(reader.id.clone(), "api:entries:read").await);
    assert!(check(reader.id.clone(), "api:treatments:read").await);
    assert!(!check(reader.id.clone(), "api:treatments:create").await);
    assert!(check(uploader.id.clone(), "api:devicestatus:create").await);
    assert!(!check(uploader.id.clone(), "api:entries:read").await);

    assert!(!subjects::assign_role(db.connection(), &reader.id, roles::READABLE_ROLE)
        .await
        .unwrap());
    assert!(subjects::remove_role(db.connection(), &reader.id, roles::READABLE_ROLE)
        .await
        .unwrap());
    assert!(!check(reader.id, "api:entries:read").await);
}

#[tokio::test]
async fn test_external_identity_reused_and_refreshed() {
    let db = TestDb::new().await;
    let issuer = "https://id.example";

    let first = subjects::find_or_create_external(db.connection(), issuer, "u-1", "Alice", None)
        .await
        .unwrap();
    let again = subjects::find_or_create_external(
        db.connection(),
        issuer,
        "u-1",
        "Alice Smith",
        Some("alice@example.com"),
    )
    .await
    .unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(again.name, "Alice Smith");
    assert_eq!(again.email.as_deref(), Some("alice@example.com"));

    let other_issuer =
        subjects::find_or_create_external(db.connection(), "https://other.example", "u-1", "Alice", None)
            .await
            .unwrap();
    assert_ne!(first.id, other_issuer.id);
}

#[tokio::test]
async fn test_static_access_token_authenticates() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let rig = SubjectBuilder::new("rig")
        .with_role(roles::DEVICESTATUS_UPLOAD_ROLE)
        .system()
        .create(db.connection())
        .await;

    let old = subjects::issue_access_token(db.connection(), &rig.id).await.unwrap();
    let token = subjects::issue_access_token(db.connection(), &rig.id).await.unwrap();

    let principal = service.authenticate(&token).await.unwrap();
    assert_eq!(principal.subject_id, rig.id);
    assert_eq!(principal.kind, CredentialKind::StaticToken);
    assert!(principal.has_permission("api:devicestatus:create"));

    // reissuing replaces the previous token
    assert!(matches!(
        service.authenticate(&old).await,
        Err(AuthenticationError::UnknownToken)
    ));
}

#[tokio::test]
async fn test_garbage_jwt_rejected() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    assert!(matches!(
        service.authenticate("a.b.c").await,
        Err(AuthenticationError::InvalidToken(_))
    ));
}
