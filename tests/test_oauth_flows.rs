//! Authorization code, refresh rotation and revocation, end to end through the token service.

mod helpers;

use helpers::{pkce_pair, test_token_service, test_token_service_with, SubjectBuilder, TestDb};
use nightgate::entities::{grant, refresh_token};
use nightgate::grants;
use nightgate::settings::Tokens;
use nightgate::storage;
use nightgate::token_exchange::{AuthenticationError, OAuthErrorCode, RequestContext};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};

const CLIENT: &str = "xdrip";
const REDIRECT: &str = "https://app.example/cb";

fn scopes(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_code_exchange_issues_tokens_once() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").with_role("readable").create(db.connection()).await;
    let (verifier, challenge) = pkce_pair();
    let ctx = RequestContext {
        ip: Some("10.0.0.1".into()),
        user_agent: Some("xDrip+".into()),
    };

    let code = service
        .authorize(&subject.id, CLIENT, REDIRECT, &scopes(&["entries.read"]), challenge, "S256")
        .await
        .unwrap();

    let pair = service
        .exchange_code(&code, CLIENT, REDIRECT, verifier, &ctx)
        .await
        .unwrap();
    assert_eq!(pair.token_type, "Bearer");
    assert_eq!(pair.scope, "entries.read");
    assert!(pair.refresh_token.is_some());

    let principal = service.authenticate(&pair.access_token).await.unwrap();
    assert_eq!(principal.subject_id, subject.id);
    assert_eq!(principal.client_id.as_deref(), Some(CLIENT));
    assert!(principal.has_permission("api:entries:read"));

    let stored = grant::Entity::find().one(db.connection()).await.unwrap().unwrap();
    assert_eq!(stored.last_used_ip.as_deref(), Some("10.0.0.1"));

    let second = service
        .exchange_code(&code, CLIENT, REDIRECT, verifier, &ctx)
        .await
        .unwrap_err();
    assert_eq!(second.code, OAuthErrorCode::InvalidGrant);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_code_exchange_has_one_winner() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;
    let (verifier, challenge) = pkce_pair();

    let code = service
        .authorize(&subject.id, CLIENT, REDIRECT, &scopes(&["entries.read"]), challenge, "S256")
        .await
        .unwrap();

    let exchanges: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            let code = code.clone();
            tokio::spawn(async move {
                service
                    .exchange_code(&code, CLIENT, REDIRECT, verifier, &RequestContext::default())
                    .await
            })
        })
        .collect();

    let mut issued = 0;
    for exchange in exchanges {
        match exchange.await.unwrap() {
            Ok(_) => issued += 1,
            Err(e) => assert_eq!(e.code, OAuthErrorCode::InvalidGrant),
        }
    }
    assert_eq!(issued, 1);
    assert_eq!(
        refresh_token::Entity::find().count(db.connection()).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_code_bindings_are_enforced() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;
    let (verifier, challenge) = pkce_pair();
    let ctx = RequestContext::default();

    let code = service
        .authorize(&subject.id, CLIENT, REDIRECT, &scopes(&["entries.read"]), challenge, "S256")
        .await
        .unwrap();

    let wrong_verifier = "x".repeat(43);
    for (client, redirect, verifier) in [
        (CLIENT, REDIRECT, wrong_verifier.as_str()),
        ("other-app", REDIRECT, verifier),
        (CLIENT, "https://app.example/other", verifier),
    ] {
        let err = service
            .exchange_code(&code, client, redirect, verifier, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
    }

    // failed attempts do not consume the code
    service
        .exchange_code(&code, CLIENT, REDIRECT, verifier, &ctx)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_redirect_uri_pinned_on_first_use() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;
    let (_, challenge) = pkce_pair();
    let requested = scopes(&["entries.read"]);

    service
        .authorize(&subject.id, CLIENT, REDIRECT, &requested, challenge, "S256")
        .await
        .unwrap();
    service
        .authorize(&subject.id, CLIENT, REDIRECT, &requested, challenge, "S256")
        .await
        .unwrap();

    let err = service
        .authorize(&subject.id, CLIENT, "https://app.example/other", &requested, challenge, "S256")
        .await
        .unwrap_err();
    assert_eq!(err.code, OAuthErrorCode::InvalidRequest);

    let plain = service
        .authorize(&subject.id, CLIENT, REDIRECT, &requested, challenge, "plain")
        .await
        .unwrap_err();
    assert_eq!(plain.code, OAuthErrorCode::InvalidRequest);
}

#[tokio::test]
async fn test_refresh_rotation_and_reuse_detection() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;
    let (verifier, challenge) = pkce_pair();
    let ctx = RequestContext::default();

    let code = service
        .authorize(&subject.id, CLIENT, REDIRECT, &scopes(&["entries.read"]), challenge, "S256")
        .await
        .unwrap();
    let first = service
        .exchange_code(&code, CLIENT, REDIRECT, verifier, &ctx)
        .await
        .unwrap();
    let t1 = first.refresh_token.unwrap();

    let second = service.refresh(&t1, Some(CLIENT), &ctx).await.unwrap();
    let t2 = second.refresh_token.unwrap();
    assert_ne!(t1, t2);
    assert_eq!(second.scope, "entries.read");

    let rotated = refresh_token::Entity::find()
        .filter(refresh_token::Column::TokenHash.eq(nightgate::storage::hash_token(&t1)))
        .one(db.connection())
        .await
        .unwrap()
        .unwrap();
    assert!(rotated.revoked_at.is_some());
    assert!(rotated.replaced_by.is_some());

    // replaying the rotated token is treated as theft
    let replay = service.refresh(&t1, Some(CLIENT), &ctx).await.unwrap_err();
    assert_eq!(replay.code, OAuthErrorCode::InvalidGrant);

    let stored = grant::Entity::find().one(db.connection()).await.unwrap().unwrap();
    assert!(!grants::is_active(&stored));
    let after_theft = service.refresh(&t2, Some(CLIENT), &ctx).await.unwrap_err();
    assert_eq!(after_theft.code, OAuthErrorCode::InvalidGrant);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_has_one_winner() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;
    let (verifier, challenge) = pkce_pair();
    let ctx = RequestContext::default();

    let code = service
        .authorize(&subject.id, CLIENT, REDIRECT, &scopes(&["entries.read"]), challenge, "S256")
        .await
        .unwrap();
    let token = service
        .exchange_code(&code, CLIENT, REDIRECT, verifier, &ctx)
        .await
        .unwrap()
        .refresh_token
        .unwrap();

    let rotations: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            let token = token.clone();
            tokio::spawn(async move {
                service
                    .refresh(&token, Some(CLIENT), &RequestContext::default())
                    .await
            })
        })
        .collect();

    let mut issued = 0;
    for rotation in rotations {
        match rotation.await.unwrap() {
            Ok(_) => issued += 1,
            Err(e) => assert_eq!(e.code, OAuthErrorCode::InvalidGrant),
        }
    }
    assert_eq!(issued, 1);

    // the presented token was rotated exactly once
    let presented = refresh_token::Entity::find()
        .filter(refresh_token::Column::TokenHash.eq(storage::hash_token(&token)))
        .one(db.connection())
        .await
        .unwrap()
        .unwrap();
    assert!(presented.revoked_at.is_some());
    let successors = refresh_token::Entity::find()
        .filter(refresh_token::Column::Id.ne(presented.id.clone()))
        .count(db.connection())
        .await
        .unwrap();
    assert_eq!(successors, 1);
}

#[tokio::test]
async fn test_refresh_rejects_other_client() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;
    let (verifier, challenge) = pkce_pair();
    let ctx = RequestContext::default();

    let code = service
        .authorize(&subject.id, CLIENT, REDIRECT, &scopes(&["entries.read"]), challenge, "S256")
        .await
        .unwrap();
    let pair = service
        .exchange_code(&code, CLIENT, REDIRECT, verifier, &ctx)
        .await
        .unwrap();
    let token = pair.refresh_token.unwrap();

    let err = service.refresh(&token, Some("other-app"), &ctx).await.unwrap_err();
    assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
    // a rejected attempt leaves the token usable
    service.refresh(&token, Some(CLIENT), &ctx).await.unwrap();
}

#[tokio::test]
async fn test_revoking_refresh_token_keeps_grant() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;
    let (verifier, challenge) = pkce_pair();
    let ctx = RequestContext::default();

    let code = service
        .authorize(&subject.id, CLIENT, REDIRECT, &scopes(&["entries.read"]), challenge, "S256")
        .await
        .unwrap();
    let pair = service
        .exchange_code(&code, CLIENT, REDIRECT, verifier, &ctx)
        .await
        .unwrap();
    let token = pair.refresh_token.unwrap();

    service.revoke(&token, Some("refresh_token")).await;
    service.revoke("not-a-token", None).await;

    let err = service.refresh(&token, Some(CLIENT), &ctx).await.unwrap_err();
    assert_eq!(err.code, OAuthErrorCode::InvalidGrant);

    let stored = grant::Entity::find().one(db.connection()).await.unwrap().unwrap();
    assert!(grants::is_active(&stored));
}

#[tokio::test]
async fn test_revoked_access_token_is_rejected() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;

    let session = service.issue_session_token(&subject.id).await.unwrap();
    assert!(session.refresh_token.is_none());
    service.authenticate(&session.access_token).await.unwrap();

    service.revoke(&session.access_token, Some("access_token")).await;
    assert!(matches!(
        service.authenticate(&session.access_token).await,
        Err(AuthenticationError::Revoked)
    ));
}

#[tokio::test]
async fn test_revoked_access_token_stays_rejected_through_clock_skew() {
    let db = TestDb::new().await;
    let tokens = Tokens {
        access_token_ttl_secs: 1,
        clock_skew_secs: 5,
        ..Tokens::default()
    };
    let (service, _keys) = test_token_service_with(db.connection(), tokens).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;

    let early = service.issue_session_token(&subject.id).await.unwrap();
    service.revoke(&early.access_token, Some("access_token")).await;
    let late = service.issue_session_token(&subject.id).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;

    // both are past exp but inside the skew window, so the codec alone would accept them
    assert!(service
        .codec()
        .validate(&late.access_token, storage::now())
        .is_ok());
    assert!(matches!(
        service.authenticate(&early.access_token).await,
        Err(AuthenticationError::Revoked)
    ));

    service.revoke(&late.access_token, None).await;
    assert!(matches!(
        service.authenticate(&late.access_token).await,
        Err(AuthenticationError::Revoked)
    ));
}

#[tokio::test]
async fn test_revoking_grant_revokes_refresh_tokens() {
    let db = TestDb::new().await;
    let (service, _keys) = test_token_service(db.connection()).await;
    let subject = SubjectBuilder::new("alice").create(db.connection()).await;
    let (verifier, challenge) = pkce_pair();
    let ctx = RequestContext::default();

    let code = service
        .authorize(&subject.id, CLIENT, REDIRECT, &scopes(&["entries.read"]), challenge, "S256")
        .await
        .unwrap();
    let pair = service
        .exchange_code(&code, CLIENT, REDIRECT, verifier, &ctx)
        .await
        .unwrap();

    let stored = grant::Entity::find().one(db.connection()).await.unwrap().unwrap();
    assert!(grants::revoke_as(db.connection(), &stored.id, &subject.id).await.unwrap());

    let live = refresh_token::Entity::find()
        .filter(refresh_token::Column::RevokedAt.is_null())
        .count(db.connection())
        .await
        .unwrap();
    assert_eq!(live, 0);
    let err = service
        .refresh(&pair.refresh_token.unwrap(), Some(CLIENT), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code, OAuthErrorCode::InvalidGrant);
}
