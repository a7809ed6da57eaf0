mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use vidtube::accounts::Credentials;
use vidtube::errors::AppError;
use vidtube::models::NewIdentity;
use vidtube::session::{ReusePolicy, SessionManager};
use vidtube::store::{IdentityStore, MemoryStore};
use vidtube::tokens::TokenIssuer;

fn is_unauthorized<T: std::fmt::Debug>(result: &Result<T, AppError>) -> bool {
    matches!(result, Err(AppError::Unauthorized(_)))
}

#[tokio::test]
async fn test_login_issues_tokens_for_the_identity() {
    let app = TestApp::new();
    let registered = app.register("alice").await;

    let outcome = app.login("alice").await;
    assert_eq!(outcome.identity.id, registered.id);

    let current = app
        .state
        .accounts
        .current_user(&outcome.tokens.access_token)
        .await
        .unwrap();
    assert_eq!(current.id, registered.id);
}

#[tokio::test]
async fn test_login_by_email_and_wrong_password() {
    let app = TestApp::new();
    app.register("alice").await;

    let by_email = app
        .state
        .accounts
        .login(Credentials {
            login: "Alice@Example.com".to_string(),
            password: PASSWORD.to_string(),
        })
        .await;
    assert!(by_email.is_ok());

    let wrong = app
        .state
        .accounts
        .login(Credentials {
            login: "alice".to_string(),
            password: "not it".to_string(),
        })
        .await;
    assert!(is_unauthorized(&wrong));

    let unknown = app
        .state
        .accounts
        .login(Credentials {
            login: "mallory".to_string(),
            password: PASSWORD.to_string(),
        })
        .await;
    assert!(is_unauthorized(&unknown));
}

#[tokio::test]
async fn test_refresh_token_is_single_use() {
    let app = TestApp::with_policy(ReusePolicy::Reject);
    app.register("alice").await;
    let r0 = app.login("alice").await.tokens.refresh_token;

    let r1 = app.state.accounts.refresh(&r0).await.unwrap().refresh_token;
    assert_ne!(r0, r1);

    let replay = app.state.accounts.refresh(&r0).await;
    assert!(is_unauthorized(&replay));

    // Rejecting the replay leaves the current session alone
    let r2 = app.state.accounts.refresh(&r1).await;
    assert!(r2.is_ok());
}

#[tokio::test]
async fn test_reuse_revokes_the_session_by_default() {
    let app = TestApp::new();
    app.register("alice").await;
    let r0 = app.login("alice").await.tokens.refresh_token;

    let r1 = app.state.accounts.refresh(&r0).await.unwrap().refresh_token;
    assert!(is_unauthorized(&app.state.accounts.refresh(&r0).await));

    // After reuse was detected the newer token is dead too
    assert!(is_unauthorized(&app.state.accounts.refresh(&r1).await));

    // A fresh login starts over
    let r = app.login("alice").await.tokens.refresh_token;
    assert!(app.state.accounts.refresh(&r).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_refresh_has_exactly_one_winner() {
    let app = Arc::new(TestApp::with_policy(ReusePolicy::Reject));
    app.register("alice").await;
    let r0 = app.login("alice").await.tokens.refresh_token;

    let attempts = (0..8).map(|_| {
        let app = app.clone();
        let token = r0.clone();
        tokio::spawn(async move { app.state.accounts.refresh(&token).await })
    });

    let results = futures::future::join_all(attempts).await;
    let winners = results
        .into_iter()
        .map(|joined| joined.expect("task completes"))
        .filter(Result::is_ok)
        .count();

    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_second_login_invalidates_the_first_refresh_token() {
    let app = TestApp::with_policy(ReusePolicy::Reject);
    app.register("alice").await;

    let first = app.login("alice").await.tokens.refresh_token;
    let second = app.login("alice").await.tokens.refresh_token;

    assert!(is_unauthorized(&app.state.accounts.refresh(&first).await));
    assert!(app.state.accounts.refresh(&second).await.is_ok());
}

#[tokio::test]
async fn test_logout_kills_the_refresh_token() {
    let app = TestApp::new();
    let identity = app.register("alice").await;
    let tokens = app.login("alice").await.tokens;

    app.state.accounts.logout(identity.id).await.unwrap();

    assert!(is_unauthorized(&app.state.accounts.refresh(&tokens.refresh_token).await));
}

#[tokio::test]
async fn test_access_token_is_not_a_refresh_token() {
    let app = TestApp::new();
    app.register("alice").await;
    let tokens = app.login("alice").await.tokens;

    assert!(is_unauthorized(&app.state.accounts.refresh(&tokens.access_token).await));
    assert!(is_unauthorized(
        &app.state.accounts.current_user(&tokens.refresh_token).await
    ));
    assert!(is_unauthorized(&app.state.accounts.refresh("   ").await));
}

#[tokio::test]
async fn test_change_password_signs_out_and_swaps_credentials() {
    let app = TestApp::new();
    let identity = app.register("alice").await;
    let tokens = app.login("alice").await.tokens;

    let mismatch = app
        .state
        .accounts
        .change_password(identity.id, PASSWORD, "new secret", "other secret")
        .await;
    assert!(matches!(mismatch, Err(AppError::Validation(_))));

    let wrong_old = app
        .state
        .accounts
        .change_password(identity.id, "guess", "new secret", "new secret")
        .await;
    assert!(is_unauthorized(&wrong_old));

    app.state
        .accounts
        .change_password(identity.id, PASSWORD, "new secret", "new secret")
        .await
        .unwrap();

    assert!(is_unauthorized(&app.state.accounts.refresh(&tokens.refresh_token).await));

    let old = app
        .state
        .accounts
        .login(Credentials {
            login: "alice".to_string(),
            password: PASSWORD.to_string(),
        })
        .await;
    assert!(is_unauthorized(&old));

    let new = app
        .state
        .accounts
        .login(Credentials {
            login: "alice".to_string(),
            password: "new secret".to_string(),
        })
        .await;
    assert!(new.is_ok());
}

#[tokio::test]
async fn test_change_password_survives_a_concurrent_refresh() {
    let app = TestApp::new();
    let identity = app.register("alice").await;
    app.login("alice").await;
    app.identities.refresh_before_password_write(true);

    app.state
        .accounts
        .change_password(identity.id, PASSWORD, "new secret", "new secret")
        .await
        .expect("a refresh on another device does not block a password change");

    let stored = IdentityStore::find_by_id(app.store.as_ref(), identity.id)
        .await
        .unwrap()
        .expect("identity exists");
    assert_eq!(stored.refresh_token_digest, None);

    let new = app
        .state
        .accounts
        .login(Credentials {
            login: "alice".to_string(),
            password: "new secret".to_string(),
        })
        .await;
    assert!(new.is_ok());
}

#[tokio::test]
async fn test_expired_refresh_token_is_rejected_without_touching_the_session() {
    let store = Arc::new(MemoryStore::new());
    let identity = IdentityStore::create(
        store.as_ref(),
        NewIdentity {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            fullname: "Alice".to_string(),
            password_hash: "unused".to_string(),
            avatar: None,
            cover_image: None,
        },
    )
    .await
    .unwrap();

    let issuer = TokenIssuer::hmac(
        b"access",
        b"refresh",
        chrono::Duration::minutes(15),
        chrono::Duration::seconds(-60),
    );
    let sessions = SessionManager::new(
        store.clone(),
        Arc::new(issuer),
        ReusePolicy::RevokeSession,
        Duration::from_secs(3),
    );

    let pair = sessions.start(identity.id).await.unwrap();
    let result = sessions.rotate(&pair.refresh_token).await;
    assert!(is_unauthorized(&result));

    // Expiry is not reuse, so the stored digest is untouched
    let stored = IdentityStore::find_by_id(store.as_ref(), identity.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.refresh_token_digest.is_some());
}

#[tokio::test]
async fn test_only_the_digest_is_stored() {
    let app = TestApp::new();
    let identity = app.register("alice").await;
    let tokens = app.login("alice").await.tokens;

    let stored = IdentityStore::find_by_id(app.store.as_ref(), identity.id)
        .await
        .unwrap()
        .unwrap();

    let digest = stored.refresh_token_digest.expect("session is active");
    assert_ne!(digest, tokens.refresh_token);
    assert_eq!(digest, vidtube::tokens::digest(&tokens.refresh_token));
}
