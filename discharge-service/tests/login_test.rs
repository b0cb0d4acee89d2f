mod common;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use common::{admin_key, TestApp};
use discharge_service::{
    config::ProviderConfig,
    dtos::{DischargeResponse, ErrorResponse, InteractionInfo},
    handlers::discharge::INTERACTION_KINDS_HEADER,
    models::ProviderIdentity,
    services::IdentityStore,
    visitor::{
        AgentSigner, Interactor, LegacyFormVisitor, SignedRequestVisitor, WebBrowserVisitor,
    },
};
use reqwest::StatusCode;
use secrecy::SecretString;

fn browser(username: &str, password: &str) -> Vec<Box<dyn Interactor>> {
    vec![Box::new(WebBrowserVisitor::password_login(
        username,
        SecretString::new(password.to_string()),
    ))]
}

fn legacy_form(username: &str, password: &str) -> Vec<Box<dyn Interactor>> {
    vec![Box::new(LegacyFormVisitor::new(
        username,
        SecretString::new(password.to_string()),
    ))]
}

/// POST /discharge without a capability header and return the error body.
async fn start_discharge(app: &TestApp, caveat_id: &[u8]) -> (StatusCode, ErrorResponse) {
    let response = app
        .http
        .post(app.url("/discharge"))
        .form(&[("id", URL_SAFE_NO_PAD.encode(caveat_id))])
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

/// POST /discharge declaring `kinds` and return the interaction info.
async fn start_discharge_with_kinds(app: &TestApp, caveat_id: &[u8], kinds: &str) -> InteractionInfo {
    let response = app
        .http
        .post(app.url("/discharge"))
        .header(INTERACTION_KINDS_HEADER, kinds)
        .form(&[("id", URL_SAFE_NO_PAD.encode(caveat_id))])
        .send()
        .await
        .unwrap();
    let body: ErrorResponse = response.json().await.unwrap();
    body.info.expect("interaction info")
}

#[tokio::test]
async fn test_static_password_login_discharges_identity() {
    let app = TestApp::spawn().await;
    let caveat = app.caveat("is-authenticated-user");

    let macaroon = app
        .client(browser("test", "testpassword"))
        .discharge(&caveat)
        .await
        .expect("discharge should succeed");

    app.assert_discharges(&caveat, &macaroon);
    assert_eq!(macaroon.declared("username"), Some("test"));
    assert!(macaroon.expiry().is_some());

    let identity = app
        .store
        .find_by_provider_id(&ProviderIdentity::new("test", "test"))
        .await
        .expect("identity should be stored");
    assert_eq!(identity.username, "test");
    assert!(identity.groups.contains("test1"));
    assert!(identity.groups.contains("test2"));
}

#[tokio::test]
async fn test_wrong_password_is_refused() {
    let app = TestApp::spawn().await;
    let caveat = app.caveat("is-authenticated-user");

    let err = app
        .client(browser("test", "wrong"))
        .discharge(&caveat)
        .await
        .expect_err("wrong password must not discharge");

    assert_eq!(err.code(), Some("authentication failed"));
    assert_eq!(
        err.to_string(),
        "cannot acquire discharge token: authentication failed for user \"test\""
    );
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_legacy_marker_selects_legacy_flow() {
    let app = TestApp::spawn().await;

    let (status, body) = start_discharge(&app, &app.caveat("<is-authenticated-user")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body.code, "interaction required");
    let info = body.info.expect("interaction info");
    assert!(info.wait_url.contains("/wait?waitid="));
    assert!(info.interaction_methods.contains_key("legacy-form"));

    let (_, body) = start_discharge(&app, &app.caveat("is-authenticated-user")).await;
    let info = body.info.expect("interaction info");
    assert!(info.wait_url.contains("/wait-token?waitid="));
    assert!(!info.interaction_methods.contains_key("legacy-form"));
}

#[tokio::test]
async fn test_legacy_form_login_discharges_identity() {
    let app = TestApp::spawn().await;
    let caveat = app.caveat("<is-authenticated-user");

    let macaroon = app
        .client(legacy_form("test", "testpassword"))
        .discharge(&caveat)
        .await
        .expect("legacy discharge should succeed");

    app.assert_discharges(&caveat, &macaroon);
    assert_eq!(macaroon.declared("username"), Some("test"));
}

#[tokio::test]
async fn test_legacy_wrong_password_reports_refusal_after_waiting() {
    let app = TestApp::spawn().await;
    let caveat = app.caveat("<is-authenticated-user");

    let err = app
        .client(browser("test", "wrong"))
        .discharge(&caveat)
        .await
        .expect_err("wrong password must not discharge");

    assert_eq!(
        err.to_string(),
        "failed to acquire macaroon after waiting: third party refused discharge: \
         authentication failed for user \"test\""
    );
}

#[tokio::test]
async fn test_legacy_wait_result_is_read_once() {
    let app = TestApp::spawn().await;
    let (_, body) = start_discharge(&app, &app.caveat("<is-authenticated-user")).await;
    let info = body.info.expect("interaction info");

    let response = app
        .http
        .post(&info.interaction_methods["legacy-form"])
        .form(&[("username", "test"), ("password", "testpassword")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let first = app.http.get(&info.wait_url).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.http.get(&info.wait_url).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_agent_discharges_admin_identity() {
    let app = TestApp::spawn().await;
    let caveat = app.caveat("is-authenticated-user");

    let signer = AgentSigner::new("admin@idm", admin_key());
    let macaroon = app
        .client(vec![Box::new(SignedRequestVisitor::new(signer))])
        .discharge(&caveat)
        .await
        .expect("admin agent should discharge");

    app.assert_discharges(&caveat, &macaroon);
    assert_eq!(macaroon.declared("username"), Some("admin@idm"));
    // The administrative identity is never persisted.
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_unknown_agent_key_is_refused() {
    let app = TestApp::spawn().await;
    let caveat = app.caveat("is-authenticated-user");

    let signer = AgentSigner::new("admin@idm", ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]));
    let err = app
        .client(vec![Box::new(SignedRequestVisitor::new(signer))])
        .discharge(&caveat)
        .await
        .expect_err("unknown key must not discharge");

    assert_eq!(err.code(), Some("authentication failed"));
}

#[tokio::test]
async fn test_login_methods_lists_legacy_agent() {
    let app = TestApp::spawn().await;

    let methods = app
        .client(browser("test", "testpassword"))
        .login_methods()
        .await
        .unwrap();

    assert_eq!(methods["agent"], app.url("/login/legacy-agent"));
    assert_eq!(methods["test"], app.url("/login/test/browser"));
}

#[tokio::test]
async fn test_no_common_interaction_kind_is_method_not_supported() {
    let app = TestApp::spawn().await;
    // Modern flow never offers the legacy form.
    let caveat = app.caveat("is-authenticated-user");

    let err = app
        .client(legacy_form("test", "testpassword"))
        .discharge(&caveat)
        .await
        .expect_err("no shared kind");

    assert_eq!(err.code(), Some("method not supported"));
    assert!(app.sessions.is_empty(), "no login session should be opened");
}

#[tokio::test]
async fn test_shared_session_offers_each_client_its_own_kinds() {
    let app = TestApp::spawn().await;
    let caveat = app.caveat("is-authenticated-user");

    let first = start_discharge_with_kinds(&app, &caveat, "browser-redirect").await;
    let second = start_discharge_with_kinds(&app, &caveat, "signed-request").await;

    assert_eq!(first.wait_id, second.wait_id);
    assert_eq!(
        first.interaction_methods.keys().collect::<Vec<_>>(),
        vec!["browser-redirect"]
    );
    assert_eq!(
        second.interaction_methods.keys().collect::<Vec<_>>(),
        vec!["signed-request"]
    );

    // A signed-request client completes the session the browser client opened.
    let signer = AgentSigner::new("admin@idm", admin_key());
    let macaroon = app
        .client(vec![Box::new(SignedRequestVisitor::new(signer))])
        .discharge(&caveat)
        .await
        .expect("signed-request client should discharge a shared session");
    assert_eq!(macaroon.declared("username"), Some("admin@idm"));

    let response = app.http.get(&first.wait_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: DischargeResponse = response.json().await.unwrap();
    assert_eq!(body.macaroon.signature, macaroon.signature);
    assert_eq!(app.sessions.len(), 1);
}

#[tokio::test]
async fn test_login_through_a_provider_not_offered_is_rejected() {
    // Two undomained password providers; only the first is offered.
    let mut providers = common::default_providers();
    let backup: ProviderConfig = serde_json::from_value(serde_json::json!({
        "type": "static",
        "name": "backup",
        "users": { "test": { "password_hash": common::TESTPASSWORD_HASH } }
    }))
    .unwrap();
    providers.push(backup);
    let app = TestApp::spawn_with(providers).await;
    let caveat = app.caveat("is-authenticated-user");
    let info = start_discharge_with_kinds(&app, &caveat, "browser-redirect").await;
    let offered = &info.interaction_methods["browser-redirect"];
    assert!(offered.contains("/login/test/browser"));

    let response = app
        .http
        .post(offered.replace("/login/test/", "/login/backup/"))
        .form(&[("username", "test"), ("password", "testpassword")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The session is still pending and the offered provider can finish it.
    let response = app
        .http
        .post(offered)
        .form(&[("username", "test"), ("password", "testpassword")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.http.get(&info.wait_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let identity = app
        .store
        .find_by_provider_id(&ProviderIdentity::new("test", "test"))
        .await
        .expect("identity recorded under the offered provider");
    assert_eq!(identity.username, "test");
}

#[tokio::test]
async fn test_resolved_wait_token_returns_the_same_discharge() {
    let app = TestApp::spawn().await;
    let caveat = app.caveat("is-authenticated-user");
    let (_, body) = start_discharge(&app, &caveat).await;
    let info = body.info.expect("interaction info");

    let response = app
        .http
        .post(&info.interaction_methods["browser-redirect"])
        .form(&[("username", "test"), ("password", "testpassword")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let response = app.http.get(&info.wait_url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: DischargeResponse = response.json().await.unwrap();
        seen.push(body.macaroon.signature);
    }
    assert!(seen.windows(2).all(|w| w[0] == w[1]));

    // Asking again for the same caveat hands back the same discharge.
    let response = app
        .http
        .post(app.url("/discharge"))
        .form(&[("id", URL_SAFE_NO_PAD.encode(&caveat))])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: DischargeResponse = response.json().await.unwrap();
    assert_eq!(body.macaroon.signature, seen[0]);
}

#[tokio::test]
async fn test_failed_login_does_not_affect_concurrent_login() {
    let app = TestApp::spawn().await;
    let caveat_a = app.caveat("is-authenticated-user");
    let caveat_b = app.caveat("is-authenticated-user");

    let client_a = app.client(browser("test", "wrong"));
    let client_b = app.client(browser("other", "otherpassword"));
    let (a, b) = tokio::join!(client_a.discharge(&caveat_a), client_b.discharge(&caveat_b));

    assert_eq!(a.unwrap_err().code(), Some("authentication failed"));
    let macaroon = b.expect("user B should discharge");
    app.assert_discharges(&caveat_b, &macaroon);
    assert_eq!(macaroon.declared("username"), Some("other"));

    assert!(app
        .store
        .find_by_provider_id(&ProviderIdentity::new("test", "test"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_domain_qualified_caveat_uses_domain_provider() {
    let app = TestApp::spawn().await;
    let caveat = app.caveat("is-authenticated-user @test2");

    let macaroon = app
        .client(browser("test", "testpassword"))
        .discharge(&caveat)
        .await
        .expect("domain discharge should succeed");

    assert_eq!(macaroon.declared("username"), Some("test@test2"));
}

#[tokio::test]
async fn test_membership_caveat_declares_matched_groups() {
    let app = TestApp::spawn().await;

    let caveat = app.caveat("is-member-of test2 admins");
    let macaroon = app
        .client(browser("test", "testpassword"))
        .discharge(&caveat)
        .await
        .expect("member should discharge");
    assert_eq!(macaroon.declared("groups"), Some("test2"));

    let caveat = app.caveat("is-member-of admins");
    let err = app
        .client(browser("test", "testpassword"))
        .discharge(&caveat)
        .await
        .expect_err("non-member must not discharge");
    assert_eq!(err.code(), Some("authentication failed"));
}

#[tokio::test]
async fn test_unknown_wait_id_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .http
        .get(app.url("/wait-token?waitid=00000000000000000000000000000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "not found");
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::spawn().await;

    let response = app.http.get(app.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
