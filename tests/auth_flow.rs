//! End-to-end tests for the auth API.
//!
//! Each test boots the real router on an ephemeral port with in-memory
//! stores and a fixture credential verifier, then drives it over HTTP:
//! through `ResilientTransport` where the client behavior itself is under
//! test, or raw `reqwest` where the wire shape matters.

use anyhow::Result;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use staffdesk::SESSION_HEADER;
use staffdesk::api;
use staffdesk::auth::{AuthOrchestrator, FixtureCredentialVerifier, NoopRateLimiter};
use staffdesk::codec::PayloadCodec;
use staffdesk::session::{MemorySessionStore, SessionPolicy, SessionRegistry};
use staffdesk::token::{AccessTokenSigner, MemoryRefreshTokenStore, TokenConfig, TokenIssuer};
use staffdesk::transport::{
    CredentialBundle, ResilientTransport, TransportConfig, TransportError,
};
use staffdesk::twofactor::{
    CodeSender, MemoryTwoFactorStore, TwoFactorConfig, TwoFactorService,
};

#[derive(Default)]
struct CapturingSender {
    last_code: Mutex<Option<String>>,
}

impl CodeSender for CapturingSender {
    fn send(&self, _destination: &str, code: &str) -> Result<()> {
        *self.last_code.lock().unwrap() = Some(code.to_string());
        Ok(())
    }
}

struct TestApp {
    addr: SocketAddr,
    verifier: Arc<FixtureCredentialVerifier>,
    two_factor: Arc<TwoFactorService>,
    sender: Arc<CapturingSender>,
}

impl TestApp {
    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

fn signer() -> Arc<AccessTokenSigner> {
    static SIGNER: OnceLock<Arc<AccessTokenSigner>> = OnceLock::new();
    SIGNER
        .get_or_init(|| Arc::new(AccessTokenSigner::generate("integration-test").unwrap()))
        .clone()
}

async fn spawn_app(codec: PayloadCodec, access_ttl_seconds: i64) -> TestApp {
    let verifier = Arc::new(FixtureCredentialVerifier::new());
    let sender = Arc::new(CapturingSender::default());
    let two_factor = Arc::new(TwoFactorService::new(
        Arc::new(MemoryTwoFactorStore::new()),
        sender.clone(),
        codec.clone(),
        TwoFactorConfig::new().with_backup_pepper(Arc::from(b"integration-pepper".as_slice())),
    ));
    let tokens = Arc::new(TokenIssuer::new(
        signer(),
        Arc::new(MemoryRefreshTokenStore::new()),
        TokenConfig::new(
            "https://api.staffdesk.test".to_string(),
            "staffdesk-portal".to_string(),
        )
        .with_access_ttl_seconds(access_ttl_seconds),
    ));
    let sessions = Arc::new(SessionRegistry::new(
        Arc::new(MemorySessionStore::new()),
        SessionPolicy::new(),
    ));
    let orchestrator = Arc::new(AuthOrchestrator::new(
        verifier.clone(),
        two_factor.clone(),
        tokens,
        sessions,
        Arc::new(NoopRateLimiter),
    ));

    let app = api::app(orchestrator, codec, None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("test server failed");
    });

    TestApp {
        addr,
        verifier,
        two_factor,
        sender,
    }
}

fn transport_for(app: &TestApp, codec: PayloadCodec) -> ResilientTransport {
    ResilientTransport::new(
        TransportConfig::new(app.base_url())
            .with_max_attempts(2)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
        codec,
    )
    .expect("transport should build")
}

async fn login_via(
    transport: &ResilientTransport,
    identity: &str,
    password: &str,
) -> (Value, String) {
    let response = transport
        .request(
            Method::POST,
            "/v1/auth/login",
            Some(&json!({ "identity": identity, "password": password })),
        )
        .await
        .expect("login request should complete");
    assert_eq!(response.status, StatusCode::OK, "body: {}", response.body);
    let body: Value = response.json().expect("login response should be JSON");
    // The transport strips nothing: grab the session header via reqwest in
    // header-sensitive tests; here the body is what matters.
    (body, response.body.clone())
}

#[tokio::test]
async fn login_returns_tokens_and_session_header() {
    let app = spawn_app(PayloadCodec::disabled(), 600).await;
    app.verifier.add_account("alice@example.com", "correct horse");

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/auth/login", app.base_url()))
        .json(&json!({ "identity": "alice@example.com", "password": "correct horse" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get(SESSION_HEADER)
        .expect("session header should be present")
        .to_str()
        .unwrap()
        .to_string();
    assert!(!session_id.is_empty());

    let body: Value = response.json().await.unwrap();
    assert!(body["accessToken"].is_string());
    assert!(body["refreshToken"].is_string());
    assert!(body["userId"].is_string());
    assert_eq!(body["requires2FA"], json!(false));

    // The session id authorizes keep-alive together with the access token.
    let keep_alive = client
        .post(format!("{}/v1/auth/session/keep-alive", app.base_url()))
        .header(
            "authorization",
            format!("Bearer {}", body["accessToken"].as_str().unwrap()),
        )
        .header(SESSION_HEADER, &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(keep_alive.status(), StatusCode::OK);
    let keep_alive: Value = keep_alive.json().await.unwrap();
    assert_eq!(keep_alive["isValid"], json!(true));
    assert!(keep_alive["expiresAt"].is_i64());
}

#[tokio::test]
async fn failed_logins_have_one_indistinguishable_shape() {
    let app = spawn_app(PayloadCodec::disabled(), 600).await;
    app.verifier.add_account("alice@example.com", "correct horse");

    let client = reqwest::Client::new();
    let post = |body: Value| {
        let client = client.clone();
        let url = format!("{}/v1/auth/login", app.base_url());
        async move { client.post(url).json(&body).send().await.unwrap() }
    };

    let unknown = post(json!({ "identity": "nobody@example.com", "password": "x" })).await;
    let wrong = post(json!({ "identity": "alice@example.com", "password": "x" })).await;

    assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let unknown_body: Value = unknown.json().await.unwrap();
    let wrong_body: Value = wrong.json().await.unwrap();
    // Identical shape and content: no signal about which credential failed.
    assert_eq!(unknown_body, wrong_body);
    assert_eq!(unknown_body, json!({ "error": "invalid_credentials" }));
}

#[tokio::test]
async fn two_factor_login_issues_session_only_after_verification() {
    let app = spawn_app(PayloadCodec::disabled(), 600).await;
    let user_id = app.verifier.add_account("alice@example.com", "pw");
    app.two_factor
        .enable_email(user_id, "alice@example.com".to_string())
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let login = client
        .post(format!("{}/v1/auth/login", app.base_url()))
        .json(&json!({ "identity": "alice@example.com", "password": "pw" }))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::OK);
    assert!(
        login.headers().get(SESSION_HEADER).is_none(),
        "no session before the second factor"
    );
    let login: Value = login.json().await.unwrap();
    assert_eq!(login["requires2FA"], json!(true));
    assert!(login["accessToken"].is_null());

    client
        .post(format!("{}/v1/auth/2fa/send", app.base_url()))
        .json(&json!({ "userId": user_id.to_string() }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    let code = app.sender.last_code.lock().unwrap().clone().unwrap();

    let verify = client
        .post(format!("{}/v1/auth/2fa/verify", app.base_url()))
        .json(&json!({ "userId": user_id.to_string(), "code": code }))
        .send()
        .await
        .unwrap();
    assert_eq!(verify.status(), StatusCode::OK);
    assert!(verify.headers().get(SESSION_HEADER).is_some());
    let verify: Value = verify.json().await.unwrap();
    assert!(verify["accessToken"].is_string());
    assert!(verify["refreshToken"].is_string());
}

#[tokio::test]
async fn concurrent_refresh_has_one_winner_over_http() {
    let app = spawn_app(PayloadCodec::disabled(), 600).await;
    app.verifier.add_account("alice@example.com", "pw");

    let transport = transport_for(&app, PayloadCodec::disabled());
    let (login, _raw) = login_via(&transport, "alice@example.com", "pw").await;
    let stale = json!({
        "accessToken": login["accessToken"],
        "refreshToken": login["refreshToken"],
    });

    let client = reqwest::Client::new();
    let url = format!("{}/v1/auth/refresh-token", app.base_url());
    let call = |body: Value| {
        let client = client.clone();
        let url = url.clone();
        async move { client.post(url).json(&body).send().await.unwrap() }
    };

    let (a, b) = tokio::join!(call(stale.clone()), call(stale.clone()));
    let statuses = [a.status(), b.status()];
    assert!(
        statuses.contains(&StatusCode::OK),
        "one refresh must win: {statuses:?}"
    );
    assert!(
        statuses.contains(&StatusCode::UNAUTHORIZED),
        "one refresh must lose: {statuses:?}"
    );

    let loser = if a.status() == StatusCode::UNAUTHORIZED { a } else { b };
    let loser: Value = loser.json().await.unwrap();
    // The replay is reported with the uniform token error, nothing special.
    assert_eq!(loser, json!({ "error": "token_invalid" }));
}

#[tokio::test]
async fn transport_refreshes_once_on_401_and_retries() {
    // Access tokens live two seconds; the session far outlives them.
    let app = spawn_app(PayloadCodec::disabled(), 2).await;
    app.verifier.add_account("alice@example.com", "pw");

    let transport = transport_for(&app, PayloadCodec::disabled());
    let client = reqwest::Client::new();
    let login = client
        .post(format!("{}/v1/auth/login", app.base_url()))
        .json(&json!({ "identity": "alice@example.com", "password": "pw" }))
        .send()
        .await
        .unwrap();
    let session_id = login
        .headers()
        .get(SESSION_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let login: Value = login.json().await.unwrap();

    transport
        .set_credentials(CredentialBundle {
            access_token: login["accessToken"].as_str().unwrap().to_string(),
            refresh_token: login["refreshToken"].as_str().unwrap().to_string(),
            session_id,
            access_expires_at: login["accessExpiresAt"].as_i64().unwrap_or(0),
            refresh_expires_at: login["refreshExpiresAt"].as_i64().unwrap_or(0),
        })
        .await;

    // Let the access token expire, then call an authenticated endpoint: the
    // transport must refresh exactly once and retry transparently.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let response = transport
        .request(Method::POST, "/v1/auth/session/keep-alive", None)
        .await
        .expect("keep-alive should succeed after transparent refresh");
    assert_eq!(response.status, StatusCode::OK, "body: {}", response.body);
    let body: Value = response.json().unwrap();
    assert_eq!(body["isValid"], json!(true));

    // The bundle was rotated in place.
    let rotated = transport.credentials().await.unwrap();
    assert_ne!(rotated.access_token, login["accessToken"].as_str().unwrap());
    assert_ne!(rotated.refresh_token, login["refreshToken"].as_str().unwrap());
}

#[tokio::test]
async fn logout_flips_keep_alive_to_session_ended() {
    let app = spawn_app(PayloadCodec::disabled(), 600).await;
    app.verifier.add_account("alice@example.com", "pw");

    let client = reqwest::Client::new();
    let login = client
        .post(format!("{}/v1/auth/login", app.base_url()))
        .json(&json!({ "identity": "alice@example.com", "password": "pw" }))
        .send()
        .await
        .unwrap();
    let session_id = login
        .headers()
        .get(SESSION_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let login: Value = login.json().await.unwrap();
    let bearer = format!("Bearer {}", login["accessToken"].as_str().unwrap());

    let logout = client
        .post(format!("{}/v1/auth/logout", app.base_url()))
        .header("authorization", &bearer)
        .header(SESSION_HEADER, &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(logout.status(), StatusCode::OK);

    // Logout is idempotent.
    client
        .post(format!("{}/v1/auth/logout", app.base_url()))
        .header(SESSION_HEADER, &session_id)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // The UI gets "you were signed out", not a generic auth failure.
    let keep_alive = client
        .post(format!("{}/v1/auth/session/keep-alive", app.base_url()))
        .header("authorization", &bearer)
        .header(SESSION_HEADER, &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(keep_alive.status(), StatusCode::OK);
    let keep_alive: Value = keep_alive.json().await.unwrap();
    assert_eq!(keep_alive["isValid"], json!(false));
    assert_eq!(keep_alive["reason"], json!("session_ended"));

    // And the refresh token died with the session.
    let refresh = client
        .post(format!("{}/v1/auth/refresh-token", app.base_url()))
        .json(&json!({
            "accessToken": login["accessToken"],
            "refreshToken": login["refreshToken"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(refresh.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn encrypted_bodies_round_trip_end_to_end() {
    let key = [9u8; 32];
    let app = spawn_app(PayloadCodec::new(key), 600).await;
    app.verifier.add_account("alice@example.com", "pw");

    let transport = transport_for(&app, PayloadCodec::new(key));
    let (login, _raw) = login_via(&transport, "alice@example.com", "pw").await;
    assert!(login["accessToken"].is_string());

    // A client without the key still gets a response, sees envelope bytes,
    // and notices through the JSON parse failure.
    let plaintext_transport = transport_for(&app, PayloadCodec::disabled());
    let response = plaintext_transport
        .request(
            Method::POST,
            "/v1/auth/login",
            Some(&json!({ "identity": "alice@example.com", "password": "pw" })),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body.starts_with("enc.v1."));
    assert!(response.json::<Value>().is_err());
}

#[tokio::test]
async fn unlock_rechecks_the_password() {
    let app = spawn_app(PayloadCodec::disabled(), 600).await;
    app.verifier.add_account("alice@example.com", "pw");

    let client = reqwest::Client::new();
    let login = client
        .post(format!("{}/v1/auth/login", app.base_url()))
        .json(&json!({ "identity": "alice@example.com", "password": "pw" }))
        .send()
        .await
        .unwrap();
    let session_id = login
        .headers()
        .get(SESSION_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let login: Value = login.json().await.unwrap();
    let bearer = format!("Bearer {}", login["accessToken"].as_str().unwrap());

    let unlock = |password: &str| {
        let client = client.clone();
        let url = format!("{}/v1/auth/session/unlock", app.base_url());
        let bearer = bearer.clone();
        let session_id = session_id.clone();
        let body = json!({ "password": password }).to_string();
        async move {
            client
                .post(url)
                .header("authorization", bearer)
                .header(SESSION_HEADER, session_id)
                .body(body)
                .send()
                .await
                .unwrap()
        }
    };

    let wrong = unlock("nope").await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let right = unlock("pw").await;
    assert_eq!(right.status(), StatusCode::OK);
    let right: Value = right.json().await.unwrap();
    assert_eq!(right["success"], json!(true));
    assert_eq!(right["sessionExpired"], json!(false));
}

#[tokio::test]
async fn logout_all_spares_only_the_requesting_device() {
    let app = spawn_app(PayloadCodec::disabled(), 600).await;
    app.verifier.add_account("alice@example.com", "pw");

    let client = reqwest::Client::new();
    let login = || async {
        let response = client
            .post(format!("{}/v1/auth/login", app.base_url()))
            .json(&json!({ "identity": "alice@example.com", "password": "pw" }))
            .send()
            .await
            .unwrap();
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body: Value = response.json().await.unwrap();
        (body, session_id)
    };

    let (here, here_session) = login().await;
    let (elsewhere, elsewhere_session) = login().await;

    let logout_all = client
        .post(format!("{}/v1/auth/logout-all", app.base_url()))
        .header(
            "authorization",
            format!("Bearer {}", here["accessToken"].as_str().unwrap()),
        )
        .header(SESSION_HEADER, &here_session)
        .body(json!({ "includeCurrent": false }).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(logout_all.status(), StatusCode::OK);

    let check = |token: String, session: String| {
        let client = client.clone();
        let url = format!("{}/v1/auth/session/keep-alive", app.base_url());
        async move {
            let response = client
                .post(url)
                .header("authorization", format!("Bearer {token}"))
                .header(SESSION_HEADER, session)
                .send()
                .await
                .unwrap();
            response.json::<Value>().await.unwrap()
        }
    };

    let here_state = check(
        here["accessToken"].as_str().unwrap().to_string(),
        here_session,
    )
    .await;
    assert_eq!(here_state["isValid"], json!(true));

    let elsewhere_state = check(
        elsewhere["accessToken"].as_str().unwrap().to_string(),
        elsewhere_session,
    )
    .await;
    assert_eq!(elsewhere_state["isValid"], json!(false));
    assert_eq!(elsewhere_state["reason"], json!("session_ended"));
}

#[tokio::test]
async fn transport_surfaces_reauthentication_after_failed_refresh() {
    let app = spawn_app(PayloadCodec::disabled(), 600).await;
    app.verifier.add_account("alice@example.com", "pw");

    let transport = transport_for(&app, PayloadCodec::disabled());
    // A bundle whose tokens the server never issued.
    transport
        .set_credentials(CredentialBundle {
            access_token: "bogus-access".to_string(),
            refresh_token: "bogus-refresh".to_string(),
            session_id: "bogus-session".to_string(),
            access_expires_at: 0,
            refresh_expires_at: 0,
        })
        .await;

    let result = transport
        .request(Method::POST, "/v1/auth/session/keep-alive", None)
        .await;
    assert!(matches!(
        result,
        Err(TransportError::ReauthenticationRequired)
    ));
    // The dead bundle was dropped: back to Anonymous.
    assert!(transport.credentials().await.is_none());
}
