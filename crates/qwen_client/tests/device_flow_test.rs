//! Device-code authorization against a mock OAuth server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use qwen_client::auth::device_code::MAX_POLL_INTERVAL_SECS;
use qwen_client::auth::pkce::compute_code_challenge;
use qwen_client::auth::{AuthorizationPhase, DeviceAuthorizer, OAuthEndpoints};
use qwen_client::clock::{Clock, ManualClock};
use qwen_client::config::ProfileKind;
use qwen_client::error::QwenError;
use qwen_client::QwenClient;
use regex::Regex;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use common::{config_for, form_value, http_transport};

const DEVICE_PATH: &str = "/api/v1/oauth2/device/code";
const TOKEN_PATH: &str = "/api/v1/oauth2/token";

fn device_code_body(interval: u64) -> serde_json::Value {
    json!({
        "device_code": "dev-123",
        "user_code": "ABCD-EFGH",
        "verification_uri": "https://chat.qwen.ai/authorize",
        "verification_uri_complete": "https://chat.qwen.ai/authorize?user_code=ABCD-EFGH",
        "expires_in": 600,
        "interval": interval
    })
}

fn token_body() -> serde_json::Value {
    json!({
        "access_token": "access-1",
        "refresh_token": "refresh-1",
        "token_type": "Bearer",
        "expires_in": 3600
    })
}

async fn mount_device_code(server: &MockServer, interval: u64) {
    Mock::given(method("POST"))
        .and(path(DEVICE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_code_body(interval)))
        .expect(1)
        .mount(server)
        .await;
}

/// Token endpoint answering with `errors` in order, then issuing a token.
async fn mount_token_sequence(server: &MockServer, errors: Vec<&'static str>, expected: u64) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(move |_req: &Request| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            match errors.get(call) {
                Some(error) => ResponseTemplate::new(400).set_body_json(json!({
                    "error": error,
                    "error_description": format!("{error} description")
                })),
                None => ResponseTemplate::new(200).set_body_json(token_body()),
            }
        })
        .expect(expected)
        .mount(server)
        .await;
}

fn authorizer(server: &MockServer, clock: Arc<ManualClock>) -> DeviceAuthorizer {
    let config = config_for(&server.uri(), ProfileKind::Portal);
    DeviceAuthorizer::new(http_transport(), clock, OAuthEndpoints::from_config(&config))
}

#[tokio::test]
async fn pending_then_success_polls_twice() {
    let server = MockServer::start().await;
    mount_device_code(&server, 2).await;
    mount_token_sequence(&server, vec!["authorization_pending"], 2).await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock.clone());

    let verification = auth.login().await.unwrap();
    assert_eq!(
        verification.verification_url,
        "https://chat.qwen.ai/authorize?user_code=ABCD-EFGH"
    );
    assert_eq!(verification.user_code, "ABCD-EFGH");
    assert_eq!(auth.phase(), AuthorizationPhase::AwaitingUserAction);

    let started = clock.now();
    let lease = auth.wait_for_authorization().await.unwrap();

    assert_eq!(lease.access_token, "access-1");
    assert_eq!(lease.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(lease.expires_at, started + chrono::Duration::seconds(2 + 3600));
    assert_eq!(auth.phase(), AuthorizationPhase::Authorized);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);
}

#[tokio::test]
async fn slow_down_lengthens_the_next_sleep() {
    let server = MockServer::start().await;
    mount_device_code(&server, 2).await;
    mount_token_sequence(&server, vec!["slow_down"], 2).await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock.clone());

    auth.login().await.unwrap();
    auth.wait_for_authorization().await.unwrap();

    assert_eq!(clock.sleeps(), vec![Duration::from_secs(3)]);
}

#[tokio::test]
async fn access_denied_fails_without_retry() {
    let server = MockServer::start().await;
    mount_device_code(&server, 1).await;
    mount_token_sequence(&server, vec!["access_denied"], 1).await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock.clone());

    auth.login().await.unwrap();
    let err = auth.wait_for_authorization().await.unwrap_err();

    assert!(
        matches!(err, QwenError::AuthorizationDenied { ref description } if description == "access_denied description")
    );
    assert_eq!(auth.phase(), AuthorizationPhase::Denied);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn expired_device_code() {
    let server = MockServer::start().await;
    mount_device_code(&server, 1).await;
    mount_token_sequence(&server, vec!["authorization_pending", "expired_token"], 2).await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock);

    auth.login().await.unwrap();
    let err = auth.wait_for_authorization().await.unwrap_err();

    assert!(matches!(err, QwenError::DeviceCodeExpired));
    assert_eq!(auth.phase(), AuthorizationPhase::Expired);

    // The pending authorization is gone; a new login is required.
    assert!(matches!(
        auth.wait_for_authorization().await.unwrap_err(),
        QwenError::NotStarted
    ));
}

#[tokio::test]
async fn attempt_cap_times_out() {
    let server = MockServer::start().await;
    mount_device_code(&server, 1).await;
    mount_token_sequence(
        &server,
        vec!["authorization_pending", "authorization_pending", "authorization_pending"],
        3,
    )
    .await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock.clone()).with_max_attempts(Some(3));

    auth.login().await.unwrap();
    let err = auth.wait_for_authorization().await.unwrap_err();

    assert!(matches!(err, QwenError::AuthorizationTimeout { attempts: 3 }));
    assert_eq!(auth.phase(), AuthorizationPhase::TimedOut);
    // No wasted sleep after the final poll.
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(1); 2]);
}

#[tokio::test]
async fn zero_attempt_cap_never_polls() {
    let server = MockServer::start().await;
    mount_device_code(&server, 1).await;
    mount_token_sequence(&server, vec![], 0).await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock.clone()).with_max_attempts(Some(0));

    auth.login().await.unwrap();
    let err = auth.wait_for_authorization().await.unwrap_err();

    assert!(matches!(err, QwenError::AuthorizationTimeout { attempts: 0 }));
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn oversized_interval_is_clamped() {
    let server = MockServer::start().await;
    let mut body = device_code_body(1);
    body["interval"] = json!(1e300);
    Mock::given(method("POST"))
        .and(path(DEVICE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;
    mount_token_sequence(&server, vec!["authorization_pending", "slow_down"], 3).await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock.clone());

    auth.login().await.unwrap();
    auth.wait_for_authorization().await.unwrap();

    let ceiling = Duration::from_secs_f64(MAX_POLL_INTERVAL_SECS);
    assert_eq!(clock.sleeps(), vec![ceiling, ceiling]);
}

#[tokio::test]
async fn unrecognized_poll_response_is_a_protocol_error() {
    let server = MockServer::start().await;
    mount_device_code(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock);

    auth.login().await.unwrap();
    let err = auth.wait_for_authorization().await.unwrap_err();

    assert!(matches!(err, QwenError::AuthorizationProtocolError { ref raw } if raw.contains("bad gateway")));
    assert_eq!(auth.phase(), AuthorizationPhase::Failed);
}

#[tokio::test]
async fn wait_before_login_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock);

    let err = auth.wait_for_authorization().await.unwrap_err();
    assert!(matches!(err, QwenError::NotStarted));
    assert_eq!(auth.phase(), AuthorizationPhase::Idle);
}

#[tokio::test]
async fn device_code_failure_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DEVICE_PATH))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down there"))
        .expect(1)
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock);

    let err = auth.login().await.unwrap_err();
    assert!(matches!(
        err,
        QwenError::DeviceCodeRequestFailed { status: 429, ref body } if body == "slow down there"
    ));
    assert_eq!(auth.phase(), AuthorizationPhase::Idle);
}

#[tokio::test]
async fn pkce_verifier_sent_on_poll_matches_challenge() {
    let server = MockServer::start().await;
    mount_device_code(&server, 1).await;
    mount_token_sequence(&server, vec![], 1).await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock);
    auth.login().await.unwrap();
    auth.wait_for_authorization().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    let device = &requests[0].body;
    assert_eq!(form_value(device, "code_challenge_method").as_deref(), Some("S256"));
    assert_eq!(form_value(device, "scope").as_deref(), Some("openid profile email model.completion"));
    let challenge = form_value(device, "code_challenge").unwrap();

    let poll = &requests[1].body;
    assert_eq!(
        form_value(poll, "grant_type").as_deref(),
        Some("urn:ietf:params:oauth:grant-type:device_code")
    );
    assert_eq!(form_value(poll, "device_code").as_deref(), Some("dev-123"));
    let verifier = form_value(poll, "code_verifier").unwrap();

    let verifier_shape = Regex::new(r"^[A-Za-z0-9_-]{43}$").unwrap();
    assert!(verifier_shape.is_match(&verifier));
    assert_eq!(compute_code_challenge(&verifier), challenge);
}

#[tokio::test]
async fn abandon_returns_to_idle() {
    let server = MockServer::start().await;
    mount_device_code(&server, 1).await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut auth = authorizer(&server, clock);
    auth.login().await.unwrap();
    auth.abandon();

    assert_eq!(auth.phase(), AuthorizationPhase::Idle);
    assert!(matches!(
        auth.wait_for_authorization().await.unwrap_err(),
        QwenError::NotStarted
    ));
}

#[tokio::test]
async fn client_authenticate_installs_lease() {
    let server = MockServer::start().await;
    mount_device_code(&server, 1).await;
    mount_token_sequence(&server, vec!["authorization_pending"], 2).await;

    let config = config_for(&server.uri(), ProfileKind::Portal);
    let client = QwenClient::from_parts(
        &config,
        http_transport(),
        Arc::new(ManualClock::new(Utc::now())),
    );

    let mut shown = None;
    let lease = client
        .authenticate(|code| shown = Some(code.user_code.clone()))
        .await
        .unwrap();

    assert_eq!(shown.as_deref(), Some("ABCD-EFGH"));
    assert_eq!(client.token_lease().await, Some(lease));
    assert_eq!(client.authorization_phase().await, AuthorizationPhase::Authorized);
}
