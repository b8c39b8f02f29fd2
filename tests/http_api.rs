#![allow(clippy::unwrap_used)]

use anyhow::{Result, anyhow};
use argon2::Params;
use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{
        Request, StatusCode,
        header::{CONTENT_TYPE, COOKIE, SET_COOKIE},
    },
    response::Response,
};
use otpgate::otpgate::{ApiConfig, AppState, app};
use otpgate::verification::{
    InMemoryRateLimiter, RateLimitPolicy, VerificationConfig, VerificationService,
    email::{Delivery, EmailMessage, EmailSender, LogEmailSender},
};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tower::ServiceExt;

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, String)>>,
    down: bool,
}

impl EmailSender for Outbox {
    fn send(&self, message: &EmailMessage) -> Result<Delivery> {
        if self.down {
            return Err(anyhow!("provider unavailable"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((message.to_email.clone(), message.template.clone()));
        Ok(Delivery::Sent)
    }
}

const CLIENT: &str = "198.51.100.4:51000";
const PROXY: &str = "10.0.0.1:443";

fn router(config: VerificationConfig, api: ApiConfig, outbox: Arc<dyn EmailSender>) -> Router {
    let service = VerificationService::from_secret_with_params(
        config,
        Arc::new(InMemoryRateLimiter::new()),
        &SecretString::from("http-test-secret-0123456789abcdef"),
        Params::new(1024, 1, 1, None).unwrap(),
    )
    .unwrap();
    app(Arc::new(AppState::new(api, service, outbox))).unwrap()
}

fn dev_api() -> ApiConfig {
    ApiConfig::new("http://localhost:3000".to_string()).with_expose_code(true)
}

fn post(path: &str, body: &Value, cookie: Option<&str>) -> Request<Body> {
    post_via(CLIENT, None, path, body, cookie)
}

// A request as the server sees it: socket peer plus whatever forwarding header arrived.
fn post_via(
    peer: &str,
    forwarded_for: Option<&str>,
    path: &str,
    body: &Value,
    cookie: Option<&str>,
) -> Request<Body> {
    let peer: SocketAddr = peer.parse().unwrap();
    let mut builder = Request::post(path)
        .header(CONTENT_TYPE, "application/json")
        .extension(ConnectInfo(peer));
    if let Some(forwarded_for) = forwarded_for {
        builder = builder.header("x-forwarded-for", forwarded_for);
    }
    if let Some(cookie) = cookie {
        builder = builder.header(COOKIE, cookie);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send_code(app: &Router, peer: &str, email: &str, case_id: &str) -> (String, String) {
    let response = app
        .clone()
        .oneshot(post_via(
            peer,
            None,
            "/v1/otp/send",
            &json!({"email": email, "caseId": case_id}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = session_cookie(&response);
    let code = json(response).await["otp"].as_str().unwrap().to_string();
    (cookie, code)
}

fn other_code(code: &str) -> &'static str {
    if code == "000000" { "111111" } else { "000000" }
}

async fn json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn session_cookie(response: &Response) -> String {
    let header = response
        .headers()
        .get(SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    header.split(';').next().unwrap().to_string()
}

#[tokio::test]
async fn send_and_verify_over_http() {
    let outbox = Arc::new(Outbox::default());
    let app = router(VerificationConfig::new(), dev_api(), outbox.clone());

    let response = app
        .clone()
        .oneshot(post(
            "/v1/otp/send",
            &json!({"email": "A@X.com", "caseId": "C1"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let set_cookie = response
        .headers()
        .get(SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("Secure"));
    assert!(set_cookie.contains("SameSite=Lax"));
    assert!(set_cookie.contains("Max-Age=600"));
    let cookie = session_cookie(&response);
    let body = json(response).await;
    assert_eq!(body["emailDispatched"], true);
    let code = body["otp"].as_str().unwrap().to_string();

    let wrong = other_code(&code);
    let response = app
        .clone()
        .oneshot(post(
            "/v1/otp/verify",
            &json!({"email": "a@x.com", "otp": wrong, "caseId": "C1"}),
            Some(&cookie),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(post(
            "/v1/otp/verify",
            &json!({"email": "a@x.com", "otp": code, "caseId": "C2"}),
            Some(&cookie),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post(
            "/v1/otp/verify",
            &json!({"email": "a@x.com", "otp": code, "caseId": "C1"}),
            Some(&cookie),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cleared = response
        .headers()
        .get(SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cleared.starts_with("otp_session=;"));
    assert!(cleared.contains("Max-Age=0"));
    assert_eq!(json(response).await["success"], true);

    let sent = outbox.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![
            ("a@x.com".to_string(), "otp_code".to_string()),
            ("a@x.com".to_string(), "verification_welcome".to_string()),
        ]
    );
}

#[tokio::test]
async fn send_is_throttled_per_client_and_email() {
    let config = VerificationConfig::new()
        .with_send_limit(RateLimitPolicy::new(Duration::from_secs(60), 1));
    let app = router(config, dev_api(), Arc::new(Outbox::default()));
    let body = json!({"email": "a@x.com", "caseId": "C1"});

    let first = app
        .clone()
        .oneshot(post("/v1/otp/send", &body, None))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(post("/v1/otp/send", &body, None))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().get(SET_COOKIE).is_none());
}

#[tokio::test]
async fn production_send_hides_code_and_requires_delivery() {
    let api = ApiConfig::new("http://localhost:3000".to_string());
    let down = Arc::new(Outbox {
        down: true,
        ..Outbox::default()
    });
    let app = router(VerificationConfig::new(), api.clone(), down);
    let response = app
        .oneshot(post(
            "/v1/otp/send",
            &json!({"email": "a@x.com", "caseId": "C1"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let app = router(VerificationConfig::new(), api, Arc::new(Outbox::default()));
    let response = app
        .oneshot(post(
            "/v1/otp/send",
            &json!({"email": "a@x.com", "caseId": "C1"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(json(response).await.get("otp").is_none());
}

#[tokio::test]
async fn rotating_forwarded_for_does_not_reset_verify_budget() {
    let app = router(
        VerificationConfig::new(),
        dev_api(),
        Arc::new(Outbox::default()),
    );
    let (cookie, code) = send_code(&app, CLIENT, "a@x.com", "C1").await;
    let wrong = other_code(&code);

    let mut statuses = Vec::new();
    for i in 0..30 {
        let forwarded_for = format!("10.0.0.{i}");
        let response = app
            .clone()
            .oneshot(post_via(
                CLIENT,
                Some(&forwarded_for),
                "/v1/otp/verify",
                &json!({"email": "a@x.com", "otp": wrong, "caseId": "C1"}),
                Some(&cookie),
            ))
            .await
            .unwrap();
        statuses.push(response.status());
    }

    assert!(statuses[..10].iter().all(|s| *s == StatusCode::UNAUTHORIZED));
    assert!(
        statuses[10..]
            .iter()
            .all(|s| *s == StatusCode::TOO_MANY_REQUESTS),
        "{statuses:?}"
    );
}

#[tokio::test]
async fn trusted_proxy_clients_share_the_case_budget() {
    let api = dev_api().with_trusted_proxies(vec!["10.0.0.1".parse().unwrap()]);
    let app = router(VerificationConfig::new(), api, Arc::new(Outbox::default()));
    let (cookie, code) = send_code(&app, PROXY, "a@x.com", "C1").await;
    let wrong = other_code(&code);

    // Each forwarded client has its own per-client budget, but not its own per-case one.
    for i in 0..10 {
        let forwarded_for = format!("203.0.113.{i}");
        let response = app
            .clone()
            .oneshot(post_via(
                PROXY,
                Some(&forwarded_for),
                "/v1/otp/verify",
                &json!({"email": "a@x.com", "otp": wrong, "caseId": "C1"}),
                Some(&cookie),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "attempt {i}");
    }

    let response = app
        .oneshot(post_via(
            PROXY,
            Some("203.0.113.99"),
            "/v1/otp/verify",
            &json!({"email": "a@x.com", "otp": code, "caseId": "C1"}),
            Some(&cookie),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn send_budget_follows_forwarded_client_only_behind_trusted_proxy() {
    let config = VerificationConfig::new()
        .with_send_limit(RateLimitPolicy::new(Duration::from_secs(60), 1));
    let body = json!({"email": "a@x.com", "caseId": "C1"});

    let api = dev_api().with_trusted_proxies(vec!["10.0.0.1".parse().unwrap()]);
    let app = router(config.clone(), api, Arc::new(Outbox::default()));
    for client in ["203.0.113.1", "203.0.113.2"] {
        let response = app
            .clone()
            .oneshot(post_via(PROXY, Some(client), "/v1/otp/send", &body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{client}");
    }

    // Same headers from a peer that is not a trusted proxy: one budget.
    let app = router(config, dev_api(), Arc::new(Outbox::default()));
    let first = app
        .clone()
        .oneshot(post_via(CLIENT, Some("203.0.113.1"), "/v1/otp/send", &body, None))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let second = app
        .oneshot(post_via(CLIENT, Some("203.0.113.2"), "/v1/otp/send", &body, None))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn without_smtp_send_reports_undelivered_and_health_says_so() {
    let api = ApiConfig::new("http://localhost:3000".to_string());
    let app = router(VerificationConfig::new(), api, Arc::new(LogEmailSender));

    let response = app
        .clone()
        .oneshot(post(
            "/v1/otp/send",
            &json!({"email": "a@x.com", "caseId": "C1"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["emailDispatched"], false);
    assert!(body.get("otp").is_none());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json(response).await["smtp"]["configured"], false);
}

#[tokio::test]
async fn missing_fields_are_bad_requests() {
    let app = router(
        VerificationConfig::new(),
        dev_api(),
        Arc::new(Outbox::default()),
    );

    let response = app
        .clone()
        .oneshot(post("/v1/otp/send", &json!({"email": "a@x.com"}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["error"], "Email and caseId are required");

    let response = app
        .oneshot(post(
            "/v1/otp/verify",
            &json!({"email": "a@x.com", "caseId": "C1"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_and_openapi_are_served() {
    let app = router(
        VerificationConfig::new(),
        dev_api(),
        Arc::new(Outbox::default()),
    );

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("X-App"));
    let health = json(response).await;
    assert_eq!(health["name"], "otpgate");
    assert_eq!(health["smtp"]["configured"], true);

    let response = app
        .oneshot(
            Request::get("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let doc = json(response).await;
    assert!(doc["paths"]["/v1/otp/verify"].is_object());
}
