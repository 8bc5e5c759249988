use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use otp_relay::app::build_app;
use otp_relay::config::AppConfig;
use otp_relay::errors::GeoError;
use otp_relay::services::broker::RendezvousBroker;
use otp_relay::services::fingerprint::{GeoResolver, Location, LocationFingerprinter};
use otp_relay::state::AppState;

const PHONE_TOKEN: &str = "phone-token";
const EXTENSION_TOKEN: &str = "extension-token";

const MILAN_A: &str = "1.1.1.1";
const MILAN_B: &str = "5.5.5.5";
const MOUNTAIN_VIEW: &str = "8.8.8.8";

struct StubResolver(HashMap<IpAddr, Location>);

#[async_trait]
impl GeoResolver for StubResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<Location, GeoError> {
        self.0.get(&ip).cloned().ok_or(GeoError::Incomplete)
    }
}

fn location(country: &str, region: &str, city: &str) -> Location {
    Location {
        country: country.into(),
        region: region.into(),
        city: city.into(),
    }
}

fn test_app() -> (Router, Arc<RendezvousBroker>) {
    let cfg = AppConfig::from_json(&format!(
        r#"{{
            "port": 0,
            "server_version": "test",
            "publisher_timeout_ms": 1000,
            "subscriber_timeout_ms": 1000,
            "publisher_token": "{PHONE_TOKEN}",
            "subscriber_token": "{EXTENSION_TOKEN}"
        }}"#
    ))
    .unwrap();
    cfg.validate().unwrap();

    let milan = location("Italy", "Lombardy", "Milan");
    let resolver = StubResolver(HashMap::from([
        (MILAN_A.parse().unwrap(), milan.clone()),
        (MILAN_B.parse().unwrap(), milan),
        (
            MOUNTAIN_VIEW.parse().unwrap(),
            location("United States", "California", "Mountain View"),
        ),
    ]));

    let broker = Arc::new(RendezvousBroker::new());
    let state = AppState::new(
        cfg,
        broker.clone(),
        LocationFingerprinter::new(Arc::new(resolver)),
    );

    (build_app(state), broker)
}

async fn post_otp(app: &Router, token: &str, otp: &str, ip: &str) -> Response {
    let body = serde_json::json!({ "otp": otp }).to_string();
    post_raw(app, token, body, ip).await
}

async fn post_raw(app: &Router, token: &str, body: String, ip: &str) -> Response {
    let req = Request::builder()
        .method("POST")
        .uri("/otp")
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body))
        .unwrap();

    app.clone().oneshot(req).await.unwrap()
}

async fn get_otp(app: &Router, token: &str, ip: &str) -> Response {
    let req = Request::builder()
        .method("GET")
        .uri("/otp")
        .header("authorization", format!("Bearer {token}"))
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap();

    app.clone().oneshot(req).await.unwrap()
}

async fn get_path(app: &Router, path: &str) -> Response {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    app.clone().oneshot(req).await.unwrap()
}

async fn body_text(res: Response) -> String {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

//
// ─────────────────────────────────────────────────────────────
// Rendezvous
// ─────────────────────────────────────────────────────────────
//

#[tokio::test(start_paused = true)]
async fn otp_first_get_later() {
    let (app, _) = test_app();

    let (post, get) = tokio::join!(post_otp(&app, PHONE_TOKEN, "123456", MILAN_A), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        get_otp(&app, EXTENSION_TOKEN, MILAN_A).await
    });

    assert_eq!(post.status(), StatusCode::OK);
    assert_eq!(body_text(post).await, "OTP received");
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(body_text(get).await, "123456");
}

#[tokio::test(start_paused = true)]
async fn get_first_otp_arrives_later() {
    let (app, _) = test_app();

    let (post, get) = tokio::join!(
        async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            post_otp(&app, PHONE_TOKEN, "654321", MILAN_A).await
        },
        get_otp(&app, EXTENSION_TOKEN, MILAN_A)
    );

    assert_eq!(post.status(), StatusCode::OK);
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(body_text(get).await, "654321");
}

#[tokio::test(start_paused = true)]
async fn get_without_any_otp_is_no_content() {
    let (app, broker) = test_app();
    let started = tokio::time::Instant::now();

    let get = get_otp(&app, EXTENSION_TOKEN, MILAN_A).await;

    assert_eq!(get.status(), StatusCode::NO_CONTENT);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(body_text(get).await.is_empty());
    assert_eq!(broker.stats().channels, 0);
}

#[tokio::test(start_paused = true)]
async fn differing_locations_never_pair() {
    let (app, _) = test_app();

    let (post, get) = tokio::join!(
        post_otp(&app, PHONE_TOKEN, "6676767", MILAN_A),
        get_otp(&app, EXTENSION_TOKEN, MOUNTAIN_VIEW)
    );

    assert_eq!(post.status(), StatusCode::OK);
    assert_eq!(get.status(), StatusCode::NO_CONTENT);
}

#[tokio::test(start_paused = true)]
async fn different_addresses_in_the_same_city_pair() {
    let (app, _) = test_app();

    let (post, get) = tokio::join!(
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            post_otp(&app, PHONE_TOKEN, "4242", MILAN_B).await
        },
        get_otp(&app, EXTENSION_TOKEN, MILAN_A)
    );

    assert_eq!(post.status(), StatusCode::OK);
    assert_eq!(body_text(get).await, "4242");
}

#[tokio::test(start_paused = true)]
async fn unlocatable_clients_share_the_fallback_channel() {
    let (app, _) = test_app();

    let (_, get) = tokio::join!(
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            post_otp(&app, PHONE_TOKEN, "9999", "203.0.113.1").await
        },
        get_otp(&app, EXTENSION_TOKEN, "198.51.100.1")
    );

    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(body_text(get).await, "9999");
}

// An OTP published with nobody listening is gone. A later GET must not
// receive it; the relay is not a queue.
#[tokio::test(start_paused = true)]
async fn unclaimed_otp_is_dropped_not_queued() {
    let (app, broker) = test_app();

    let post = post_otp(&app, PHONE_TOKEN, "111111", MILAN_A).await;
    assert_eq!(post.status(), StatusCode::OK);
    assert_eq!(broker.stats().channels, 0);

    let get = get_otp(&app, EXTENSION_TOKEN, MILAN_A).await;
    assert_eq!(get.status(), StatusCode::NO_CONTENT);
}

#[tokio::test(start_paused = true)]
async fn one_otp_reaches_every_waiting_extension() {
    let (app, _) = test_app();

    let (first, second, post) = tokio::join!(
        get_otp(&app, EXTENSION_TOKEN, MILAN_A),
        get_otp(&app, EXTENSION_TOKEN, MILAN_B),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            post_otp(&app, PHONE_TOKEN, "80808", MILAN_A).await
        }
    );

    assert_eq!(post.status(), StatusCode::OK);
    assert_eq!(body_text(first).await, "80808");
    assert_eq!(body_text(second).await, "80808");
}

// The phone may give up on its request while the server is still
// waiting for an extension. The accepted code must still go out.
#[tokio::test(start_paused = true)]
async fn phone_hanging_up_does_not_cancel_the_handover() {
    let (app, _) = test_app();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        post_otp(&app, PHONE_TOKEN, "777777", MILAN_A),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let get = get_otp(&app, EXTENSION_TOKEN, MILAN_A).await;

    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(body_text(get).await, "777777");
}

#[tokio::test(start_paused = true)]
async fn abandoned_get_releases_its_subscription() {
    let (app, broker) = test_app();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        get_otp(&app, EXTENSION_TOKEN, MILAN_A),
    )
    .await;

    assert!(abandoned.is_err());
    assert_eq!(broker.stats().subscriptions, 0);
    assert_eq!(broker.stats().channels, 0);
}

//
// ─────────────────────────────────────────────────────────────
// Auth and validation
// ─────────────────────────────────────────────────────────────
//

#[tokio::test]
async fn invalid_phone_token_is_unauthorized() {
    let (app, _) = test_app();

    let res = post_otp(&app, "invalid-token", "123456", MILAN_A).await;

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_str(&body_text(res).await).unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn invalid_extension_token_is_unauthorized() {
    let (app, _) = test_app();

    let res = get_otp(&app, "invalid-token", MILAN_A).await;

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn role_tokens_are_not_interchangeable() {
    let (app, _) = test_app();

    assert_eq!(
        post_otp(&app, EXTENSION_TOKEN, "123456", MILAN_A).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        get_otp(&app, PHONE_TOKEN, MILAN_A).await.status(),
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn missing_authorization_header_is_unauthorized() {
    let (app, _) = test_app();

    let res = get_path(&app, "/otp").await;

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_otp_is_bad_request() {
    let (app, broker) = test_app();

    for otp in ["123", "123456789", "12ab56"] {
        let res = post_otp(&app, PHONE_TOKEN, otp, MILAN_A).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "otp {otp:?}");
    }

    let res = post_raw(&app, PHONE_TOKEN, "not json".into(), MILAN_A).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(res).await, "Invalid OTP payload");

    assert_eq!(broker.stats().waiters, 0);
}

#[tokio::test]
async fn auth_is_checked_before_the_payload() {
    let (app, _) = test_app();

    let res = post_raw(&app, "invalid-token", "not json".into(), MILAN_A).await;

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

//
// ─────────────────────────────────────────────────────────────
// System routes
// ─────────────────────────────────────────────────────────────
//

#[tokio::test]
async fn system_routes_report_health_version_and_stats() {
    let (app, _) = test_app();

    let alive = get_path(&app, "/system/alive").await;
    assert_eq!(alive.status(), StatusCode::OK);
    assert_eq!(body_text(alive).await, "OK");

    let version: Value =
        serde_json::from_str(&body_text(get_path(&app, "/system/version").await).await).unwrap();
    assert_eq!(version["version"], "test");
    assert!(version["started_at"].is_string());

    let stats: Value =
        serde_json::from_str(&body_text(get_path(&app, "/system/stats").await).await).unwrap();
    assert_eq!(stats["channels"], 0);
    assert_eq!(stats["subscriptions"], 0);
    assert_eq!(stats["waiters"], 0);
}
