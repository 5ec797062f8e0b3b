//! Proxy tap integration tests
//!
//! wiremock plays the console backend. Requests travel through the router's
//! fallback proxy; the assertions check both halves of the tap contract: the
//! exchange is relayed unmodified, and the correlator stores are populated
//! (or left alone) as a side effect.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tracelens_core::config::{
    HttpConfig, LlmConfig, ServiceConfig, TracelensConfig, UpstreamConfig,
};
use tracelens_server::http::{build_router, HttpState};

fn make_state(upstream_url: &str) -> Arc<HttpState> {
    let config = TracelensConfig {
        service: ServiceConfig {
            log_level: "info".to_string(),
        },
        upstream: UpstreamConfig {
            base_url: upstream_url.to_string(),
            detail_path: "/api/trace/detail".to_string(),
            search_path: "/api/trace/search".to_string(),
            timeout_seconds: 5,
        },
        llm: LlmConfig {
            endpoint: "https://llm.example".to_string(),
            model: "qwen3-32b".to_string(),
            api_key: "test-key".to_string(),
            enable_thinking: false,
            temperature: 0.7,
            top_p: 0.8,
            frequency_penalty: 0.0,
            timeout_seconds: 5,
        },
        http: HttpConfig::default(),
    };
    HttpState::from_config(config).expect("state")
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8")
}

// ===========================================================================
// TEST 1: detail exchange is relayed verbatim and captured by guid
// ===========================================================================
#[tokio::test]
async fn test_detail_exchange_relayed_and_captured() {
    let upstream = MockServer::start().await;
    let record = json!({ "data": [{ "appName": "svc", "result": 0 }] });

    Mock::given(method("POST"))
        .and(path("/api/trace/detail"))
        .and(body_json(json!({ "condition": { "guid": "g1" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(&record))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = make_state(&upstream.uri());
    let app = build_router(state.clone());

    let resp = app
        .oneshot(post_json(
            "/api/trace/detail",
            &json!({ "condition": { "guid": "g1" } }),
        ))
        .await
        .expect("response");

    assert_eq!(resp.status(), StatusCode::OK);
    let relayed = body_string(resp).await;
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&relayed).expect("json"),
        record,
        "proxied body must be the upstream body"
    );

    let captured = state.correlator.lookup("g1").expect("captured record");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&captured).expect("json"),
        record
    );
}

// ===========================================================================
// TEST 2: search exchange populates the category index
// ===========================================================================
#[tokio::test]
async fn test_search_exchange_populates_categories() {
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/trace/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "idInfo": { "guid": "g1" }, "layers": { "ProductType": "Flight, Hotel" } },
                { "idInfo": { "guid": "g2" }, "layers": { "ProductType": "Train" } }
            ]
        })))
        .mount(&upstream)
        .await;

    let state = make_state(&upstream.uri());
    let app = build_router(state.clone());

    let resp = app
        .oneshot(post_json("/api/trace/search", &json!({ "pageIndex": 1 })))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(state.correlator.categories_for("g1"), vec!["Flight", "Hotel"]);
    assert_eq!(state.correlator.categories_for("g2"), vec!["Train"]);
}

// ===========================================================================
// TEST 3: non-200 upstream response is relayed but never captured
// ===========================================================================
#[tokio::test]
async fn test_failed_upstream_response_not_captured() {
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/trace/detail"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend exploded"))
        .mount(&upstream)
        .await;

    let state = make_state(&upstream.uri());
    let app = build_router(state.clone());

    let resp = app
        .oneshot(post_json(
            "/api/trace/detail",
            &json!({ "condition": { "guid": "g1" } }),
        ))
        .await
        .expect("response");

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(resp).await, "backend exploded");
    assert!(state.correlator.lookup("g1").is_none());
}

// ===========================================================================
// TEST 4: malformed detail request body is relayed, capture silently skipped
// ===========================================================================
#[tokio::test]
async fn test_malformed_detail_request_still_proxied() {
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/trace/detail"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = make_state(&upstream.uri());
    let app = build_router(state.clone());

    let req = Request::builder()
        .method("POST")
        .uri("/api/trace/detail")
        .header("content-type", "application/json")
        .body(Body::from("{this is not json"))
        .expect("request");

    let resp = app.oneshot(req).await.expect("response");
    assert_eq!(resp.status(), StatusCode::OK, "capture must not affect the exchange");
    assert_eq!(body_string(resp).await, "ok");
    assert!(state.correlator.chain_keys().is_empty());
}

// ===========================================================================
// TEST 5: unrelated paths pass through without touching the stores
// ===========================================================================
#[tokio::test]
async fn test_unrelated_path_passthrough() {
    let upstream = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/behavior/onextrace"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>console</html>"))
        .mount(&upstream)
        .await;

    let state = make_state(&upstream.uri());
    let app = build_router(state.clone());

    let req = Request::builder()
        .method("GET")
        .uri("/behavior/onextrace")
        .body(Body::empty())
        .expect("request");

    let resp = app.oneshot(req).await.expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "<html>console</html>");
    assert!(state.correlator.chain_keys().is_empty());
}

// ===========================================================================
// TEST 6: unreachable upstream surfaces as 502
// ===========================================================================
#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    // Port 9 (discard) is never listening.
    let state = make_state("http://127.0.0.1:9");
    let app = build_router(state);

    let resp = app
        .oneshot(post_json(
            "/api/trace/detail",
            &json!({ "condition": { "guid": "g1" } }),
        ))
        .await
        .expect("response");

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

// ===========================================================================
// TEST 7: re-captured key is last-write-wins through the proxy
// ===========================================================================
#[tokio::test]
async fn test_recapture_is_last_write_wins() {
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/trace/detail"))
        .respond_with(ResponseTemplate::new(200).set_body_string("first"))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/trace/detail"))
        .respond_with(ResponseTemplate::new(200).set_body_string("second"))
        .mount(&upstream)
        .await;

    let state = make_state(&upstream.uri());
    let body = json!({ "condition": { "guid": "g1" } });

    let app = build_router(state.clone());
    app.oneshot(post_json("/api/trace/detail", &body))
        .await
        .expect("response");

    let app = build_router(state.clone());
    app.oneshot(post_json("/api/trace/detail", &body))
        .await
        .expect("response");

    assert_eq!(state.correlator.lookup("g1").as_deref(), Some("second"));
}
