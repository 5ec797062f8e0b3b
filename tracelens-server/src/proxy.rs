//! Transport tap — observing reverse proxy in front of the console backend
//!
//! Every request that no API route claims is forwarded verbatim to the
//! configured upstream and the upstream's response is returned unmodified.
//! After the exchange completes, the request/response pair is handed to the
//! `ExchangeObserver` as a post-receive hook. The tap is best-effort: it
//! never alters, delays, or fails the proxied exchange.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use tracelens_core::{ExchangeObserver, ObservedExchange};

use crate::http::HttpState;

/// Upper bound on buffered request bodies; the console's queries are small.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub async fn proxy_handler(State(state): State<Arc<HttpState>>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();

    let request_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Failed to read request body: {e}"),
            )
                .into_response();
        }
    };

    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let url = format!("{}{}", state.config.upstream.base_url, path_and_query);

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return (StatusCode::METHOD_NOT_ALLOWED, "Unsupported method").into_response();
        }
    };

    let mut upstream_request = state.upstream.request(method, url.as_str());
    if let Some(content_type) = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        upstream_request = upstream_request.header("Content-Type", content_type);
    }

    let upstream_response = match upstream_request.body(request_bytes.to_vec()).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(url = %url, error = %e, "Upstream request failed");
            return (
                StatusCode::BAD_GATEWAY,
                format!("Upstream request failed: {e}"),
            )
                .into_response();
        }
    };

    let status = upstream_response.status().as_u16();
    let content_type = upstream_response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let response_body = match upstream_response.text().await {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(url = %url, error = %e, "Failed to read upstream response body");
            return (
                StatusCode::BAD_GATEWAY,
                format!("Failed to read upstream response: {e}"),
            )
                .into_response();
        }
    };

    // Post-receive hook. Parse failures inside the observer are its own
    // concern; nothing here may affect the response below.
    state.observer.on_exchange(&ObservedExchange {
        path,
        request_body: String::from_utf8_lossy(&request_bytes).into_owned(),
        status,
        response_body: response_body.clone(),
    });

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, [(header::CONTENT_TYPE, content_type)], response_body).into_response()
}
