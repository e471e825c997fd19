//! Agent-local HTTP surface: `/request` and `/healthz`
//!
//! `/request` lets in-cluster callers send HTTP requests out through the
//! broker, the mirror image of the broker's own request endpoint.

use crate::client::Client;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Json;
use axum::Router;
use backhaul_connection::ProxyRequest;
use backhaul_proto::{RequestHead, DESTINATION_HEADER};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AgentState {
    pub client: Arc<Client>,
}

pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/request", any(request))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn request(State(state): State<AgentState>, request: Request) -> Response {
    if state.client.is_killed() {
        return kill_response();
    }

    let (parts, body) = request.into_parts();

    let Some(destination) = header_value(&parts.headers, DESTINATION_HEADER) else {
        return proxy_error(StatusCode::BAD_REQUEST, "missing x-proxy-destination header");
    };

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            return proxy_error(
                StatusCode::BAD_REQUEST,
                format!("unable to read request body: {err}"),
            )
        }
    };

    debug!(method = %parts.method, %destination, "Proxying request to broker");

    let head = RequestHead {
        method: parts.method.as_str().to_string(),
        url: destination,
        headers: forwardable_headers(&parts.headers),
        content_length: body.len() as i64,
    };

    let connection = match state.client.pool().acquire().await {
        Ok(connection) => connection,
        Err(err) => {
            return proxy_error(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("no tunnel capacity: {err}"),
            )
        }
    };

    match connection.proxy_request(ProxyRequest { head, body }).await {
        Ok(response) => tunnel_response(response),
        Err(err) => {
            warn!(error = %err, "Exchange failed, discarding connection");
            connection.close().await;
            proxy_error(StatusCode::BAD_GATEWAY, format!("exchange failed: {err}"))
        }
    }
}

async fn healthz(State(state): State<AgentState>) -> Response {
    if state.client.is_ready() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "backhaul agent not ready").into_response()
    }
}

/// Answer given to callers once the credential has been revoked: a
/// structured verdict rather than an opaque failure.
fn kill_response() -> Response {
    Json(json!({ "payload": { "killed": true } })).into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !name.eq_ignore_ascii_case(DESTINATION_HEADER)
                && !name.eq_ignore_ascii_case("host")
                && !is_hop_by_hop(name)
        })
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

fn tunnel_response(response: backhaul_connection::ProxyResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() =
        StatusCode::from_u16(response.head.status).unwrap_or(StatusCode::BAD_GATEWAY);

    for (name, value) in &response.head.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            out.headers_mut().append(name, value);
        }
    }

    out
}

fn proxy_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kill_response_shape() {
        let response = kill_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded["payload"]["killed"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_forwardable_headers_strips_destination() {
        let mut headers = HeaderMap::new();
        headers.insert(DESTINATION_HEADER, "http://x".parse().unwrap());
        headers.insert("x-trace-id", "t1".parse().unwrap());

        let forwarded = forwardable_headers(&headers);
        assert_eq!(forwarded, vec![("x-trace-id".to_string(), "t1".to_string())]);
    }
}
