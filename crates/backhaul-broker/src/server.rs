//! Broker HTTP surface: `/register`, `/request`, `/status`

use crate::auth::{AuthError, PeerAuthenticator};
use crate::registry::Registry;
use crate::reporter::PeerStatus;
use crate::ws::WsServerTransport;
use axum::body::Body;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Json;
use axum::Router;
use backhaul_connection::{ProxyRequest, Transport};
use backhaul_proto::{
    Frame, Handshake, RequestHead, DESTINATION_HEADER, PEER_ID_HEADER, PEER_KEY_HEADER,
    UNAUTHORIZED_PEER_STATUS,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct BrokerState {
    pub registry: Arc<Registry>,
    pub authenticator: Arc<dyn PeerAuthenticator>,
}

pub fn router(state: BrokerState) -> Router {
    Router::new()
        .route("/register", get(register))
        .route("/request", any(request))
        .route("/status", get(status))
        .route("/status/{peer_id}", get(peer_status))
        .with_state(state)
}

/// Upgrade an agent's HTTP request to a tunnel connection. The credential
/// is validated before the upgrade; the peer identity comes from the
/// validation result.
async fn register(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = headers
        .get(PEER_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match state.authenticator.authenticate(&credential).await {
        Ok(peer_id) => {
            ws.on_upgrade(move |socket| register_connection(socket, peer_id, state))
        }
        Err(AuthError::Unauthorized) => {
            warn!("Rejected registration: credential invalid or revoked");
            proxy_error(
                StatusCode::from_u16(UNAUTHORIZED_PEER_STATUS)
                    .unwrap_or(StatusCode::FORBIDDEN),
                "credential invalid or revoked",
            )
        }
        Err(AuthError::Unavailable(reason)) => {
            warn!(%reason, "Credential validation unavailable");
            proxy_error(StatusCode::INTERNAL_SERVER_ERROR, "unable to validate credential")
        }
    }
}

async fn register_connection(socket: WebSocket, peer_id: String, state: BrokerState) {
    let transport: Arc<dyn Transport> = Arc::new(WsServerTransport::new(socket));

    let greeting = match tokio::time::timeout(HANDSHAKE_TIMEOUT, transport.recv()).await {
        Ok(Ok(Some(Frame::Text(text)))) => text,
        other => {
            warn!(%peer_id, ?other, "No handshake on new tunnel connection");
            transport.close().await;
            return;
        }
    };

    let handshake: Handshake = match greeting.parse() {
        Ok(handshake) => handshake,
        Err(err) => {
            warn!(%peer_id, error = %err, "Malformed handshake");
            transport.close().await;
            return;
        }
    };

    state.registry.register(&peer_id, handshake, transport);
}

/// Forward one external HTTP request through an idle tunnel connection of
/// the destination peer.
async fn request(State(state): State<BrokerState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let Some(destination) = header_value(&parts.headers, DESTINATION_HEADER) else {
        return proxy_error(StatusCode::BAD_REQUEST, "missing x-proxy-destination header");
    };
    let Some(peer_id) = header_value(&parts.headers, PEER_ID_HEADER) else {
        return proxy_error(StatusCode::BAD_REQUEST, "missing x-peer-id header");
    };

    let Some(pool) = state.registry.get(&peer_id) else {
        return proxy_error(StatusCode::SERVICE_UNAVAILABLE, "peer is not connected");
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

    debug!(%peer_id, method = %parts.method, %destination, "Proxying request");

    let head = RequestHead {
        method: parts.method.as_str().to_string(),
        url: destination,
        headers: forwardable_headers(&parts.headers),
        content_length: body.len() as i64,
    };

    let connection = match pool.acquire().await {
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
            // Partial protocol state: discard the connection.
            warn!(%peer_id, error = %err, "Exchange failed, discarding connection");
            connection.close().await;
            proxy_error(StatusCode::BAD_GATEWAY, format!("exchange failed: {err}"))
        }
    }
}

async fn status() -> &'static str {
    "ok"
}

async fn peer_status(
    State(state): State<BrokerState>,
    Path(peer_id): Path<String>,
) -> Json<PeerStatus> {
    let is_active = state.registry.peer_is_active(&peer_id).await;
    Json(PeerStatus { peer_id, is_active })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Headers worth carrying through the tunnel: everything except routing
/// headers, the host (the destination URL decides it) and hop-by-hop
/// headers.
fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !name.eq_ignore_ascii_case(DESTINATION_HEADER)
                && !name.eq_ignore_ascii_case(PEER_ID_HEADER)
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

/// Turn a tunnel response back into an HTTP response for the caller.
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
    use backhaul_proto::ResponseHead;
    use bytes::Bytes;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("content-length"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-request-id"));
    }

    #[test]
    fn test_forwardable_headers_strips_routing() {
        let mut headers = HeaderMap::new();
        headers.insert(DESTINATION_HEADER, "http://x".parse().unwrap());
        headers.insert(PEER_ID_HEADER, "peer-a".parse().unwrap());
        headers.insert("host", "broker.example.com".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());

        let forwarded = forwardable_headers(&headers);
        assert_eq!(forwarded, vec![("x-request-id".to_string(), "abc".to_string())]);
    }

    #[test]
    fn test_tunnel_response_maps_status_and_headers() {
        let response = backhaul_connection::ProxyResponse {
            head: ResponseHead {
                status: 503,
                headers: vec![
                    ("x-upstream".to_string(), "yes".to_string()),
                    ("transfer-encoding".to_string(), "chunked".to_string()),
                ],
                content_length: 2,
            },
            body: Bytes::from_static(b"no"),
        };

        let out = tunnel_response(response);
        assert_eq!(out.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(out.headers().get("x-upstream").unwrap(), "yes");
        assert!(out.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn test_tunnel_response_bad_status_maps_to_bad_gateway() {
        let response = backhaul_connection::ProxyResponse {
            head: ResponseHead {
                status: 9999,
                headers: Vec::new(),
                content_length: 0,
            },
            body: Bytes::new(),
        };

        let out = tunnel_response(response);
        assert_eq!(out.status(), StatusCode::BAD_GATEWAY);
    }
}
