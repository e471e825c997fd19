//! End-to-end round trips: agent pool ↔ broker ↔ external callers

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use backhaul_agent::{AgentConfig, AgentState, Client};
use backhaul_broker::{router, BrokerState, Registry, StaticAuthenticator};
use backhaul_pool::PoolConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn echo(request: Request) -> impl IntoResponse {
    let method = request.method().to_string();
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap();
    (StatusCode::OK, [("x-echo-method", method)], body)
}

async fn fail() -> impl IntoResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [("x-failure-mode", "intentional".to_string())],
        "upstream exploded",
    )
}

fn broker_state(registry: Arc<Registry>) -> BrokerState {
    BrokerState {
        registry,
        authenticator: Arc::new(StaticAuthenticator::default().with_peer("key-1", "peer-a")),
    }
}

fn agent_config(broker_addr: SocketAddr, secret: &str) -> AgentConfig {
    AgentConfig {
        broker_url: format!("ws://{broker_addr}/register"),
        pool_idle_size: 2,
        pool_max_size: 4,
        timeout_ms: 2000,
        replenish_interval_secs: 1,
        secret: Some(secret.to_string()),
        ..AgentConfig::default()
    }
}

/// Wait until the broker holds the expected connections for the peer.
async fn wait_for_registration(registry: &Arc<Registry>, peer_id: &str) {
    for _ in 0..100 {
        if let Some(pool) = registry.get(peer_id) {
            let counts = pool.counts();
            if counts.dispatchers >= 2 && counts.executors >= 2 {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("agent never fully registered with the broker");
}

#[tokio::test]
async fn test_external_request_reaches_private_upstream() {
    let upstream = serve(
        Router::new()
            .route("/echo", any(echo))
            .route("/fail", any(fail)),
    )
    .await;

    let registry = Registry::new(
        PoolConfig {
            acquire_timeout: Duration::from_secs(2),
            ..PoolConfig::default()
        },
        reqwest::Client::new(),
    );
    let broker_addr = serve(router(broker_state(registry.clone()))).await;

    let config = agent_config(broker_addr, "key-1");
    let client = Arc::new(Client::new(&config, config.credentials().unwrap()));
    client.start();

    wait_for_registration(&registry, "peer-a").await;

    let caller = reqwest::Client::new();

    // Happy path: body and headers survive byte-for-byte.
    let response = caller
        .post(format!("http://{broker_addr}/request"))
        .header("x-peer-id", "peer-a")
        .header("x-proxy-destination", format!("http://{upstream}/echo"))
        .body("ping-body")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("x-echo-method").unwrap(),
        "POST"
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"ping-body");

    // Upstream failure: the 500 and its headers cross the tunnel intact.
    let response = caller
        .get(format!("http://{broker_addr}/request"))
        .header("x-peer-id", "peer-a")
        .header("x-proxy-destination", format!("http://{upstream}/fail"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 500);
    assert_eq!(
        response.headers().get("x-failure-mode").unwrap(),
        "intentional"
    );
    assert_eq!(
        response.bytes().await.unwrap().as_ref(),
        b"upstream exploded"
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_agent_originated_request_through_broker() {
    let upstream = serve(Router::new().route("/echo", any(echo))).await;

    let registry = Registry::new(
        PoolConfig {
            acquire_timeout: Duration::from_secs(2),
            ..PoolConfig::default()
        },
        reqwest::Client::new(),
    );
    let broker_addr = serve(router(broker_state(registry.clone()))).await;

    let config = agent_config(broker_addr, "key-1");
    let client = Arc::new(Client::new(&config, config.credentials().unwrap()));
    client.start();

    wait_for_registration(&registry, "peer-a").await;

    // Local surface of the agent, as an in-cluster caller would see it.
    let agent_addr = serve(backhaul_agent::router(AgentState {
        client: client.clone(),
    }))
    .await;

    let caller = reqwest::Client::new();
    let response = caller
        .put(format!("http://{agent_addr}/request"))
        .header("x-proxy-destination", format!("http://{upstream}/echo"))
        .body("outbound")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers().get("x-echo-method").unwrap(), "PUT");
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"outbound");

    client.shutdown().await;
}

#[tokio::test]
async fn test_unknown_peer_gets_service_unavailable() {
    let registry = Registry::new(PoolConfig::default(), reqwest::Client::new());
    let broker_addr = serve(router(broker_state(registry))).await;

    let response = reqwest::Client::new()
        .get(format!("http://{broker_addr}/request"))
        .header("x-peer-id", "nobody")
        .header("x-proxy-destination", "http://127.0.0.1:9/x")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 503);
}

#[tokio::test]
async fn test_rejected_credential_stops_reconnection() {
    let registry = Registry::new(PoolConfig::default(), reqwest::Client::new());
    let broker_addr = serve(router(broker_state(registry.clone()))).await;

    let config = agent_config(broker_addr, "wrong-key");
    let client = Arc::new(Client::new(&config, config.credentials().unwrap()));
    client.start();

    for _ in 0..100 {
        if client.is_killed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(client.is_killed(), "agent should observe the rejection");
    assert!(client.pool().is_shut_down(), "pool should stop reconnecting");
    assert!(registry.get("peer-a").is_none());
}
