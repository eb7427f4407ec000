mod common;

use bytes::Bytes;
use egress::body;
use egress::connect::{Dialer, RelayDialer};
use egress::error::ConnectError;
use egress::fetch::{Fetcher, RemoteFetcher};
use egress::metrics::Metrics;
use egress::protocol::{transform, TunnelCodec};
use egress::relay::{RelayEndpoints, RelayServer};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{closed_port, spawn, spawn_echo, Origin};

const TIMEOUT: Duration = Duration::from_secs(5);

fn codec(secret: Option<&str>) -> TunnelCodec {
    TunnelCodec::new(transform::from_secret(secret))
}

async fn spawn_relay(secret: Option<&str>) -> (RelayEndpoints, tokio::sync::broadcast::Sender<()>) {
    let relay = RelayServer::new(codec(secret), TIMEOUT).unwrap();
    let (addr, shutdown) = spawn(relay).await;
    let endpoints = RelayEndpoints::from_base(&format!("http://{addr}")).unwrap();
    (endpoints, shutdown)
}

fn remote_fetcher(endpoints: &RelayEndpoints, secret: Option<&str>) -> RemoteFetcher {
    let metrics = Arc::new(Metrics::new().unwrap());
    RemoteFetcher::new(endpoints.fetch.clone(), codec(secret), TIMEOUT, metrics).unwrap()
}

#[tokio::test]
async fn test_fetch_through_relay() {
    let (origin, _origin_shutdown) = spawn(Origin).await;
    let (endpoints, _relay_shutdown) = spawn_relay(None).await;
    let fetcher = remote_fetcher(&endpoints, None);

    let req = Request::get(format!("http://{origin}/hello"))
        .body(body::empty())
        .unwrap();
    let resp = fetcher.fetch(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-origin"], "yes");
    let page = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(page, Bytes::from_static(b"hello from origin"));
}

#[tokio::test]
async fn test_post_body_survives_keyed_relay() {
    let (origin, _origin_shutdown) = spawn(Origin).await;
    let (endpoints, _relay_shutdown) = spawn_relay(Some("shared secret")).await;
    let fetcher = remote_fetcher(&endpoints, Some("shared secret"));

    let req = Request::post(format!("http://{origin}/echo"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body::full("ping=pong&n=1"))
        .unwrap();
    let resp = fetcher.fetch(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let echoed = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(echoed, Bytes::from_static(b"ping=pong&n=1"));
}

#[tokio::test]
async fn test_mismatched_secret_returns_relay_status() {
    let (origin, _origin_shutdown) = spawn(Origin).await;
    let (endpoints, _relay_shutdown) = spawn_relay(Some("relay side")).await;
    let fetcher = remote_fetcher(&endpoints, Some("client side"));

    let req = Request::get(format!("http://{origin}/hello"))
        .body(body::empty())
        .unwrap();
    let resp = fetcher.fetch(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unreachable_origin_is_gateway_timeout() {
    let dead = closed_port().await;
    let (endpoints, _relay_shutdown) = spawn_relay(None).await;
    let fetcher = remote_fetcher(&endpoints, None);

    let req = Request::get(format!("http://{dead}/"))
        .body(body::empty())
        .unwrap();
    let resp = fetcher.fetch(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_tunnel_through_relay() {
    let echo = spawn_echo().await;
    let (endpoints, _relay_shutdown) = spawn_relay(None).await;
    let dialer = RelayDialer::new(endpoints.connect.clone(), TIMEOUT).unwrap();

    let mut tunnel = dialer.dial(&echo.to_string()).await.unwrap();
    tunnel.write_all(b"hello tunnel").await.unwrap();
    let mut reply = [0u8; 12];
    tunnel.read_exact(&mut reply).await.unwrap();

    assert_eq!(&reply, b"hello tunnel");
}

#[tokio::test]
async fn test_tunnel_to_closed_port_is_refused() {
    let dead = closed_port().await;
    let (endpoints, _relay_shutdown) = spawn_relay(None).await;
    let dialer = RelayDialer::new(endpoints.connect.clone(), TIMEOUT).unwrap();

    let err = match dialer.dial(&dead.to_string()).await {
        Err(e) => e,
        Ok(_) => panic!("tunnel to a closed port opened"),
    };
    assert!(matches!(err, ConnectError::Relay(_)));
}

#[tokio::test]
async fn test_relay_rejects_tunnel_without_target() {
    let (endpoints, _relay_shutdown) = spawn_relay(None).await;

    let resp = common::client()
        .get(endpoints.connect.to_string())
        .header("connection", "upgrade")
        .header("upgrade", "egress-tunnel")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_relay_health() {
    let (endpoints, _relay_shutdown) = spawn_relay(None).await;
    let health = format!(
        "http://{}/health",
        endpoints.fetch.authority().unwrap()
    );

    let resp = common::client().get(health).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");
}
