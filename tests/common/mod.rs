//! Loopback servers shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use egress::body::{self, ProxyBody};
use egress::listener::{serve, HttpHandler};
use http::{Method, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Request;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Serves `handler` on an ephemeral port. Dropping the sender stops the
/// listener, so keep it alive for the duration of the test.
pub async fn spawn<H: HttpHandler>(handler: H) -> (SocketAddr, broadcast::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(serve(listener, Arc::new(handler), rx));
    (addr, tx)
}

/// Client that ignores proxy settings from the environment.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// `GET /hello` answers a greeting; `POST /echo` answers the request body.
pub struct Origin;

#[async_trait]
impl HttpHandler for Origin {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match (req.method().clone(), req.uri().path()) {
            (Method::GET, "/hello") => Response::builder()
                .header("x-origin", "yes")
                .body(body::full("hello from origin"))
                .unwrap(),
            (Method::POST, "/echo") => {
                let payload = req.into_body().collect().await.unwrap().to_bytes();
                Response::new(body::full(payload))
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(body::empty())
                .unwrap(),
        }
    }
}

/// Plain TCP echo server.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A loopback port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Reads a response head byte by byte, leaving the tunnel bytes unread.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed inside response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}
