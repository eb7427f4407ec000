//! Accept loop shared by the local proxy and the relay.

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::body::ProxyBody;

/// Answers one request. Failures are turned into responses by the handler;
/// nothing escapes to the connection.
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody>;
}

/// Serves HTTP/1 connections with upgrades enabled until `shutdown` fires.
/// Connections already accepted keep running.
pub async fn serve<H: HttpHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(%local, "Listening");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(%local, error = %e, "Accept failed");
                    continue;
                }
            },
            _ = shutdown.recv() => {
                tracing::info!(%local, "Listener stopping");
                return Ok(());
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.handle(req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                tracing::debug!(%peer, error = %e, "Connection ended with error");
            }
        });
    }
}
