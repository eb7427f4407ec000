use async_trait::async_trait;
use http::{header, HeaderValue, Method, Response, StatusCode};
use hyper::body::Incoming;
use hyper::Request;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::body::{self, ProxyBody};
use crate::connect::{ClientTunnel, Connector, Target};
use crate::fetch::Fetcher;
use crate::listener::HttpHandler;
use crate::metrics::Metrics;
use crate::protocol::status::{gateway_timeout, status_response};

pub struct LocalProxy {
    fetcher: Arc<dyn Fetcher>,
    connector: Arc<dyn Connector>,
    metrics: Arc<Metrics>,
}

impl LocalProxy {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        connector: Arc<dyn Connector>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            fetcher,
            connector,
            metrics,
        }
    }

    async fn tunnel(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let authority = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => req.uri().to_string(),
        };
        let target = match Target::parse(&authority) {
            Ok(target) => target.addr(),
            Err(e) => return status_response(e.status(), e.to_string()),
        };
        tracing::debug!(%target, "CONNECT");

        let (respond, established) = oneshot::channel();
        let client = ClientTunnel::Pending {
            respond,
            upgrade: hyper::upgrade::on(&mut req),
        };
        let connector = self.connector.clone();
        tokio::spawn(async move {
            if let Err(e) = connector.connect(&target, client).await {
                tracing::warn!(%target, error = %e, "Tunnel failed");
            }
        });

        // The connector answers once its upstream is ready; dropping the
        // sender means it gave up first.
        match established.await {
            Ok(resp) => resp,
            Err(_) => gateway_timeout(),
        }
    }

    async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let url = req.uri().to_string();
        match self.fetcher.fetch(req.map(body::boxed)).await {
            Ok(resp) => {
                tracing::info!(%method, %url, status = resp.status().as_u16(), "Proxied");
                resp
            }
            Err(e) => {
                tracing::warn!(%method, %url, error = %e, "Fetch failed");
                status_response(e.status(), e.to_string())
            }
        }
    }

    fn serve_local(&self, req: &Request<Incoming>) -> Response<ProxyBody> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/health") => status_response(StatusCode::OK, "ok"),
            (&Method::GET, "/metrics") => match self.metrics.render() {
                Ok(text) => {
                    let mut resp = status_response(StatusCode::OK, text);
                    resp.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    resp
                }
                Err(e) => status_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            _ => status_response(StatusCode::NOT_FOUND, "not a proxy request"),
        }
    }
}

#[async_trait]
impl HttpHandler for LocalProxy {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.tunnel(req).await;
        }
        if req.uri().scheme().is_none() {
            return self.serve_local(&req);
        }
        self.forward(req).await
    }
}
