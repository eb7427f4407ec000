use async_trait::async_trait;
use http::{header, HeaderValue, Method, Response, StatusCode};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::time::Duration;

use crate::body::{self, ProxyBody};
use crate::connect::direct::dial_tcp;
use crate::connect::Target;
use crate::error::RelayError;
use crate::fetch::direct::{origin_client, round_trip};
use crate::listener::HttpHandler;
use crate::protocol::status::status_response;
use crate::protocol::{bind, TunnelCodec, CONNECT_HOST, TUNNEL_PROTOCOL};

/// Unwraps envelopes from local proxies and performs the real fetch or dial.
pub struct RelayServer {
    client: reqwest::Client,
    codec: TunnelCodec,
    dial_timeout: Duration,
}

impl RelayServer {
    pub fn new(codec: TunnelCodec, dial_timeout: Duration) -> Result<Self, RelayError> {
        let client =
            origin_client(dial_timeout).map_err(|e| RelayError::Upstream(e.to_string()))?;
        Ok(Self {
            client,
            codec,
            dial_timeout,
        })
    }

    /// Decodes the envelope, fetches from the origin and wraps the result.
    /// Only a fetch that produced no response at all becomes a `504`.
    pub async fn serve_fetch(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, RelayError> {
        let inner = self.codec.unmarshal_request(req).await?;
        let method = inner.method().clone();
        let url = inner.uri().to_string();

        let resp = round_trip(&self.client, inner.map(body::full))
            .await
            .map_err(|e| RelayError::Upstream(e.to_string()))?;
        tracing::info!(%method, %url, status = resp.status().as_u16(), "Relayed fetch");

        Ok(self.codec.marshal_response(resp)?)
    }

    /// Dials `Connect-Host` and, once the client has switched protocols,
    /// binds the two streams.
    pub async fn serve_connect(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, RelayError> {
        let target = req
            .headers()
            .get(CONNECT_HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(RelayError::MissingConnectHost)?;
        let target = Target::parse(target)?.addr();

        let upstream = dial_tcp(&target, self.dial_timeout).await?;
        tracing::info!(%target, "Relayed tunnel");

        let upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = bind(TokioIo::new(upgraded), upstream).await {
                        tracing::debug!(%target, error = %e, "Relayed tunnel ended with error");
                    }
                }
                Err(e) => tracing::warn!(%target, error = %e, "Tunnel upgrade failed"),
            }
        });

        let mut resp = Response::new(body::empty());
        *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        resp.headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        resp.headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static(TUNNEL_PROTOCOL));
        Ok(resp)
    }
}

fn wants_tunnel<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(TUNNEL_PROTOCOL))
}

#[async_trait]
impl HttpHandler for RelayServer {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let result = match *req.method() {
            Method::GET if req.uri().path() == "/health" => {
                return status_response(StatusCode::OK, "ok")
            }
            Method::GET if wants_tunnel(&req) && req.uri().path().ends_with("/c") => {
                self.serve_connect(req).await
            }
            Method::POST => self.serve_fetch(req).await,
            _ => return status_response(StatusCode::NOT_FOUND, "unknown relay endpoint"),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Relay request failed");
            status_response(e.status(), e.to_string())
        })
    }
}
