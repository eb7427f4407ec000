use async_trait::async_trait;
use http::{header, Request, Response};
use std::sync::Arc;
use std::time::Duration;

use super::Fetcher;
use crate::body::{self, ProxyBody, SyncBody};
use crate::error::FetchError;
use crate::metrics::{FetchTimer, Metrics, Route};
use crate::protocol::wire;

/// HTTP client for origin requests: no redirects, no cookies, no
/// environment proxy.
pub fn origin_client(connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .connect_timeout(connect_timeout)
        .build()
}

/// Sends `req` to the origin named in its absolute URI and hands back the
/// response as-is, minus hop-by-hop headers.
pub async fn round_trip(
    client: &reqwest::Client,
    req: Request<ProxyBody>,
) -> Result<Response<ProxyBody>, reqwest::Error> {
    let (mut parts, payload) = req.into_parts();
    wire::strip_hop_by_hop(&mut parts.headers);
    parts.headers.remove(header::HOST);

    let resp = client
        .request(parts.method, parts.uri.to_string())
        .headers(parts.headers)
        .body(reqwest::Body::wrap(SyncBody::new(payload)))
        .send()
        .await?;

    let mut resp = Response::from(resp);
    wire::strip_hop_by_hop(resp.headers_mut());
    Ok(resp.map(body::boxed))
}

pub struct DirectFetcher {
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl DirectFetcher {
    pub fn new(connect_timeout: Duration, metrics: Arc<Metrics>) -> Result<Self, FetchError> {
        let client = origin_client(connect_timeout).map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client, metrics })
    }
}

#[async_trait]
impl Fetcher for DirectFetcher {
    async fn fetch(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, FetchError> {
        let url = req.uri().to_string();
        let timer = FetchTimer::new(self.metrics.clone());
        match round_trip(&self.client, req).await {
            Ok(resp) => {
                tracing::debug!(%url, status = resp.status().as_u16(), "Direct fetch");
                timer.finish(Route::Direct);
                Ok(resp)
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, "Direct fetch failed");
                Err(FetchError::Direct(e.to_string()))
            }
        }
    }
}
