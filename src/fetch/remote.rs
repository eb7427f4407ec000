use async_trait::async_trait;
use http::{Request, Response, StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;

use super::Fetcher;
use crate::body::{self, ProxyBody};
use crate::error::FetchError;
use crate::metrics::{FetchTimer, Metrics, Route};
use crate::protocol::TunnelCodec;

/// Fetches through the relay's fetch endpoint.
pub struct RemoteFetcher {
    client: reqwest::Client,
    endpoint: Uri,
    codec: TunnelCodec,
    metrics: Arc<Metrics>,
}

impl RemoteFetcher {
    pub fn new(
        endpoint: Uri,
        codec: TunnelCodec,
        connect_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            codec,
            metrics,
        })
    }
}

#[async_trait]
impl Fetcher for RemoteFetcher {
    async fn fetch(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, FetchError> {
        let method = req.method().clone();
        let url = req.uri().to_string();
        let timer = FetchTimer::new(self.metrics.clone());
        tracing::info!(%url, "Fetching through relay");

        let envelope = self.codec.marshal_request(req, &self.endpoint).await?;
        let (parts, payload) = envelope.into_parts();
        let resp = self
            .client
            .request(parts.method, self.endpoint.to_string())
            .headers(parts.headers)
            .body(payload)
            .send()
            .await
            .map_err(|e| FetchError::Relay(e.to_string()))?;

        if resp.status() != StatusCode::OK {
            tracing::warn!(%url, status = resp.status().as_u16(), "Relay refused request");
            return Ok(Response::from(resp).map(body::boxed));
        }

        let decoded = self
            .codec
            .unmarshal_response(Response::from(resp), &method)
            .await?;
        timer.finish(Route::Remote);
        Ok(decoded)
    }
}
