//! Plain request/response strategies for ordinary (non-CONNECT) proxy
//! requests.

pub mod direct;
pub mod remote;
pub mod smart;

use async_trait::async_trait;
use http::request::Parts;
use http::{header, Request, Response};
use std::sync::Arc;

use crate::body::ProxyBody;
use crate::config::FetchMode;
use crate::error::FetchError;
use crate::routing::RoutingPolicy;

pub use direct::DirectFetcher;
pub use remote::RemoteFetcher;
pub use smart::SmartFetcher;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, FetchError>;
}

/// Bare host a request is addressed to: the URI host, or the `Host` header
/// without its port.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.trim_start_matches('[').trim_end_matches(']').to_string());
    }
    let value = req.headers().get(header::HOST)?.to_str().ok()?;
    let authority: http::uri::Authority = value.parse().ok()?;
    Some(
        authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string(),
    )
}

/// Copy of a request head. Extensions are not carried over.
pub(crate) fn clone_head(parts: &Parts) -> Parts {
    let mut req = Request::new(());
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = parts.uri.clone();
    *req.version_mut() = parts.version;
    *req.headers_mut() = parts.headers.clone();
    req.into_parts().0
}

/// Picks the fetcher for `mode`.
pub fn build(
    mode: FetchMode,
    direct: Arc<DirectFetcher>,
    remote: Arc<RemoteFetcher>,
    policy: Arc<RoutingPolicy>,
    replay_limit: usize,
) -> Arc<dyn Fetcher> {
    match mode {
        FetchMode::Direct => {
            tracing::info!("Fetching directly only");
            direct
        }
        FetchMode::Remote => {
            tracing::info!("Fetching through the relay only");
            remote
        }
        FetchMode::Smart => Arc::new(SmartFetcher::new(direct, remote, policy, replay_limit)),
    }
}
