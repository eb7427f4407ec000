use async_trait::async_trait;
use http::{Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex};
use tokio_rustls::TlsAcceptor;

use super::{ClientTunnel, Connector, Target};
use crate::body::{self, ProxyBody};
use crate::error::{ConnectError, FetchError};
use crate::fetch::Fetcher;
use crate::metrics::{Metrics, Route, TunnelGuard};
use crate::protocol::status::{gateway_timeout, status_response};
use crate::tls::{CertAuthority, CertError};

/// Terminates the client's TLS with a forged leaf and serves the single
/// request inside through a [`Fetcher`].
pub struct InterceptConnector {
    authority: Arc<CertAuthority>,
    fetcher: Arc<dyn Fetcher>,
    metrics: Arc<Metrics>,
}

impl InterceptConnector {
    pub fn new(
        authority: Arc<CertAuthority>,
        fetcher: Arc<dyn Fetcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            authority,
            fetcher,
            metrics,
        }
    }
}

#[async_trait]
impl Connector for InterceptConnector {
    async fn connect(&self, target: &str, client: ClientTunnel) -> Result<(), ConnectError> {
        let target = Target::parse(target)?;
        let record = {
            let authority = self.authority.clone();
            let host = target.host.clone();
            tokio::task::spawn_blocking(move || authority.get(&host))
                .await
                .map_err(|e| CertError::Generation(e.to_string()))??
        };

        let client = client.establish().await?;
        self.metrics.record_intercept();
        self.metrics.record_connect(Route::Intercept);
        let _active = TunnelGuard::new(self.metrics.clone());

        let tls = TlsAcceptor::from(record.server_config.clone())
            .accept(client)
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        tracing::debug!(%target, "Client TLS accepted");

        let failure: Arc<Mutex<Option<FetchError>>> = Arc::new(Mutex::new(None));
        let service = {
            let fetcher = self.fetcher.clone();
            let origin = target.addr();
            let failure = failure.clone();
            service_fn(move |req: Request<Incoming>| {
                let fetcher = fetcher.clone();
                let origin = origin.clone();
                let failure = failure.clone();
                async move { Ok::<_, Infallible>(serve_one(fetcher, &origin, req, failure).await) }
            })
        };

        let served = http1::Builder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(tls), service)
            .await;
        if let Err(e) = served {
            if !is_benign(&e) {
                return Err(ConnectError::Http(e.to_string()));
            }
            tracing::trace!(%target, error = %e, "Intercepted connection ended early");
        }

        let failed = match failure.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match failed {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

async fn serve_one(
    fetcher: Arc<dyn Fetcher>,
    origin: &str,
    req: Request<Incoming>,
    failure: Arc<Mutex<Option<FetchError>>>,
) -> Response<ProxyBody> {
    let (mut parts, incoming) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = match format!("https://{origin}{path}").parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => return status_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    tracing::info!(uri = %parts.uri, method = %parts.method, "Intercepted request");

    match fetcher
        .fetch(Request::from_parts(parts, body::boxed(incoming)))
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(%origin, error = %e, "Intercepted fetch failed");
            match failure.lock() {
                Ok(mut slot) => *slot = Some(e),
                Err(poisoned) => *poisoned.into_inner() = Some(e),
            }
            gateway_timeout()
        }
    }
}

/// Clients routinely hang up without finishing; those are not errors.
fn is_benign(e: &hyper::Error) -> bool {
    if e.is_incomplete_message() || e.is_closed() || e.is_canceled() {
        return true;
    }
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            );
        }
        source = inner.source();
    }
    false
}
