//! CONNECT tunnel strategies.
//!
//! A [`Connector`] receives the CONNECT target and the client side of the
//! tunnel. Until it calls [`ClientTunnel::establish`] the client has not been
//! told anything, so a connector that fails early leaves the proxy free to
//! answer with an error status instead.

pub mod direct;
pub mod intercept;
pub mod remote;
pub mod smart;

use async_trait::async_trait;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::body::{self, ProxyBody};
use crate::config::ConnectMode;
use crate::error::ConnectError;
use crate::fetch::Fetcher;
use crate::metrics::{Metrics, Route, TunnelGuard};
use crate::protocol::{bind, status::OK_200};
use crate::routing::RoutingPolicy;
use crate::tls::{CertAuthority, CertError};

pub use direct::TcpDialer;
pub use intercept::InterceptConnector;
pub use remote::RelayDialer;
pub use smart::SmartConnector;

pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

/// Opens a raw byte stream to a `host:port` target.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &str) -> Result<BoxedIo, ConnectError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &str, client: ClientTunnel) -> Result<(), ConnectError>;
}

/// The client end of a CONNECT.
pub enum ClientTunnel {
    /// A raw stream whose CONNECT request has already been consumed.
    Raw(BoxedIo),
    /// A hyper CONNECT request still waiting for its response.
    Pending {
        respond: oneshot::Sender<http::Response<ProxyBody>>,
        upgrade: OnUpgrade,
    },
}

impl ClientTunnel {
    /// Tells the client the tunnel is up and returns the client stream.
    pub async fn establish(self) -> Result<BoxedIo, ConnectError> {
        match self {
            ClientTunnel::Raw(mut io) => {
                io.write_all(OK_200).await?;
                io.flush().await?;
                Ok(io)
            }
            ClientTunnel::Pending { respond, upgrade } => {
                respond
                    .send(http::Response::new(body::empty()))
                    .map_err(|_| ConnectError::Upgrade("client went away".into()))?;
                let upgraded = upgrade
                    .await
                    .map_err(|e| ConnectError::Upgrade(e.to_string()))?;
                Ok(Box::new(TokioIo::new(upgraded)))
            }
        }
    }
}

impl fmt::Debug for ClientTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientTunnel::Raw(_) => f.write_str("ClientTunnel::Raw"),
            ClientTunnel::Pending { .. } => f.write_str("ClientTunnel::Pending"),
        }
    }
}

/// A parsed CONNECT target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Parses `host:port`, `[v6]:port` or a bare host (port 443).
    pub fn parse(authority: &str) -> Result<Self, ConnectError> {
        let invalid = || ConnectError::InvalidTarget(authority.to_string());
        if authority.is_empty() {
            return Err(invalid());
        }

        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => 443,
                None => return Err(invalid()),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        match authority.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => Ok(Self {
                host: authority.to_string(),
                port: 443,
            }),
            Some((host, port)) if !host.is_empty() => Ok(Self {
                host: host.to_string(),
                port: port.parse().map_err(|_| invalid())?,
            }),
            Some(_) => Err(invalid()),
            None => Ok(Self {
                host: authority.to_string(),
                port: 443,
            }),
        }
    }

    /// `host:port`, bracketing IPv6 hosts.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr())
    }
}

/// Establishes the client side and binds it to `upstream` until either side
/// is done.
pub(crate) async fn splice(
    client: ClientTunnel,
    upstream: BoxedIo,
    target: &str,
    route: Route,
    metrics: &Arc<Metrics>,
) -> Result<(), ConnectError> {
    let client = client.establish().await?;
    metrics.record_connect(route);
    let _active = TunnelGuard::new(metrics.clone());
    tracing::debug!(target, route = route.as_str(), "Tunnel established");

    bind(client, upstream).await?;
    tracing::debug!(target, "Tunnel closed");
    Ok(())
}

/// Connector that dials through a single [`Dialer`] and splices.
pub struct DialConnector {
    dialer: Arc<dyn Dialer>,
    route: Route,
    metrics: Arc<Metrics>,
}

impl DialConnector {
    pub fn new(dialer: Arc<dyn Dialer>, route: Route, metrics: Arc<Metrics>) -> Self {
        Self {
            dialer,
            route,
            metrics,
        }
    }
}

#[async_trait]
impl Connector for DialConnector {
    async fn connect(&self, target: &str, client: ClientTunnel) -> Result<(), ConnectError> {
        let upstream = self.dialer.dial(target).await?;
        splice(client, upstream, target, self.route, &self.metrics).await
    }
}

/// Everything a connector may be built from.
pub struct ConnectorParts {
    pub direct: Arc<dyn Dialer>,
    pub remote: Arc<dyn Dialer>,
    pub policy: Arc<RoutingPolicy>,
    pub fetcher: Arc<dyn Fetcher>,
    pub metrics: Arc<Metrics>,
    pub authority: Option<Arc<CertAuthority>>,
}

/// Picks the connector for `mode`.
pub fn build(mode: ConnectMode, parts: ConnectorParts) -> Result<Arc<dyn Connector>, ConnectError> {
    let connector: Arc<dyn Connector> = match mode {
        ConnectMode::Direct => {
            tracing::info!("Connecting directly only");
            Arc::new(DialConnector::new(parts.direct, Route::Direct, parts.metrics))
        }
        ConnectMode::Remote => {
            tracing::info!("Connecting through the relay only");
            Arc::new(DialConnector::new(parts.remote, Route::Remote, parts.metrics))
        }
        ConnectMode::Smart => Arc::new(SmartConnector::new(
            parts.direct,
            parts.remote,
            parts.policy,
        )),
        ConnectMode::Intercept => {
            tracing::info!("Intercepting CONNECT tunnels with forged certificates");
            let authority = parts.authority.ok_or_else(|| {
                CertError::Load("intercept mode needs a certificate authority".into())
            })?;
            Arc::new(InterceptConnector::new(authority, parts.fetcher, parts.metrics))
        }
    };
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_forms() {
        assert_eq!(
            Target::parse("example.com:8443").unwrap(),
            Target { host: "example.com".into(), port: 8443 }
        );
        assert_eq!(Target::parse("example.com").unwrap().port, 443);
        assert_eq!(
            Target::parse("[2001:db8::1]:443").unwrap(),
            Target { host: "2001:db8::1".into(), port: 443 }
        );
        assert_eq!(Target::parse("[::1]").unwrap().port, 443);
    }

    #[test]
    fn test_parse_target_rejects_garbage() {
        assert!(Target::parse("").is_err());
        assert!(Target::parse(":443").is_err());
        assert!(Target::parse("example.com:http").is_err());
        assert!(Target::parse("[::1]x").is_err());
    }

    #[test]
    fn test_target_addr_brackets_ipv6() {
        let target = Target::parse("[::1]:8080").unwrap();
        assert_eq!(target.addr(), "[::1]:8080");
        assert_eq!(Target::parse("a.example:80").unwrap().to_string(), "a.example:80");
    }

    #[tokio::test]
    async fn test_raw_client_gets_status_line() {
        use tokio::io::{duplex, AsyncReadExt};

        let (client, proxy_side) = duplex(64);
        let mut client = client;
        let tunnel = ClientTunnel::Raw(Box::new(proxy_side));
        let _io = tunnel.establish().await.unwrap();

        let mut line = vec![0u8; OK_200.len()];
        client.read_exact(&mut line).await.unwrap();
        assert_eq!(line, OK_200);
    }
}
