use async_trait::async_trait;
use http::{header, StatusCode, Uri};
use std::time::Duration;

use super::{BoxedIo, Dialer};
use crate::error::ConnectError;
use crate::protocol::{CONNECT_HOST, TUNNEL_PROTOCOL};

/// Opens tunnels through the relay's connect endpoint.
///
/// The relay is asked to dial the target with an upgrade request carrying
/// `Connect-Host`; once it answers `101` the upgraded connection is a raw
/// byte pipe to the target.
pub struct RelayDialer {
    client: reqwest::Client,
    endpoint: Uri,
    timeout: Duration,
}

impl RelayDialer {
    pub fn new(endpoint: Uri, timeout: Duration) -> Result<Self, ConnectError> {
        let client = reqwest::Client::builder()
            .http1_only()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ConnectError::Relay(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }
}

#[async_trait]
impl Dialer for RelayDialer {
    async fn dial(&self, target: &str) -> Result<BoxedIo, ConnectError> {
        let request = self
            .client
            .get(self.endpoint.to_string())
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, TUNNEL_PROTOCOL)
            .header(CONNECT_HOST, target)
            .send();

        let resp = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ConnectError::Relay(format!("relay timed out opening {target}")))?
            .map_err(|e| ConnectError::Relay(e.to_string()))?;

        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(ConnectError::Relay(format!(
                "relay answered {} for {target}",
                resp.status()
            )));
        }

        let upgraded = resp
            .upgrade()
            .await
            .map_err(|e| ConnectError::Relay(e.to_string()))?;
        tracing::debug!(target, "Relay tunnel opened");
        Ok(Box::new(upgraded))
    }
}
