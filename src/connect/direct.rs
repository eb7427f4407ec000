use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

use super::{BoxedIo, Dialer};
use crate::error::ConnectError;

/// Opens a TCP connection, giving up after `timeout`.
pub async fn dial_tcp(target: &str, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let dial_err = |source| ConnectError::Dial {
        target: target.to_string(),
        source,
    };
    let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| dial_err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")))?
        .map_err(dial_err)?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(target, error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &str) -> Result<BoxedIo, ConnectError> {
        let stream = dial_tcp(target, self.timeout).await?;
        tracing::debug!(target, "Dialed directly");
        Ok(Box::new(stream))
    }
}
