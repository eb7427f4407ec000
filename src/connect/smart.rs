use async_trait::async_trait;
use std::sync::Arc;

use super::{splice, ClientTunnel, Connector, Dialer, Target};
use crate::error::ConnectError;
use crate::metrics::Route;
use crate::routing::RoutingPolicy;

/// Direct dial first, relay on failure, keyed on the bare host. The choice
/// is made on the dial step, before the client learns the tunnel is up.
pub struct SmartConnector {
    direct: Arc<dyn Dialer>,
    remote: Arc<dyn Dialer>,
    policy: Arc<RoutingPolicy>,
}

impl SmartConnector {
    pub fn new(direct: Arc<dyn Dialer>, remote: Arc<dyn Dialer>, policy: Arc<RoutingPolicy>) -> Self {
        Self {
            direct,
            remote,
            policy,
        }
    }
}

#[async_trait]
impl Connector for SmartConnector {
    async fn connect(&self, target: &str, client: ClientTunnel) -> Result<(), ConnectError> {
        let host = Target::parse(target)?.host;
        let metrics = self.policy.metrics().clone();

        if self.policy.prefers_remote(&host) {
            let upstream = self.remote.dial(target).await?;
            return splice(client, upstream, target, Route::Remote, &metrics).await;
        }

        match self.direct.dial(target).await {
            Ok(upstream) => return splice(client, upstream, target, Route::Direct, &metrics).await,
            Err(e) => tracing::info!(target, error = %e, "Direct dial failed, trying relay"),
        }

        let upstream = self.remote.dial(target).await?;
        metrics.record_fallback();
        self.policy.record(&host).await;
        splice(client, upstream, target, Route::Remote, &metrics).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::{BoxedIo, MockDialer};
    use crate::routing::policy::tests::policy_with;
    use mockall::Sequence;
    use std::io;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn refused(target: &str) -> ConnectError {
        ConnectError::Dial {
            target: target.to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        }
    }

    /// An upstream that echoes one greeting back so the test can see which
    /// dialer was used.
    fn upstream(greeting: &'static [u8]) -> BoxedIo {
        let (ours, mut theirs): (DuplexStream, DuplexStream) = duplex(64);
        tokio::spawn(async move {
            let _ = theirs.write_all(greeting).await;
        });
        Box::new(ours)
    }

    async fn run(connector: &SmartConnector, target: &str) -> Vec<u8> {
        let (mut client, proxy_side) = duplex(64);
        let tunnel = ClientTunnel::Raw(Box::new(proxy_side));
        let task = async {
            let mut buf = vec![0u8; 19 + 6];
            client.read_exact(&mut buf).await.unwrap();
            drop(client);
            buf
        };
        let (result, buf) = tokio::join!(connector.connect(target, tunnel), task);
        result.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_falls_back_to_relay_and_records() {
        let dir = TempDir::new().unwrap();
        let (policy, table) = policy_with(&dir, Some(Ipv4Addr::new(8, 8, 4, 4)));
        let mut seq = Sequence::new();
        let mut direct = MockDialer::new();
        direct
            .expect_dial()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|t| Err(refused(t)));
        let mut remote = MockDialer::new();
        remote
            .expect_dial()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(upstream(b"relay!")));

        let connector = SmartConnector::new(Arc::new(direct), Arc::new(remote), Arc::new(policy));
        let seen = run(&connector, "blocked.example:443").await;

        assert_eq!(&seen[19..], b"relay!");
        assert!(table.has("blocked.example"));
    }

    #[tokio::test]
    async fn test_direct_success_leaves_table_alone() {
        let dir = TempDir::new().unwrap();
        let (policy, table) = policy_with(&dir, Some(Ipv4Addr::new(8, 8, 4, 4)));
        let mut direct = MockDialer::new();
        direct.expect_dial().times(1).returning(|_| Ok(upstream(b"direct")));
        let mut remote = MockDialer::new();
        remote.expect_dial().never();

        let connector = SmartConnector::new(Arc::new(direct), Arc::new(remote), Arc::new(policy));
        let seen = run(&connector, "open.example:443").await;

        assert_eq!(&seen[..19], b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(&seen[19..], b"direct");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_domestic_host_is_not_recorded() {
        let dir = TempDir::new().unwrap();
        let (policy, table) = policy_with(&dir, Some(Ipv4Addr::new(1, 0, 1, 1)));
        let mut direct = MockDialer::new();
        direct.expect_dial().returning(|t| Err(refused(t)));
        let mut remote = MockDialer::new();
        remote.expect_dial().returning(|_| Ok(upstream(b"relay!")));

        let connector = SmartConnector::new(Arc::new(direct), Arc::new(remote), Arc::new(policy));
        run(&connector, "near.example:443").await;

        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_both_routes_failing_leaves_client_unanswered() {
        let dir = TempDir::new().unwrap();
        let (policy, table) = policy_with(&dir, None);
        let mut direct = MockDialer::new();
        direct.expect_dial().returning(|t| Err(refused(t)));
        let mut remote = MockDialer::new();
        remote
            .expect_dial()
            .returning(|_| Err(ConnectError::Relay("relay answered 504".into())));

        let connector = SmartConnector::new(Arc::new(direct), Arc::new(remote), Arc::new(policy));
        let (mut client, proxy_side) = duplex(64);
        let err = connector
            .connect("dead.example:443", ClientTunnel::Raw(Box::new(proxy_side)))
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectError::Relay(_)));
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert!(table.is_empty());
    }
}
