use async_trait::async_trait;
use http::{Request, Response};
use std::sync::Arc;

use super::{clone_head, request_host, Fetcher};
use crate::body::{BodyRecorder, ProxyBody};
use crate::error::FetchError;
use crate::routing::RoutingPolicy;

/// Direct first, relay on failure, and remember hosts that needed the relay.
pub struct SmartFetcher {
    direct: Arc<dyn Fetcher>,
    remote: Arc<dyn Fetcher>,
    policy: Arc<RoutingPolicy>,
    replay_limit: usize,
}

impl SmartFetcher {
    pub fn new(
        direct: Arc<dyn Fetcher>,
        remote: Arc<dyn Fetcher>,
        policy: Arc<RoutingPolicy>,
        replay_limit: usize,
    ) -> Self {
        Self {
            direct,
            remote,
            policy,
            replay_limit,
        }
    }
}

#[async_trait]
impl Fetcher for SmartFetcher {
    async fn fetch(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, FetchError> {
        let host = request_host(&req)
            .ok_or_else(|| FetchError::InvalidRequest("request names no host".into()))?;

        if self.policy.prefers_remote(&host) {
            return self.remote.fetch(req).await;
        }

        let (parts, payload) = req.into_parts();
        let head = clone_head(&parts);
        let recorder = BodyRecorder::new(payload, self.replay_limit);

        match self.direct.fetch(Request::from_parts(parts, recorder.tap())).await {
            Ok(resp) => return Ok(resp),
            Err(e) => tracing::info!(%host, error = %e, "Direct fetch failed, trying relay"),
        }

        let replayed = recorder.recorded_len();
        let resp = self
            .remote
            .fetch(Request::from_parts(head, recorder.reborn().await?))
            .await?;
        if replayed > 0 {
            tracing::debug!(%host, bytes = replayed, "Replayed request body to relay");
        }

        self.policy.metrics().record_fallback();
        self.policy.record(&host).await;
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;
    use crate::fetch::MockFetcher;
    use crate::routing::policy::tests::policy_with;
    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::BodyExt;
    use mockall::Sequence;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const FOREIGN: Option<Ipv4Addr> = Some(Ipv4Addr::new(93, 184, 216, 34));
    const DOMESTIC: Option<Ipv4Addr> = Some(Ipv4Addr::new(1, 0, 1, 9));

    fn ok(text: &'static str) -> Response<ProxyBody> {
        Response::new(body::full(text))
    }

    fn post(uri: &str, payload: &'static str) -> Request<ProxyBody> {
        Request::post(uri).body(body::full(payload)).unwrap()
    }

    /// Direct mock that reads the whole body and then fails.
    fn failing_direct(seq: &mut Sequence) -> MockFetcher {
        let mut direct = MockFetcher::new();
        direct
            .expect_fetch()
            .times(1)
            .in_sequence(seq)
            .returning(|req| {
                let _ = futures::executor::block_on(req.into_body().collect());
                Err(FetchError::Direct("connection refused".into()))
            });
        direct
    }

    #[tokio::test]
    async fn test_falls_back_and_records_foreign_host() {
        let dir = TempDir::new().unwrap();
        let (policy, table) = policy_with(&dir, FOREIGN);
        let mut seq = Sequence::new();
        let direct = failing_direct(&mut seq);

        let seen = Arc::new(Mutex::new(None::<ProxyBody>));
        let seen_in_mock = seen.clone();
        let mut remote = MockFetcher::new();
        remote
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |req| {
                assert_eq!(req.uri(), "http://blocked.example/upload");
                *seen_in_mock.lock().unwrap() = Some(req.into_body());
                Ok(ok("via relay"))
            });

        let smart = SmartFetcher::new(Arc::new(direct), Arc::new(remote), Arc::new(policy), 1024);
        let resp = smart
            .fetch(post("http://blocked.example/upload", "form=data"))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(table.has("blocked.example"));
        let replayed = seen.lock().unwrap().take().unwrap();
        assert_eq!(
            replayed.collect().await.unwrap().to_bytes(),
            Bytes::from_static(b"form=data")
        );
    }

    #[tokio::test]
    async fn test_domestic_host_served_remotely_but_not_recorded() {
        let dir = TempDir::new().unwrap();
        let (policy, table) = policy_with(&dir, DOMESTIC);
        let mut seq = Sequence::new();
        let direct = failing_direct(&mut seq);
        let mut remote = MockFetcher::new();
        remote
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok("via relay")));

        let smart = SmartFetcher::new(Arc::new(direct), Arc::new(remote), Arc::new(policy), 1024);
        smart.fetch(post("http://near.example/", "x")).await.unwrap();

        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_direct_success_never_touches_table() {
        let dir = TempDir::new().unwrap();
        let (policy, table) = policy_with(&dir, FOREIGN);
        let mut direct = MockFetcher::new();
        direct.expect_fetch().times(2).returning(|_| Ok(ok("direct")));
        let mut remote = MockFetcher::new();
        remote.expect_fetch().never();

        let smart = SmartFetcher::new(Arc::new(direct), Arc::new(remote), Arc::new(policy), 1024);
        smart.fetch(post("http://open.example/", "a")).await.unwrap();
        smart.fetch(post("http://open.example/", "b")).await.unwrap();

        assert!(table.is_empty());
        assert_eq!(std::fs::read_to_string(table.path()).unwrap(), "");
    }

    #[tokio::test]
    async fn test_known_host_skips_direct() {
        let dir = TempDir::new().unwrap();
        let (policy, table) = policy_with(&dir, FOREIGN);
        table.add("known.example").unwrap();

        let mut direct = MockFetcher::new();
        direct.expect_fetch().never();
        let mut remote = MockFetcher::new();
        remote.expect_fetch().times(1).returning(|_| Ok(ok("relay")));

        let smart = SmartFetcher::new(Arc::new(direct), Arc::new(remote), Arc::new(policy), 1024);
        smart
            .fetch(Request::get("http://known.example/").body(body::empty()).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_failure_is_returned_and_not_recorded() {
        let dir = TempDir::new().unwrap();
        let (policy, table) = policy_with(&dir, FOREIGN);
        let mut seq = Sequence::new();
        let direct = failing_direct(&mut seq);
        let mut remote = MockFetcher::new();
        remote
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(FetchError::Relay("relay down".into())));

        let smart = SmartFetcher::new(Arc::new(direct), Arc::new(remote), Arc::new(policy), 1024);
        let err = smart
            .fetch(post("http://down.example/", "x"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Relay(_)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_cannot_fall_back() {
        let dir = TempDir::new().unwrap();
        let (policy, _table) = policy_with(&dir, FOREIGN);
        let mut seq = Sequence::new();
        let direct = failing_direct(&mut seq);
        let mut remote = MockFetcher::new();
        remote.expect_fetch().never();

        let smart = SmartFetcher::new(Arc::new(direct), Arc::new(remote), Arc::new(policy), 4);
        let err = smart
            .fetch(post("http://big.example/", "far too long"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::BodyTooLarge { limit: 4 }));
    }
}
