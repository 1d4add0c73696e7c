//! Trend chart capture through a remote headless Chrome.
//!
//! A capture runs as a small state machine:
//! `EndpointDiscovery -> SessionOpen -> Navigated -> Capturing -> Done`,
//! with `Failed` reachable from every state. The DevTools session is opened
//! per call and closed before the call returns, whatever the outcome.
//!
//! One anchor failing to render does not fail the batch: it is logged and
//! left out of the returned map. The batch only fails with
//! [`ErrorKind::Capture`](crate::ErrorKind::Capture) when nothing at all
//! could be captured.

pub(crate) mod discovery;
pub(crate) mod session;

use std::collections::HashMap;

use async_trait::async_trait;
use itertools::Itertools;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{Result, StatsError};
use session::DevtoolsSession;

/// Captured PNG bytes keyed by anchor id.
pub type TrendImages = HashMap<String, Vec<u8>>;

/// Renders trend images for DOM anchors on a player's stats page.
#[async_trait]
pub trait TrendCapture: Send + Sync {
    async fn capture_all(&self, account_id: u64, anchors: &[String]) -> Result<TrendImages>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub(crate) enum CaptureState {
    EndpointDiscovery,
    SessionOpen,
    Navigated,
    Capturing,
    Done,
    Failed,
}

/// [`TrendCapture`] backed by a Chrome DevTools endpoint.
#[derive(Debug, Clone)]
pub struct DevtoolsCapture {
    http: reqwest::Client,
    config: SyncConfig,
}

impl DevtoolsCapture {
    pub fn new(http: reqwest::Client, config: SyncConfig) -> Self {
        Self { http, config }
    }

    async fn drive(
        &self,
        session: &DevtoolsSession,
        state: &mut CaptureState,
        url: &str,
        anchors: &[&String],
    ) -> Result<Vec<(String, Result<Vec<u8>>)>> {
        session.set_viewport(self.config.viewport).await?;
        session.navigate(url).await?;
        advance(state, CaptureState::Navigated);

        advance(state, CaptureState::Capturing);
        let mut outcomes = Vec::with_capacity(anchors.len());
        for anchor_id in anchors {
            let outcome = session.capture_element(anchor_id).await;
            outcomes.push(((*anchor_id).clone(), outcome));
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl TrendCapture for DevtoolsCapture {
    #[instrument(skip(self, anchors), fields(anchors = anchors.len()))]
    async fn capture_all(&self, account_id: u64, anchors: &[String]) -> Result<TrendImages> {
        let anchors: Vec<&String> = anchors.iter().unique().collect();
        if anchors.is_empty() {
            debug!("no anchors requested, skipping browser");
            return Ok(TrendImages::new());
        }

        let mut state = CaptureState::EndpointDiscovery;
        let ws_url = discovery::discover_ws_url(
            &self.http,
            &self.config.devtools_url,
            self.config.http_timeout,
        )
        .await
        .map_err(|e| fail(&mut state, e))?;

        advance(&mut state, CaptureState::SessionOpen);
        let deadline = Instant::now() + self.config.devtools_timeout;
        let session = match timeout_at(deadline, DevtoolsSession::open(&ws_url)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(fail(&mut state, e)),
            Err(_) => {
                let e = StatsError::SessionTimeout(self.config.devtools_timeout);
                return Err(fail(&mut state, e));
            }
        };

        let url = self.config.stats_page_url(account_id);
        let driven = timeout_at(deadline, self.drive(&session, &mut state, &url, &anchors)).await;
        session.close().await;

        let outcomes = match driven {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(e)) => return Err(fail(&mut state, e)),
            Err(_) => {
                let e = StatsError::SessionTimeout(self.config.devtools_timeout);
                return Err(fail(&mut state, e));
            }
        };

        let images = settle_batch(outcomes).map_err(|e| fail(&mut state, e))?;
        advance(&mut state, CaptureState::Done);
        info!(captured = images.len(), requested = anchors.len(), "trend capture finished");
        Ok(images)
    }
}

fn advance(state: &mut CaptureState, next: CaptureState) {
    info!(from = %state, to = %next, "capture state");
    *state = next;
}

fn fail(state: &mut CaptureState, err: StatsError) -> StatsError {
    warn!(state = %state, error = %err, "trend capture failed");
    *state = CaptureState::Failed;
    err
}

/// Keep every anchor that rendered; fail only when none did.
pub(crate) fn settle_batch(outcomes: Vec<(String, Result<Vec<u8>>)>) -> Result<TrendImages> {
    let requested = outcomes.len();
    let mut images = TrendImages::with_capacity(requested);
    for (anchor_id, outcome) in outcomes {
        match outcome {
            Ok(image) => {
                images.insert(anchor_id, image);
            }
            Err(err) => warn!(anchor_id, error = %err, "skipping trend image"),
        }
    }

    if requested > 0 && images.is_empty() {
        return Err(StatsError::Capture {
            requested,
            failed: requested,
        });
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::error::ErrorKind;

    fn anchors(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_settle_batch_keeps_partial_results() {
        let outcomes = vec![
            ("#a".to_string(), Ok(vec![1, 2, 3])),
            (
                "#b".to_string(),
                Err(StatsError::Session("element #b is not visible".to_string())),
            ),
            ("#c".to_string(), Ok(vec![4])),
        ];
        let images = settle_batch(outcomes).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images["#a"], vec![1, 2, 3]);
        assert_eq!(images["#c"], vec![4]);
        assert!(!images.contains_key("#b"));
    }

    #[test]
    fn test_settle_batch_fails_when_nothing_captured() {
        let outcomes = vec![
            ("#a".to_string(), Err(StatsError::Session("gone".to_string()))),
            ("#b".to_string(), Err(StatsError::Session("gone".to_string()))),
        ];
        let err = settle_batch(outcomes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capture);
        assert!(matches!(err, StatsError::Capture { requested: 2, failed: 2 }));

        assert!(settle_batch(Vec::new()).unwrap().is_empty());
    }

    async fn capture_with_targets(body: serde_json::Value) -> (MockServer, Result<TrendImages>) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;
        // Port 1 on loopback refuses the websocket handshake.
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/browser/A",
            })))
            .mount(&server)
            .await;

        let mut config = SyncConfig::new(format!("{}/json", server.uri()));
        config.stats_base_url = format!("{}/players/", server.uri());
        let capture = DevtoolsCapture::new(reqwest::Client::new(), config);
        let result = capture.capture_all(42, &anchors(&["#wn8Trend"])).await;
        (server, result)
    }

    #[tokio::test]
    async fn test_capture_all_fails_discovery_without_targets() {
        let (server, result) = capture_with_targets(json!([])).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::BrowserDiscovery);

        // Only the control plane was contacted; the stats page never was.
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.path(), "/json");
    }

    #[tokio::test]
    async fn test_capture_all_fails_discovery_with_many_targets() {
        let (server, result) = capture_with_targets(json!([
            {"webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/A"},
            {"webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/B"},
        ]))
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::BrowserDiscovery);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capture_all_unreachable_endpoint_is_session_error() {
        let (_server, result) = capture_with_targets(json!([
            {"webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/A"},
        ]))
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::BrowserSession);
    }

    #[tokio::test]
    async fn test_capture_all_hung_session_stops_at_deadline() {
        // Accepts connections but never answers the websocket handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hung = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "webSocketDebuggerUrl": format!("ws://127.0.0.1:{port}/devtools/browser/H"),
            })))
            .mount(&server)
            .await;

        let mut config = SyncConfig::new(format!("{}/json/version", server.uri()));
        config.devtools_timeout = Duration::from_millis(300);
        let capture = DevtoolsCapture::new(reqwest::Client::new(), config);

        let started = Instant::now();
        let err = capture
            .capture_all(42, &anchors(&["#wn8Trend"]))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        hung.abort();

        assert_eq!(err.kind(), ErrorKind::BrowserSession);
        assert!(matches!(err, StatsError::SessionTimeout(d) if d == Duration::from_millis(300)));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_capture_all_without_anchors_skips_browser() {
        let server = MockServer::start().await;
        let config = SyncConfig::new(format!("{}/json", server.uri()));
        let capture = DevtoolsCapture::new(reqwest::Client::new(), config);

        let images = capture.capture_all(42, &[]).await.unwrap();
        assert!(images.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
