use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use std::future::Future;
use std::time::Duration;

use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ViewportConfig;
use crate::error::{Result, StatsError};

/// Upper bound on closing the tab once a capture is over, so a hung browser
/// cannot hold the call past its deadline for long.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// One CDP connection plus the single tab it drives. Owned by exactly one
/// capture call; closing or dropping it closes the tab and stops the
/// event loop so nothing outlives the call.
pub(crate) struct DevtoolsSession {
    // Connected, not launched: dropping the handle leaves the remote browser running.
    browser: Browser,
    page: Option<Page>,
    events: Option<JoinHandle<()>>,
}

impl DevtoolsSession {
    pub(crate) async fn open(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .map_err(|e| StatsError::Session(format!("connect to {ws_url}: {e}")))?;
        let events = tokio::spawn(async move { while let Some(_event) = handler.next().await {} });

        let mut session = Self {
            browser,
            page: None,
            events: Some(events),
        };
        let page = session.browser.new_page("about:blank").await?;
        session.page = Some(page);
        Ok(session)
    }

    fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| StatsError::Session("session page already closed".to_string()))
    }

    pub(crate) async fn set_viewport(&self, viewport: ViewportConfig) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(viewport.width))
            .height(i64::from(viewport.height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| StatsError::Session(format!("viewport params: {e}")))?;
        self.page()?.execute(params).await?;
        Ok(())
    }

    pub(crate) async fn navigate(&self, url: &str) -> Result<()> {
        self.page()?
            .goto(url)
            .await
            .map_err(|e| StatsError::Session(format!("navigate to {url}: {e}")))?;
        Ok(())
    }

    /// PNG of the element with `anchor_id`, which must be laid out with a
    /// non-empty box.
    pub(crate) async fn capture_element(&self, anchor_id: &str) -> Result<Vec<u8>> {
        let element = self.page()?.find_element(element_selector(anchor_id)).await?;
        element.scroll_into_view().await?;

        let bounds = element.bounding_box().await?;
        if bounds.width <= 0.0 || bounds.height <= 0.0 {
            return Err(StatsError::Session(format!("element {anchor_id} is not visible")));
        }

        let image = element.screenshot(CaptureScreenshotFormat::Png).await?;
        debug!(anchor_id, bytes = image.len(), "captured element");
        Ok(image)
    }

    pub(crate) async fn close(mut self) {
        if let Some(page) = self.page.take() {
            close_page_within(CLOSE_TIMEOUT, page.close()).await;
        }
        if let Some(events) = self.events.take() {
            events.abort();
        }
    }
}

impl Drop for DevtoolsSession {
    fn drop(&mut self) {
        let page = self.page.take();
        let events = self.events.take();
        if page.is_none() && events.is_none() {
            return;
        }
        // Dropped mid-flight (deadline or caller cancellation): close the tab
        // on the runtime before stopping the event loop it depends on.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(page) = page {
                        close_page_within(CLOSE_TIMEOUT, page.close()).await;
                    }
                    if let Some(events) = events {
                        events.abort();
                    }
                });
            }
            Err(_) => {
                if let Some(events) = events {
                    events.abort();
                }
            }
        }
    }
}

/// Await a page close for at most `limit`. Returns whether it completed.
pub(crate) async fn close_page_within<F>(limit: Duration, close: F) -> bool
where
    F: Future<Output = std::result::Result<(), CdpError>>,
{
    match tokio::time::timeout(limit, close).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(error = %err, "failed to close devtools page");
            true
        }
        Err(_) => {
            warn!(?limit, "devtools page close timed out, abandoning it");
            false
        }
    }
}

/// Attribute selector for an `#id` anchor; survives ids that are not valid
/// CSS identifiers.
pub(crate) fn element_selector(anchor_id: &str) -> String {
    let id = anchor_id.strip_prefix('#').unwrap_or(anchor_id);
    let escaped = id.replace('\\', "\\\\").replace('"', "\\\"");
    format!("[id=\"{escaped}\"]")
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_close_page_within_gives_up_on_hung_browser() {
        let started = Instant::now();
        let closed = close_page_within(
            Duration::from_millis(100),
            std::future::pending::<std::result::Result<(), CdpError>>(),
        )
        .await;
        assert!(!closed);
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(close_page_within(Duration::from_millis(100), async { Ok(()) }).await);
    }

    #[test]
    fn test_element_selector() {
        assert_eq!(element_selector("#wn8Trend"), r#"[id="wn8Trend"]"#);
        assert_eq!(element_selector("vehicleTiers"), r#"[id="vehicleTiers"]"#);
        assert_eq!(element_selector("#a\"b"), r#"[id="a\"b"]"#);
    }
}
