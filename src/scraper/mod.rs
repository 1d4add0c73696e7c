pub(crate) mod stats;

use std::time::Duration;

pub(crate) use ::scraper::Html;
use ::scraper::{ElementRef, Selector};
use tracing::debug;

use crate::error::{Result, StatsError};

/// Fetch a URL within `timeout` and parse the response body as an HTML document.
pub(crate) async fn get_document(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Html> {
    debug!(url, ?timeout, "fetching page");

    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| StatsError::Http {
            url: url.to_owned(),
            source: e,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(StatsError::UnexpectedStatus {
            url: url.to_owned(),
            status,
        });
    }

    let body = response.text().await.map_err(|e| StatsError::ResponseBody {
        url: url.to_owned(),
        source: e,
    })?;

    if body.trim().is_empty() {
        return Err(StatsError::Document {
            url: url.to_owned(),
            reason: "empty body",
        });
    }

    let document = Html::parse_document(&body);
    let body_selector = Selector::parse("body")?;
    if document.select(&body_selector).next().is_none() {
        return Err(StatsError::Document {
            url: url.to_owned(),
            reason: "no body element",
        });
    }

    Ok(document)
}

/// Extract trimmed text content from the first element matching `selector`
/// inside `element`. Returns an empty string if nothing matches.
pub(crate) fn select_text(element: &ElementRef, selector: &Selector) -> String {
    element
        .select(selector)
        .next()
        .and_then(|d| d.text().map(|t| t.trim()).find(|t| !t.is_empty()))
        .unwrap_or_default()
        .trim()
        .replace(['\n', '\t'], "")
        .to_string()
}
