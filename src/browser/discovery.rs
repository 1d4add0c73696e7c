use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{Result, StatsError};

#[derive(Debug, Deserialize)]
struct DevtoolsTarget {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: Option<String>,
}

/// `/json` and `/json/list` answer with a target list, `/json/version`
/// with a single browser object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DiscoveryResponse {
    Targets(Vec<DevtoolsTarget>),
    Version(DevtoolsTarget),
}

/// Resolve the control-plane URL to the browser-level websocket address.
///
/// A target list (`/json`, `/json/list`) must hold exactly one debuggable
/// target; the socket handed back is then the browser endpoint from
/// `/json/version` on the same host, since the CDP client attaches to a
/// browser rather than to a single page.
#[instrument(skip(client))]
pub(crate) async fn discover_ws_url(
    client: &reqwest::Client,
    devtools_url: &str,
    timeout: Duration,
) -> Result<String> {
    let url = resolve_host(devtools_url).await?;
    match request(client, &url, timeout).await? {
        DiscoveryResponse::Version(browser) => single_candidate(url.as_str(), vec![browser]),
        DiscoveryResponse::Targets(targets) => {
            single_candidate(url.as_str(), targets)?;

            let version_url = url.join("/json/version").map_err(|e| StatsError::Discovery {
                url: url.to_string(),
                reason: format!("cannot build version url: {e}"),
            })?;
            match request(client, &version_url, timeout).await? {
                DiscoveryResponse::Version(browser) => {
                    single_candidate(version_url.as_str(), vec![browser])
                }
                DiscoveryResponse::Targets(_) => Err(StatsError::Discovery {
                    url: version_url.to_string(),
                    reason: "expected a browser version object".to_string(),
                }),
            }
        }
    }
}

async fn request(
    client: &reqwest::Client,
    url: &Url,
    timeout: Duration,
) -> Result<DiscoveryResponse> {
    debug!(%url, "requesting devtools metadata");
    let discovery_err = |reason: String| StatsError::Discovery {
        url: url.to_string(),
        reason,
    };

    let response = client
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| discovery_err(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(discovery_err(format!("unexpected status {status}")));
    }

    response
        .json()
        .await
        .map_err(|e| discovery_err(format!("malformed response: {e}")))
}

fn single_candidate(url: &str, targets: Vec<DevtoolsTarget>) -> Result<String> {
    let mut candidates: Vec<String> = targets
        .into_iter()
        .filter_map(|t| t.web_socket_debugger_url)
        .filter(|ws| !ws.trim().is_empty())
        .collect();

    if candidates.len() != 1 {
        return Err(StatsError::AmbiguousTarget {
            url: url.to_owned(),
            found: candidates.len(),
        });
    }
    Ok(candidates.remove(0))
}

/// Chrome rejects DevTools requests whose Host header is neither an IP nor
/// `localhost`, so a service name like `chrome:9222` is swapped for its
/// address before the request is made.
async fn resolve_host(devtools_url: &str) -> Result<Url> {
    let mut url = Url::parse(devtools_url).map_err(|e| StatsError::Discovery {
        url: devtools_url.to_owned(),
        reason: format!("invalid url: {e}"),
    })?;

    let Some(host) = url.host_str().map(str::to_owned) else {
        return Err(StatsError::Discovery {
            url: devtools_url.to_owned(),
            reason: "url has no host".to_string(),
        });
    };
    if host.trim_matches(['[', ']']).parse::<IpAddr>().is_ok() {
        return Ok(url);
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| StatsError::Discovery {
            url: devtools_url.to_owned(),
            reason: format!("cannot resolve {host}: {e}"),
        })?
        .collect();
    let ip = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip())
        .ok_or_else(|| StatsError::Discovery {
            url: devtools_url.to_owned(),
            reason: format!("{host} resolved to no addresses"),
        })?;

    url.set_ip_host(ip).map_err(|()| StatsError::Discovery {
        url: devtools_url.to_owned(),
        reason: format!("cannot use {ip} as host"),
    })?;
    debug!(%host, %ip, "resolved devtools host");
    Ok(url)
}
