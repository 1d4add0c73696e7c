use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::browser::{DevtoolsCapture, TrendCapture};
use crate::config::SyncConfig;
use crate::error::{Result, StatsError};
use crate::model::{StatisticEntry, StoredStatistic};
use crate::scraper::stats::PageScraper;
use crate::store::StatsStore;

/// The main entry point: scrapes a player's stats and, on request, their
/// trend charts.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> xvm_stats::Result<()> {
/// use xvm_stats::{StatsSynchronizer, SyncConfig};
///
/// let config = SyncConfig::new("http://127.0.0.1:9222/json/version");
/// let sync = StatsSynchronizer::new(reqwest::Client::new(), config);
/// let stats = sync.fetch(1234567, false).await?;
/// println!("Found {} stats", stats.len());
/// # Ok(())
/// # }
/// ```
pub struct StatsSynchronizer<C = DevtoolsCapture> {
    scraper: PageScraper,
    capture: C,
}

impl StatsSynchronizer<DevtoolsCapture> {
    /// Scraper and browser share the client and configuration, so both hit
    /// the same stats page URL.
    pub fn new(http: reqwest::Client, config: SyncConfig) -> Self {
        Self {
            scraper: PageScraper::new(http.clone(), config.clone()),
            capture: DevtoolsCapture::new(http, config),
        }
    }
}

impl<C: TrendCapture> StatsSynchronizer<C> {
    pub fn with_capture(scraper: PageScraper, capture: C) -> Self {
        Self { scraper, capture }
    }

    /// Scrape the stats page. With `with_trend` the browser is also driven
    /// and each entry gets its chart image where one could be captured;
    /// without it the browser is never touched.
    #[instrument(skip(self))]
    pub async fn fetch(&self, account_id: u64, with_trend: bool) -> Result<Vec<StatisticEntry>> {
        let mut entries = self.scraper.extract(account_id).await?;
        if !with_trend {
            return Ok(entries);
        }

        let anchors: Vec<String> = entries.iter().map(|e| e.anchor_id.clone()).collect();
        let mut images = self.capture.capture_all(account_id, &anchors).await?;
        for entry in &mut entries {
            entry.image = images.remove(&entry.anchor_id);
        }

        debug!(
            entries = entries.len(),
            with_image = entries.iter().filter(|e| e.image.is_some()).count(),
            "merged trend images"
        );
        Ok(entries)
    }

    /// Re-scrape a saved profile with trend images and replace the user's
    /// stored snapshot. Store calls run on the blocking pool.
    #[instrument(skip(self, store))]
    pub async fn refresh_profile<S>(
        &self,
        store: &Arc<S>,
        telegram_id: i64,
    ) -> Result<Vec<StoredStatistic>>
    where
        S: StatsStore + ?Sized + 'static,
    {
        let user = blocking(store, move |s| s.user_by_telegram_id(telegram_id)).await?;
        let account_id = user.account_id.ok_or(StatsError::NicknameNotSaved(user.id))?;

        let entries = self.fetch(account_id, true).await?;
        let user_id = user.id;
        let stored = blocking(store, move |s| s.replace_all(user_id, &entries)).await?;
        info!(user_id, account_id, count = stored.len(), "profile refreshed");
        Ok(stored)
    }
}

async fn blocking<S, T, F>(store: &Arc<S>, op: F) -> Result<T>
where
    S: StatsStore + ?Sized + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store)).await?
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::browser::TrendImages;
    use crate::error::ErrorKind;
    use crate::model::{StatisticEntry, User, UserUpsert};
    use crate::scraper::stats::tests::STATS_PAGE;
    use crate::store::SqliteStatsStore;

    /// Returns one-byte images for the anchors in `available`.
    struct FakeCapture {
        available: HashSet<String>,
        calls: AtomicUsize,
        requested: Mutex<Vec<String>>,
        fail_with: Option<fn() -> StatsError>,
    }

    impl FakeCapture {
        fn with(available: &[&str]) -> Self {
            Self {
                available: available.iter().map(|a| a.to_string()).collect(),
                calls: AtomicUsize::new(0),
                requested: Mutex::new(Vec::new()),
                fail_with: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TrendCapture for FakeCapture {
        async fn capture_all(&self, _account_id: u64, anchors: &[String]) -> Result<TrendImages> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().extend_from_slice(anchors);
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            Ok(anchors
                .iter()
                .filter(|a| self.available.contains(*a))
                .map(|a| (a.clone(), vec![0x89]))
                .collect())
        }
    }

    async fn stats_server() -> (MockServer, SyncConfig) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/players/77"))
            .respond_with(ResponseTemplate::new(200).set_body_string(STATS_PAGE))
            .mount(&server)
            .await;
        let mut config = SyncConfig::new("http://127.0.0.1:9/json");
        config.stats_base_url = format!("{}/players/", server.uri());
        (server, config)
    }

    fn synchronizer(config: SyncConfig, capture: FakeCapture) -> StatsSynchronizer<FakeCapture> {
        let scraper = PageScraper::new(reqwest::Client::new(), config);
        StatsSynchronizer::with_capture(scraper, capture)
    }

    #[tokio::test]
    async fn test_fetch_without_trend_never_touches_browser() {
        let (_server, config) = stats_server().await;
        let scraped = PageScraper::new(reqwest::Client::new(), config.clone())
            .extract(77)
            .await
            .unwrap();

        let sync = synchronizer(config, FakeCapture::with(&["#wn8Trend"]));
        let entries = sync.fetch(77, false).await.unwrap();

        assert_eq!(sync.capture.calls(), 0);
        assert_eq!(entries, scraped);
        assert!(entries.iter().all(|e| e.image.is_none()));
    }

    #[tokio::test]
    async fn test_fetch_with_trend_merges_partial_images() {
        let (_server, config) = stats_server().await;
        let sync = synchronizer(config, FakeCapture::with(&["#wn8Trend", "#vehicleDamage"]));

        let entries = sync.fetch(77, true).await.unwrap();

        assert_eq!(sync.capture.calls(), 1);
        assert_eq!(
            *sync.capture.requested.lock().unwrap(),
            vec![
                "#wn8Trend",
                "#winrateTrend",
                "#battlesTrend",
                "#vehicleBattles",
                "#vehicleDamage"
            ]
        );
        assert_eq!(entries.len(), 5);
        let with_image: Vec<&str> = entries
            .iter()
            .filter(|e| e.image.is_some())
            .map(|e| e.anchor_id.as_str())
            .collect();
        assert_eq!(with_image, vec!["#wn8Trend", "#vehicleDamage"]);
    }

    #[tokio::test]
    async fn test_fetch_passes_errors_through() {
        let (_server, config) = stats_server().await;
        let mut capture = FakeCapture::with(&[]);
        capture.fail_with = Some(|| StatsError::AmbiguousTarget {
            url: "http://127.0.0.1:9222/json".to_string(),
            found: 0,
        });
        let sync = synchronizer(config.clone(), capture);
        let err = sync.fetch(77, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrowserDiscovery);

        // Scrape failure stops before the browser.
        let sync = synchronizer(config, FakeCapture::with(&[]));
        let err = sync.fetch(404, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert_eq!(sync.capture.calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_profile_replaces_snapshot() {
        let (_server, config) = stats_server().await;
        let store = Arc::new(SqliteStatsStore::open_in_memory().unwrap());
        let user = store
            .upsert_user(&UserUpsert {
                telegram_id: 1001,
                nickname: Some("Tanker".to_string()),
                account_id: Some(77),
            })
            .unwrap();

        let sync = synchronizer(config, FakeCapture::with(&["#wn8Trend"]));
        let stored = sync.refresh_profile(&store, 1001).await.unwrap();

        assert_eq!(stored.len(), 5);
        assert!(stored.iter().all(|s| s.user_id == user.id));
        assert_eq!(store.trend_image(user.id, "#wn8Trend").unwrap(), vec![0x89]);
    }

    #[tokio::test]
    async fn test_refresh_profile_requires_saved_account() {
        let (_server, config) = stats_server().await;
        let store = Arc::new(SqliteStatsStore::open_in_memory().unwrap());
        store
            .upsert_user(&UserUpsert {
                telegram_id: 1002,
                ..Default::default()
            })
            .unwrap();
        let sync = synchronizer(config, FakeCapture::with(&[]));

        let err = sync.refresh_profile(&store, 1002).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NicknameNotSaved);
        let err = sync.refresh_profile(&store, 9999).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserNotFound);
        assert_eq!(sync.capture.calls(), 0);
    }

    /// Sleeps on every snapshot write to stand in for slow disk I/O.
    struct SlowStore {
        inner: SqliteStatsStore,
        delay: Duration,
    }

    impl StatsStore for SlowStore {
        fn upsert_user(&self, user: &UserUpsert) -> Result<User> {
            self.inner.upsert_user(user)
        }

        fn user_by_telegram_id(&self, telegram_id: i64) -> Result<User> {
            self.inner.user_by_telegram_id(telegram_id)
        }

        fn replace_all(
            &self,
            user_id: i64,
            entries: &[StatisticEntry],
        ) -> Result<Vec<StoredStatistic>> {
            std::thread::sleep(self.delay);
            self.inner.replace_all(user_id, entries)
        }

        fn get(&self, user_id: i64) -> Result<Vec<StoredStatistic>> {
            self.inner.get(user_id)
        }

        fn trend_image(&self, user_id: i64, anchor_id: &str) -> Result<Vec<u8>> {
            self.inner.trend_image(user_id, anchor_id)
        }
    }

    #[tokio::test]
    async fn test_refresh_profile_keeps_runtime_responsive() {
        let (_server, config) = stats_server().await;
        let store: Arc<dyn StatsStore> = Arc::new(SlowStore {
            inner: SqliteStatsStore::open_in_memory().unwrap(),
            delay: Duration::from_millis(300),
        });
        store
            .upsert_user(&UserUpsert {
                telegram_id: 1003,
                nickname: Some("Tanker".to_string()),
                account_id: Some(77),
            })
            .unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        let sync = synchronizer(config, FakeCapture::with(&[]));
        let stored = sync.refresh_profile(&store, 1003).await.unwrap();
        ticker.abort();

        assert_eq!(stored.len(), 5);
        // The single-threaded test runtime kept polling while the write slept.
        assert!(ticks.load(Ordering::SeqCst) >= 10);
    }
}
