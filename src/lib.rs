pub use browser::{DevtoolsCapture, TrendCapture, TrendImages};
pub use config::{SyncConfig, ViewportConfig};
pub use error::{ErrorKind, Result, StatsError};
pub use model::{StatKind, StatisticEntry, StoredStatistic, User, UserUpsert};
pub use scraper::stats::PageScraper;
pub use store::{SqliteStatsStore, StatsStore};
pub use synchronizer::StatsSynchronizer;

pub mod browser;
pub mod config;
pub mod error;
pub mod model;
pub(crate) mod scraper;
pub mod store;
pub mod synchronizer;
