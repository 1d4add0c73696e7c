use std::time::Duration;

use ::scraper::error::SelectorErrorKind;

/// Coarse classification of [`StatsError`], used by callers to pick a
/// user-facing message without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Fetch,
    Parse,
    BrowserDiscovery,
    BrowserSession,
    Capture,
    Storage,
    Config,
    UserNotFound,
    NicknameNotSaved,
    TrendImageNotFound,
}

/// All errors that can occur while synchronizing or storing player stats.
#[derive(thiserror::Error, Debug)]
pub enum StatsError {
    /// HTTP request to the stats page failed (network, DNS, TLS, timeout, etc.).
    #[error("http request failed for {url}: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },

    /// Stats page returned a non-success HTTP status code.
    #[error("unexpected status {status} for {url}")]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    /// Failed to read the stats page body as text.
    #[error("failed to read response body from {url}: {source}")]
    ResponseBody {
        url: String,
        source: reqwest::Error,
    },

    /// A CSS selector string could not be parsed.
    #[error("invalid CSS selector: {0}")]
    Selector(String),

    /// The stats page could not be turned into a usable document.
    #[error("unparsable document from {url}: {reason}")]
    Document { url: String, reason: &'static str },

    /// The control plane could not be reached or did not answer with JSON.
    #[error("devtools discovery failed for {url}: {reason}")]
    Discovery { url: String, reason: String },

    /// The control plane answered, but not with exactly one debuggable target.
    #[error("expected exactly one devtools target at {url}, found {found}")]
    AmbiguousTarget { url: String, found: usize },

    /// Opening the automation session or navigating inside it failed.
    #[error("browser session failed: {0}")]
    Session(String),

    /// The whole automation sequence ran past its deadline.
    #[error("browser session exceeded its {0:?} deadline")]
    SessionTimeout(Duration),

    /// No requested element could be captured.
    #[error("failed to capture {failed} of {requested} trend images")]
    Capture { requested: usize, failed: usize },

    /// Any database failure during read, transaction or re-read.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A store call run off the async runtime panicked or was cancelled.
    #[error("store task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),

    /// Injected configuration is missing or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("user {0} has not saved a nickname")]
    NicknameNotSaved(i64),

    #[error("trend image {anchor_id} not found for user {user_id}")]
    TrendImageNotFound { user_id: i64, anchor_id: String },
}

impl StatsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StatsError::Http { .. }
            | StatsError::UnexpectedStatus { .. }
            | StatsError::ResponseBody { .. } => ErrorKind::Fetch,
            StatsError::Selector(_) | StatsError::Document { .. } => ErrorKind::Parse,
            StatsError::Discovery { .. } | StatsError::AmbiguousTarget { .. } => {
                ErrorKind::BrowserDiscovery
            }
            StatsError::Session(_) | StatsError::SessionTimeout(_) => ErrorKind::BrowserSession,
            StatsError::Capture { .. } => ErrorKind::Capture,
            StatsError::Storage(_) | StatsError::StoreTask(_) => ErrorKind::Storage,
            StatsError::Config(_) => ErrorKind::Config,
            StatsError::UserNotFound(_) => ErrorKind::UserNotFound,
            StatsError::NicknameNotSaved(_) => ErrorKind::NicknameNotSaved,
            StatsError::TrendImageNotFound { .. } => ErrorKind::TrendImageNotFound,
        }
    }
}

impl<'a> From<SelectorErrorKind<'a>> for StatsError {
    fn from(err: SelectorErrorKind<'a>) -> Self {
        StatsError::Selector(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for StatsError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        StatsError::Session(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StatsError>;
