use chrono::{DateTime, Utc};
use serde::Serialize;

/// A bot user who may have linked a game account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub nickname: Option<String>,
    pub account_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fields written by [`crate::store::StatsStore::upsert_user`]. Absent
/// values keep whatever is already stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpsert {
    pub telegram_id: i64,
    pub nickname: Option<String>,
    pub account_id: Option<u64>,
}
