mod schema;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StatsError};
use crate::model::{StatKind, StatisticEntry, StoredStatistic, User, UserUpsert};

const USER_COLUMNS: &str = "id, telegram_id, nickname, account_id, created_at, updated_at";
const STAT_COLUMNS: &str = "id, user_id, created_at, kind, name, value, anchor_id, image";

/// Persistence for users and their statistics snapshots.
pub trait StatsStore: Send + Sync {
    /// Insert a user or update the existing one with the same Telegram id.
    /// Absent nickname or account id keep the stored value.
    fn upsert_user(&self, user: &UserUpsert) -> Result<User>;

    fn user_by_telegram_id(&self, telegram_id: i64) -> Result<User>;

    /// Atomically swap the user's snapshot for `entries` and return the
    /// rows as committed. On failure the previous snapshot is untouched.
    fn replace_all(&self, user_id: i64, entries: &[StatisticEntry]) -> Result<Vec<StoredStatistic>>;

    /// The user's current snapshot in stored order.
    fn get(&self, user_id: i64) -> Result<Vec<StoredStatistic>>;

    /// Stored trend image for one anchor.
    fn trend_image(&self, user_id: i64, anchor_id: &str) -> Result<Vec<u8>>;
}

/// SQLite-backed [`StatsStore`]. One connection, serialised behind a mutex.
pub struct SqliteStatsStore {
    conn: Mutex<Connection>,
}

impl SqliteStatsStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_snapshot(
        conn: &mut Connection,
        user_id: i64,
        entries: &[StatisticEntry],
    ) -> Result<usize> {
        let tx = conn.transaction()?;
        ensure_user(&tx, user_id)?;

        let removed = tx.execute("DELETE FROM stats WHERE user_id = ?1", params![user_id])?;

        let created_at = Utc::now();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO stats (user_id, kind, name, value, anchor_id, image, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    user_id,
                    entry.kind.to_string(),
                    entry.name,
                    entry.value,
                    entry.anchor_id,
                    entry.image,
                    created_at,
                ])?;
            }
        }

        tx.commit()?;
        Ok(removed)
    }
}

impl StatsStore for SqliteStatsStore {
    #[instrument(skip(self))]
    fn upsert_user(&self, user: &UserUpsert) -> Result<User> {
        let account_id = user.account_id.map(account_to_sql).transpose()?;
        let conn = self.lock();
        let now = Utc::now();
        let stored = conn.query_row(
            &format!(
                "INSERT INTO users (telegram_id, nickname, account_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (telegram_id) DO UPDATE SET
                    nickname = COALESCE(excluded.nickname, users.nickname),
                    account_id = COALESCE(excluded.account_id, users.account_id),
                    updated_at = ?4
                 RETURNING {USER_COLUMNS}"
            ),
            params![
                user.telegram_id,
                user.nickname,
                account_id,
                now,
            ],
            user_from_row,
        )?;
        debug!(user_id = stored.id, "upserted user");
        Ok(stored)
    }

    fn user_by_telegram_id(&self, telegram_id: i64) -> Result<User> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE telegram_id = ?1"),
            params![telegram_id],
            user_from_row,
        )
        .optional()?
        .ok_or(StatsError::UserNotFound(telegram_id))
    }

    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    fn replace_all(&self, user_id: i64, entries: &[StatisticEntry]) -> Result<Vec<StoredStatistic>> {
        let mut conn = self.lock();
        match Self::write_snapshot(&mut conn, user_id, entries) {
            Ok(removed) => {
                info!(user_id, removed, inserted = entries.len(), "replaced stats snapshot");
            }
            Err(err) => {
                warn!(user_id, error = %err, "stats snapshot replace rolled back");
                return Err(err);
            }
        }
        load_stats(&conn, user_id)
    }

    fn get(&self, user_id: i64) -> Result<Vec<StoredStatistic>> {
        let conn = self.lock();
        ensure_user(&conn, user_id)?;
        load_stats(&conn, user_id)
    }

    fn trend_image(&self, user_id: i64, anchor_id: &str) -> Result<Vec<u8>> {
        let conn = self.lock();
        ensure_user(&conn, user_id)?;
        conn.query_row(
            "SELECT image FROM stats WHERE user_id = ?1 AND anchor_id = ?2",
            params![user_id, anchor_id],
            |row| row.get::<_, Option<Vec<u8>>>(0),
        )
        .optional()?
        .flatten()
        .ok_or_else(|| StatsError::TrendImageNotFound {
            user_id,
            anchor_id: anchor_id.to_owned(),
        })
    }
}

fn ensure_user(conn: &Connection, user_id: i64) -> Result<()> {
    let exists = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", params![user_id], |_| Ok(()))
        .optional()?;
    exists.ok_or(StatsError::UserNotFound(user_id))
}

fn load_stats(conn: &Connection, user_id: i64) -> Result<Vec<StoredStatistic>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {STAT_COLUMNS} FROM stats WHERE user_id = ?1 ORDER BY id"
    ))?;
    let stats = stmt
        .query_map(params![user_id], stat_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(stats)
}

fn stat_from_row(row: &Row) -> rusqlite::Result<StoredStatistic> {
    let kind: String = row.get(3)?;
    let kind = StatKind::from_str(&kind)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(StoredStatistic {
        id: row.get(0)?,
        user_id: row.get(1)?,
        created_at: row.get(2)?,
        entry: StatisticEntry {
            kind,
            name: row.get(4)?,
            value: row.get(5)?,
            anchor_id: row.get(6)?,
            image: row.get(7)?,
        },
    })
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    let account_id: Option<i64> = row.get(3)?;
    Ok(User {
        id: row.get(0)?,
        telegram_id: row.get(1)?,
        nickname: row.get(2)?,
        account_id: account_id.and_then(|id| u64::try_from(id).ok()),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn account_to_sql(account_id: u64) -> Result<i64> {
    i64::try_from(account_id)
        .map_err(|e| StatsError::Storage(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))
}
