use rusqlite::Connection;

pub(crate) fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            telegram_id INTEGER NOT NULL UNIQUE,
            nickname TEXT,
            account_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            value TEXT,
            anchor_id TEXT NOT NULL,
            image BLOB,
            created_at TEXT NOT NULL,
            UNIQUE (user_id, anchor_id)
        );

        CREATE INDEX IF NOT EXISTS idx_stats_user_id ON stats(user_id);",
    )
}
