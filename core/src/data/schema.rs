//! Database schema

use rusqlite::Connection;

/// Create all tables if they do not exist yet.
pub fn create_all_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS session (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            user_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            access_token TEXT NOT NULL,
            since TEXT,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channels (
            user_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            encrypted INTEGER NOT NULL DEFAULT 0,
            verified_at INTEGER NOT NULL
        );
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('session', 'channels')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_create_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();
        create_all_tables(&conn).unwrap();
    }

    #[test]
    fn test_session_is_single_row() {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();

        conn.execute(
            "INSERT INTO session (id, user_id, device_id, access_token, since, updated_at)
             VALUES (1, '@a:x', 'DEV', 'tok', NULL, 0)",
            [],
        )
        .unwrap();

        // A second row violates the id check constraint
        let second = conn.execute(
            "INSERT INTO session (id, user_id, device_id, access_token, since, updated_at)
             VALUES (2, '@b:x', 'DEV2', 'tok2', NULL, 0)",
            [],
        );
        assert!(second.is_err());
    }
}
