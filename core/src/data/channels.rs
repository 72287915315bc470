//! Persisted channel cache
//!
//! Backs the in-memory recipient resolver so the private channel a user
//! was contacted through survives restarts. One row per user; rows are
//! replaced on re-resolution and deleted when a delivery failure marks
//! the channel stale.

use rusqlite::{params, Connection};

use crate::gateway::current_timestamp;

/// One cached recipient -> channel mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub user_id: String,
    pub channel_id: String,
    pub encrypted: bool,
    pub verified_at: i64,
}

/// Load every cached mapping (startup warm-up).
pub fn load_channels(conn: &Connection) -> Result<Vec<ChannelRecord>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT user_id, channel_id, encrypted, verified_at FROM channels")?;
    let rows = stmt.query_map([], |row| {
        Ok(ChannelRecord {
            user_id: row.get(0)?,
            channel_id: row.get(1)?,
            encrypted: row.get::<_, i64>(2)? != 0,
            verified_at: row.get(3)?,
        })
    })?;
    rows.collect()
}

/// Insert or replace the mapping for a user.
pub fn upsert_channel(
    conn: &Connection,
    user_id: &str,
    channel_id: &str,
    encrypted: bool,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO channels (user_id, channel_id, encrypted, verified_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
             channel_id = excluded.channel_id,
             encrypted = excluded.encrypted,
             verified_at = excluded.verified_at",
        params![user_id, channel_id, encrypted as i64, current_timestamp()],
    )?;
    Ok(())
}

/// Remove the mapping for a user (stale channel invalidation).
pub fn remove_channel(conn: &Connection, user_id: &str) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM channels WHERE user_id = ?1", params![user_id])?;
    Ok(())
}

/// Mark every mapping pointing at this channel as encryption-enabled.
pub fn set_channel_encrypted(conn: &Connection, channel_id: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE channels SET encrypted = 1 WHERE channel_id = ?1",
        params![channel_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::open_test_db;

    #[test]
    fn test_load_empty() {
        let conn = open_test_db();
        assert!(load_channels(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_and_load() {
        let conn = open_test_db();
        upsert_channel(&conn, "@alice:example.org", "!dm1:example.org", false).unwrap();
        upsert_channel(&conn, "@bob:example.org", "!dm2:example.org", true).unwrap();

        let mut records = load_channels(&conn).unwrap();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_id, "@alice:example.org");
        assert_eq!(records[0].channel_id, "!dm1:example.org");
        assert!(!records[0].encrypted);
        assert!(records[1].encrypted);
    }

    #[test]
    fn test_upsert_replaces_channel() {
        let conn = open_test_db();
        upsert_channel(&conn, "@alice:example.org", "!old:example.org", false).unwrap();
        upsert_channel(&conn, "@alice:example.org", "!new:example.org", false).unwrap();

        let records = load_channels(&conn).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channel_id, "!new:example.org");
    }

    #[test]
    fn test_remove_channel() {
        let conn = open_test_db();
        upsert_channel(&conn, "@alice:example.org", "!dm:example.org", false).unwrap();

        remove_channel(&conn, "@alice:example.org").unwrap();
        assert!(load_channels(&conn).unwrap().is_empty());

        // Removing an absent row is not an error
        remove_channel(&conn, "@alice:example.org").unwrap();
    }

    #[test]
    fn test_set_channel_encrypted() {
        let conn = open_test_db();
        upsert_channel(&conn, "@alice:example.org", "!dm:example.org", false).unwrap();

        set_channel_encrypted(&conn, "!dm:example.org").unwrap();

        let records = load_channels(&conn).unwrap();
        assert!(records[0].encrypted);
    }
}
