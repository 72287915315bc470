//! SQLite persistence
//!
//! Durable state for the gateway:
//! - `session`: the single protocol session record (device identity,
//!   access token, sync cursor)
//! - `channels`: the recipient -> private channel cache
//!
//! Writes run inside transactions, so a crash mid-write can never
//! corrupt the previously committed state.

pub mod channels;
pub mod schema;
pub mod session;

use std::path::{Path, PathBuf};

use rusqlite::Connection;

pub use channels::{
    load_channels, remove_channel, set_channel_encrypted, upsert_channel, ChannelRecord,
};
pub use schema::create_all_tables;
pub use session::{clear_session, load_session, save_session, SessionState};

/// Default session database path
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
        .join("courier.db")
}

/// Open (or create) the session database and ensure the schema exists.
pub fn open_db(path: &Path) -> Result<Connection, rusqlite::Error> {
    if let Some(parent) = path.parent() {
        // rusqlite won't create intermediate directories
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    create_all_tables(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub(crate) fn open_test_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    create_all_tables(&conn).unwrap();
    conn
}
