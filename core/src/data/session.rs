//! Session record persistence
//!
//! One row holding the authenticated protocol session: device identity,
//! access token, and the sync cursor. Saved after every state-changing
//! protocol event; loaded on startup so an intact record resumes the
//! session without re-authentication.

use rusqlite::{params, Connection, OptionalExtension};

use crate::gateway::current_timestamp;

/// The persisted protocol session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Account the session belongs to
    pub user_id: String,
    /// Device identity registered on login
    pub device_id: String,
    /// Bearer token authenticating the session
    pub access_token: String,
    /// Sync cursor; None until the first sync batch completes
    pub since: Option<String>,
}

/// Load the committed session record, if any.
pub fn load_session(conn: &Connection) -> Result<Option<SessionState>, rusqlite::Error> {
    conn.query_row(
        "SELECT user_id, device_id, access_token, since FROM session WHERE id = 1",
        [],
        |row| {
            Ok(SessionState {
                user_id: row.get(0)?,
                device_id: row.get(1)?,
                access_token: row.get(2)?,
                since: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Replace the session record atomically.
pub fn save_session(conn: &mut Connection, session: &SessionState) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO session (id, user_id, device_id, access_token, since, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             user_id = excluded.user_id,
             device_id = excluded.device_id,
             access_token = excluded.access_token,
             since = excluded.since,
             updated_at = excluded.updated_at",
        params![
            session.user_id,
            session.device_id,
            session.access_token,
            session.since,
            current_timestamp(),
        ],
    )?;
    tx.commit()
}

/// Drop the stored session (forces a fresh login on next start).
pub fn clear_session(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM session WHERE id = 1", [])?;
    Ok(())
}
