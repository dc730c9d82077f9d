//! v002 -- Presence write ordering.
//!
//! `presence_seq` breaks ties between mirror writes stamped with the same
//! `last_seen`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE users ADD COLUMN presence_seq INTEGER NOT NULL DEFAULT 0;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
