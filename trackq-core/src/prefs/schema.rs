//! Preferences schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: key/value table
    r#"
    CREATE TABLE IF NOT EXISTS preferences (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        updated_at  DATETIME NOT NULL
    );
    "#,
];

/// Bring the preferences database up to [`SCHEMA_VERSION`].
///
/// Each step runs in its own transaction together with the `user_version`
/// bump. A database written by a newer build is left untouched.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let from = get_schema_version(conn)?;
    if from > SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "preferences schema {} is newer than supported {}",
            from, SCHEMA_VERSION
        )));
    }

    for (version, sql) in (1..).zip(MIGRATIONS.iter()).skip(from as usize) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!(version, "Applied preferences migration");
    }

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |r| r.get(0))?)
}
