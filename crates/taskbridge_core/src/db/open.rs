//! Opening configured database locations.

use super::migrations::apply_migrations;
use super::DbResult;
use crate::config::DatabaseLocation;
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

/// Busy timeout used when none is configured.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens (or creates) a database file with the default busy timeout.
pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    open_db_with(
        &DatabaseLocation::File(path.as_ref().to_path_buf()),
        DEFAULT_BUSY_TIMEOUT,
    )
}

/// Opens a private in-memory database. Used by tests and the CLI probe.
pub fn open_db_in_memory() -> DbResult<Connection> {
    open_db_with(&DatabaseLocation::InMemory, DEFAULT_BUSY_TIMEOUT)
}

/// Opens `location`, enforces foreign keys, sets the busy timeout and
/// migrates the schema.
///
/// # Side effects
/// - Logs one `db_open` event with status and duration.
pub fn open_db_with(location: &DatabaseLocation, busy_timeout: Duration) -> DbResult<Connection> {
    let started_at = Instant::now();
    let mode = location.mode();

    let result = connect(location).and_then(|mut conn| {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(busy_timeout)?;
        let applied = apply_migrations(&mut conn)?;
        Ok((conn, applied))
    });

    match result {
        Ok((conn, applied)) => {
            info!(
                "event=db_open module=db status=ok mode={mode} migrations_applied={applied} duration_ms={}",
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error={err}",
                started_at.elapsed().as_millis()
            );
            Err(err)
        }
    }
}

fn connect(location: &DatabaseLocation) -> DbResult<Connection> {
    let conn = match location {
        DatabaseLocation::InMemory => Connection::open_in_memory()?,
        DatabaseLocation::File(path) => Connection::open(path)?,
    };
    Ok(conn)
}
