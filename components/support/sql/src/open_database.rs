/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Use this module to open a new SQLite database connection.
///
/// Usage:
///    - Define a struct that implements ConnectionInitializer.  This handles:
///      - Initializing the schema for a new database
///      - Upgrading the schema for an existing database
///      - Extra preparation/finishing steps, for example setting up SQLite
///        functions
///
///    - Call open_database() in your database constructor:
///      - The first method called is `prepare()`.  This is executed outside
///        of a transaction and is suitable for executing pragmas (eg,
///        `PRAGMA journal_mode=wal`).
///      - If the database file is not present and the schema needs creating,
///        `init()` will be called.
///      - If the database file exists and its schema version is less than
///        the current version, `upgrade_from()` will be called once for each
///        version between the stored one and `END_VERSION`.
///      - The last method called is `finish()`, inside the same transaction
///        that `init()`/`upgrade_from()` ran in.
use rusqlite::{Connection, OpenFlags, Transaction};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Incompatible database version: {0}")]
    IncompatibleVersion(u32),
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait ConnectionInitializer {
    // Name to display in the logs.
    const NAME: &'static str;

    // The version that the last upgrade function upgrades to.
    const END_VERSION: u32;

    // Runs immediately after connection creation, outside any transaction.
    fn prepare(&self, _conn: &Connection, _db_empty: bool) -> Result<()> {
        Ok(())
    }

    // Initialize a newly created database to END_VERSION.
    fn init(&self, tx: &Transaction<'_>) -> Result<()>;

    // Upgrades the schema from `version` to `version + 1`.
    fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> Result<()>;

    // Runs after the init/upgrade functions, inside the same transaction.
    fn finish(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

pub fn open_database<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    connection_initializer: &CI,
) -> Result<Connection> {
    open_database_with_flags(path, OpenFlags::default(), connection_initializer)
}

pub fn open_memory_database<CI: ConnectionInitializer>(
    connection_initializer: &CI,
) -> Result<Connection> {
    do_open_database_with_flags(connection_initializer, Connection::open_in_memory)
}

pub fn open_database_with_flags<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    open_flags: OpenFlags,
    connection_initializer: &CI,
) -> Result<Connection> {
    do_open_database_with_flags(connection_initializer, || {
        Connection::open_with_flags(&path, open_flags)
    })
}

fn do_open_database_with_flags<CI, F>(connection_initializer: &CI, open: F) -> Result<Connection>
where
    CI: ConnectionInitializer,
    F: Fn() -> rusqlite::Result<Connection>,
{
    log::debug!("{}: opening database", CI::NAME);
    let mut conn = open()?;

    let db_empty = is_db_empty(&conn)?;
    log::debug!("{}: preparing (empty={})", CI::NAME, db_empty);
    connection_initializer.prepare(&conn, db_empty)?;

    let tx = conn.transaction()?;
    if db_empty {
        log::debug!("{}: initializing new database", CI::NAME);
        connection_initializer.init(&tx)?;
    } else {
        let mut current_version = get_schema_version(&tx)?;
        if current_version > CI::END_VERSION {
            return Err(Error::IncompatibleVersion(current_version));
        }
        while current_version < CI::END_VERSION {
            log::debug!(
                "{}: upgrading database from {}",
                CI::NAME,
                current_version
            );
            connection_initializer.upgrade_from(&tx, current_version)?;
            current_version += 1;
        }
    }
    set_schema_version(&tx, CI::END_VERSION)?;
    connection_initializer.finish(&tx)?;
    tx.commit()?;

    log::debug!("{}: database open successful", CI::NAME);
    Ok(conn)
}

fn is_db_empty(conn: &Connection) -> Result<bool> {
    let count: u32 = conn.query_row_and_then("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get(0)
    })?;
    Ok(count == 0)
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version = conn.query_row_and_then("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

// It would be nice for this to be #[cfg(test)], but that doesn't allow it to
// be used in tests for our other crates.
pub mod test_utils {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Database file that we can programmatically run upgrades on.
    ///
    /// We purposefully don't keep a connection to the database around to
    /// force upgrades to always run against a newly opened DB, like they
    /// would in the real world.
    pub struct MigratedDatabaseFile<CI: ConnectionInitializer> {
        // Keep around a TempDir to ensure the database file stays around
        // until this struct is dropped.
        _tempdir: TempDir,
        pub connection_initializer: CI,
        pub path: PathBuf,
    }

    impl<CI: ConnectionInitializer> MigratedDatabaseFile<CI> {
        pub fn new(connection_initializer: CI, init_sql: &str) -> Self {
            let tempdir = tempfile::tempdir().unwrap();
            let path = tempdir.path().join(Path::new("db.sql"));
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(init_sql).unwrap();
            Self {
                _tempdir: tempdir,
                connection_initializer,
                path,
            }
        }

        pub fn open(&self) -> Connection {
            open_database(&self.path, &self.connection_initializer).unwrap()
        }
    }
}
