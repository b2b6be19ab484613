/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The replica database: one mirror table per registry entry (row images as
//! JSON, like the server ships them), the change log, the meta key-value
//! table and the migration ledger.

use rusqlite::{Connection, Transaction};
use sql_support::open_database::{
    ConnectionInitializer as MigrationLogic, Error as MigrationError, Result as MigrationResult,
};
use sql_support::ConnExt;
use types::Timestamp;
use walsync::tables::TABLES;

const CREATE_CHANGE_LOG_SQL: &str = "
    CREATE TABLE IF NOT EXISTS change_log (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name      TEXT NOT NULL,
        primary_key     TEXT NOT NULL,
        operation       TEXT NOT NULL,
        data            TEXT,
        old_data        TEXT,
        timestamp       INTEGER NOT NULL,
        processed_local INTEGER NOT NULL DEFAULT 0,
        processed_sync  INTEGER NOT NULL DEFAULT 0,
        from_server     INTEGER NOT NULL DEFAULT 0,
        lsn             TEXT,
        attempts        INTEGER NOT NULL DEFAULT 0,
        error           TEXT
    );
";

const CREATE_CHANGE_LOG_INDEX_SQL: &str = "
    CREATE INDEX IF NOT EXISTS idx_change_log_unsynced
    ON change_log (from_server, processed_sync, timestamp, id);
";

const CREATE_META_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key    TEXT PRIMARY KEY,
        value  NOT NULL
    );
";

pub(crate) const CREATE_MIGRATIONS_STATUS_SQL: &str = "
    CREATE TABLE IF NOT EXISTS migrations_status (
        name        TEXT PRIMARY KEY,
        status      TEXT NOT NULL,
        applied_at  INTEGER NOT NULL
    );
";

pub(crate) static CLIENT_ID_META_KEY: &str = "client_id";
pub(crate) static APPLIED_LSN_META_KEY: &str = "applied_lsn";
pub(crate) static STATE_TIMESTAMP_META_KEY: &str = "state_timestamp";

pub(crate) static MIGRATION_APPLIED: &str = "applied";

/// Migrations the live protocol depends on. A session may only start in a
/// phase other than initial sync when all of these are recorded as applied.
pub(crate) static REQUIRED_MIGRATIONS: &[&str] = &["replica-schema", "change-log-retries"];

fn create_mirror_tables(conn: &Connection) -> MigrationResult<()> {
    for descriptor in TABLES {
        // One mirror per known table; the row image is stored the way the
        // wire carries it, keyed by the registry's primary key.
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                pk          TEXT NOT NULL PRIMARY KEY,
                data        TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            );",
            descriptor.name
        ))?;
    }
    Ok(())
}

pub(crate) fn record_migration(conn: &Connection, name: &str) -> rusqlite::Result<()> {
    conn.execute_cached(
        "INSERT OR REPLACE INTO migrations_status (name, status, applied_at)
         VALUES (:name, :status, :applied_at)",
        rusqlite::named_params! {
            ":name": name,
            ":status": MIGRATION_APPLIED,
            ":applied_at": Timestamp::now(),
        },
    )?;
    Ok(())
}

pub struct ReplicaMigrationLogic;

impl MigrationLogic for ReplicaMigrationLogic {
    const NAME: &'static str = "replica storage db";
    const END_VERSION: u32 = 2;

    fn prepare(&self, conn: &Connection, _db_empty: bool) -> MigrationResult<()> {
        let initial_pragmas = "
            -- We don't care about temp tables being persisted to disk.
            PRAGMA temp_store = 2;
            -- we unconditionally want write-ahead-logging mode.
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
        ";
        conn.execute_batch(initial_pragmas)?;
        conn.set_prepared_statement_cache_capacity(128);
        Ok(())
    }

    fn init(&self, db: &Transaction<'_>) -> MigrationResult<()> {
        log::debug!("Creating schemas");
        db.execute_all(&[
            CREATE_CHANGE_LOG_SQL,
            CREATE_CHANGE_LOG_INDEX_SQL,
            CREATE_META_TABLE_SQL,
            CREATE_MIGRATIONS_STATUS_SQL,
        ])?;
        create_mirror_tables(db)?;
        for name in REQUIRED_MIGRATIONS {
            record_migration(db, name)?;
        }
        Ok(())
    }

    fn upgrade_from(&self, db: &Transaction<'_>, version: u32) -> MigrationResult<()> {
        match version {
            1 => upgrade_from_v1(db),
            _ => Err(MigrationError::IncompatibleVersion(version)),
        }
    }
}

fn upgrade_from_v1(db: &Connection) -> MigrationResult<()> {
    // v1 predates retry bookkeeping and the migration ledger.
    db.execute_all(&[
        "ALTER TABLE change_log ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;",
        "ALTER TABLE change_log ADD COLUMN error TEXT;",
        CREATE_MIGRATIONS_STATUS_SQL,
    ])?;
    for name in REQUIRED_MIGRATIONS {
        record_migration(db, name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sql_support::open_database::test_utils::MigratedDatabaseFile;
    use sql_support::open_database::open_memory_database;

    const CREATE_V1_SCHEMA_SQL: &str = "
        CREATE TABLE IF NOT EXISTS change_log (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name      TEXT NOT NULL,
            primary_key     TEXT NOT NULL,
            operation       TEXT NOT NULL,
            data            TEXT,
            old_data        TEXT,
            timestamp       INTEGER NOT NULL,
            processed_local INTEGER NOT NULL DEFAULT 0,
            processed_sync  INTEGER NOT NULL DEFAULT 0,
            from_server     INTEGER NOT NULL DEFAULT 0,
            lsn             TEXT
        );
        CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value NOT NULL);
        PRAGMA user_version=1;
    ";

    #[test]
    fn test_fresh_schema_records_migrations() {
        let conn = open_memory_database(&ReplicaMigrationLogic).unwrap();
        let count: i64 = conn
            .query_one("SELECT COUNT(*) FROM migrations_status WHERE status = 'applied'")
            .unwrap();
        assert_eq!(count as usize, REQUIRED_MIGRATIONS.len());
        // every registry table has a mirror
        for descriptor in TABLES {
            let n: i64 = conn
                .query_one(&format!("SELECT COUNT(*) FROM \"{}\"", descriptor.name))
                .unwrap();
            assert_eq!(n, 0);
        }
    }

    #[test]
    fn test_upgrade_from_v1_adds_retry_columns() {
        let db_file = MigratedDatabaseFile::new(ReplicaMigrationLogic, CREATE_V1_SCHEMA_SQL);
        let conn = db_file.open();
        conn.execute_batch(
            "INSERT INTO change_log
                (table_name, primary_key, operation, timestamp, attempts, error)
             VALUES ('tasks', 't-1', 'insert', 5, 2, 'boom');",
        )
        .unwrap();
        let attempts: i64 = conn
            .query_one("SELECT attempts FROM change_log WHERE primary_key = 't-1'")
            .unwrap();
        assert_eq!(attempts, 2);
        let migrated: i64 = conn
            .query_one("SELECT COUNT(*) FROM migrations_status")
            .unwrap();
        assert_eq!(migrated as usize, REQUIRED_MIGRATIONS.len());
    }
}
