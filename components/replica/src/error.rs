/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use walsync::Lsn;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error synchronizing: {0}")]
    SyncError(#[from] walsync::Error),

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Applied LSN would regress from {from} to {to}")]
    LsnRegression { from: Lsn, to: Lsn },

    #[error("Required migration {0:?} has not been applied")]
    MigrationMissing(String),

    #[error("Fatal change for {table}/{primary_key}: {message}")]
    FatalChange {
        table: String,
        primary_key: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
