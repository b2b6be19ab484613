/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Compile-time registry of the domain tables both ends replicate. A change
//! naming a table that isn't here is a protocol error, never silently
//! ignored - string-keyed dispatch stops at this boundary.

use crate::error::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [&'static str],
}

/// Every table the protocol knows how to carry. The replica schema creates a
/// local mirror for each entry; the server snapshots each entry during an
/// initial sync, in this order.
pub static TABLES: &[TableDescriptor] = &[
    TableDescriptor {
        name: "users",
        primary_key: "id",
        columns: &["id", "name", "email", "updated_at"],
    },
    TableDescriptor {
        name: "projects",
        primary_key: "id",
        columns: &["id", "owner_id", "name", "description", "updated_at"],
    },
    TableDescriptor {
        name: "tasks",
        primary_key: "id",
        columns: &["id", "project_id", "title", "state", "position", "updated_at"],
    },
];

/// Looks up a descriptor, failing with `UnknownTable` for anything not in
/// the registry.
pub fn table(name: &str) -> Result<&'static TableDescriptor> {
    TABLES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| Error::UnknownTable(name.to_string()))
}

impl TableDescriptor {
    /// Extracts the primary key value from a row image. The key must be
    /// present and scalar; anything else means the peer sent us a row we
    /// can't identify.
    pub fn primary_key_of(&self, row: &Value) -> Result<String> {
        let obj = row.as_object().ok_or_else(|| {
            Error::Protocol(format!("row image for {:?} is not an object", self.name))
        })?;
        match obj.get(self.primary_key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(Error::Protocol(format!(
                "row image for {:?} is missing primary key {:?}",
                self.name, self.primary_key
            ))),
        }
    }

    /// Checks a row image only contains known columns. Extra columns mean
    /// the two ends disagree about the schema, which is exactly the mismatch
    /// the applier must refuse to paper over.
    pub fn check_columns(&self, row: &Value) -> Result<()> {
        if let Some(obj) = row.as_object() {
            for key in obj.keys() {
                if !self.columns.contains(&key.as_str()) {
                    return Err(Error::Protocol(format!(
                        "unknown column {:?} in row image for {:?}",
                        key, self.name
                    )));
                }
            }
        }
        Ok(())
    }
}
