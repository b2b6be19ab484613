/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The wire vocabulary. Every frame is one JSON object with a `type` tag and
//! a `messageId` unique within the session; the two directions are distinct
//! enums so each end statically matches only messages it may legally
//! receive. An unknown `type` fails deserialization, which the framing layer
//! reports as a framing error.

use crate::error::ErrorCode;
use crate::lsn::Lsn;
use crate::tables;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use types::Timestamp;

/// A single row-level mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub table: String,
    pub operation: Op,
    /// Post-image for insert/update; null for delete.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Pre-image for update/delete; carries at least the primary key.
    #[serde(rename = "oldData", default, skip_serializing_if = "Value::is_null")]
    pub old_data: Value,
    /// Assigned by the server when the change is emitted; absent on
    /// client-originated changes until acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<Lsn>,
    /// Server clock for server changes, local clock for client changes.
    #[serde(rename = "updatedAt")]
    pub updated_at: Timestamp,
    /// Client-side change-log surrogate, echoed back by the server in
    /// `changes_received`/`changes_applied` so the replica can correlate
    /// acknowledgements. Opaque to the server.
    #[serde(rename = "changeId", default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Insert,
    Update,
    Delete,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Insert => "insert",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Op {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "insert" => Ok(Op::Insert),
            "update" => Ok(Op::Update),
            "delete" => Ok(Op::Delete),
            other => Err(crate::error::Error::Protocol(format!(
                "unknown operation {:?}",
                other
            ))),
        }
    }
}

impl Change {
    /// The stable identity of the row this change mutates.
    pub fn identity(&self) -> crate::error::Result<(&str, String)> {
        let descriptor = tables::table(&self.table)?;
        let image = match self.operation {
            Op::Insert | Op::Update => &self.data,
            Op::Delete => {
                if self.old_data.is_null() {
                    &self.data
                } else {
                    &self.old_data
                }
            }
        };
        Ok((descriptor.name, descriptor.primary_key_of(image)?))
    }
}

/// Validates a batch of inbound changes against the table registry before
/// anything touches storage: known table, identifiable row, known columns.
pub fn validate_changes(changes: &[Change]) -> crate::error::Result<()> {
    for change in changes {
        let descriptor = tables::table(&change.table)?;
        change.identity()?;
        if !change.data.is_null() {
            descriptor.check_columns(&change.data)?;
        }
        if !change.old_data.is_null() {
            descriptor.check_columns(&change.old_data)?;
        }
    }
    Ok(())
}

/// Position of one chunk within a chunked stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSequence {
    pub chunk: u32,
    pub total: u32,
}

/// One client change the server has applied, with its assigned LSN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    #[serde(rename = "changeId")]
    pub change_id: i64,
    pub lsn: Lsn,
}

/// Messages the server sends to a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    InitStart {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "serverLSN")]
        server_lsn: Lsn,
    },
    InitChanges {
        #[serde(rename = "messageId")]
        message_id: String,
        sequence: ChunkSequence,
        changes: Vec<Change>,
    },
    InitComplete {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "serverLSN")]
        server_lsn: Lsn,
    },
    CatchupChanges {
        #[serde(rename = "messageId")]
        message_id: String,
        sequence: ChunkSequence,
        changes: Vec<Change>,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },
    /// `sync_completed` is the legacy spelling some older servers still
    /// emit; we accept it and never send it.
    #[serde(alias = "sync_completed")]
    CatchupCompleted {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "finalLSN")]
        final_lsn: Lsn,
        #[serde(rename = "changeCount")]
        change_count: u64,
        success: bool,
    },
    LiveStart {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "finalLSN")]
        final_lsn: Lsn,
    },
    LiveChanges {
        #[serde(rename = "messageId")]
        message_id: String,
        sequence: ChunkSequence,
        changes: Vec<Change>,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },
    /// Keep-alive LSN advance when live traffic is idle.
    LsnUpdate {
        #[serde(rename = "messageId")]
        message_id: String,
        lsn: Lsn,
    },
    /// Client changes accepted for processing.
    ChangesReceived {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "changeIds")]
        change_ids: Vec<i64>,
    },
    /// Client changes applied (or rejected). A change the client sent that
    /// is absent from `applied_changes` was rejected; `error` says why.
    ChangesApplied {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "appliedChanges")]
        applied_changes: Vec<AppliedChange>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Heartbeat {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Error {
        #[serde(rename = "messageId")]
        message_id: String,
        code: ErrorCode,
        message: String,
    },
}

/// Messages a replica sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Session opener: who we are and where we stopped.
    Sync {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
        #[serde(rename = "resetSync", default, skip_serializing_if = "std::ops::Not::not")]
        reset_sync: bool,
    },
    InitReceived {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "inReplyTo")]
        in_reply_to: String,
        chunk: u32,
    },
    InitProcessed {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    CatchupReceived {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "inReplyTo")]
        in_reply_to: String,
        chunk: u32,
        lsn: Lsn,
    },
    /// Per-chunk ACK for `live_changes`.
    ChangesReceived {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "inReplyTo")]
        in_reply_to: String,
        chunk: u32,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },
    /// Application report for live server changes, by LSN.
    ChangesApplied {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "appliedChanges")]
        applied_changes: Vec<Lsn>,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },
    SendChanges {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "clientId")]
        client_id: String,
        changes: Vec<Change>,
    },
    Heartbeat {
        #[serde(rename = "messageId")]
        message_id: String,
        lsn: Lsn,
        active: bool,
    },
    Disconnect {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ServerMessage {
    pub fn message_id(&self) -> &str {
        match self {
            ServerMessage::InitStart { message_id, .. }
            | ServerMessage::InitChanges { message_id, .. }
            | ServerMessage::InitComplete { message_id, .. }
            | ServerMessage::CatchupChanges { message_id, .. }
            | ServerMessage::CatchupCompleted { message_id, .. }
            | ServerMessage::LiveStart { message_id, .. }
            | ServerMessage::LiveChanges { message_id, .. }
            | ServerMessage::LsnUpdate { message_id, .. }
            | ServerMessage::ChangesReceived { message_id, .. }
            | ServerMessage::ChangesApplied { message_id, .. }
            | ServerMessage::Heartbeat { message_id }
            | ServerMessage::Error { message_id, .. } => message_id,
        }
    }
}

impl ClientMessage {
    pub fn message_id(&self) -> &str {
        match self {
            ClientMessage::Sync { message_id, .. }
            | ClientMessage::InitReceived { message_id, .. }
            | ClientMessage::InitProcessed { message_id }
            | ClientMessage::CatchupReceived { message_id, .. }
            | ClientMessage::ChangesReceived { message_id, .. }
            | ClientMessage::ChangesApplied { message_id, .. }
            | ClientMessage::SendChanges { message_id, .. }
            | ClientMessage::Heartbeat { message_id, .. }
            | ClientMessage::Disconnect { message_id, .. } => message_id,
        }
    }
}

/// Session-scoped message id allocator. Ids only need to be unique within
/// one session, so a role prefix plus a counter is enough - and makes
/// transcripts in test failures legible.
#[derive(Debug)]
pub struct MessageIds {
    prefix: &'static str,
    next: u64,
}

impl MessageIds {
    pub fn client() -> Self {
        Self {
            prefix: "c",
            next: 0,
        }
    }

    pub fn server() -> Self {
        Self {
            prefix: "s",
            next: 0,
        }
    }

    pub fn next(&mut self) -> String {
        self.next += 1;
        format!("{}-{}", self.prefix, self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let msg = ServerMessage::CatchupChanges {
            message_id: "s-3".into(),
            sequence: ChunkSequence { chunk: 2, total: 3 },
            changes: vec![Change {
                table: "tasks".into(),
                operation: Op::Insert,
                data: json!({"id": "t-1", "title": "hello", "updated_at": 5}),
                old_data: Value::Null,
                lsn: Some(Lsn::new(0, 0xD)),
                updated_at: Timestamp(5),
                change_id: None,
            }],
            last_lsn: Lsn::new(0, 0xD),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "catchup_changes");
        assert_eq!(value["messageId"], "s-3");
        assert_eq!(value["lastLSN"], "0/D");
        assert_eq!(value["sequence"]["chunk"], 2);
        assert_eq!(value["changes"][0]["operation"], "insert");
        // absent fields stay off the wire
        assert!(value["changes"][0].get("oldData").is_none());
        assert!(value["changes"][0].get("changeId").is_none());
    }

    #[test]
    fn test_sync_completed_alias() {
        let legacy = json!({
            "type": "sync_completed",
            "messageId": "s-9",
            "finalLSN": "0/FE",
            "changeCount": 250,
            "success": true,
        });
        let msg: ServerMessage = serde_json::from_value(legacy).unwrap();
        assert!(matches!(
            msg,
            ServerMessage::CatchupCompleted {
                change_count: 250,
                success: true,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let bad = json!({ "type": "mystery", "messageId": "x-1" });
        assert!(serde_json::from_value::<ServerMessage>(bad.clone()).is_err());
        assert!(serde_json::from_value::<ClientMessage>(bad).is_err());
    }

    #[test]
    fn test_sync_round_trip() {
        let msg = ClientMessage::Sync {
            message_id: "c-1".into(),
            client_id: "11111111-2222-3333-4444-555555555555".into(),
            last_lsn: Lsn::ZERO,
            reset_sync: false,
        };
        let text = serde_json::to_string(&msg).unwrap();
        // resetSync defaults off the wire
        assert!(!text.contains("resetSync"));
        let back: ClientMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_identity_of_delete_uses_old_data() {
        let change = Change {
            table: "users".into(),
            operation: Op::Delete,
            data: Value::Null,
            old_data: json!({"id": "u-2"}),
            lsn: None,
            updated_at: Timestamp(1),
            change_id: None,
        };
        assert_eq!(change.identity().unwrap(), ("users", "u-2".to_string()));
    }

    #[test]
    fn test_validate_changes_rejects_unknown_table() {
        let change = Change {
            table: "invoices".into(),
            operation: Op::Insert,
            data: json!({"id": "i-1"}),
            old_data: Value::Null,
            lsn: None,
            updated_at: Timestamp(1),
            change_id: None,
        };
        assert!(validate_changes(&[change]).is_err());
    }

    #[test]
    fn test_message_ids_are_session_unique() {
        let mut ids = MessageIds::client();
        assert_eq!(ids.next(), "c-1");
        assert_eq!(ids.next(), "c-2");
        assert_eq!(MessageIds::server().next(), "s-1");
    }
}
