/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use serde::{Deserialize, Serialize};

/// Errors raised by the protocol layers. The taxonomy matters more than the
/// shapes: `Framing` and `Protocol` close the connection and let the
/// supervisor reconnect, `Transient` retries with backoff, `Fatal` aborts
/// the session and surfaces the failing record, `Auth` aborts without
/// reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("No ACK for chunk {chunk} of message {message_id} within the chunk timeout")]
    ChunkTimeout { message_id: String, chunk: u32 },

    #[error("No inbound traffic within twice the heartbeat interval")]
    InactivityTimeout,

    #[error("Malformed LSN {0:?}")]
    InvalidLsn(String),

    #[error("Unknown table {0:?}")]
    UnknownTable(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Authentication required: {0}")]
    Auth(String),

    #[error("Transient I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wire error codes carried in `error` messages, one per §7 taxonomy bucket
/// that can be reported to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Framing,
    Protocol,
    ChunkTimeout,
    Transient,
    Fatal,
    Auth,
}

impl Error {
    /// The code to report to the peer when this error closes a session.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Error::Framing(_) | Error::FrameTooLarge(_) | Error::Json(_) => ErrorCode::Framing,
            Error::Protocol(_)
            | Error::InvalidLsn(_)
            | Error::UnknownTable(_)
            | Error::InactivityTimeout => ErrorCode::Protocol,
            Error::ChunkTimeout { .. } => ErrorCode::ChunkTimeout,
            Error::Io(_) | Error::Closed => ErrorCode::Transient,
            Error::Auth(_) => ErrorCode::Auth,
            Error::Backend(_) => ErrorCode::Fatal,
        }
    }
}
