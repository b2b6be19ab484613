/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Seams to the two external collaborators the server end consumes: the
//! WAL tail reader and the server database. Implementations are expected
//! to be shared across sessions, so everything here takes `&self`.

use crate::lsn::Lsn;
use crate::messages::{AppliedChange, Change};

/// An ordered stream of decoded row changes with monotonic LSNs, resumable
/// from any LSN. The tailer that produces it is out of scope; this is the
/// interface the sessions consume.
pub trait WalTail: Send + Sync {
    /// The LSN of the most recently emitted change, `0/0` before any.
    fn current_lsn(&self) -> anyhow::Result<Lsn>;

    /// Changes with LSN strictly greater than `after`, in LSN order, at
    /// most `limit` of them.
    fn changes_since(&self, after: Lsn, limit: usize) -> anyhow::Result<Vec<Change>>;
}

/// A client change the server refused, with the reason the client will
/// surface to its user.
#[derive(Debug, Clone)]
pub struct RejectedChange {
    pub change_id: Option<i64>,
    pub reason: String,
}

/// Outcome of applying one `send_changes` batch.
#[derive(Debug, Clone, Default)]
pub struct ClientApplyResult {
    pub applied: Vec<AppliedChange>,
    pub rejected: Vec<RejectedChange>,
}

/// The server-authoritative store. Assigning LSNs to accepted client
/// changes and feeding them back into the WAL is this collaborator's job;
/// the session only relays.
pub trait ServerStore: Send + Sync {
    /// Full-table snapshot as insert images, in a stable order.
    fn snapshot(&self, table: &str) -> anyhow::Result<Vec<Change>>;

    /// Applies one client's changes in producer order, last-writer-wins by
    /// `updated_at`. Changes from concurrent clients are serialised by the
    /// implementation.
    fn apply_client_changes(
        &self,
        client_id: &str,
        changes: &[Change],
    ) -> anyhow::Result<ClientApplyResult>;
}
