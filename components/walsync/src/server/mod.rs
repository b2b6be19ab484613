/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The server end of the protocol: one `ServerSession` per connected
//! replica, all sharing a `ServerStore` and a `WalTail` through the
//! `ReplicationHub`. Sessions share no mutable state with each other
//! besides the store.

mod backend;
mod hub;
pub mod memory;
mod session;

pub use backend::{ClientApplyResult, RejectedChange, ServerStore, WalTail};
pub use hub::ReplicationHub;
pub use session::ServerSession;
