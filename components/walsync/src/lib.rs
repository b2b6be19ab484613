/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The core replication protocol shared by the server and its replicas:
//! LSNs, the wire vocabulary, length-prefixed JSON framing, chunked
//! delivery with per-chunk ACKs, and the server-side session state machine.
//! The client-side engine lives in the `replica` component and builds on
//! everything here.

#![warn(rust_2018_idioms)]

pub mod chunk;
mod error;
pub mod framing;
mod lsn;
pub mod messages;
pub mod server;
mod settings;
pub mod tables;

pub use error::{Error, ErrorCode, Result};
pub use lsn::Lsn;
pub use settings::Settings;
