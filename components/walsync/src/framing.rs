/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Length-prefixed JSON framing over any bidirectional byte stream. One
//! frame is a 4-byte big-endian length followed by one UTF-8 JSON message.
//! Anything that doesn't parse - bad JSON, unknown `type`, oversized frame -
//! fails the session; the supervisor owns reconnecting.
//!
//! The stream's own read timeout drives the session's idle ticks: a timed
//! out read surfaces as `Received::Idle`, never as an error.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

/// Outcome of one `recv` call.
#[derive(Debug)]
pub enum Received<M> {
    /// A complete, well-formed message.
    Message(M),
    /// The read timed out before a full frame arrived. Time to run timers.
    Idle,
    /// The peer closed the connection.
    Closed,
}

pub struct FramedStream<S> {
    io: S,
    max_frame_bytes: usize,
    rbuf: Vec<u8>,
}

impl<S: Read + Write> FramedStream<S> {
    pub fn new(io: S, max_frame_bytes: usize) -> Self {
        Self {
            io,
            max_frame_bytes,
            rbuf: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    /// Writes one message as a single frame.
    pub fn send<M: Serialize>(&mut self, msg: &M) -> Result<()> {
        let body = serde_json::to_vec(msg)?;
        if body.len() > self.max_frame_bytes {
            return Err(Error::FrameTooLarge(body.len()));
        }
        let header = (body.len() as u32).to_be_bytes();
        self.io.write_all(&header)?;
        self.io.write_all(&body)?;
        self.io.flush()?;
        Ok(())
    }

    /// Reads until one full frame is buffered, the read times out, or the
    /// peer hangs up. A partial frame survives in the buffer across calls,
    /// so slow peers only cost idle ticks, not data.
    pub fn recv<M: DeserializeOwned>(&mut self) -> Result<Received<M>> {
        loop {
            if let Some(frame) = self.extract_frame()? {
                let msg = serde_json::from_slice(&frame)?;
                return Ok(Received::Message(msg));
            }
            let mut buf = [0u8; 4096];
            match self.io.read(&mut buf) {
                Ok(0) => {
                    if !self.rbuf.is_empty() {
                        log::warn!("connection closed mid-frame ({} bytes)", self.rbuf.len());
                    }
                    return Ok(Received::Closed);
                }
                Ok(n) => self.rbuf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(Received::Idle);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn extract_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.rbuf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.rbuf[0], self.rbuf[1], self.rbuf[2], self.rbuf[3]])
            as usize;
        if len > self.max_frame_bytes {
            return Err(Error::FrameTooLarge(len));
        }
        if self.rbuf.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.rbuf[4..4 + len].to_vec();
        self.rbuf.drain(..4 + len);
        Ok(Some(frame))
    }
}

/// An in-memory duplex byte pipe with read timeouts, so protocol tests can
/// wire a real client session to a real server session without sockets.
// It would be nice for this to be #[cfg(test)], but that doesn't allow it to
// be used in tests for our other crates.
pub mod pipe {
    use parking_lot::{Condvar, Mutex};
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Half {
        buf: Mutex<VecDeque<u8>>,
        readable: Condvar,
        closed: Mutex<bool>,
    }

    impl Half {
        fn close(&self) {
            *self.closed.lock() = true;
            self.readable.notify_all();
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock()
        }
    }

    /// One end of the pipe. Dropping an end closes both directions, so the
    /// peer observes a hangup exactly like a dropped socket.
    pub struct PipeEnd {
        rx: Arc<Half>,
        tx: Arc<Half>,
        read_timeout: Duration,
    }

    /// A connected pair of pipe ends.
    pub fn pair(read_timeout: Duration) -> (PipeEnd, PipeEnd) {
        let a = Arc::new(Half::default());
        let b = Arc::new(Half::default());
        (
            PipeEnd {
                rx: Arc::clone(&a),
                tx: Arc::clone(&b),
                read_timeout,
            },
            PipeEnd {
                rx: b,
                tx: a,
                read_timeout,
            },
        )
    }

    impl Read for PipeEnd {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let mut buf = self.rx.buf.lock();
            while buf.is_empty() {
                if self.rx.is_closed() {
                    return Ok(0);
                }
                let timed_out = self
                    .rx
                    .readable
                    .wait_for(&mut buf, self.read_timeout)
                    .timed_out();
                if timed_out && buf.is_empty() {
                    if self.rx.is_closed() {
                        return Ok(0);
                    }
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "read timed out"));
                }
            }
            let n = out.len().min(buf.len());
            for (i, byte) in buf.drain(..n).enumerate() {
                out[i] = byte;
            }
            Ok(n)
        }
    }

    impl Write for PipeEnd {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.tx.is_closed() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer hung up"));
            }
            self.tx.buf.lock().extend(data);
            self.tx.readable.notify_all();
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for PipeEnd {
        fn drop(&mut self) {
            self.rx.close();
            self.tx.close();
        }
    }
}
