//! Shared-reader lock and line scanner over the socket's read half.
//!
//! Only one holder may issue commands and consume replies at a time: every
//! request/response interaction over the half-duplex REPL goes through
//! [`LockReader::with`], which is the serialization point between user
//! commands, RPCs, uploads and the background output dumper.

use std::io::{self, Read};
use std::sync::Mutex;
use std::time::Instant;

use hexplay::HexViewBuilder;
use log::{debug, log_enabled, Level::Debug};

use crate::error::{Error, Result};

/// Scoped exclusive access to the [`LineScanner`].
pub struct LockReader {
    inner: Mutex<LineScanner>,
}

impl LockReader {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        LockReader {
            inner: Mutex::new(LineScanner::new(reader)),
        }
    }

    /// Run `f` while holding the reader exclusively. No other
    /// device-interactive operation can begin until `f` returns.
    pub fn with<T>(&self, f: impl FnOnce(&mut LineScanner) -> T) -> T {
        let mut scanner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut scanner)
    }
}

/// Buffers raw socket bytes and carves them into lines.
///
/// The underlying socket is expected to time out on idle reads (the serial
/// port is opened with a 1 s read timeout); the scanner turns those
/// timeouts into polling so a caller-supplied deadline can be honored.
pub struct LineScanner {
    reader: Box<dyn Read + Send>,
    pending: Vec<u8>,
}

impl LineScanner {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        LineScanner {
            reader,
            pending: Vec::new(),
        }
    }

    /// Read one full line, stripping carriage returns, waiting at most
    /// until `deadline`. `what` names the awaited token for error context.
    pub fn read_line(&mut self, deadline: Instant, what: &str) -> Result<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                line.retain(|&b| b != b'\r');
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(what.to_string()));
            }
            let mut buf = [0u8; 256];
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    return Err(Error::io(
                        format!("awaiting {}", what),
                        io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed"),
                    ))
                }
                Ok(n) => {
                    dump_raw(&buf[..n]);
                    self.pending.extend_from_slice(&buf[..n]);
                }
                Err(e) if is_poll_timeout(&e) => continue,
                Err(e) => return Err(Error::io(format!("awaiting {}", what), e)),
            }
        }
    }

    /// Read whatever bytes are available, for the output dumper. Returns
    /// `Ok(0)` when the socket is merely idle and an error when it ends.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        match self.reader.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed",
            )),
            Ok(n) => {
                dump_raw(&buf[..n]);
                Ok(n)
            }
            Err(e) if is_poll_timeout(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Dump received data in a hex table for debugging.
fn dump_raw(data: &[u8]) {
    if log_enabled!(Debug) {
        let view = HexViewBuilder::new(data)
            .address_offset(0)
            .row_width(16)
            .finish();
        debug!("device -> host\n{}", view);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lines_are_carved_and_cr_stripped() {
        let data: &[u8] = b"one\r\ntwo\n\nrest";
        let lr = LockReader::new(Box::new(data));
        lr.with(|s| {
            let deadline = Instant::now() + Duration::from_secs(1);
            assert_eq!(s.read_line(deadline, "test").unwrap(), "one");
            assert_eq!(s.read_line(deadline, "test").unwrap(), "two");
            assert_eq!(s.read_line(deadline, "test").unwrap(), "");
        });
    }

    #[test]
    fn end_of_stream_is_an_io_error() {
        let lr = LockReader::new(Box::new(&b"no newline"[..]));
        lr.with(|s| {
            let deadline = Instant::now() + Duration::from_secs(1);
            let err = s.read_line(deadline, "token").unwrap_err();
            assert!(matches!(err, Error::Io { .. }));
        });
    }

    #[test]
    fn read_chunk_serves_pending_before_socket() {
        let lr = LockReader::new(Box::new(&b"abcdef"[..]));
        lr.with(|s| {
            s.pending.extend_from_slice(b"xy");
            let mut buf = [0u8; 4];
            assert_eq!(s.read_chunk(&mut buf).unwrap(), 2);
            assert_eq!(&buf[..2], b"xy");
            assert_eq!(s.read_chunk(&mut buf).unwrap(), 4);
            assert_eq!(&buf, b"abcd");
        });
    }
}
