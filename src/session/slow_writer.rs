//! Chunked, throttled writer used to feed the device's single-read buffer.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use super::CHUNK_SIZE;

/// Wraps any byte sink and writes in fixed chunks of [`CHUNK_SIZE`] bytes,
/// sleeping the configured throttle between chunks.
///
/// The device's single-threaded interpreter drops bytes when fed faster than
/// it can consume them; the chunk size matches the helper's single-read
/// buffer.
pub struct SlowWriter<W: Write> {
    w: W,
    throttle: Duration,
}

impl<W: Write> SlowWriter<W> {
    pub fn new(writer: W, throttle: Duration) -> Self {
        SlowWriter {
            w: writer,
            throttle,
        }
    }
}

impl<W: Write> Write for SlowWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let size = data.len();
        let mut rest = data;
        while !rest.is_empty() {
            let this_chunk = CHUNK_SIZE.min(rest.len());
            self.w.write_all(&rest[..this_chunk])?;
            rest = &rest[this_chunk..];
            thread::sleep(self.throttle);
        }
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the size of every write it receives.
    struct Recorder {
        chunks: Vec<usize>,
    }

    impl Write for Recorder {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.chunks.push(data.len());
            Ok(data.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn splits_into_device_sized_chunks() {
        let mut sw = SlowWriter::new(Recorder { chunks: vec![] }, Duration::from_millis(0));
        assert_eq!(sw.write(&[0u8; 300]).unwrap(), 300);
        assert_eq!(sw.w.chunks, vec![128, 128, 44]);
    }

    #[test]
    fn small_write_is_a_single_chunk() {
        let mut sw = SlowWriter::new(Recorder { chunks: vec![] }, Duration::from_millis(0));
        sw.write(&[0u8; 5]).unwrap();
        assert_eq!(sw.w.chunks, vec![5]);
    }
}
