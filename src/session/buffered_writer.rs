//! Asynchronous socket writer backed by a bounded channel.

use std::io::{self, Write};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use log::warn;

/// Capacity of the write queue between callers and the drainer thread.
const WRITE_QUEUE: usize = 100;

/// Forwards byte slices via a bounded channel to a background worker that
/// writes to the socket. Senders copy the slice before enqueueing, so the
/// caller's buffer can be reused immediately; a full queue blocks the
/// caller until the drainer catches up.
pub struct BufferedWriter {
    tx: Mutex<Option<SyncSender<Vec<u8>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedWriter {
    pub fn new(mut writer: Box<dyn Write + Send>) -> Self {
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(WRITE_QUEUE);
        let worker = thread::spawn(move || {
            for data in rx {
                if let Err(e) = writer.write_all(&data) {
                    warn!("socket write failed: {}", e);
                    break;
                }
                let _ = writer.flush();
            }
        });
        BufferedWriter {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// A cheap cloneable handle implementing [`Write`] for use by the
    /// protocol writers.
    pub fn handle(&self) -> WriterHandle {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        WriterHandle { tx }
    }

    /// Stop the drainer after it has written everything already queued.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sender half handed to [`super::SlowWriter`] and [`super::LineWriter`].
#[derive(Clone)]
pub struct WriterHandle {
    tx: Option<SyncSender<Vec<u8>>>,
}

impl Write for WriterHandle {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "writer is closed")
        })?;
        tx.send(data.to_vec()).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "writer worker is gone")
        })?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, Sender};

    struct ChannelSink(Sender<Vec<u8>>);

    impl Write for ChannelSink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.send(data.to_vec()).ok();
            Ok(data.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn drains_queued_writes_on_close() {
        let (tx, rx) = channel();
        let bw = BufferedWriter::new(Box::new(ChannelSink(tx)));
        let mut handle = bw.handle();
        handle.write_all(b"first").unwrap();
        handle.write_all(b"second").unwrap();
        drop(handle);
        bw.close();
        let received: Vec<u8> = rx.try_iter().flatten().collect();
        assert_eq!(received, b"firstsecond");
    }

    #[test]
    fn writes_after_close_fail() {
        let (tx, _rx) = channel();
        let bw = BufferedWriter::new(Box::new(ChannelSink(tx)));
        bw.close();
        let mut handle = bw.handle();
        assert!(handle.write_all(b"late").is_err());
    }
}
