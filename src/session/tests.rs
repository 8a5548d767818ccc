//! Session protocol tests against a scripted in-memory device.

use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use sha1::{Digest, Sha1};

use super::*;
use crate::error::Error;
use crate::utils;

// =============================================================================
// In-memory byte pipes standing in for the serial socket
// =============================================================================

/// Host-side read half. Mimics a serial port read timeout so the scanner
/// can poll against its deadline.
struct PipeReader {
    rx: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(data) => self.leftover = data,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        // A device that went away just swallows the bytes.
        self.tx.send(data.to_vec()).ok();
        Ok(data.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The device side of the pipe pair, driven by test scripts.
struct FakeDevice {
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
    pending: Vec<u8>,
}

impl FakeDevice {
    fn say(&self, text: &str) {
        self.tx.send(format!("{}\n", text).into_bytes()).ok();
    }

    fn read_line(&mut self) -> String {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                return String::from_utf8_lossy(&line).into_owned();
            }
            match self.rx.recv_timeout(Duration::from_secs(5)) {
                Ok(data) => self.pending.extend_from_slice(&data),
                Err(e) => panic!("fake device starved waiting for host data: {:?}", e),
            }
        }
    }

    /// Skip lines until one containing `needle` arrives.
    fn expect_line(&mut self, needle: &str) -> String {
        loop {
            let line = self.read_line();
            if line.contains(needle) {
                return line;
            }
        }
    }

    fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        while self.pending.len() < n {
            match self.rx.recv_timeout(Duration::from_secs(5)) {
                Ok(data) => self.pending.extend_from_slice(&data),
                Err(e) => panic!("fake device starved waiting for {} bytes: {:?}", n, e),
            }
        }
        self.pending.drain(..n).collect()
    }

    fn confirm_runtime(&mut self) {
        self.expect_line("tostring(__espore");
        self.say("espore=true");
    }
}

fn fake_session(deadline: Duration) -> (Session, FakeDevice) {
    let (host_tx, dev_rx) = channel();
    let (dev_tx, host_rx) = channel();
    let session = Session::new(Config {
        reader: Box::new(PipeReader {
            rx: host_rx,
            leftover: Vec::new(),
        }),
        writer: Box::new(PipeWriter { tx: host_tx }),
        deadline,
        throttle: Duration::from_millis(1),
    });
    let device = FakeDevice {
        rx: dev_rx,
        tx: dev_tx,
        pending: Vec::new(),
    };
    (session, device)
}

const TEST_DEADLINE: Duration = Duration::from_secs(5);

// =============================================================================
// Protocol operations
// =============================================================================

#[test]
fn chip_id_is_captured_from_the_reply() {
    let (session, mut device) = fake_session(TEST_DEADLINE);
    let script = thread::spawn(move || {
        device.expect_line("node.chipid()");
        device.say("id=8fe91a");
    });
    assert_eq!(session.get_chip_id().unwrap(), "8fe91a");
    script.join().unwrap();
}

#[test]
fn ensure_runtime_accepts_an_installed_helper() {
    let (session, mut device) = fake_session(TEST_DEADLINE);
    let script = thread::spawn(move || {
        device.confirm_runtime();
    });
    session.ensure_runtime().unwrap();
    script.join().unwrap();
}

#[test]
fn missing_helper_is_written_line_by_line_and_required_again() {
    let (session, mut device) = fake_session(TEST_DEADLINE);
    let script = thread::spawn(move || {
        device.expect_line("tostring(__espore");
        device.say("espore=false");
        device.expect_line("require('__espore')");
        device.say("lua: cannot open __espore  module '__espore' not found");
        device.expect_line("file.open(\"__espore.lua\"");
        let mut lines = 0usize;
        loop {
            let line = device.read_line();
            if line.contains("file.close()") {
                break;
            }
            if line.contains("file.writeline(") {
                lines += 1;
            }
        }
        assert_eq!(lines, RUNTIME_LUA.lines().count());
        device.expect_line("require('__espore')");
        device.say("READY");
    });
    session.ensure_runtime().unwrap();
    script.join().unwrap();
}

#[test]
fn runtime_install_fails_after_one_retry() {
    let (session, mut device) = fake_session(Duration::from_millis(400));
    let script = thread::spawn(move || {
        device.expect_line("tostring(__espore");
        device.say("espore=false");
        // Stay silent from here on: both requires run into their deadline.
        loop {
            if device.rx.recv_timeout(Duration::from_secs(2)).is_err() {
                break;
            }
        }
    });
    let err = session.ensure_runtime().unwrap_err();
    assert!(matches!(err, Error::RuntimeInstallFailed(_)));
    script.join().unwrap();
}

/// Scenario E2: a 300-byte upload is sent as 128+128+44, gated on the
/// device's remaining-count echo, then checksummed and renamed.
#[test]
fn push_stream_uploads_gated_chunks() {
    let (session, mut device) = fake_session(TEST_DEADLINE);
    let payload = vec![b'A'; 300];
    let expected = payload.clone();

    let script = thread::spawn(move || -> Vec<u8> {
        device.confirm_runtime();
        let cmd = device.expect_line("__espore.upload");
        assert!(cmd.contains("\"__upload.tmp\", 300"));
        device.say("BEGIN");

        let mut received = Vec::new();
        device.say("300");
        for chunk in [128usize, 128, 44] {
            received.extend(device.read_bytes(chunk));
            device.say(&format!("{}", 300 - received.len()));
        }
        let mut hasher = Sha1::new();
        hasher.update(&received);
        device.say(&utils::hex_digest(hasher));

        // The confirming rename re-probes the runtime.
        device.confirm_runtime();
        device.expect_line("__espore.rename(\"__upload.tmp\", \"app.lua\")");
        device.say("RENAME_OK");
        received
    });

    session
        .push_stream(&mut &payload[..], 300, "app.lua")
        .unwrap();
    assert_eq!(script.join().unwrap(), expected);
}

#[test]
fn push_stream_detects_a_checksum_mismatch() {
    let (session, mut device) = fake_session(TEST_DEADLINE);
    let payload = vec![b'B'; 64];
    let script = thread::spawn(move || {
        device.confirm_runtime();
        device.expect_line("__espore.upload");
        device.say("BEGIN");
        device.say("64");
        device.read_bytes(64);
        device.say("0");
        device.say(&"0".repeat(40));
    });
    let err = session
        .push_stream(&mut &payload[..], 64, "app.lua")
        .unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }));
    script.join().unwrap();
}

/// The remaining count must never grow; the device echoing more bytes
/// outstanding than before is a protocol violation.
#[test]
fn push_stream_rejects_out_of_order_progress() {
    let (session, mut device) = fake_session(TEST_DEADLINE);
    let payload = vec![b'C'; 300];
    let script = thread::spawn(move || {
        device.confirm_runtime();
        device.expect_line("__espore.upload");
        device.say("BEGIN");
        device.say("300");
        device.read_bytes(128);
        device.say("400");
    });
    let err = session
        .push_stream(&mut &payload[..], 300, "app.lua")
        .unwrap_err();
    assert!(matches!(err, Error::ProtocolMismatch(_)));
    script.join().unwrap();
}

#[test]
fn rename_fail_is_reported() {
    let (session, mut device) = fake_session(TEST_DEADLINE);
    let script = thread::spawn(move || {
        device.confirm_runtime();
        device.expect_line("__espore.rename");
        device.say("RENAME_FAIL");
    });
    let err = session.rename_file("a.lua", "b.lua").unwrap_err();
    assert!(matches!(err, Error::RenameFailed { .. }));
    script.join().unwrap();
}

/// Scenario E3: an RPC reply spread over several lines is reassembled and
/// its `ret` value returned raw.
#[test]
fn rpc_returns_the_ret_value() {
    let (session, mut device) = fake_session(TEST_DEADLINE);
    let script = thread::spawn(move || {
        device.confirm_runtime();
        device.expect_line("__espore.call");
        device.say("some unrelated print output");
        device.say("{");
        device.say("\"ret\":{\"a\":1,\"b\":2},");
        device.say("\"err\":\"\"");
        device.say("}");
    });
    let ret = session.rpc("return {a=1,b=2}").unwrap();
    assert_eq!(ret, serde_json::json!({"a": 1, "b": 2}));
    script.join().unwrap();
}

#[test]
fn rpc_surfaces_the_device_error() {
    let (session, mut device) = fake_session(TEST_DEADLINE);
    let script = thread::spawn(move || {
        device.confirm_runtime();
        device.expect_line("__espore.call");
        device.say("{\"err\":\"attempt to index a nil value\"}");
    });
    match session.rpc("return boom.field").unwrap_err() {
        Error::Rpc(msg) => assert!(msg.contains("nil value")),
        other => panic!("expected rpc error, got {:?}", other),
    }
    script.join().unwrap();
}

// =============================================================================
// Deadlines and stream end
// =============================================================================

/// Scenario E4: a silent device trips the await deadline. The configured
/// deadline is shrunk so the test does not sit out the full 10 seconds.
#[test]
fn await_regex_times_out_on_a_silent_device() {
    let (session, device) = fake_session(Duration::from_millis(200));
    let err = session.await_regex("X").unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    drop(device);
}

#[test]
fn await_regex_fails_when_the_stream_closes() {
    let (session, device) = fake_session(TEST_DEADLINE);
    drop(device);
    let err = session.await_regex("X").unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
}

#[test]
fn await_json_skips_noise_and_counts_braces() {
    let (session, device) = fake_session(TEST_DEADLINE);
    device.say("garbage before");
    device.say("prefix {");
    device.say("\"nested\": {\"x\": 1},");
    device.say("\"done\": true");
    device.say("}");
    let text = session.await_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["nested"]["x"], 1);
    assert_eq!(value["done"], true);
}
