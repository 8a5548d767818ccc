//! Device session protocol.
//!
//! A [`Session`] drives the device's text REPL as a byte-stream protocol:
//! it bootstraps the embedded helper runtime on demand, uploads files with
//! flow control and checksum verification, and invokes remote procedures
//! that return structured JSON replies.
//!
//! The session owns an asynchronous writer (a bounded channel drained by a
//! background thread) and a single reader guarded by a mutex supporting
//! scoped exclusive sections. Every request/response exchange takes the
//! reader lock for its whole duration; the TUI's output dumper reads
//! through the same lock in between.

mod buffered_writer;
mod line_writer;
mod lock_reader;
mod runtime;
mod slow_writer;

#[cfg(test)]
mod tests;

use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::settings::Settings;
use crate::utils;

pub use buffered_writer::{BufferedWriter, WriterHandle};
pub use line_writer::LineWriter;
pub use lock_reader::{LineScanner, LockReader};
pub use runtime::RUNTIME_LUA;
pub use slow_writer::SlowWriter;

use runtime::lua_quote;

/// Pause between protocol write units. Matches the device's UART buffering;
/// changing it breaks compatibility with the embedded helper.
pub const THROTTLE: Duration = Duration::from_millis(100);

/// Upload chunk size. Matches the helper's single-read buffer.
pub const CHUNK_SIZE: usize = 128;

/// Default deadline for awaiting a device token or JSON object.
pub const DEADLINE: Duration = Duration::from_secs(10);

/// Name files are uploaded under before the confirming rename.
const UPLOAD_TMPFILE: &str = "__upload.tmp";

/// Capability for UI-directed session output. Text arrives in fragments;
/// the sink decides how to render them.
pub trait Logger: Send + Sync {
    fn print(&self, text: &str);
}

struct DefaultLogger;

impl Logger for DefaultLogger {
    fn print(&self, text: &str) {
        let trimmed = text.trim_end();
        if !trimmed.is_empty() {
            log::info!("{}", trimmed);
        }
    }
}

/// Session construction parameters. The socket is handed over as its two
/// halves; callers that own a real serial port clone it (see
/// [`Session::open`]).
pub struct Config {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    /// Await deadline; defaults to [`DEADLINE`].
    pub deadline: Duration,
    /// Write pacing; defaults to [`THROTTLE`].
    pub throttle: Duration,
}

impl Config {
    pub fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
        Config {
            reader,
            writer,
            deadline: DEADLINE,
            throttle: THROTTLE,
        }
    }
}

/// A live link to one device.
pub struct Session {
    writer: BufferedWriter,
    reader: LockReader,
    deadline: Duration,
    throttle: Duration,
    logger: RwLock<Arc<dyn Logger>>,
}

impl Session {
    pub fn new(config: Config) -> Session {
        Session {
            writer: BufferedWriter::new(config.writer),
            reader: LockReader::new(config.reader),
            deadline: config.deadline,
            throttle: config.throttle,
            logger: RwLock::new(Arc::new(DefaultLogger)),
        }
    }

    /// Open the serial port described by `settings` and wrap it in a
    /// session. The port handle is cloned so reads and writes can proceed
    /// independently.
    pub fn open(settings: &Settings) -> Result<Session> {
        let port = utils::open_and_setup_port(settings).map_err(|e| {
            Error::io(
                format!("opening serial port {}", settings.path),
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )
        })?;
        let writer = port.try_clone().map_err(|e| {
            Error::io(
                format!("cloning serial port {}", settings.path),
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )
        })?;
        Ok(Session::new(Config::new(Box::new(port), Box::new(writer))))
    }

    /// Route session output somewhere other than the process log, e.g. the
    /// TUI output pane.
    pub fn set_logger(&self, logger: Arc<dyn Logger>) {
        *self.logger.write().unwrap_or_else(|e| e.into_inner()) = logger;
    }

    fn log(&self, text: &str) {
        self.logger
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .print(text);
    }

    /// Run `f` while holding the shared reader exclusively. Used by the
    /// output dumper to read device chatter between interactive exchanges.
    pub fn with_reader<T>(&self, f: impl FnOnce(&mut LineScanner) -> T) -> T {
        self.reader.with(f)
    }

    // =========================================================================
    // Wire primitives
    // =========================================================================

    /// Line-write `cmd` to the socket. Fire-and-forget: never waits for a
    /// device reply, only for queue capacity on the async writer.
    pub fn send_command(&self, cmd: &str) -> Result<()> {
        let mut lw = LineWriter::new(self.writer.handle(), self.throttle);
        lw.write_all(cmd.as_bytes())
            .map_err(|e| Error::io("sending command", e))
    }

    /// Read full lines from the locked reader until one matches `pattern`;
    /// returns the whole match followed by its capture groups.
    pub fn await_regex(&self, pattern: &str) -> Result<Vec<String>> {
        self.reader.with(|s| self.await_regex_on(s, pattern))
    }

    fn await_regex_on(&self, scanner: &mut LineScanner, pattern: &str) -> Result<Vec<String>> {
        let regex =
            Regex::new(pattern).map_err(|e| Error::parse("compiling await pattern", e))?;
        let deadline = Instant::now() + self.deadline;
        loop {
            let line = scanner.read_line(deadline, pattern)?;
            if let Some(caps) = regex.captures(&line) {
                return Ok(caps
                    .iter()
                    .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect());
            }
        }
    }

    /// Read lines until the first `{`, then accumulate until the brace
    /// depth returns to zero. The deadline resets whenever a `{`, `}` or
    /// `,` token arrives, so a slow but active sender is not cut off.
    /// Returns the raw text of the JSON object.
    pub fn await_json(&self) -> Result<String> {
        self.reader.with(|s| self.await_json_on(s))
    }

    fn await_json_on(&self, scanner: &mut LineScanner) -> Result<String> {
        let mut deadline = Instant::now() + self.deadline;
        let mut text = String::new();
        let mut depth: i64 = 0;
        let mut started = false;
        loop {
            let line = scanner.read_line(deadline, "JSON reply")?;
            let slice = if started {
                line.as_str()
            } else {
                match line.find('{') {
                    Some(i) => {
                        started = true;
                        &line[i..]
                    }
                    None => continue,
                }
            };
            for ch in slice.chars() {
                match ch {
                    '{' => depth += 1,
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            text.push_str(slice);
            text.push('\n');
            if slice.contains(['{', '}', ',']) {
                deadline = Instant::now() + self.deadline;
            }
            if depth <= 0 {
                return Ok(text);
            }
        }
    }

    // =========================================================================
    // Protocol operations
    // =========================================================================

    /// Query the device chip ID. The probe is split so that the echoed
    /// command line can never match the reply pattern.
    pub fn get_chip_id(&self) -> Result<String> {
        self.reader.with(|scanner| {
            self.send_command("\nprint('i' .. 'd=' .. node.chipid())\n")?;
            let m = self.await_regex_on(scanner, "id=(.*)")?;
            Ok(m[1].clone())
        })
    }

    /// Make sure the `__espore` helper is active, installing it if needed.
    pub fn ensure_runtime(&self) -> Result<()> {
        self.reader.with(|scanner| self.ensure_runtime_on(scanner))
    }

    fn ensure_runtime_on(&self, scanner: &mut LineScanner) -> Result<()> {
        self.send_command("\nprint(\"espore=\" .. tostring(__espore ~= nil))\n")?;
        let installed = self
            .await_regex_on(scanner, "espore=(true|false)")
            .map_err(|e| match e {
                Error::Timeout(_) => {
                    Error::RuntimeInstallFailed("no reply to the runtime probe".into())
                }
                other => other,
            })?;
        if installed[1] == "true" {
            return Ok(());
        }
        self.push_runtime_on(scanner)
    }

    /// Install the helper: `require` it, and when the device reports the
    /// module missing, write the blob to the device filesystem line by
    /// line and reissue the `require`. One retry, then
    /// [`Error::RuntimeInstallFailed`].
    fn push_runtime_on(&self, scanner: &mut LineScanner) -> Result<()> {
        self.log("Installing espore runtime ... ");
        for _attempt in 0..2 {
            self.send_command("require('__espore')")?;
            match self.await_regex_on(scanner, "READY|module '__espore' not found") {
                Ok(m) if m[0].contains("READY") => {
                    self.log("OK\n");
                    return Ok(());
                }
                Ok(_) | Err(Error::Timeout(_)) => self.write_runtime_file()?,
                Err(e) => return Err(e),
            }
        }
        self.log("ERROR\n");
        Err(Error::RuntimeInstallFailed(
            "helper did not report READY".into(),
        ))
    }

    fn write_runtime_file(&self) -> Result<()> {
        self.send_command("file.open(\"__espore.lua\", \"w+\")")?;
        for line in RUNTIME_LUA.lines() {
            self.send_command(&format!("file.writeline({})", lua_quote(line)))?;
        }
        self.send_command("file.close()")
    }

    /// Push the helper blob onto the device filesystem through the regular
    /// upload protocol, replacing whatever `__espore.lua` is there.
    pub fn install_runtime(&self) -> Result<()> {
        let mut blob = RUNTIME_LUA.as_bytes();
        self.push_stream(&mut blob, RUNTIME_LUA.len() as u64, "__espore.lua")
    }

    /// Upload `size` bytes from `reader` to the device as `dst_name`.
    ///
    /// The whole exchange holds the reader lock: start the helper upload,
    /// await `BEGIN`, then stream 128-byte chunks gated on the device's
    /// bytes-remaining echo, verify the device-computed SHA-1 against the
    /// rolling local one, and finally rename the temporary file into
    /// place.
    pub fn push_stream(
        &self,
        reader: &mut (dyn Read + Send),
        size: u64,
        dst_name: &str,
    ) -> Result<()> {
        self.log(&format!("Pushing {} ", dst_name));
        let result = self.reader.with(|scanner| -> Result<()> {
            self.ensure_runtime_on(scanner)?;
            self.send_command(&format!(
                "__espore.upload(\"{}\", {})",
                UPLOAD_TMPFILE, size
            ))?;
            self.await_regex_on(scanner, "BEGIN").map_err(|e| match e {
                Error::Timeout(_) => {
                    Error::ProtocolMismatch("no BEGIN signal for upload".into())
                }
                other => other,
            })?;
            let local_hash = self.stream_chunks(scanner, reader, size)?;
            let m = self.await_regex_on(scanner, "^([0-9a-f]{40})$")?;
            if m[1] != local_hash {
                return Err(Error::ChecksumMismatch {
                    expected: local_hash,
                    reported: m[1].clone(),
                });
            }
            Ok(())
        });
        if let Err(e) = result {
            self.log("ERROR\n");
            return Err(e);
        }
        if let Err(e) = self.rename_file(UPLOAD_TMPFILE, dst_name) {
            self.log("ERROR\n");
            return Err(e);
        }
        self.log("OK\n");
        Ok(())
    }

    /// The gated chunk pump: a sender thread feeds the slow writer while
    /// this thread consumes the device's bytes-remaining lines, joined by
    /// a rendezvous channel. Returns the locally computed SHA-1.
    fn stream_chunks(
        &self,
        scanner: &mut LineScanner,
        reader: &mut (dyn Read + Send),
        size: u64,
    ) -> Result<String> {
        let (ack_tx, ack_rx) = mpsc::sync_channel::<u64>(0);
        let mut slow = SlowWriter::new(self.writer.handle(), self.throttle);

        thread::scope(|scope| {
            let sender = scope.spawn(move || -> Result<String> {
                let mut hasher = Sha1::new();
                let mut sent: u64 = 0;
                let mut buf = [0u8; CHUNK_SIZE];
                // Only release the next chunk once the device has
                // acknowledged everything sent so far.
                while let Ok(received) = ack_rx.recv() {
                    if sent == received {
                        let n = reader
                            .read(&mut buf)
                            .map_err(|e| Error::io("reading upload source", e))?;
                        if n == 0 {
                            break;
                        }
                        hasher.update(&buf[..n]);
                        slow.write_all(&buf[..n])
                            .map_err(|e| Error::io("writing upload chunk", e))?;
                        sent += n as u64;
                    }
                }
                Ok(utils::hex_digest(hasher))
            });

            let mut received: u64 = 0;
            let mut last_remaining = size;
            let mut progress_mark = 0u64;
            let mut recv_err: Option<Error> = None;
            while received < size {
                if ack_tx.send(received).is_err() {
                    break;
                }
                match self.await_regex_on(scanner, r"^(\d+)$") {
                    Ok(m) => {
                        let remaining: u64 = match m[1].parse() {
                            Ok(v) => v,
                            Err(_) => {
                                recv_err = Some(Error::ProtocolMismatch(format!(
                                    "unparseable progress count {:?}",
                                    m[1]
                                )));
                                break;
                            }
                        };
                        if remaining > last_remaining {
                            recv_err = Some(Error::ProtocolMismatch(format!(
                                "upload progress went backwards: {} remaining after {}",
                                remaining, last_remaining
                            )));
                            break;
                        }
                        last_remaining = remaining;
                        received = size - remaining;
                        if received >= progress_mark {
                            self.log(".");
                            progress_mark += size / 10 + 1;
                        }
                    }
                    Err(e) => {
                        recv_err = Some(e);
                        break;
                    }
                }
            }
            drop(ack_tx);

            let hash = sender.join().expect("upload sender thread panicked")?;
            match recv_err {
                Some(e) => Err(e),
                None => Ok(hash),
            }
        })
    }

    /// Upload a local file to the device under `dst_name`.
    pub fn push_file(&self, src_path: &std::path::Path, dst_name: &str) -> Result<()> {
        let mut file = std::fs::File::open(src_path)
            .map_err(|e| Error::io(format!("opening {}", src_path.display()), e))?;
        let size = file
            .metadata()
            .map_err(|e| Error::io(format!("inspecting {}", src_path.display()), e))?
            .len();
        self.push_stream(&mut file, size, dst_name)
    }

    /// Rename a file on the device, awaiting its confirmation token.
    pub fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.reader.with(|scanner| {
            self.ensure_runtime_on(scanner)?;
            self.send_command(&format!(
                "__espore.rename(\"{}\", \"{}\")",
                old_name, new_name
            ))?;
            let m = self
                .await_regex_on(scanner, "RENAME_(OK|FAIL)")
                .map_err(|e| match e {
                    Error::Timeout(_) => Error::ProtocolMismatch(
                        "expected RENAME_OK or RENAME_FAIL, got neither".into(),
                    ),
                    other => other,
                })?;
            if m[1] == "OK" {
                Ok(())
            } else {
                Err(Error::RenameFailed {
                    old: old_name.to_string(),
                    new: new_name.to_string(),
                })
            }
        })
    }

    /// Invoke `lua` on the device wrapped in `__espore.call` and return
    /// the `ret` value of its JSON reply.
    pub fn rpc(&self, lua: &str) -> Result<serde_json::Value> {
        self.reader.with(|scanner| {
            self.ensure_runtime_on(scanner)?;
            self.send_command(&format!("__espore.call(function()\n{}\nend)\n", lua))?;
            let text = self.await_json_on(scanner)?;
            let mut reply: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| Error::parse("decoding device rpc reply", e))?;
            if let Some(err) = reply.get("err").and_then(|v| v.as_str()) {
                if !err.is_empty() {
                    return Err(Error::Rpc(err.to_string()));
                }
            }
            Ok(reply
                .get_mut("ret")
                .map(serde_json::Value::take)
                .unwrap_or(serde_json::Value::Null))
        })
    }

    /// Run a snippet on the device inside an anonymous function. No reply
    /// is collected; any output lands in the dumper.
    pub fn run_code(&self, lua: &str) -> Result<()> {
        self.reader.with(|scanner| self.ensure_runtime_on(scanner))?;
        self.send_command(&format!("\n(function ()\n{}\nend)()\n", lua))
    }

    /// Reboot the device. No reply is awaited.
    pub fn node_restart(&self) -> Result<()> {
        self.send_command("node.restart()")
    }

    /// Tear the helper down and drain the async writer.
    pub fn close(&self) {
        let _ = self.send_command("\n__espore.finish()\n");
        self.writer.close();
    }
}
