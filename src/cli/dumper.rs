//! Background task mirroring device output into the output pane.
//!
//! The dumper reads the session byte stream whenever the session is not
//! locked for an interactive exchange. RPCs and uploads hold the shared
//! reader lock for their whole duration, which naturally pauses the
//! dumper; operations that must keep it quiet across several exchanges
//! (initialization, watched pushes) wrap themselves in [`Dumper::pause`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::session::Session;

use super::UiMsg;

pub(crate) struct Dumper {
    session: Arc<Session>,
    ui: Sender<UiMsg>,
    dumping: AtomicBool,
    terminated: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dumper {
    pub fn new(session: Arc<Session>, ui: Sender<UiMsg>) -> Dumper {
        Dumper {
            session,
            ui,
            dumping: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let dumper = Arc::clone(self);
        let handle = thread::spawn(move || dumper.run());
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn run(&self) {
        let mut buf = [0u8; 1024];
        while !self.terminated.load(Ordering::SeqCst) {
            if !self.dumping.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            let read = self
                .session
                .with_reader(|scanner| scanner.read_chunk(&mut buf).map(|n| buf[..n].to_vec()));
            match read {
                Ok(data) if !data.is_empty() => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if self.ui.send(UiMsg::Output(text)).is_err() {
                        break;
                    }
                }
                Ok(_) => {
                    // Idle socket. Yield the lock so queued commands get in.
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    let _ = self
                        .ui
                        .send(UiMsg::ErrorLine(format!("device stream ended: {}", e)));
                    break;
                }
            }
        }
    }

    /// Keep the dumper quiet while `f` runs.
    pub fn pause<T>(&self, f: impl FnOnce() -> T) -> T {
        self.dumping.store(false, Ordering::SeqCst);
        let result = f();
        self.dumping.store(true, Ordering::SeqCst);
        result
    }

    pub fn stop(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
