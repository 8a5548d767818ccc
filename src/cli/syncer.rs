//! Filesystem watcher pushing edited files to the device.

use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;

use notify::{watcher, DebouncedEvent, RecursiveMode, Watcher};

use crate::error::{Error, Result};

/// How often the watcher polls for changes.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Watches a source directory recursively and invokes the callback with
/// every changed path. Dropping the syncer stops the watch and its
/// forwarding thread.
pub(crate) struct Syncer {
    _watcher: notify::RecommendedWatcher,
}

impl Syncer {
    pub fn new(
        src_path: PathBuf,
        on_sync: impl Fn(PathBuf) + Send + 'static,
    ) -> Result<Syncer> {
        let (tx, rx) = channel();
        let mut w = watcher(tx, POLL_INTERVAL).map_err(|e| {
            Error::parse(format!("watching {}", src_path.display()), e)
        })?;
        w.watch(&src_path, RecursiveMode::Recursive).map_err(|e| {
            Error::NotFound(format!("watch source {}: {}", src_path.display(), e))
        })?;

        thread::spawn(move || {
            for event in rx {
                match event {
                    DebouncedEvent::Create(path)
                    | DebouncedEvent::Write(path)
                    | DebouncedEvent::Rename(_, path) => on_sync(path),
                    DebouncedEvent::Error(e, path) => {
                        log::warn!("watcher error on {:?}: {}", path, e);
                    }
                    _ => {}
                }
            }
        });

        Ok(Syncer { _watcher: w })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc::channel as std_channel;

    #[test]
    fn reports_changed_files_under_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = std_channel();
        let _syncer = Syncer::new(dir.path().to_path_buf(), move |path| {
            tx.send(path).ok();
        })
        .unwrap();

        // Give the poller a moment to take its baseline snapshot.
        thread::sleep(Duration::from_millis(300));
        fs::write(dir.path().join("edited.lua"), "print(1)").unwrap();

        let changed = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("change event");
        assert!(changed.ends_with("edited.lua"));
    }

    #[test]
    fn missing_source_fails() {
        assert!(Syncer::new(PathBuf::from("/definitely/not/here"), |_| {}).is_err());
    }
}
