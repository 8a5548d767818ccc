//! Command handlers executed on the pump worker.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::builder;
use crate::config::EsporeConfig;
use crate::error::{Error, Result};
use crate::initializer;
use crate::session::Session;

use super::dumper::Dumper;
use super::{FileRow, UiMsg};

/// A job enqueued by the UI task for serial execution.
pub(crate) type Job = Box<dyn FnOnce(&Worker) + Send>;

/// Everything a command needs: the device session, the build
/// configuration, the UI channel for output and the dumper to pause
/// around interactive exchanges.
pub(crate) struct Worker {
    pub session: Arc<Session>,
    pub config: EsporeConfig,
    pub ui: Sender<UiMsg>,
    pub dumper: Arc<Dumper>,
}

impl Worker {
    pub fn print(&self, text: impl Into<String>) {
        let _ = self.ui.send(UiMsg::Output(text.into()));
    }

    pub fn print_error(&self, text: impl Into<String>) {
        let _ = self.ui.send(UiMsg::ErrorLine(text.into()));
    }

    /// Run an RPC with the output dumper held off.
    pub fn rpc(&self, lua: &str) -> Result<serde_json::Value> {
        self.dumper.pause(|| self.session.rpc(lua))
    }

    /// The device file list as sorted name/size rows.
    pub fn file_list(&self) -> Result<Vec<FileRow>> {
        let listing = self.rpc("return file.list()")?;
        let map = listing
            .as_object()
            .ok_or_else(|| Error::parse("decoding file list", "reply is not an object"))?;
        let mut rows: Vec<FileRow> = map
            .iter()
            .map(|(name, size)| FileRow {
                name: name.clone(),
                size: size.as_u64().unwrap_or(0),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    pub fn remove_file(&self, name: &str) -> Result<()> {
        self.rpc(&format!("__espore.removeFile('{}')", name))?;
        Ok(())
    }

    pub fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.rpc(&format!(
            "__espore.renameFile('{}', '{}')",
            old_name, new_name
        ))?;
        Ok(())
    }

    /// Fetch the device file list and hand it to the file browser.
    pub fn refresh_filelist(&self) {
        self.print("Retrieving file list ... ");
        match self.file_list() {
            Ok(rows) => {
                let _ = self.ui.send(UiMsg::FileList(rows));
                self.print("OK\n");
            }
            Err(e) => self.print_error(format!("ERROR: {}", e)),
        }
    }
}

pub(crate) struct CommandHandler {
    /// The handler refuses to run with fewer parameters than this.
    pub min_args: usize,
    pub run: fn(&Worker, &[String]) -> Result<()>,
}

/// The `/command` dispatch table. Sorted iteration drives autocomplete.
pub(crate) fn command_handlers() -> &'static BTreeMap<&'static str, CommandHandler> {
    static HANDLERS: Lazy<BTreeMap<&'static str, CommandHandler>> = Lazy::new(|| {
        let mut map: BTreeMap<&'static str, CommandHandler> = BTreeMap::new();
        map.insert(
            "quit",
            CommandHandler {
                min_args: 0,
                run: |_, _| Err(Error::UserQuit),
            },
        );
        map.insert(
            "ls",
            CommandHandler {
                min_args: 0,
                run: |w, _| {
                    let rows = w.file_list()?;
                    let mut listing = String::new();
                    for row in &rows {
                        listing.push_str(&format!("{:<24} {:>8}\n", row.name, row.size));
                    }
                    w.print(listing);
                    let _ = w.ui.send(UiMsg::FileList(rows));
                    Ok(())
                },
            },
        );
        map.insert(
            "init",
            CommandHandler {
                min_args: 0,
                run: |w, _| {
                    let output = w.config.build.output.clone();
                    w.dumper
                        .pause(|| initializer::initialize(Path::new(&output), &w.session))
                },
            },
        );
        map.insert(
            "install-runtime",
            CommandHandler {
                min_args: 0,
                run: |w, _| w.dumper.pause(|| w.session.install_runtime()),
            },
        );
        map.insert(
            "unload",
            CommandHandler {
                min_args: 1,
                run: |w, args| {
                    if args[0] == "*" {
                        w.session.run_code(
                            "__espore.unloadAll()\nprint(\"\\nAll packages unloaded\")",
                        )
                    } else {
                        w.session.run_code(&format!(
                            "__espore.unload(\"{0}\")\nprint(\"\\nUnloaded {0}\")",
                            args[0]
                        ))
                    }
                },
            },
        );
        map.insert(
            "push",
            CommandHandler {
                min_args: 2,
                run: |w, args| {
                    let src = Path::new(&args[0]);
                    w.dumper.pause(|| w.session.push_file(src, &args[1]))
                },
            },
        );
        map.insert(
            "watch",
            CommandHandler {
                min_args: 1,
                run: |w, args| {
                    let _ = w.ui.send(UiMsg::AddWatcher {
                        src: args[0].clone(),
                        dst: args.get(1).cloned(),
                    });
                    Ok(())
                },
            },
        );
        map.insert(
            "cat",
            CommandHandler {
                min_args: 1,
                run: |w, args| w.session.run_code(&format!("__espore.cat(\"{}\")", args[0])),
            },
        );
        map.insert(
            "clear",
            CommandHandler {
                min_args: 0,
                run: |w, _| {
                    let _ = w.ui.send(UiMsg::Clear);
                    Ok(())
                },
            },
        );
        map.insert(
            "restart",
            CommandHandler {
                min_args: 0,
                run: |w, _| w.session.node_restart(),
            },
        );
        map.insert(
            "build",
            CommandHandler {
                min_args: 0,
                run: |w, _| {
                    w.print("Building firmware images ... ");
                    builder::build(&w.config.build)?;
                    w.print("OK\n");
                    Ok(())
                },
            },
        );
        map
    });
    &HANDLERS
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_full_handler_table_is_registered() {
        let handlers = command_handlers();
        for name in [
            "quit",
            "ls",
            "init",
            "install-runtime",
            "unload",
            "push",
            "watch",
            "cat",
            "clear",
            "restart",
            "build",
        ] {
            assert!(handlers.contains_key(name), "missing handler {}", name);
        }
    }

    #[test]
    fn minimum_arities_match_the_grammar() {
        let handlers = command_handlers();
        assert_eq!(handlers["quit"].min_args, 0);
        assert_eq!(handlers["unload"].min_args, 1);
        assert_eq!(handlers["push"].min_args, 2);
        assert_eq!(handlers["watch"].min_args, 1);
        assert_eq!(handlers["cat"].min_args, 1);
    }

}
