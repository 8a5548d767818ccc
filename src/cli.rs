//! Interactive terminal workspace.
//!
//! Three widgets share one terminal: a scrolling output pane fed by the
//! background dumper, a single-line input with history and `/command`
//! autocomplete, and a file browser showing live device state.
//!
//! The UI task is single-threaded cooperative: all widget mutation happens
//! on it. Blocking commands are enqueued on a bounded channel and executed
//! serially by a worker task, which reports back through the UI message
//! channel; submission order is preserved, keystrokes are never dropped,
//! but command execution may lag.

mod commands;
mod draw;
mod dumper;
pub mod history;
mod syncer;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use once_cell::sync::Lazy;
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use regex::Regex;

use crate::config::EsporeConfig;
use crate::error::{Error, Result};
use crate::session::{Logger, Session};

use commands::{command_handlers, CommandHandler, Job, Worker};
use dumper::Dumper;
use syncer::Syncer;

pub use history::History;

/// Output pane line buffer cap.
const MAX_OUTPUT_LINES: usize = 300;
/// Bounded command queue between the UI task and the worker.
const COMMAND_QUEUE: usize = 10;
/// Command history cap.
pub const HISTORY_LIMIT: usize = 100;
/// File browser column width when visible.
const BROWSER_WIDTH: u16 = 20;

pub struct Config {
    pub session: Arc<Session>,
    pub espore_config: EsporeConfig,
    pub history: History,
}

/// Messages from the worker, dumper and watchers back to the UI task.
pub(crate) enum UiMsg {
    Output(String),
    ErrorLine(String),
    FileList(Vec<FileRow>),
    AddWatcher { src: String, dst: Option<String> },
    Clear,
    Quit,
}

#[derive(Debug, Clone)]
pub(crate) struct FileRow {
    pub name: String,
    pub size: u64,
}

struct UiLogger {
    ui: Sender<UiMsg>,
}

impl Logger for UiLogger {
    fn print(&self, text: &str) {
        let _ = self.ui.send(UiMsg::Output(text.to_string()));
    }
}

/// Launch the workspace over an open session. Returns once the user quits
/// or the terminal fails.
pub fn run(config: Config) -> Result<()> {
    let Config {
        session,
        espore_config,
        history,
    } = config;

    let (ui_tx, ui_rx) = mpsc::channel::<UiMsg>();
    let (jobs_tx, jobs_rx) = mpsc::sync_channel::<Job>(COMMAND_QUEUE);

    session.set_logger(Arc::new(UiLogger { ui: ui_tx.clone() }));
    let dumper = Arc::new(Dumper::new(Arc::clone(&session), ui_tx.clone()));
    dumper.start();

    let worker_ctx = Worker {
        session: Arc::clone(&session),
        config: espore_config,
        ui: ui_tx.clone(),
        dumper: Arc::clone(&dumper),
    };
    let worker = thread::spawn(move || {
        for job in jobs_rx {
            job(&worker_ctx);
        }
    });

    let mut app = App::new(jobs_tx.clone(), history);
    app.print_line("espore ready. /quit exits, Tab cycles focus, Ctrl-B toggles the browser.");

    let result = run_terminal(&mut app, ui_rx);

    dumper.stop();
    drop(app);
    drop(jobs_tx);
    let _ = worker.join();
    session.close();

    match result {
        Err(Error::UserQuit) => Ok(()),
        other => other,
    }
}

fn run_terminal(app: &mut App, ui_rx: Receiver<UiMsg>) -> Result<()> {
    enable_raw_mode().map_err(|e| Error::io("entering raw mode", e))?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)
        .map_err(|e| Error::io("entering alternate screen", e))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal =
        Terminal::new(backend).map_err(|e| Error::io("initializing terminal", e))?;

    let result = event_loop(app, &mut terminal, ui_rx);

    let _ = disable_raw_mode();
    let _ = execute!(io::stdout(), LeaveAlternateScreen);
    let _ = terminal.show_cursor();
    result
}

fn event_loop(
    app: &mut App,
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    ui_rx: Receiver<UiMsg>,
) -> Result<()> {
    loop {
        while let Ok(msg) = ui_rx.try_recv() {
            app.apply(msg);
        }
        // Retry the single deferred job once the queue has drained a bit.
        if let Some(job) = app.deferred.take() {
            if let Err(TrySendError::Full(job)) = app.jobs.try_send(job) {
                app.deferred = Some(job);
            }
        }
        if app.quit {
            return Ok(());
        }
        terminal
            .draw(|frame| draw::draw(frame, app))
            .map_err(|e| Error::io("drawing", e))?;
        if event::poll(Duration::from_millis(50)).map_err(|e| Error::io("polling input", e))? {
            match event::read().map_err(|e| Error::io("reading input", e))? {
                Event::Key(key) if key.kind == KeyEventKind::Press => app.on_key(key),
                _ => {}
            }
        }
    }
}

// =============================================================================
// Application state
// =============================================================================

struct OutLine {
    text: String,
    error: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Focus {
    Input,
    Output,
    Browser,
}

struct RenameDialog {
    target: String,
    value: String,
}

pub(crate) struct App {
    jobs: SyncSender<Job>,
    handlers: &'static std::collections::BTreeMap<&'static str, CommandHandler>,
    history: History,

    lines: VecDeque<OutLine>,
    partial: String,
    scroll_back: usize,

    input: String,
    autocomplete: Vec<String>,
    autocomplete_idx: usize,

    files: Vec<FileRow>,
    browser_selected: usize,
    browser_width: u16,

    focus: Focus,
    rename: Option<RenameDialog>,
    syncers: HashMap<String, Syncer>,
    deferred: Option<Job>,
    quit: bool,
}

static COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/([^ ]*) *(.*)$").expect("static regex"));

impl App {
    fn new(jobs: SyncSender<Job>, history: History) -> App {
        App {
            jobs,
            handlers: command_handlers(),
            history,
            lines: VecDeque::new(),
            partial: String::new(),
            scroll_back: 0,
            input: String::new(),
            autocomplete: Vec::new(),
            autocomplete_idx: 0,
            files: Vec::new(),
            browser_selected: 0,
            browser_width: BROWSER_WIDTH,
            focus: Focus::Input,
            rename: None,
            syncers: HashMap::new(),
            deferred: None,
            quit: false,
        }
    }

    fn apply(&mut self, msg: UiMsg) {
        match msg {
            UiMsg::Output(text) => self.append_output(&text),
            UiMsg::ErrorLine(text) => self.print_error(&text),
            UiMsg::FileList(rows) => {
                self.files = rows;
                self.browser_selected = self.browser_selected.min(self.files.len());
            }
            UiMsg::AddWatcher { src, dst } => self.add_watcher(src, dst),
            UiMsg::Clear => {
                self.lines.clear();
                self.partial.clear();
                self.scroll_back = 0;
            }
            UiMsg::Quit => self.quit = true,
        }
    }

    // Output pane ------------------------------------------------------------

    fn append_output(&mut self, text: &str) {
        self.partial.push_str(text);
        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.pop();
            line.retain(|c| c != '\r');
            self.push_line(line, false);
        }
    }

    fn push_line(&mut self, text: String, error: bool) {
        self.lines.push_back(OutLine { text, error });
        while self.lines.len() > MAX_OUTPUT_LINES {
            self.lines.pop_front();
        }
    }

    fn print_line(&mut self, text: &str) {
        self.flush_partial();
        self.push_line(text.to_string(), false);
    }

    fn print_error(&mut self, text: &str) {
        self.flush_partial();
        self.push_line(text.to_string(), true);
    }

    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let text = std::mem::take(&mut self.partial);
            self.push_line(text, false);
        }
    }

    // Command dispatch -------------------------------------------------------

    /// A line beginning with `/` selects a local handler; anything else is
    /// sent verbatim to the device REPL.
    fn run_command_line(&mut self, cmdline: String) {
        if let Some(caps) = COMMAND_RE.captures(&cmdline) {
            let name = caps[1].to_string();
            let params: Vec<String> =
                caps[2].split_whitespace().map(str::to_string).collect();
            let handler = match self.handlers.get(name.as_str()) {
                Some(handler) => handler,
                None => {
                    self.print_error(&format!("Unknown command {:?}", name));
                    return;
                }
            };
            if params.len() < handler.min_args {
                self.print_error(&format!(
                    "Expected at least {} parameters. Got {}",
                    handler.min_args,
                    params.len()
                ));
                return;
            }
            let run = handler.run;
            self.enqueue(Box::new(move |w| match run(w, &params) {
                Ok(()) => {}
                Err(Error::UserQuit) => {
                    let _ = w.ui.send(UiMsg::Quit);
                }
                Err(e) => w.print_error(format!("Error executing command: {}", e)),
            }));
        } else {
            self.enqueue(Box::new(move |w| {
                if let Err(e) = w.session.send_command(&cmdline) {
                    w.print_error(format!("Error sending command: {}", e));
                }
            }));
        }
    }

    fn enqueue(&mut self, job: Job) {
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                if self.deferred.is_none() {
                    self.deferred = Some(job);
                } else {
                    self.print_error("Command queue is full; command dropped");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.print_error("Command worker is gone");
            }
        }
    }

    // Watchers ---------------------------------------------------------------

    fn add_watcher(&mut self, src: String, dst: Option<String>) {
        let base = PathBuf::from(&src);
        let jobs = self.jobs.clone();
        let prefix = dst.unwrap_or_default();
        let watch_base = base.clone();
        let result = Syncer::new(base, move |changed: PathBuf| {
            let rel = changed
                .strip_prefix(&watch_base)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| {
                    changed
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                });
            let dst_name = if prefix.is_empty() {
                rel
            } else {
                format!("{}/{}", prefix.trim_end_matches('/'), rel)
            };
            let job: Job = Box::new(move |w: &Worker| {
                w.print(format!("Syncing {} -> {} ...\n", changed.display(), dst_name));
                if let Err(e) = w.dumper.pause(|| w.session.push_file(&changed, &dst_name)) {
                    w.print_error(format!("Sync failed: {}", e));
                }
            });
            let _ = jobs.send(job);
        });
        match result {
            Ok(syncer) => {
                self.syncers.insert(src.clone(), syncer);
                self.print_line(&format!("Watching {} for changes", src));
            }
            Err(e) => self.print_error(&format!("Cannot watch {}: {}", src, e)),
        }
    }

    // Key handling -----------------------------------------------------------

    fn on_key(&mut self, key: KeyEvent) {
        if self.rename.is_some() {
            self.on_modal_key(key);
            return;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('b') => {
                    self.browser_width = if self.browser_width == 0 {
                        BROWSER_WIDTH
                    } else {
                        0
                    };
                    return;
                }
                KeyCode::Char('c') => {
                    self.quit = true;
                    return;
                }
                _ => {}
            }
        }
        let completing = self.focus == Focus::Input && !self.autocomplete.is_empty();
        if key.code == KeyCode::Tab && !completing {
            self.focus = match self.focus {
                Focus::Input => Focus::Output,
                Focus::Output if self.browser_width > 0 => Focus::Browser,
                Focus::Output => Focus::Input,
                Focus::Browser => Focus::Input,
            };
            return;
        }
        match self.focus {
            Focus::Input => self.on_input_key(key),
            Focus::Output => self.on_output_key(key),
            Focus::Browser => self.on_browser_key(key),
        }
    }

    fn on_input_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => self.submit_input(),
            KeyCode::Tab => {
                if let Some(candidate) = self.autocomplete.get(self.autocomplete_idx) {
                    self.input = candidate.clone();
                }
                self.refresh_autocomplete();
            }
            KeyCode::Up => {
                if self.autocomplete.is_empty() {
                    self.input = self.history.up();
                } else if self.autocomplete_idx > 0 {
                    self.autocomplete_idx -= 1;
                }
            }
            KeyCode::Down => {
                if self.autocomplete.is_empty() {
                    self.input = self.history.down();
                } else if self.autocomplete_idx + 1 < self.autocomplete.len() {
                    self.autocomplete_idx += 1;
                }
            }
            KeyCode::Esc => {
                self.autocomplete.clear();
                self.autocomplete_idx = 0;
            }
            KeyCode::Backspace => {
                self.input.pop();
                self.refresh_autocomplete();
            }
            KeyCode::Char(c) => {
                self.input.push(c);
                self.refresh_autocomplete();
            }
            _ => {}
        }
    }

    fn refresh_autocomplete(&mut self) {
        self.autocomplete.clear();
        self.autocomplete_idx = 0;
        if !self.input.starts_with('/') {
            return;
        }
        for name in self.handlers.keys() {
            let cmd = format!("/{}", name);
            if cmd.starts_with(&self.input) && cmd != self.input {
                self.autocomplete.push(cmd);
            }
        }
    }

    fn submit_input(&mut self) {
        let cmd = self.input.trim().to_string();
        if cmd.is_empty() {
            return;
        }
        self.input.clear();
        self.autocomplete.clear();
        self.autocomplete_idx = 0;
        self.history.append(&cmd);
        self.scroll_back = 0;
        self.run_command_line(cmd);
    }

    fn on_output_key(&mut self, key: KeyEvent) {
        let max_back = self.lines.len();
        match key.code {
            KeyCode::Up => self.scroll_back = (self.scroll_back + 1).min(max_back),
            KeyCode::Down => self.scroll_back = self.scroll_back.saturating_sub(1),
            KeyCode::PageUp => self.scroll_back = (self.scroll_back + 10).min(max_back),
            KeyCode::PageDown => self.scroll_back = self.scroll_back.saturating_sub(10),
            KeyCode::End | KeyCode::Esc => self.scroll_back = 0,
            _ => {}
        }
    }

    fn on_browser_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Up => self.browser_selected = self.browser_selected.saturating_sub(1),
            KeyCode::Down => {
                self.browser_selected = (self.browser_selected + 1).min(self.files.len())
            }
            KeyCode::Enter => {
                if self.browser_selected == 0 {
                    self.enqueue(Box::new(|w| w.refresh_filelist()));
                } else if let Some(row) = self.files.get(self.browser_selected - 1) {
                    // Selecting a script runs it on the device.
                    if row.name.to_lowercase().ends_with(".lua") {
                        let cmd = format!("dofile(\"{}\")", row.name);
                        self.enqueue(Box::new(move |w| {
                            if let Err(e) = w.session.send_command(&cmd) {
                                w.print_error(format!("Error sending command: {}", e));
                            }
                        }));
                    }
                }
            }
            KeyCode::Delete => {
                if self.browser_selected > 0 {
                    if let Some(row) = self.files.get(self.browser_selected - 1) {
                        let name = row.name.clone();
                        self.browser_selected = 0;
                        self.enqueue(Box::new(move |w| {
                            w.print(format!("Deleting {} ... ", name));
                            match w.remove_file(&name) {
                                Ok(()) => {
                                    w.print("OK\n");
                                    w.refresh_filelist();
                                }
                                Err(e) => w.print_error(format!("ERROR: {}", e)),
                            }
                        }));
                    }
                }
            }
            KeyCode::F(2) => {
                if self.browser_selected > 0 {
                    if let Some(row) = self.files.get(self.browser_selected - 1) {
                        self.rename = Some(RenameDialog {
                            target: row.name.clone(),
                            value: row.name.clone(),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    fn on_modal_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Esc => {
                self.rename = None;
                self.focus = Focus::Browser;
            }
            KeyCode::Enter => {
                if let Some(dialog) = self.rename.take() {
                    self.focus = Focus::Browser;
                    let new_name = dialog.value.trim().to_string();
                    if new_name.is_empty() || new_name == dialog.target {
                        return;
                    }
                    let old_name = dialog.target;
                    self.enqueue(Box::new(move |w| {
                        w.print(format!("Renaming {} to {} ... ", old_name, new_name));
                        match w.rename_file(&old_name, &new_name) {
                            Ok(()) => {
                                w.print("OK\n");
                                w.refresh_filelist();
                            }
                            Err(e) => w.print_error(format!("ERROR: {}", e)),
                        }
                    }));
                }
            }
            KeyCode::Backspace => {
                if let Some(dialog) = self.rename.as_mut() {
                    dialog.value.pop();
                }
            }
            KeyCode::Char(c) => {
                if let Some(dialog) = self.rename.as_mut() {
                    dialog.value.push(c);
                }
            }
            _ => {}
        }
    }
}
