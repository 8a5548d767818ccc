//! Persistent command line history.

use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Manages a persistent command line history.
///
/// At most `limit` lines are kept; the cursor starts past the end so
/// [`History::current`] returns the empty string until the user navigates.
/// Every appended line is handed to the `on_append` sink for persistence.
pub struct History {
    lines: Vec<String>,
    pos: usize,
    limit: usize,
    on_append: Box<dyn FnMut(&str) + Send>,
}

impl History {
    /// Build a history from previously persisted content. Only the last
    /// `limit` lines of the reader are retained.
    pub fn new(
        reader: impl BufRead,
        limit: usize,
        on_append: Box<dyn FnMut(&str) + Send>,
    ) -> Result<History> {
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| Error::io("reading history", e))?;
            lines.push(line);
            if lines.len() > limit {
                let excess = lines.len() - limit;
                lines.drain(..excess);
            }
        }
        let pos = lines.len();
        Ok(History {
            lines,
            pos,
            limit,
            on_append,
        })
    }

    /// History persisted in a file, appending new lines as they arrive. A
    /// missing file simply starts an empty history.
    pub fn with_file(path: &Path, limit: usize) -> Result<History> {
        let file_name: PathBuf = path.to_path_buf();
        let sink = Box::new(move |line: &str| {
            let opened = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&file_name);
            if let Ok(mut f) = opened {
                let _ = writeln!(f, "{}", line);
            }
        });
        match std::fs::File::open(path) {
            Ok(f) => History::new(std::io::BufReader::new(f), limit, sink),
            Err(_) => History::new(std::io::Cursor::new(""), limit, sink),
        }
    }

    /// Add a new line to the history. Whitespace-only lines are ignored
    /// and an immediate duplicate of the last line is collapsed; either
    /// way the cursor resets past the end.
    pub fn append(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        if self.lines.last().map(String::as_str) != Some(line) {
            (self.on_append)(line);
            self.lines.push(line.to_string());
            if self.lines.len() > self.limit {
                let excess = self.lines.len() - self.limit;
                self.lines.drain(..excess);
            }
        }
        self.pos = self.lines.len();
    }

    /// The currently selected item, or the empty string past the end.
    pub fn current(&self) -> String {
        self.lines.get(self.pos).cloned().unwrap_or_default()
    }

    /// Move the cursor up and return the pointed item.
    pub fn up(&mut self) -> String {
        if self.pos > 0 {
            self.pos -= 1;
        }
        self.current()
    }

    /// Move the cursor down and return the pointed item; moving past the
    /// end yields the empty string.
    pub fn down(&mut self) -> String {
        if self.pos + 1 < self.lines.len() {
            self.pos += 1;
            return self.current();
        }
        self.pos = self.lines.len();
        String::new()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn collected() -> (Arc<Mutex<Vec<String>>>, Box<dyn FnMut(&str) + Send>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let writer = Arc::clone(&sink);
        (
            sink,
            Box::new(move |line: &str| writer.lock().unwrap().push(line.to_string())),
        )
    }

    #[test]
    fn navigation_walks_persisted_lines() {
        let (_, sink) = collected();
        let mut h = History::new(Cursor::new("line1\nline2\nline3\n"), 5, sink).unwrap();

        // Upon start, the cursor is past the end.
        assert_eq!(h.current(), "");
        assert_eq!(h.len(), 3);

        assert_eq!(h.up(), "line3");
        assert_eq!(h.up(), "line2");
        assert_eq!(h.up(), "line1");
        // Going up at the top has no effect.
        assert_eq!(h.up(), "line1");
        assert_eq!(h.current(), "line1");

        assert_eq!(h.down(), "line2");
        assert_eq!(h.down(), "line3");
        // Going past the last item returns "" and stays there.
        assert_eq!(h.down(), "");
        assert_eq!(h.down(), "");
    }

    #[test]
    fn append_persists_collapses_and_resets_the_cursor() {
        let (persisted, sink) = collected();
        let mut h = History::new(Cursor::new(""), 5, sink).unwrap();

        h.append("line4");
        assert_eq!(*persisted.lock().unwrap(), vec!["line4"]);

        // Repeating the last line has no effect on storage...
        h.append("line4");
        assert_eq!(*persisted.lock().unwrap(), vec!["line4"]);
        // ...but the cursor still resets past the end.
        assert_eq!(h.current(), "");

        h.append("line5");
        assert_eq!(*persisted.lock().unwrap(), vec!["line4", "line5"]);

        // Whitespace-only lines are ignored.
        h.append("  ");
        h.append("");
        assert_eq!(*persisted.lock().unwrap(), vec!["line4", "line5"]);

        assert_eq!(h.up(), "line5");
    }

    #[test]
    fn limit_truncates_oldest_entries() {
        let (_, sink) = collected();
        let mut h = History::new(Cursor::new(""), 5, sink).unwrap();
        for i in 0..8 {
            h.append(&format!("line {}", i));
        }
        assert_eq!(h.len(), 5);
        assert_eq!(h.up(), "line 7");
        for _ in 0..10 {
            h.up();
        }
        assert_eq!(h.current(), "line 3");
    }

    #[test]
    fn oversized_history_files_keep_only_the_tail() {
        let mut content = String::new();
        for i in 0..20 {
            content.push_str(&format!("line {}\n", i));
        }
        let (_, sink) = collected();
        let h = History::new(Cursor::new(content), 5, sink).unwrap();
        assert_eq!(h.len(), 5);
    }

    #[test]
    fn file_backed_history_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.txt");
        {
            let mut h = History::with_file(&path, 100).unwrap();
            h.append("first");
            h.append("second");
        }
        let mut h = History::with_file(&path, 100).unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h.up(), "second");
    }
}
