//! Line-paced writer used to deliver interpreter commands.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

/// Splits its input on newlines and writes each line terminated by `\n`,
/// sleeping the throttle between lines, so each command line is fully
/// received and reflected by the interpreter before the next one arrives.
pub struct LineWriter<W: Write> {
    w: W,
    throttle: Duration,
}

impl<W: Write> LineWriter<W> {
    pub fn new(writer: W, throttle: Duration) -> Self {
        LineWriter {
            w: writer,
            throttle,
        }
    }
}

impl<W: Write> Write for LineWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut lines: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
        // A trailing newline does not produce an extra empty line.
        if lines.last().map_or(false, |line| line.is_empty()) {
            lines.pop();
        }
        for line in lines {
            let line = match line.last() {
                Some(b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            self.w.write_all(line)?;
            self.w.write_all(b"\n")?;
            thread::sleep(self.throttle);
        }
        Ok(data.len())
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

    #[test]
    fn terminates_every_line() {
        let mut out = Vec::new();
        let mut lw = LineWriter::new(&mut out, Duration::from_millis(0));
        lw.write(b"one\ntwo").unwrap();
        assert_eq!(out, b"one\ntwo\n");
    }

    #[test]
    fn trailing_newline_is_not_doubled() {
        let mut out = Vec::new();
        let mut lw = LineWriter::new(&mut out, Duration::from_millis(0));
        lw.write(b"cmd\n").unwrap();
        assert_eq!(out, b"cmd\n");
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let mut out = Vec::new();
        let mut lw = LineWriter::new(&mut out, Duration::from_millis(0));
        lw.write(b"a\r\nb\r\n").unwrap();
        assert_eq!(out, b"a\nb\n");
    }

    #[test]
    fn empty_lines_are_preserved() {
        let mut out = Vec::new();
        let mut lw = LineWriter::new(&mut out, Duration::from_millis(0));
        lw.write(b"\n\ncmd\n").unwrap();
        assert_eq!(out, b"\n\ncmd\n");
    }
}
