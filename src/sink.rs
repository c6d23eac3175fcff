//! Where command output goes.
//!
//! Both local and remote execution hand every line they read to an
//! `OutputSink` as soon as the line is complete.

use std::io::Write;
use std::sync::Mutex;

use colored::ColoredString;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

pub trait OutputSink: Send + Sync {
    fn on_line(&self, stream: Stream, line: &str);
}

/// Prints lines to the terminal, optionally prefixed with a colored host name.
#[derive(Default)]
pub struct Console {
    prefix: Option<ColoredString>,
}

impl Console {
    pub fn new() -> Self {
        Self { prefix: None }
    }

    pub fn with_prefix(prefix: ColoredString) -> Self {
        Self {
            prefix: Some(prefix),
        }
    }
}

impl OutputSink for Console {
    fn on_line(&self, stream: Stream, line: &str) {
        // Without the lock, lines from concurrently running hosts get mixed.
        let _ = match stream {
            Stream::Stdout => write_line(&mut std::io::stdout().lock(), &self.prefix, line),
            Stream::Stderr => write_line(&mut std::io::stderr().lock(), &self.prefix, line),
        };
    }
}

fn write_line(
    out: &mut impl Write,
    prefix: &Option<ColoredString>,
    line: &str,
) -> std::io::Result<()> {
    match prefix {
        Some(prefix) => writeln!(out, "{} {}", prefix, line),
        None => writeln!(out, "{}", line),
    }
}

/// Keeps every line in memory.
#[derive(Default)]
pub struct Capture {
    lines: Mutex<Vec<(Stream, String)>>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Stream, String)> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Lines of one stream, in arrival order.
    pub fn stream(&self, stream: Stream) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, line)| line)
            .collect()
    }
}

impl OutputSink for Capture {
    fn on_line(&self, stream: Stream, line: &str) {
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.push((stream, line.to_string()));
    }
}

pub struct Discard;

impl OutputSink for Discard {
    fn on_line(&self, _stream: Stream, _line: &str) {}
}
