//! Output sinks for formatted lines.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

/// Destination for fully formatted output lines. Each call writes one whole line.
pub trait LineSink: Send + Sync {
    fn emit(&self, line: &str);
}

/// Writes to process stdout, one locked write per line so concurrent tasks never interleave.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

static STDOUT_FAILED: AtomicBool = AtomicBool::new(false);

impl LineSink for StdoutSink {
    fn emit(&self, line: &str) {
        write_line(&mut std::io::stdout().lock(), line, &STDOUT_FAILED);
    }
}

/// Write one line; the first failure is logged and later ones are dropped quietly.
fn write_line(out: &mut impl Write, line: &str, failed: &AtomicBool) {
    if let Err(e) = writeln!(out, "{line}") {
        if !failed.swap(true, Ordering::Relaxed) {
            debug!(error = %e, "output write failed; dropping lines");
        }
    }
}

/// Collects lines in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Self { Self::default() }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl LineSink for BufferSink {
    fn emit(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}
