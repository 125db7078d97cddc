//! Reassembly of physical log lines into logical records.
//!
//! PostgreSQL writes one entry per `log_line_prefix`-led line plus any number
//! of continuation lines (multi-line SQL, `DETAIL:` follow-ups). There is no
//! terminator, so a record ends when either:
//! - the next line starts with a timestamp and an upper-case tag, or
//! - no line arrives for the idle window (trailing records, paused writers).
//!
//! A spawned reader task pulls from the [`LineSource`] and hands lines over a
//! single-slot channel; [`Reassembler::next_record`] owns the buffer.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{LogError, Result};
use crate::extract::extract;
use crate::source::LineSource;
use crate::types::SlowQueryRecord;

/// Upper bound on a single record buffer (5 MiB).
pub const MAX_RECORD_BYTES: usize = 5 * 1024 * 1024;

/// Separator inserted between the lines of one record.
pub const RECORD_SEPARATOR: &str = "\r\n";

/// How long the buffer may sit without new lines before it is flushed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// `YYYY-MM-DD HH:MM:SS ... TAG:` at the start of a line.
static NEW_RECORD_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}.*([A-Z]+):").unwrap_or_else(|_| unreachable!())
});

/// Returns true if `line` starts a new log record.
#[must_use]
pub fn is_new_record_line(line: &str) -> bool {
    NEW_RECORD_REGEX.is_match(line)
}

/// Accumulated text of one in-progress record.
///
/// Once a line does not fit under the limit, it and every later line are
/// dropped until the buffer is taken.
#[derive(Debug)]
pub struct RecordBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordBuffer {
    /// Creates an empty buffer bounded by [`MAX_RECORD_BYTES`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(MAX_RECORD_BYTES)
    }

    /// Creates an empty buffer with a custom bound.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Appends a line, returning false if it was dropped.
    pub fn push_line(&mut self, line: &str) -> bool {
        if self.truncated {
            return false;
        }

        if self.text.is_empty() {
            let mut end = line.len().min(self.limit);
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            self.text.push_str(&line[..end]);
            self.truncated = end < line.len();
            return true;
        }

        if self.text.len() + RECORD_SEPARATOR.len() + line.len() > self.limit {
            self.truncated = true;
            return false;
        }
        self.text.push_str(RECORD_SEPARATOR);
        self.text.push_str(line);
        true
    }

    /// Returns true if no line has been buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Returns the buffered length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Returns true if lines were dropped because of the bound.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Returns the buffered text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Takes the buffered text, leaving the buffer empty.
    pub fn take(&mut self) -> String {
        self.truncated = false;
        std::mem::take(&mut self.text)
    }
}

/// Turns a stream of raw lines into [`SlowQueryRecord`]s.
pub struct Reassembler {
    lines: mpsc::Receiver<Result<String>>,
    reader: JoinHandle<()>,
    buffer: RecordBuffer,
    idle_timeout: Duration,
    pending_error: Option<LogError>,
    ended: bool,
}

impl Reassembler {
    /// Starts reading `source` with the default idle window.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn<S: LineSource>(source: S) -> Self {
        Self::with_idle_timeout(source, DEFAULT_IDLE_TIMEOUT)
    }

    /// Starts reading `source` with a custom idle window.
    #[must_use]
    pub fn with_idle_timeout<S: LineSource>(source: S, idle_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let reader = tokio::spawn(read_lines(source, tx));

        Self {
            lines: rx,
            reader,
            buffer: RecordBuffer::new(),
            idle_timeout,
            pending_error: None,
            ended: false,
        }
    }

    /// Waits for the next complete record.
    ///
    /// # Errors
    ///
    /// - [`LogError::InvalidRecord`] if the flushed buffer had no duration;
    ///   the caller should skip it and call again.
    /// - [`LogError::EndOfLog`] once the source ended and nothing is buffered.
    /// - The source's error if it failed; no further records follow.
    pub async fn next_record(&mut self) -> Result<SlowQueryRecord> {
        loop {
            if let Some(err) = self.pending_error.take() {
                return Err(err);
            }
            if self.ended {
                return Err(LogError::EndOfLog);
            }

            // A fresh sleep per iteration: every consumed line restarts the window.
            tokio::select! {
                biased;

                line = self.lines.recv() => match line {
                    Some(Ok(line)) => {
                        if !self.buffer.is_empty() && is_new_record_line(&line) {
                            let record = self.flush();
                            self.buffer.push_line(&line);
                            return record;
                        }
                        self.buffer.push_line(&line);
                    }
                    Some(Err(err)) => {
                        self.ended = true;
                        if self.buffer.is_empty() {
                            return Err(err);
                        }
                        self.pending_error = Some(err);
                        return self.flush();
                    }
                    None => {
                        self.ended = true;
                        if self.buffer.is_empty() {
                            return Err(LogError::EndOfLog);
                        }
                        return self.flush();
                    }
                },

                () = tokio::time::sleep(self.idle_timeout) => {
                    if !self.buffer.is_empty() {
                        return self.flush();
                    }
                }
            }
        }
    }

    /// Parses and clears the buffer.
    fn flush(&mut self) -> Result<SlowQueryRecord> {
        if self.buffer.is_truncated() {
            tracing::debug!(bytes = self.buffer.len(), "record truncated at buffer limit");
        }
        extract(&self.buffer.take())
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Pumps lines from the source into the handoff channel.
async fn read_lines<S: LineSource>(mut source: S, tx: mpsc::Sender<Result<String>>) {
    loop {
        match source.next_line().await {
            Ok(Some(line)) => {
                if tx.send(Ok(line)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!("line source ended");
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "line source failed");
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}
