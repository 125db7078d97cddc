//! Raw line sources feeding the reassembler.
//!
//! This module provides:
//! - [`LineSource`] — "next line, error, or end" capability
//! - [`ReaderSource`] — Lines from standard input or any async reader
//! - [`JournaldSource`] — Lines unwrapped from `journalctl -o json`

use std::future::Future;
use std::io;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Stdin};
use tokio::process::{Child, ChildStdout, Command};

use crate::error::{LogError, Result};
use crate::reassembler::MAX_RECORD_BYTES;

/// Default location of the journal reader.
pub const JOURNALCTL_PATH: &str = "/usr/bin/journalctl";

/// Syslog sequence prefix PostgreSQL adds to each message, e.g. `[24-1] `.
static SEQUENCE_PREFIX_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[\d+-\d+\] ").unwrap_or_else(|_| unreachable!()));

/// A lazy, in-order sequence of text lines.
///
/// `Ok(None)` signals the end of input; an error ends the sequence as well.
/// A source cannot be restarted, only recreated.
pub trait LineSource: Send + 'static {
    /// Produces the next line.
    fn next_line(&mut self) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// Newline-delimited reader that tolerates bad bytes and overlong lines.
///
/// Invalid UTF-8 is replaced with U+FFFD. Bytes past `limit` are discarded
/// up to the next newline.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R, limit: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            limit,
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        let mut consumed = 0;
        let mut terminated = false;

        while !terminated {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            let (chunk, found) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (&available[..=i], true),
                None => (available, false),
            };
            let room = self.limit.saturating_sub(self.buf.len());
            self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            let used = chunk.len();
            consumed += used;
            terminated = found;
            self.reader.consume(used);
        }

        if consumed == 0 {
            return Ok(None);
        }

        let kept = self.buf.len();
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        if kept < consumed {
            tracing::warn!(bytes = consumed, limit = self.limit, "overlong line truncated");
        }

        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Line source over any async reader.
pub struct ReaderSource<R> {
    lines: LineReader<R>,
}

impl<R: AsyncRead + Unpin + Send + 'static> ReaderSource<R> {
    /// Wraps a reader; lines are capped at [`MAX_RECORD_BYTES`].
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self::with_line_limit(reader, MAX_RECORD_BYTES)
    }

    /// Wraps a reader with a custom cap on line length.
    #[must_use]
    pub fn with_line_limit(reader: R, limit: usize) -> Self {
        Self {
            lines: LineReader::new(reader, limit),
        }
    }
}

impl ReaderSource<Stdin> {
    /// Reads from the process standard input.
    #[must_use]
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin())
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> LineSource for ReaderSource<R> {
    async fn next_line(&mut self) -> Result<Option<String>> {
        self.lines
            .next_line()
            .await
            .map_err(|e| LogError::Source(e.to_string()))
    }
}

/// Fields of a journal export record that matter here.
#[derive(Debug, Deserialize)]
struct JournalMessage {
    #[serde(rename = "MESSAGE")]
    message: Option<serde_json::Value>,
}

/// Unwraps one `journalctl -o json` line into the logged text.
///
/// Returns `None` when the line is not JSON or carries no text message
/// (binary messages are exported as byte arrays).
#[must_use]
pub fn parse_journal_line(line: &str) -> Option<String> {
    let record: JournalMessage = serde_json::from_str(line).ok()?;
    let serde_json::Value::String(message) = record.message? else {
        return None;
    };
    Some(SEQUENCE_PREFIX_REGEX.replace(&message, "").into_owned())
}

/// Line source that follows a syslog identifier through `journalctl`.
pub struct JournaldSource {
    // Held so the subprocess is killed when the source is dropped.
    _child: Child,
    lines: LineReader<ChildStdout>,
}

impl JournaldSource {
    /// Spawns `journalctl -t <tag> -f -o json`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Spawn`] if the subprocess or its pipe cannot be
    /// set up.
    pub fn spawn(tag: &str) -> Result<Self> {
        Self::spawn_with(JOURNALCTL_PATH, tag)
    }

    /// Spawns the journal reader found at `program`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Spawn`] if the subprocess or its pipe cannot be
    /// set up.
    pub fn spawn_with(program: &str, tag: &str) -> Result<Self> {
        let mut child = Command::new(program)
            .args(["-t", tag, "-f", "-o", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LogError::Spawn(format!("{program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LogError::Spawn(format!("{program}: stdout not captured")))?;

        tracing::info!(program, tag, "following journal");

        Ok(Self {
            _child: child,
            lines: LineReader::new(stdout, MAX_RECORD_BYTES),
        })
    }
}

impl LineSource for JournaldSource {
    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let Some(raw) = self
                .lines
                .next_line()
                .await
                .map_err(|e| LogError::Source(e.to_string()))?
            else {
                return Ok(None);
            };

            match parse_journal_line(&raw) {
                Some(line) => return Ok(Some(line)),
                None => tracing::warn!(line = %raw, "skipping unparseable journal line"),
            }
        }
    }
}
