//! Core types for parsed slow-query records.
//!
//! This module provides:
//! - [`SlowQueryRecord`] — One reassembled PostgreSQL log entry
//! - [`EntryKind`] — Classification of the verbatim `kind` token

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Classification of the entry kind token that follows the duration.
///
/// The record keeps the raw token; this is only a view over it, because
/// malformed input can produce arbitrary kind strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Simple query protocol statement
    Statement,
    /// Extended protocol execute step
    Execute,
    /// Extended protocol parse step
    Parse,
    /// Extended protocol bind step
    Bind,
    /// `auto_explain` plan output
    Plan,
    /// Anything else
    Other,
}

impl EntryKind {
    /// Classifies a raw kind token.
    #[must_use]
    pub fn classify(token: &str) -> Self {
        match token {
            "statement" => Self::Statement,
            "execute" => Self::Execute,
            "parse" => Self::Parse,
            "bind" => Self::Bind,
            "plan" => Self::Plan,
            _ => Self::Other,
        }
    }

    /// Returns true for kinds that carry query text worth shipping.
    #[must_use]
    pub const fn is_query(&self) -> bool {
        matches!(
            self,
            Self::Statement | Self::Execute | Self::Parse | Self::Bind
        )
    }

    /// Returns the string representation of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Statement => "statement",
            Self::Execute => "execute",
            Self::Parse => "parse",
            Self::Bind => "bind",
            Self::Plan => "plan",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured slow-query record extracted from one reassembled buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowQueryRecord {
    /// Server timestamp of the entry (Unix epoch when unparseable)
    pub timestamp: DateTime<Utc>,
    /// Session user, empty when the entry had no `LOG:` marker
    pub username: String,
    /// Session database, empty when the entry had no `LOG:` marker
    pub database: String,
    /// Reported execution time
    pub duration: Duration,
    /// Raw kind token, e.g. `bind` or `statement`
    pub kind: String,
    /// Prepared statement name, e.g. `<unnamed>`, empty when absent
    pub statement_name: String,
    /// Captured text following the kind, usually SQL
    pub value: String,
}

impl SlowQueryRecord {
    /// Returns the classified kind of this record.
    #[must_use]
    pub fn entry_kind(&self) -> EntryKind {
        EntryKind::classify(&self.kind)
    }

    /// Duration in fractional milliseconds at microsecond resolution.
    #[must_use]
    pub fn duration_millis(&self) -> f64 {
        self.duration.as_micros() as f64 / 1000.0
    }
}
