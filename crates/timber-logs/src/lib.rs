//! # timber-logs
//!
//! Slow-query log shipping for PostgreSQL.
//!
//! This crate provides:
//!
//! - [`LineSource`] — Raw lines from stdin ([`ReaderSource`]) or journald ([`JournaldSource`])
//! - [`Reassembler`] — Groups physical lines into records (line-start heuristic plus idle window)
//! - [`extract`] — Pulls duration, user, database, kind and query text out of a record
//! - [`derive_shard`] / [`scrub`] — Schema detection and literal redaction
//! - [`SlowQueryEvent`] — The flattened event shipped to the collector
//! - [`ForwardingSink`] — Bounded queue with a single retrying TCP writer
//! - [`Pipeline`] — Wires everything together
//!
//! ## Example
//!
//! ```rust
//! use timber_logs::{derive_shard, extract, scrub, ShipperIdentity, SlowQueryEvent};
//!
//! let line = "2021-01-11 15:25:36 EST [1-1] postgres@walle_test LOG:  \
//!             duration: 0.139 ms  execute <unnamed>: SELECT * FROM acme.users WHERE name = 'bob'";
//! let record = extract(line).expect("valid record");
//! assert_eq!(record.kind, "execute");
//!
//! let shard = derive_shard(&record.value);
//! assert_eq!(shard.shard_name, "acme");
//! assert_eq!(scrub(&shard.stripped_value), "SELECT * FROM users WHERE name = 'xxx'");
//!
//! let event = SlowQueryEvent::from_record(&record, &ShipperIdentity::new("db-1", "1.0.0"));
//! assert_eq!(event.shard_partition, "acme");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod extract;
pub mod forwarder;
pub mod pipeline;
pub mod reassembler;
pub mod scrub;
pub mod source;
pub mod types;

// Re-export main types
pub use config::{ShipperConfig, SourceType};
pub use error::{LogError, Result};
pub use event::{ShipperIdentity, SlowQueryEvent, EVENT_TYPE};
pub use extract::extract;
pub use forwarder::{Connector, ForwarderConfig, ForwardingSink, TcpConnector, FRAME_DELIMITER};
pub use pipeline::{LocalSink, Pipeline, PipelineStats, StdoutSink};
pub use reassembler::{is_new_record_line, Reassembler, RecordBuffer, MAX_RECORD_BYTES};
pub use scrub::{derive_shard, scrub, ShardDerivation, REDACTED_LITERAL};
pub use source::{parse_journal_line, JournaldSource, LineSource, ReaderSource};
pub use types::{EntryKind, SlowQueryRecord};
