//! Outbound slow-query events.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::scrub::{derive_shard, scrub};
use crate::types::SlowQueryRecord;

/// Value of the `type` field on every event.
pub const EVENT_TYPE: &str = "timber.postgres_slow_query";

/// Identity of the shipper stamped on every event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShipperIdentity {
    /// Host the shipper runs on.
    pub hostname: String,
    /// Shipper release.
    pub version: String,
}

impl ShipperIdentity {
    /// Creates an identity.
    #[must_use]
    pub fn new(hostname: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            version: version.into(),
        }
    }

    /// Identity for this host and crate version.
    #[must_use]
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::new(hostname, env!("CARGO_PKG_VERSION"))
    }
}

/// The flattened, scrubbed event sent to the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQueryEvent {
    /// Raw kind token of the record.
    pub command: String,
    /// Scrubbed query text.
    pub query: String,
    /// Schema the query addresses, possibly empty.
    pub shard_partition: String,
    /// Scrubbed query text with the shard qualifier removed.
    pub partitionless_query: String,
    /// Execution time in milliseconds.
    pub duration_in_milliseconds: f64,
    /// Session database.
    pub database: String,
    /// Session user.
    pub username: String,
    /// When the event was built (UTC).
    pub created_at: String,
    /// Always [`EVENT_TYPE`].
    #[serde(rename = "type")]
    pub event_type: String,
    /// Shipper host.
    pub hostname: String,
    /// Shipper release.
    pub timber_version: String,
}

impl SlowQueryEvent {
    /// Builds an event stamped with the current time.
    #[must_use]
    pub fn from_record(record: &SlowQueryRecord, identity: &ShipperIdentity) -> Self {
        Self::from_record_at(record, identity, Utc::now())
    }

    /// Builds an event with an explicit creation time.
    #[must_use]
    pub fn from_record_at(
        record: &SlowQueryRecord,
        identity: &ShipperIdentity,
        created_at: DateTime<Utc>,
    ) -> Self {
        let derived = derive_shard(&record.value);

        Self {
            command: record.kind.clone(),
            query: scrub(&record.value),
            shard_partition: derived.shard_name,
            partitionless_query: scrub(&derived.stripped_value),
            duration_in_milliseconds: record.duration_millis(),
            database: record.database.clone(),
            username: record.username.clone(),
            created_at: created_at.to_string(),
            event_type: EVENT_TYPE.to_string(),
            hostname: identity.hostname.clone(),
            timber_version: identity.version.clone(),
        }
    }

    /// Serializes the event as one JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
