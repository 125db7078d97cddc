//! Drives records from the reassembler to the sinks.

use std::io::Write;

use crate::error::{LogError, Result};
use crate::event::{ShipperIdentity, SlowQueryEvent};
use crate::forwarder::ForwardingSink;
use crate::reassembler::Reassembler;
use crate::types::SlowQueryRecord;

/// Local destination for serialized events.
pub trait LocalSink: Send {
    /// Writes one serialized event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be written.
    fn emit(&mut self, payload: &[u8]) -> Result<()>;
}

/// Writes each event as one line on standard output.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl LocalSink for StdoutSink {
    fn emit(&mut self, payload: &[u8]) -> Result<()> {
        let mut out = std::io::stdout().lock();
        out.write_all(payload)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

/// Counters kept while the pipeline runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records turned into events.
    pub shipped: u64,
    /// Records whose kind is not shipped (plans and unknown kinds).
    pub ignored: u64,
    /// Flushed buffers without duration markers.
    pub invalid: u64,
    /// Events lost to serialization or a full forwarding queue.
    pub dropped: u64,
}

/// Reassembler → event → local sink and optional forwarder.
pub struct Pipeline<L> {
    reassembler: Reassembler,
    identity: ShipperIdentity,
    local: L,
    forwarder: Option<ForwardingSink>,
    stats: PipelineStats,
}

impl<L: LocalSink> Pipeline<L> {
    /// Creates a pipeline writing only to `local`.
    #[must_use]
    pub fn new(reassembler: Reassembler, identity: ShipperIdentity, local: L) -> Self {
        Self {
            reassembler,
            identity,
            local,
            forwarder: None,
            stats: PipelineStats::default(),
        }
    }

    /// Also ships every event through `forwarder`.
    #[must_use]
    pub fn with_forwarder(mut self, forwarder: ForwardingSink) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Processes records until the source ends.
    ///
    /// # Errors
    ///
    /// Returns the source error if reading fails; invalid records are
    /// skipped.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.reassembler.next_record().await {
                Ok(record) => self.handle_record(&record),
                Err(LogError::EndOfLog) => {
                    tracing::info!(
                        shipped = self.stats.shipped,
                        ignored = self.stats.ignored,
                        invalid = self.stats.invalid,
                        dropped = self.stats.dropped,
                        "log ended"
                    );
                    return Ok(());
                }
                Err(LogError::InvalidRecord) => {
                    self.stats.invalid += 1;
                    tracing::warn!("could not derive query or plan info from log record, skipping");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Dispatches one record by kind.
    pub fn handle_record(&mut self, record: &SlowQueryRecord) {
        let kind = record.entry_kind();
        if !kind.is_query() {
            tracing::debug!(kind = %record.kind, "ignoring log entry");
            self.stats.ignored += 1;
            return;
        }

        let event = SlowQueryEvent::from_record(record, &self.identity);
        let payload = match event.to_json_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize slow query event");
                self.stats.dropped += 1;
                return;
            }
        };

        tracing::debug!(
            command = %event.command,
            shard = %event.shard_partition,
            duration_ms = event.duration_in_milliseconds,
            "shipping slow query"
        );

        if let Err(err) = self.local.emit(&payload) {
            tracing::warn!(error = %err, "failed to write event to local sink");
        }

        if let Some(forwarder) = &self.forwarder {
            if let Err(err) = forwarder.enqueue(payload) {
                if !err.is_recoverable() {
                    tracing::warn!(error = %err, "forwarding sink rejected event");
                }
                self.stats.dropped += 1;
            }
        }
        self.stats.shipped += 1;
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Takes the forwarder so it can be drained after the run.
    pub fn take_forwarder(&mut self) -> Option<ForwardingSink> {
        self.forwarder.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::event::EVENT_TYPE;
    use crate::source::ReaderSource;

    /// Collects emitted payloads for inspection.
    #[derive(Clone, Default)]
    struct CollectingSink(Arc<Mutex<Vec<Vec<u8>>>>);

    impl CollectingSink {
        fn events(&self) -> Vec<serde_json::Value> {
            self.0
                .lock()
                .iter()
                .map(|p| serde_json::from_slice(p).expect("valid json"))
                .collect()
        }
    }

    impl LocalSink for CollectingSink {
        fn emit(&mut self, payload: &[u8]) -> Result<()> {
            self.0.lock().push(payload.to_vec());
            Ok(())
        }
    }

    /// Connector for tests that never lose the initial connection.
    struct NoReconnect;

    impl crate::forwarder::Connector for NoReconnect {
        type Conn = tokio::io::DuplexStream;

        async fn connect(&self) -> std::io::Result<Self::Conn> {
            Err(std::io::ErrorKind::ConnectionRefused.into())
        }

        fn endpoint(&self) -> &str {
            "in-memory"
        }
    }

    const LOG: &str = "\
2021-01-11 15:25:36 EST [56193-1] postgres@walle_test LOG:  duration: 0.139 ms  bind <unnamed>: SELECT * FROM abacus101_shard6.transactions WHERE memo = 'rent'
2021-01-11 15:25:36 EST [56193-2] postgres@walle_test DETAIL:  parameters: $1 = '1220', $2 = '1'
2021-01-11 15:25:37 EST [56193-3] postgres@walle_test LOG:  duration: 4.5 ms  plan:
\tQuery Text: SELECT 1
2021-01-11 15:25:38 EST [56193-4] postgres@walle_test LOG:  duration: 12.001 ms  execute <unnamed>: SELECT id
\tFROM users
\tWHERE guid = 'USR-f164af58-bb51-47ed-aa35-368ae3f46648'
";

    fn pipeline(input: &'static [u8], sink: CollectingSink) -> Pipeline<CollectingSink> {
        let reassembler = Reassembler::with_idle_timeout(
            ReaderSource::new(input),
            Duration::from_millis(20),
        );
        Pipeline::new(reassembler, ShipperIdentity::new("db-1", "1.2.3"), sink)
    }

    #[tokio::test]
    async fn dispatches_by_kind() {
        let sink = CollectingSink::default();
        let mut pipeline = pipeline(LOG.as_bytes(), sink.clone());

        pipeline.run().await.expect("runs to end");

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["command"], "bind");
        assert_eq!(events[0]["shard_partition"], "abacus101_shard6");
        assert_eq!(
            events[0]["partitionless_query"],
            "SELECT * FROM transactions WHERE memo = 'xxx'"
        );
        assert_eq!(events[1]["command"], "execute");
        assert_eq!(
            events[1]["query"],
            "SELECT id\r\n\tFROM users\r\n\tWHERE guid = 'USR-f164af58-bb51-47ed-aa35-368ae3f46648'"
        );
        assert_eq!(events[1]["type"], EVENT_TYPE);
        assert_eq!(events[1]["hostname"], "db-1");
        assert_eq!(events[1]["timber_version"], "1.2.3");

        assert_eq!(
            pipeline.stats(),
            PipelineStats {
                shipped: 2,
                ignored: 1,
                invalid: 1,
                dropped: 0,
            }
        );
    }

    #[tokio::test]
    async fn empty_input_ends_cleanly() {
        let sink = CollectingSink::default();
        let mut pipeline = pipeline(b"", sink.clone());

        pipeline.run().await.expect("runs to end");
        assert!(sink.events().is_empty());
        assert_eq!(pipeline.stats(), PipelineStats::default());
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_stop_the_run() {
        let input: &[u8] = b"\
2021-01-11 15:25:36 EST [1-1] postgres@latin LOG:  duration: 1.0 ms  statement: SELECT * FROM t WHERE name = 'caf\xe9'
2021-01-11 15:25:37 EST [1-2] postgres@latin LOG:  duration: 2.0 ms  statement: SELECT 2
";
        let sink = CollectingSink::default();
        let mut pipeline = pipeline(input, sink.clone());

        pipeline.run().await.expect("runs to end");

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["query"], "SELECT * FROM t WHERE name = 'xxx'");
        assert_eq!(events[1]["query"], "SELECT 2");
    }

    #[tokio::test]
    async fn forwards_events_when_configured() {
        use tokio::io::AsyncReadExt;

        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let forwarder =
            ForwardingSink::start(NoReconnect, client, crate::forwarder::ForwarderConfig::default());

        let sink = CollectingSink::default();
        let mut pipeline = pipeline(LOG.as_bytes(), sink.clone()).with_forwarder(forwarder);
        pipeline.run().await.expect("runs to end");

        let forwarder = pipeline.take_forwarder().expect("forwarder kept");
        assert_eq!(forwarder.close().await, 0);

        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];
        while received.iter().filter(|&&b| b == b'\n').count() < 2 {
            let n = server.read(&mut chunk).await.expect("readable");
            assert!(n > 0);
            received.extend_from_slice(&chunk[..n]);
        }
        let frames: Vec<&[u8]> = received
            .split(|&b| b == b'\n')
            .filter(|f| !f.is_empty())
            .collect();
        assert_eq!(frames.len(), 2);
        for frame in frames {
            assert!(frame.ends_with(b"\r"));
            let json: serde_json::Value =
                serde_json::from_slice(&frame[..frame.len() - 1]).expect("valid json");
            assert_eq!(json["type"], EVENT_TYPE);
        }
    }
}
