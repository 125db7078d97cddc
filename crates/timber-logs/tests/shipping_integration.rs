//! Shipping integration tests.
//!
//! Runs raw PostgreSQL log text through the full pipeline and checks what a
//! mock Logstash TCP input receives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use timber_logs::{
    ForwarderConfig, ForwardingSink, LocalSink, LogError, Pipeline, Reassembler, ReaderSource,
    ShipperIdentity, TcpConnector, EVENT_TYPE,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

// ============================================================================
// Test Helpers - Mock Collector
// ============================================================================

/// A mock Logstash TCP input.
struct MockCollector {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockCollector {
    async fn new() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    async fn accept(&self) -> BufReader<TcpStream> {
        let (stream, _) = timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("connection within timeout")
            .expect("accept");
        BufReader::new(stream)
    }
}

/// Reads one `\r\n`-framed message.
async fn read_frame(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("frame within timeout")
        .expect("readable");
    assert!(line.ends_with("\r\n"), "frame not CRLF terminated: {line:?}");
    line.truncate(line.len() - 2);
    line
}

#[derive(Clone, Default)]
struct CollectingSink(Arc<Mutex<Vec<Vec<u8>>>>);

impl LocalSink for CollectingSink {
    fn emit(&mut self, payload: &[u8]) -> timber_logs::Result<()> {
        self.0.lock().push(payload.to_vec());
        Ok(())
    }
}

fn identity() -> ShipperIdentity {
    ShipperIdentity::new("pg-primary", "0.1.0")
}

fn reassembler(input: &'static str) -> Reassembler {
    Reassembler::with_idle_timeout(
        ReaderSource::new(input.as_bytes()),
        Duration::from_millis(20),
    )
}

// ============================================================================
// End-to-end
// ============================================================================

#[tokio::test]
async fn bind_statement_reaches_collector() {
    let collector = MockCollector::new().await.expect("bind collector");
    let forwarder = ForwardingSink::connect(
        TcpConnector::new(collector.endpoint()),
        ForwarderConfig::default(),
    )
    .await
    .expect("connect");
    let mut conn = collector.accept().await;

    let input = "2021-01-11 15:25:36 EST [56193-3/9939-5706] postgres@walle_test LOG:  duration: 0.139 ms  bind <unnamed>: SELECT * FROM abacus101_shard6.transactions WHERE balance = '13.37'\n";
    let local = CollectingSink::default();
    let mut pipeline = Pipeline::new(reassembler(input), identity(), local.clone())
        .with_forwarder(forwarder);

    pipeline.run().await.expect("pipeline ends cleanly");

    let frame = read_frame(&mut conn).await;
    let event: serde_json::Value = serde_json::from_str(&frame).expect("json event");

    assert_eq!(event["command"], "bind");
    assert_eq!(event["username"], "postgres");
    assert_eq!(event["database"], "walle_test");
    assert_eq!(event["shard_partition"], "abacus101_shard6");
    assert_eq!(
        event["query"],
        "SELECT * FROM abacus101_shard6.transactions WHERE balance = 'xxx'"
    );
    assert_eq!(
        event["partitionless_query"],
        "SELECT * FROM transactions WHERE balance = 'xxx'"
    );
    assert_eq!(event["duration_in_milliseconds"], 0.139);
    assert_eq!(event["type"], EVENT_TYPE);
    assert_eq!(event["hostname"], "pg-primary");

    // The local sink sees the same payload, unframed.
    assert_eq!(local.0.lock().as_slice(), &[frame.into_bytes()]);

    let forwarder = pipeline.take_forwarder().expect("forwarder");
    assert_eq!(forwarder.close().await, 0);
}

#[tokio::test]
async fn events_arrive_in_log_order() {
    let collector = MockCollector::new().await.expect("bind collector");
    let forwarder = ForwardingSink::connect(
        TcpConnector::new(collector.endpoint()),
        ForwarderConfig::default(),
    )
    .await
    .expect("connect");
    let mut conn = collector.accept().await;

    let input = "\
2021-01-11 15:25:36 EST [1-1] app@orders LOG:  duration: 1.5 ms  statement: SELECT 1
2021-01-11 15:25:37 EST [1-2] app@orders LOG:  duration: 2.5 ms  parse s1: SELECT 2
2021-01-11 15:25:38 EST [1-3] app@orders LOG:  duration: 3.5 ms  execute s1: SELECT 3
";
    let mut pipeline = Pipeline::new(reassembler(input), identity(), CollectingSink::default())
        .with_forwarder(forwarder);
    pipeline.run().await.expect("pipeline ends cleanly");

    let mut commands = Vec::new();
    for _ in 0..3 {
        let event: serde_json::Value =
            serde_json::from_str(&read_frame(&mut conn).await).expect("json event");
        commands.push(event["command"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(commands, ["statement", "parse", "execute"]);

    let forwarder = pipeline.take_forwarder().expect("forwarder");
    assert_eq!(forwarder.close().await, 0);
}

#[tokio::test]
async fn detail_only_input_ships_nothing() {
    let input = "2021-01-11 15:25:36 EST [56193-3/9939-5731] postgres@walle_test DETAIL:  parameters: $1 = '1220', $2 = '1'\n";
    let local = CollectingSink::default();
    let mut pipeline = Pipeline::new(reassembler(input), identity(), local.clone());

    pipeline.run().await.expect("pipeline ends cleanly");

    assert!(local.0.lock().is_empty());
    assert_eq!(pipeline.stats().invalid, 1);
}

#[tokio::test]
async fn reassembler_reports_end_after_last_record() {
    let input = "2021-01-11 15:25:36 EST [1-1] app@orders LOG:  duration: 1.5 ms  statement: SELECT 1\n";
    let mut reassembler = reassembler(input);

    let record = reassembler.next_record().await.expect("record");
    assert_eq!(record.value, "SELECT 1");
    assert!(matches!(
        reassembler.next_record().await,
        Err(LogError::EndOfLog)
    ));
}

// ============================================================================
// Forwarder over TCP
// ============================================================================

#[tokio::test]
async fn connect_to_closed_port_fails() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr")
    };

    let result = ForwardingSink::connect(
        TcpConnector::new(addr.to_string()),
        ForwarderConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(LogError::Io(_))));
}

#[tokio::test]
async fn close_drains_queued_payloads() {
    let collector = MockCollector::new().await.expect("bind collector");
    let forwarder = ForwardingSink::connect(
        TcpConnector::new(collector.endpoint()),
        ForwarderConfig::default(),
    )
    .await
    .expect("connect");
    let mut conn = collector.accept().await;

    for i in 0..50 {
        forwarder
            .enqueue(format!("{{\"n\": {i}}}").into_bytes())
            .expect("queued");
    }
    assert_eq!(forwarder.close().await, 0);

    for i in 0..50 {
        assert_eq!(read_frame(&mut conn).await, format!("{{\"n\": {i}}}"));
    }
}
