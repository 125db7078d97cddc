//! Best-effort forwarding of serialized events to a remote collector.
//!
//! Payloads are spooled in a bounded queue and written by a single writer
//! task that owns the connection. Delivery is not guaranteed: a failed write
//! is pushed back onto the tail of the queue and retried, reconnecting when
//! the peer went away, and the writer backs off for a while once the retry
//! limit is hit. Retried payloads may end up behind newer ones.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{LogError, Result};

/// Logstash expects each message to be terminated by CR LF.
pub const FRAME_DELIMITER: &[u8] = b"\r\n";

/// Tunables for the forwarding sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    /// Maximum number of queued payloads.
    pub queue_capacity: usize,
    /// Consecutive failed writes tolerated before backing off.
    pub retry_limit: u32,
    /// Deadline for a single write (and for a reconnect attempt).
    pub write_timeout: Duration,
    /// Pause after the retry limit is reached.
    pub backoff: Duration,
    /// Longest time [`ForwardingSink::close`] waits for the queue to drain.
    pub drain_timeout: Duration,
    /// How often `close` checks the queue.
    pub drain_poll_interval: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            retry_limit: 10,
            write_timeout: Duration::from_secs(60),
            backoff: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5),
            drain_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Opens connections to the collector.
pub trait Connector: Send + Sync + 'static {
    /// Connection type written to by the sink.
    type Conn: AsyncWrite + Unpin + Send + 'static;

    /// Opens a new connection to the same endpoint.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;

    /// Endpoint description for diagnostics.
    fn endpoint(&self) -> &str;
}

/// Connects to a fixed `host:port` over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Creates a connector for `addr`.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Conn = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn endpoint(&self) -> &str {
        &self.addr
    }
}

/// Counters the writer publishes for `close`.
#[derive(Debug, Default)]
struct SinkState {
    /// Payloads queued or being written.
    outstanding: AtomicUsize,
    /// Consecutive failed writes.
    retries: AtomicU32,
}

/// Handle to the forwarding queue and its writer task.
pub struct ForwardingSink {
    tx: mpsc::Sender<Vec<u8>>,
    state: Arc<SinkState>,
    writer: JoinHandle<()>,
    config: ForwarderConfig,
}

impl ForwardingSink {
    /// Opens the initial connection and starts the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the first connection cannot be established.
    pub async fn connect<C: Connector>(connector: C, config: ForwarderConfig) -> Result<Self> {
        let conn = tokio::time::timeout(config.write_timeout, connector.connect())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        tracing::info!(endpoint = connector.endpoint(), "forwarding sink connected");
        Ok(Self::start(connector, conn, config))
    }

    /// Starts the writer over an already open connection.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start<C: Connector>(connector: C, conn: C::Conn, config: ForwarderConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let state = Arc::new(SinkState::default());

        let writer = Writer {
            connector,
            conn,
            rx,
            requeue: tx.downgrade(),
            state: Arc::clone(&state),
            config: config.clone(),
            retries: 0,
        };

        Self {
            tx,
            state,
            writer: tokio::spawn(writer.run()),
            config,
        }
    }

    /// Queues a payload without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::QueueFull`] if the queue is at capacity (the
    /// payload is dropped) or [`LogError::SinkClosed`] if the writer stopped.
    pub fn enqueue(&self, payload: Vec<u8>) -> Result<()> {
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.state.outstanding.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!("forwarding queue is full, dropping event");
                Err(LogError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.state.outstanding.fetch_sub(1, Ordering::SeqCst);
                Err(LogError::SinkClosed)
            }
        }
    }

    /// Number of payloads queued or in flight.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::SeqCst)
    }

    /// Consecutive failed writes seen by the writer.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.state.retries.load(Ordering::SeqCst)
    }

    /// Waits for the queue to drain, then stops the writer.
    ///
    /// Gives up early once the writer exceeded its retry limit or the drain
    /// timeout passed. Returns the number of payloads left undelivered.
    pub async fn close(self) -> usize {
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut ticker = tokio::time::interval(self.config.drain_poll_interval);

        let lost = loop {
            let outstanding = self.outstanding();
            if outstanding == 0 {
                break 0;
            }
            if self.retries() > self.config.retry_limit {
                tracing::error!(
                    lost = outstanding,
                    "retry limit met while closing, messages will be lost"
                );
                break outstanding;
            }
            if Instant::now() >= deadline {
                tracing::error!(
                    lost = outstanding,
                    "time limit exceeded for graceful shutdown of forwarding sink"
                );
                break outstanding;
            }
            ticker.tick().await;
        };

        drop(self.tx);
        self.writer.abort();
        lost
    }
}

/// The single task that owns the connection.
struct Writer<C: Connector> {
    connector: C,
    conn: C::Conn,
    rx: mpsc::Receiver<Vec<u8>>,
    requeue: mpsc::WeakSender<Vec<u8>>,
    state: Arc<SinkState>,
    config: ForwarderConfig,
    retries: u32,
}

impl<C: Connector> Writer<C> {
    async fn run(mut self) {
        while let Some(payload) = self.rx.recv().await {
            match self.write(&payload).await {
                Ok(()) => {
                    self.set_retries(0);
                    self.state.outstanding.fetch_sub(1, Ordering::SeqCst);
                }
                Err(err) => self.handle_failure(&err, payload).await,
            }
        }
        tracing::debug!("forwarding writer stopped");
    }

    async fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut framed = Vec::with_capacity(payload.len() + FRAME_DELIMITER.len());
        framed.extend_from_slice(payload);
        framed.extend_from_slice(FRAME_DELIMITER);

        let conn = &mut self.conn;
        let attempt = async move {
            conn.write_all(&framed).await?;
            conn.flush().await
        };
        match tokio::time::timeout(self.config.write_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline exceeded",
            )),
        }
    }

    async fn handle_failure(&mut self, err: &io::Error, payload: Vec<u8>) {
        tracing::warn!(error = %err, retries = self.retries, "error writing to forwarding connection");
        if is_disconnect(err) {
            self.reconnect().await;
        }

        self.requeue(payload);

        if self.retries <= self.config.retry_limit {
            self.set_retries(self.retries + 1);
        } else {
            tracing::warn!(
                backoff = ?self.config.backoff,
                "retry limit met on forwarding sink, sleeping before continuing"
            );
            tokio::time::sleep(self.config.backoff).await;
            self.reconnect().await;
            self.set_retries(0);
        }
    }

    /// Pushes a failed payload back onto the tail of the queue.
    fn requeue(&self, payload: Vec<u8>) {
        let pushed = self
            .requeue
            .upgrade()
            .is_some_and(|tx| tx.try_send(payload).is_ok());
        if !pushed {
            self.state.outstanding.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("could not requeue event, dropping it");
        }
    }

    async fn reconnect(&mut self) {
        tracing::info!(
            endpoint = self.connector.endpoint(),
            "attempting to re-establish forwarding connection"
        );
        match tokio::time::timeout(self.config.write_timeout, self.connector.connect()).await {
            Ok(Ok(conn)) => {
                // The old connection is closed when dropped here.
                self.conn = conn;
                tracing::info!(endpoint = self.connector.endpoint(), "forwarding connection re-established");
            }
            Ok(Err(err)) => tracing::warn!(error = %err, "error reconnecting"),
            Err(_) => tracing::warn!("reconnect timed out"),
        }
    }

    fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
        self.state.retries.store(retries, Ordering::SeqCst);
    }
}

/// Errors meaning the peer is gone or unresponsive.
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    )
}
