//! timber - PostgreSQL slow-query log shipper
//!
//! Reads PostgreSQL slow-query log output from stdin or the systemd journal,
//! prints a scrubbed JSON event per query on stdout and optionally forwards
//! the events to a Logstash TCP input.

mod cli;

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use timber_logs::{
    ForwardingSink, JournaldSource, LineSource, Pipeline, Reassembler, ReaderSource,
    ShipperConfig, ShipperIdentity, SourceType, StdoutSink, TcpConnector,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::Cli;

/// How long shutdown waits for blocking-pool threads.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
    // Diagnostics go to stderr; stdout carries events.
    let filter = EnvFilter::from_default_env().add_directive(
        "timber=info"
            .parse()
            .unwrap_or_else(|_| unreachable!()),
    );
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cli));
    shut_down(runtime);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Stops the runtime without waiting on a stdin read parked in the
/// blocking pool.
fn shut_down(runtime: tokio::runtime::Runtime) {
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.resolve_config().context("invalid configuration")?;
    let identity = ShipperIdentity::detect();

    info!(
        hostname = %identity.hostname,
        version = %identity.version,
        source = %config.source_type,
        forwarding = config.tcp_out_url.is_some(),
        "starting timber"
    );

    match config.source_type {
        SourceType::Stdin => ship(ReaderSource::stdin(), &config, identity).await,
        SourceType::Journald => {
            let source = JournaldSource::spawn(&config.journald_tag)
                .context("failed to start journald source")?;
            ship(source, &config, identity).await
        }
    }
}

async fn ship<S: LineSource>(
    source: S,
    config: &ShipperConfig,
    identity: ShipperIdentity,
) -> anyhow::Result<()> {
    let reassembler = Reassembler::with_idle_timeout(source, config.idle_timeout());
    let mut pipeline = Pipeline::new(reassembler, identity, StdoutSink);

    if let Some(url) = &config.tcp_out_url {
        let forwarder = ForwardingSink::connect(TcpConnector::new(url.clone()), config.forwarder())
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        pipeline = pipeline.with_forwarder(forwarder);
    }

    let result = tokio::select! {
        result = pipeline.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    };

    if let Some(forwarder) = pipeline.take_forwarder() {
        let lost = forwarder.close().await;
        if lost > 0 {
            warn!(lost, "events were not delivered before shutdown");
        }
    }

    result.context("log source failed")
}
