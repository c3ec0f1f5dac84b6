//! Bridges the oplog of a source replica set into a destination deployment.
//!
//! Shows the replay loop the crate expects around the core: flush the replayer when enough
//! operations are buffered or enough time has passed, route commands through the sequential
//! path, and reopen the tailer from the last applied timestamp when the cursor dies.

use futures::StreamExt;
use mongorelay::bson::Timestamp;
use mongorelay::{cluster, EndpointConfig, Error, Handler, Oplog, Replayer, Result};
use std::process;
use std::time::{Duration, Instant};

const FLUSH_COUNT: usize = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let source = Handler::connect(EndpointConfig::new("127.0.0.1", 27017)).await?;
    let destination = Handler::connect(EndpointConfig::new("127.0.0.1", 27018)).await?;

    let mut marker = cluster::primary_optime(&source.client().await).await?;
    let mut replayer = Replayer::new();

    loop {
        let mut oplog = Oplog::builder()
            .start_at(marker)
            .ns_filter(|ns| !ns.starts_with("benchmark."))
            .build(&source.client().await)
            .await?;
        let mut last_flush = Instant::now();

        while let Some(res) = oplog.next().await {
            let operation = match res {
                Ok(operation) => operation,
                Err(Error::Database(e)) => {
                    tracing::error!(error = %e, "tailer failed, reopening from the resume marker");
                    break;
                }
                // An entry we cannot convert means the oplog format drifted; no way to
                // continue without a code fix.
                Err(e) => return Err(e),
            };

            if operation.is_command() {
                marker = flush(&mut replayer, &destination, marker).await?;
                destination.apply(&operation, true).await?;
                marker = operation.timestamp();
                continue;
            }
            if operation.write_op()?.is_some() {
                replayer.push(operation);
            }

            if replayer.count() >= FLUSH_COUNT || last_flush.elapsed() >= FLUSH_INTERVAL {
                marker = flush(&mut replayer, &destination, marker).await?;
                last_flush = Instant::now();
            }
        }

        marker = flush(&mut replayer, &destination, marker).await?;
    }
}

/// Flush buffered operations and advance the resume marker.
async fn flush(
    replayer: &mut Replayer,
    destination: &Handler,
    marker: Timestamp,
) -> Result<Timestamp> {
    if replayer.is_empty() {
        return Ok(marker);
    }

    replayer.apply(destination, true).await?;
    let marker = replayer.last_optime().unwrap_or(marker);
    replayer.clear();

    // A real deployment persists the marker here so a restart resumes where it left off.
    tracing::info!(time = marker.time, increment = marker.increment, "advanced resume marker");

    Ok(marker)
}
