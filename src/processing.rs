//! Collects probe results into batches and hands them to the database.

use std::{future::Future, mem, time::Duration};

use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, error};

use crate::probe::ServerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush as soon as this many records are waiting.
    pub batch_size: usize,
    /// Flush whatever we have this often, even if the batch isn't full.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub batches_flushed: usize,
    pub batches_failed: usize,
    pub records_written: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("couldn't write batch of {count} servers: {source}")]
pub struct SinkWriteError {
    pub count: usize,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

/// Where batches end up. A batch is written as one unit; if it fails, the
/// records in it are gone.
pub trait BatchSink: Send + 'static {
    fn write_batch(
        &mut self,
        batch: Vec<ServerRecord>,
    ) -> impl Future<Output = Result<(), SinkWriteError>> + Send;
}

/// Consume records until the channel closes, flushing when the batch is full,
/// when the flush interval passes, and once more at the end. Gives the sink
/// back when it's done.
pub async fn accumulate<S: BatchSink>(
    mut records: mpsc::Receiver<ServerRecord>,
    mut sink: S,
    config: BatchConfig,
) -> (S, FlushStats) {
    let batch_size = config.batch_size.max(1);
    // interval_at panics on a zero period
    let flush_interval = config.flush_interval.max(Duration::from_millis(1));
    let mut batch = Vec::with_capacity(batch_size);
    let mut stats = FlushStats::default();

    // the first tick of a normal interval is immediate, which we don't want
    let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            record = records.recv() => {
                let Some(record) = record else {
                    break;
                };
                batch.push(record);
                if batch.len() >= batch_size {
                    flush(&mut sink, &mut batch, &mut stats).await;
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    debug!("flush interval passed with {} servers waiting", batch.len());
                    flush(&mut sink, &mut batch, &mut stats).await;
                }
            }
        }
    }

    if !batch.is_empty() {
        flush(&mut sink, &mut batch, &mut stats).await;
    }

    (sink, stats)
}

async fn flush<S: BatchSink>(sink: &mut S, batch: &mut Vec<ServerRecord>, stats: &mut FlushStats) {
    let records = mem::replace(batch, Vec::with_capacity(batch.capacity()));
    let count = records.len();
    match sink.write_batch(records).await {
        Ok(()) => {
            stats.batches_flushed += 1;
            stats.records_written += count;
            debug!("flushed {count} servers");
        }
        Err(err) => {
            // no retries, the next batch gets its own chance
            stats.batches_failed += 1;
            error!("{err}");
        }
    }
}
