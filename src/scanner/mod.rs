pub mod masscan;

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{
    sync::{Mutex, mpsc},
    task::{JoinHandle, JoinSet},
};
use tracing::{error, trace};

use crate::{
    probe::{Probe, ServerRecord},
    processing::{BatchConfig, BatchSink, FlushStats, accumulate},
    terminal_colors::*,
};

/// An address that the port scanner said was open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub ip: IpAddr,
    pub port: u16,
}

impl Candidate {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub batch: BatchConfig,
    /// Print a line for every server found.
    pub verbose: bool,
    /// Stop printing found servers after this many.
    pub verbose_limit: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1000,
            inbound_capacity: 10_000,
            outbound_capacity: 1000,
            batch: BatchConfig::default(),
            verbose: false,
            verbose_limit: None,
        }
    }
}

/// Counters shared by every worker. These are only informational.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub probed: AtomicUsize,
    pub found: AtomicUsize,
    pub failed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub probed: usize,
    pub found: usize,
    pub failed: usize,
    pub flush: FlushStats,
}

/// The producer side of the pipeline. Dropping every clone of this closes the
/// inbound queue, which is what tells the workers to finish up.
#[derive(Clone)]
pub struct CandidateSender {
    tx: mpsc::Sender<Candidate>,
}

impl CandidateSender {
    /// Waits while the queue is full. Gives the candidate back if the pipeline
    /// isn't running anymore.
    pub async fn send(&self, candidate: Candidate) -> Result<(), Candidate> {
        self.tx.send(candidate).await.map_err(|err| err.0)
    }
}

pub struct PipelineHandle<S> {
    workers: JoinHandle<()>,
    accumulator: JoinHandle<(S, FlushStats)>,
    stats: Arc<PipelineStats>,
}

impl<S> PipelineHandle<S> {
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Wait for the workers to drain the inbound queue and for the last batch
    /// to be flushed. Only returns once every [`CandidateSender`] is dropped.
    pub async fn join(self) -> eyre::Result<(S, PipelineSummary)> {
        self.workers.await?;
        let (sink, flush) = self.accumulator.await?;
        let summary = PipelineSummary {
            probed: self.stats.probed.load(Ordering::Relaxed),
            found: self.stats.found.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            flush,
        };
        Ok((sink, summary))
    }
}

/// Start the workers and the batch accumulator.
///
/// Shutdown order matters here: once the inbound queue is closed and empty,
/// every worker exits, and only after all of them are gone does the outbound
/// queue close, so the accumulator always sees every record before it does its
/// final flush.
pub fn spawn_pipeline<P, S>(
    prober: Arc<P>,
    sink: S,
    config: PipelineConfig,
) -> (CandidateSender, PipelineHandle<S>)
where
    P: Probe,
    S: BatchSink,
{
    let (candidate_tx, candidate_rx) = mpsc::channel(config.inbound_capacity.max(1));
    let (record_tx, record_rx) = mpsc::channel(config.outbound_capacity.max(1));
    let stats = Arc::new(PipelineStats::default());

    let accumulator = tokio::spawn(accumulate(record_rx, sink, config.batch));

    let candidate_rx = Arc::new(Mutex::new(candidate_rx));
    let verbose = Verbosity {
        enabled: config.verbose,
        limit: config.verbose_limit,
    };
    let worker_count = config.workers.max(1);
    let worker_stats = stats.clone();
    let workers = tokio::spawn(async move {
        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            workers.spawn(worker(
                prober.clone(),
                candidate_rx.clone(),
                record_tx.clone(),
                worker_stats.clone(),
                verbose,
            ));
        }
        while let Some(res) = workers.join_next().await {
            if let Err(err) = res {
                error!("scan worker died: {err}");
            }
        }
        // every worker is done, now the accumulator can see the end
        drop(record_tx);
    });

    (
        CandidateSender { tx: candidate_tx },
        PipelineHandle {
            workers,
            accumulator,
            stats,
        },
    )
}

#[derive(Debug, Clone, Copy)]
struct Verbosity {
    enabled: bool,
    limit: Option<usize>,
}

impl Verbosity {
    fn should_print(&self, found: usize) -> bool {
        self.enabled && self.limit.is_none_or(|limit| found <= limit)
    }
}

async fn worker<P: Probe>(
    prober: Arc<P>,
    candidates: Arc<Mutex<mpsc::Receiver<Candidate>>>,
    records: mpsc::Sender<ServerRecord>,
    stats: Arc<PipelineStats>,
    verbose: Verbosity,
) {
    loop {
        // the lock is only held while waiting for the next candidate
        let Some(candidate) = candidates.lock().await.recv().await else {
            break;
        };
        stats.probed.fetch_add(1, Ordering::Relaxed);

        let record = match prober.probe(candidate).await {
            Ok(record) => record,
            Err(err) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                trace!("{} failed: {err}", candidate.addr());
                continue;
            }
        };

        let found = stats.found.fetch_add(1, Ordering::Relaxed) + 1;
        if verbose.should_print(found) {
            print_found(&record);
        }

        if records.send(record).await.is_err() {
            error!("batch accumulator is gone, stopping worker");
            break;
        }
    }
}

fn print_found(r: &ServerRecord) {
    let addr = SocketAddr::new(r.ip, r.port).to_string();
    let whitelist = if r.is_whitelisted {
        format!("{RED}whitelist{RESET}")
    } else {
        format!("{GREEN}open{RESET}")
    };
    if r.rcon_open {
        println!("{BOLD}[+]{RESET} {addr:<21} | {YELLOW}rcon{RESET}");
    } else {
        println!(
            "{BOLD}[+]{RESET} {addr:<21} | {BLUE}{:<16}{RESET} | {}/{} | {whitelist}",
            r.version_name, r.players_online, r.players_max
        );
    }
}
