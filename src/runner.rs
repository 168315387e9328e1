//! The load engine: a pool of bounded-concurrency workers drives attempts
//! through a driver and streams their records to the collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::collector::RecordCollector;
use crate::output::OutputFormat;
use crate::probe::{ClientOptions, HttpDriver, RequestTemplate};
use crate::report::{AttemptRecord, ServerReport};

/// Error key under which abandoned in-flight attempts are counted.
pub const CANCELLED_ERROR: &str = "request canceled";

/// Issues one attempt against the target and reports its timings.
///
/// The engine is generic over the driver so the pool can be exercised
/// without a network; the HTTP timing probe is the production driver.
#[async_trait]
pub trait AttemptDriver: Clone + Send + Sync + 'static {
    /// Per-worker state, typically the worker's persistent connection.
    type WorkerState: Send;

    async fn setup(&self) -> Result<Self::WorkerState>;

    /// Run one attempt. Transport failures are reported inside the record,
    /// never as an `Err`.
    async fn attempt(&self, state: &mut Self::WorkerState, offset: Duration) -> AttemptRecord;
}

/// Engine-level options, validated by the CLI layer before construction.
#[derive(Copy, Clone, Debug)]
pub struct EngineOpts {
    pub concurrency: u32,
    /// Total attempt budget; `None` runs unbounded until the duration
    /// expires or the engine is stopped.
    pub attempts: Option<u64>,
    pub duration: Option<Duration>,
    /// Per-worker pacing in attempts per second; 0 disables pacing.
    /// Aggregate throughput is `concurrency * qps`.
    pub qps: f64,
}

impl EngineOpts {
    fn channel_capacity(&self) -> usize {
        let cap = 2 * self.concurrency as usize;
        match self.attempts {
            Some(n) => cap.min(n as usize).max(1),
            None => cap.max(1),
        }
    }
}

/// Full workload description for one load server.
#[derive(Clone, Debug)]
pub struct Work {
    pub template: RequestTemplate,
    pub client: ClientOptions,
    /// Total attempts in count mode.
    pub n: u64,
    pub concurrency: u32,
    pub qps: f64,
    /// When set, supersedes `n`.
    pub duration: Option<Duration>,
    pub output: OutputFormat,
}

impl Work {
    /// Build a fresh engine for one run of this workload.
    pub fn engine(&self) -> LoadEngine<HttpDriver> {
        let opts = EngineOpts {
            concurrency: self.concurrency,
            attempts: if self.duration.is_some() { None } else { Some(self.n) },
            duration: self.duration,
            qps: self.qps,
        };
        let driver = HttpDriver::new(self.template.clone(), self.client.clone());
        LoadEngine::new(driver, opts)
    }
}

/// Drives one workload run: spawns the workers and the collector, observes
/// the duration deadline and the cancellation token, and finalises the
/// report once every record is drained.
pub struct LoadEngine<D: AttemptDriver> {
    driver: D,
    opts: EngineOpts,
    cancel: CancellationToken,
}

impl<D> LoadEngine<D>
where
    D: AttemptDriver,
    D::WorkerState: 'static,
{
    pub fn new(driver: D, opts: EngineOpts) -> Self {
        Self { driver, opts, cancel: CancellationToken::new() }
    }

    /// Token observed by every worker and in-flight request.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Idempotent early-termination signal.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run the workload to completion and return the finalised report.
    ///
    /// Returns when the attempt budget is exhausted, the duration elapses or
    /// [`stop`](Self::stop) is called, with every produced record drained.
    pub async fn run(&self) -> Result<ServerReport> {
        let started = Instant::now();
        let (tx, rx) = mpsc::channel(self.opts.channel_capacity());
        let hint = self.opts.attempts.unwrap_or(0) as usize;
        let collector = tokio::spawn(RecordCollector::new(rx, hint).run());

        let counter = Arc::new(AtomicU64::new(0));
        let mut set: JoinSet<Result<()>> = JoinSet::new();
        for _ in 0..self.opts.concurrency {
            let worker = Worker {
                driver: self.driver.clone(),
                opts: self.opts,
                started,
                tx: tx.clone(),
                cancel: self.cancel.clone(),
                counter: counter.clone(),
            };
            set.spawn(worker.run());
        }
        drop(tx);

        // Termination precedence: cancellation, then duration, then quota.
        if let Some(deadline) = self.opts.duration.map(|d| started + d) {
            select! {
                _ = self.cancel.cancelled() => {}
                _ = sleep_until(deadline) => self.cancel.cancel(),
                r = join_all(&mut set) => r?,
            }
        }
        join_all(&mut set).await?;

        let tally = collector.await?;
        Ok(tally.finalize(started.elapsed()))
    }
}

struct Worker<D: AttemptDriver> {
    driver: D,
    opts: EngineOpts,
    started: Instant,
    tx: mpsc::Sender<AttemptRecord>,
    cancel: CancellationToken,
    counter: Arc<AtomicU64>,
}

impl<D: AttemptDriver> Worker<D> {
    async fn run(self) -> Result<()> {
        let mut state = self.driver.setup().await?;
        let mut pacer = pace_interval(self.opts.qps);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(pacer) = pacer.as_mut() {
                select! {
                    _ = self.cancel.cancelled() => break,
                    _ = pacer.tick() => {}
                }
            }

            let seq = self.counter.fetch_add(1, Ordering::Relaxed);
            if let Some(attempts) = self.opts.attempts {
                if seq >= attempts {
                    break;
                }
            }

            let offset = self.started.elapsed();
            select! {
                _ = self.cancel.cancelled() => {
                    // The in-flight request is abandoned; it reports itself
                    // the way any aborted transport operation does.
                    let _ = self.tx.send(AttemptRecord::failed(offset, CANCELLED_ERROR)).await;
                    break;
                }
                record = self.driver.attempt(&mut state, offset) => {
                    if self.tx.send(record).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Per-worker pacing gate: every attempt, including the first, waits for a
/// tick of the `1/qps` interval.
fn pace_interval(qps: f64) -> Option<Interval> {
    (qps > 0.0).then(|| {
        let period = Duration::from_secs_f64(1.0 / qps);
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    })
}

async fn join_all(set: &mut JoinSet<Result<()>>) -> Result<()> {
    while let Some(res) = set.join_next().await {
        res??;
    }
    Ok(())
}
