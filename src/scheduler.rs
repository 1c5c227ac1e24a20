//! Concurrent package scheduler
//!
//! Runs one test process per package under a worker bound, folding each
//! package's summary into a private map that is only read once every worker
//! has finished.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RunError;
use crate::event::TestEvent;
use crate::test_model::RunSummary;
use crate::test_runner::{RunRequest, TestRunner, ALL_PACKAGES};

/// How long workers get to wind down after cancellation before being aborted.
pub const CANCEL_GRACE: Duration = Duration::from_secs(3);

const EVENT_BUFFER: usize = 256;

/// Logical cores, at least two.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(2)
}

/// Result of a scheduled batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Sum of all recorded package summaries.
    pub summary: RunSummary,
    pub completed: Vec<String>,
    /// Packages whose pipeline failed; not part of `summary`.
    pub errored: Vec<String>,
    /// Packages never admitted because the batch was cancelled.
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

enum WorkerOutcome {
    Completed,
    Errored(String),
    Skipped(String),
}

/// Bounded parallel executor for package runs
pub struct Scheduler {
    max_workers: usize,
    gate: Arc<Semaphore>,
    grace: Duration,
}

impl Scheduler {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            gate: Arc::new(Semaphore::new(max_workers)),
            grace: CANCEL_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Free worker slots right now.
    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// Run `executor` once per package, at most `max_workers` at a time.
    ///
    /// A failing package is logged and left out of the summary; its siblings
    /// keep running. Cancellation stops admission at once and aborts any
    /// worker still running after the grace period.
    pub async fn execute<F, Fut>(
        &self,
        packages: Vec<String>,
        cancel: CancellationToken,
        executor: F,
    ) -> BatchReport
    where
        F: Fn(String, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RunSummary, RunError>> + Send + 'static,
    {
        let results: Arc<Mutex<HashMap<String, RunSummary>>> = Arc::default();
        let executor = Arc::new(executor);
        let mut join_set = JoinSet::new();

        info!(
            packages = packages.len(),
            workers = self.max_workers,
            "scheduling package runs"
        );

        for package in packages {
            let gate = self.gate.clone();
            let exec = executor.clone();
            let results = results.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return WorkerOutcome::Skipped(package),
                    permit = gate.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return WorkerOutcome::Skipped(package),
                    },
                };

                debug!(package = %package, "package admitted");
                let result = exec(package.clone(), cancel).await;
                drop(permit);

                match result {
                    Ok(summary) => {
                        results.lock().await.insert(package, summary);
                        WorkerOutcome::Completed
                    }
                    Err(err) => {
                        warn!(package = %package, error = %err, "package run failed");
                        WorkerOutcome::Errored(package)
                    }
                }
            });
        }

        let mut report = BatchReport::default();
        let grace = self.grace;
        let deadline = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = join_set.join_next() => match next {
                    None => break,
                    Some(Ok(WorkerOutcome::Completed)) => {}
                    Some(Ok(WorkerOutcome::Errored(package))) => report.errored.push(package),
                    Some(Ok(WorkerOutcome::Skipped(package))) => report.skipped.push(package),
                    Some(Err(err)) => warn!(error = %err, "package worker did not finish"),
                },
                _ = &mut deadline => {
                    warn!(
                        remaining = join_set.len(),
                        "workers still running after cancellation, aborting"
                    );
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let recorded = std::mem::take(&mut *results.lock().await);
        for summary in recorded.values() {
            report.summary.merge(summary);
        }
        report.completed = recorded.into_keys().collect();
        report.completed.sort();
        report.errored.sort();
        report.skipped.sort();
        report.cancelled = cancel.is_cancelled();

        info!(
            completed = report.completed.len(),
            errored = report.errored.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "batch finished"
        );
        report
    }

    /// Run every package of `request` as its own process, forwarding all
    /// events to `sink`. An empty package set runs the whole module as one
    /// unit.
    pub async fn run_packages(
        &self,
        runner: Arc<TestRunner>,
        request: &RunRequest,
        sink: mpsc::Sender<TestEvent>,
        cancel: CancellationToken,
    ) -> BatchReport {
        let units: Vec<String> = if request.packages.is_empty() {
            vec![ALL_PACKAGES.to_string()]
        } else {
            request.packages.iter().cloned().collect()
        };
        let base = request.clone();

        self.execute(units, cancel, move |package, cancel| {
            let runner = runner.clone();
            let sink = sink.clone();
            let request = if base.packages.is_empty() {
                base.clone()
            } else {
                base.for_package(&package)
            };
            async move { run_package(&runner, &request, sink, cancel).await }
        })
        .await
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(default_workers())
    }
}

/// Run one request, forwarding its events and tallying a summary.
pub async fn run_package(
    runner: &TestRunner,
    request: &RunRequest,
    sink: mpsc::Sender<TestEvent>,
    cancel: CancellationToken,
) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);

    let forward = async {
        let mut summary = RunSummary::default();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            summary.record(&event);
            if sink.send(event).await.is_err() {
                break;
            }
        }
        summary
    };

    let (outcome, mut summary) = tokio::join!(runner.run(request, tx, cancel.clone()), forward);
    let outcome = outcome?;

    if summary.duration.is_zero() {
        summary.duration = started.elapsed();
    }
    debug!(
        target_packages = %request.describe(),
        ?outcome,
        total = summary.total,
        "package pipeline done"
    );
    Ok(summary)
}
