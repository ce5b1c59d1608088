//! Fan-out/fan-in over independent tasks.
//!
//! One producer feeds a bounded queue, a fixed pool of workers each owns its
//! scratch state, and a single collector folds results into the shared
//! accumulator under one lock. A progress thread logs at a fixed interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bincode::{Decode, Encode};
use crossbeam_channel::{RecvTimeoutError, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Why a task contributed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayOutcome {
    /// Not indexed, or its file is gone.
    Missing,
    /// Failed an integrity check.
    Corrupt,
    /// Decoded fine but has too few rows to measure.
    Empty,
    /// Output could not be written.
    Failed,
}

/// Outcome counts of one run, in the unit of its tasks (days for a study,
/// periods for a validation sweep).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
pub struct RunSummary {
    pub ok: u64,
    pub missing: u64,
    pub corrupt: u64,
    pub empty: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl RunSummary {
    pub fn record(&mut self, outcome: DayOutcome) {
        match outcome {
            DayOutcome::Missing => self.missing += 1,
            DayOutcome::Corrupt => self.corrupt += 1,
            DayOutcome::Empty => self.empty += 1,
            DayOutcome::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.ok + self.missing + self.corrupt + self.empty + self.failed + self.skipped
    }
}

/// Cooperative cancellation, checked between tasks only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub result_capacity: usize,
    pub progress_interval: Duration,
    /// What one task is, for log fields.
    pub unit: &'static str,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: 1024,
            result_capacity: 64,
            progress_interval: Duration::from_millis(500),
            unit: "days",
        }
    }
}

/// All hardware threads, leaving two free on machines with more than four.
pub fn default_workers() -> usize {
    let n = thread::available_parallelism().map_or(1, |n| n.get());
    if n > 4 { n - 2 } else { n }
}

/// Runs `work` over every task and folds successful results into `acc` with
/// `merge`. `init` builds one scratch state per worker. Tasks still queued
/// when `cancel` fires are counted as skipped.
pub fn run<K, S, T, A>(
    tasks: Vec<K>,
    options: &SchedulerOptions,
    cancel: &CancelToken,
    acc: A,
    init: impl Fn() -> S + Sync,
    work: impl Fn(&mut S, &K) -> Result<T, DayOutcome> + Sync,
    mut merge: impl FnMut(&mut A, &K, T) + Send,
) -> (A, RunSummary)
where
    K: Send,
    T: Send,
    A: Send,
{
    let total = tasks.len();
    let workers = options.workers.max(1);
    let shared = Mutex::new((acc, RunSummary::default()));
    let completed = AtomicU64::new(0);
    let skipped = AtomicU64::new(0);
    let started = Instant::now();

    let (task_tx, task_rx) = bounded::<K>(options.queue_capacity.max(1));
    let (result_tx, result_rx) = bounded::<(K, Result<T, DayOutcome>)>(options.result_capacity.max(1));
    let (done_tx, done_rx) = bounded::<()>(0);

    let unit = options.unit;
    info!(tasks = total, unit, workers, "run started");

    thread::scope(|s| {
        let (shared, completed, skipped) = (&shared, &completed, &skipped);
        let (init, work) = (&init, &work);

        s.spawn(move || {
            loop {
                match done_rx.recv_timeout(options.progress_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let done = completed.load(Ordering::Relaxed);
                        let secs = started.elapsed().as_secs_f64();
                        let per_sec = done as f64 / secs.max(1e-9);
                        info!(done, total, unit, per_sec, "progress");
                    }
                    _ => break,
                }
            }
        });

        let collector = s.spawn(move || {
            for (task, result) in result_rx {
                let mut guard = shared.lock();
                let (acc, summary) = &mut *guard;
                match result {
                    Ok(value) => {
                        summary.ok += 1;
                        merge(acc, &task, value);
                    }
                    Err(outcome) => summary.record(outcome),
                }
                drop(guard);
                completed.fetch_add(1, Ordering::Relaxed);
            }
        });

        for id in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            s.spawn(move || {
                let mut state = init();
                let mut handled = 0u64;
                for task in task_rx {
                    if cancel.is_cancelled() {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let result = work(&mut state, &task);
                    handled += 1;
                    if result_tx.send((task, result)).is_err() {
                        break;
                    }
                }
                debug!(worker = id, handled, "worker finished");
            });
        }
        drop(task_rx);
        drop(result_tx);

        let mut cancelled_logged = false;
        for task in tasks {
            if cancel.is_cancelled() {
                if !cancelled_logged {
                    warn!("run cancelled, skipping remaining tasks");
                    cancelled_logged = true;
                }
                skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if task_tx.send(task).is_err() {
                break;
            }
        }
        drop(task_tx);

        if collector.join().is_err() {
            warn!("collector panicked");
        }
        drop(done_tx);
    });

    let (acc, mut summary) = shared.into_inner();
    summary.skipped = skipped.into_inner();
    info!(
        unit,
        ok = summary.ok,
        missing = summary.missing,
        corrupt = summary.corrupt,
        empty = summary.empty,
        failed = summary.failed,
        skipped = summary.skipped,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "run finished"
    );
    (acc, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(workers: usize) -> SchedulerOptions {
        SchedulerOptions {
            workers,
            queue_capacity: 2,
            result_capacity: 2,
            progress_interval: Duration::from_millis(5),
            unit: "tasks",
        }
    }

    #[test]
    fn test_sum_is_order_independent() {
        let tasks: Vec<u64> = (1..=1_000).collect();
        for workers in [1, 3, 8] {
            let (sum, summary) = run(
                tasks.clone(),
                &options(workers),
                &CancelToken::new(),
                0u64,
                || (),
                |_, t| Ok(*t),
                |acc, _, v| *acc += v,
            );
            assert_eq!(sum, 500_500);
            assert_eq!(summary.ok, 1_000);
        }
    }

    #[test]
    fn test_outcomes_are_counted() {
        let (seen, summary) = run(
            (0..10).collect::<Vec<u32>>(),
            &options(2),
            &CancelToken::new(),
            Vec::new(),
            || (),
            |_, t| match t % 5 {
                0 => Err(DayOutcome::Missing),
                1 => Err(DayOutcome::Corrupt),
                2 => Err(DayOutcome::Empty),
                _ => Ok(*t),
            },
            |acc: &mut Vec<u32>, _, v| acc.push(v),
        );
        assert_eq!(seen.len(), 4);
        assert_eq!(
            summary,
            RunSummary {
                ok: 4,
                missing: 2,
                corrupt: 2,
                empty: 2,
                failed: 0,
                skipped: 0,
            }
        );
    }

    #[test]
    fn test_worker_state_is_reused() {
        let (calls, _) = run(
            (0..50).collect::<Vec<u32>>(),
            &options(1),
            &CancelToken::new(),
            0usize,
            || 0usize,
            |state, _| {
                *state += 1;
                Ok(*state)
            },
            |acc, _, v| *acc = (*acc).max(v),
        );
        assert_eq!(calls, 50);
    }

    #[test]
    fn test_cancelled_run_skips_everything() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let (sum, summary) = run(
            (0..20).collect::<Vec<u32>>(),
            &options(2),
            &cancel,
            0u32,
            || (),
            |_, t| Ok(*t),
            |acc, _, v| *acc += v,
        );
        assert_eq!(sum, 0);
        assert_eq!(summary.skipped, 20);
        assert_eq!(summary.total(), 20);
    }

    #[test]
    fn test_expired_deadline_cancels() {
        let token = CancelToken::with_deadline(Duration::ZERO);
        assert!(token.is_cancelled());
        assert!(!CancelToken::with_deadline(Duration::from_secs(3600)).is_cancelled());
    }
}
