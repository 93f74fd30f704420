//! Fixed-size worker pool running batches of independent jobs.
//!
//! A batch either completes, fails (a job panicked) or times out. In the
//! last two cases jobs not yet started are skipped and the results that
//! did arrive are returned alongside the failure.

use crate::{Error, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Worker pool sizing and limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Largest number of events handed to one job.
    pub max_segment_size: usize,
    /// How long a batch may run before it is abandoned.
    pub timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_segment_size: 1_000_000,
            timeout: Duration::from_secs(600),
        }
    }
}

impl WorkerPoolConfig {
    /// Set the number of worker threads.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the largest segment size.
    #[must_use]
    pub fn with_max_segment_size(mut self, size: usize) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Set the batch timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How a batch ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every job finished.
    Complete,
    /// A job panicked.
    Failed {
        /// Index of the failed job.
        job: usize,
        /// Panic message.
        message: String,
    },
    /// The deadline passed first.
    TimedOut {
        /// How long the batch was waited on.
        waited: Duration,
    },
}

impl BatchStatus {
    /// The failure as an error, given how many of `total` jobs finished.
    #[must_use]
    pub fn to_error(&self, completed: usize, total: usize) -> Option<Error> {
        match self {
            BatchStatus::Complete => None,
            BatchStatus::Failed { job, message } => Some(Error::WorkerFailed {
                job: *job,
                completed,
                total,
                message: message.clone(),
            }),
            BatchStatus::TimedOut { waited } => Some(Error::WorkerTimeout {
                completed,
                total,
                waited: *waited,
            }),
        }
    }
}

/// Results of a batch, indexed by job. Unfinished jobs are `None`.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Per-job results.
    pub results: Vec<Option<T>>,
    /// How the batch ended.
    pub status: BatchStatus,
}

impl<T> BatchOutcome<T> {
    /// True if every job finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Complete
    }

    /// Number of jobs that finished.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// The failure as an error, or `None` for a complete batch.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.status.to_error(self.completed(), self.results.len())
    }

    /// Finished results in job order, dropping the gaps.
    #[must_use]
    pub fn into_partial(self) -> Vec<T> {
        self.results.into_iter().flatten().collect()
    }

    /// All results in job order.
    ///
    /// # Errors
    /// Returns [`Error::WorkerFailed`] or [`Error::WorkerTimeout`] if the
    /// batch did not complete.
    pub fn into_result(self) -> Result<Vec<T>> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(self.into_partial()),
        }
    }
}

/// A fixed-size pool of worker threads.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    config: WorkerPoolConfig,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("config", &self.config).finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Starts the worker threads.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for zero workers or if the threads cannot
    /// be started.
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::Config("worker count must be positive".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("qspace-worker-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("cannot start worker pool: {e}")))?;
        Ok(Self { pool, config })
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Runs `f` inside the pool, so rayon parallel iterators in `f` use
    /// the pool's threads.
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        self.pool.install(f)
    }

    /// Runs jobs and waits for all of them, up to the configured timeout.
    ///
    /// The first panic or the deadline ends the wait; jobs that have not
    /// started by then are skipped. Running jobs are not interrupted.
    pub fn run<T, F>(&self, jobs: Vec<F>) -> BatchOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let total = jobs.len();
        let (tx, rx) = mpsc::channel();
        let abort = Arc::new(AtomicBool::new(false));
        for (index, job) in jobs.into_iter().enumerate() {
            let tx = tx.clone();
            let abort = Arc::clone(&abort);
            self.pool.spawn(move || {
                if abort.load(Ordering::SeqCst) {
                    return;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(job)).map_err(panic_message);
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);

        let mut results: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut received = 0;
        let status = loop {
            if received == total {
                break BatchStatus::Complete;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((index, Ok(value))) => {
                    results[index] = Some(value);
                    received += 1;
                }
                Ok((job, Err(message))) => {
                    log::error!("Worker job {job} of {total} failed: {message}");
                    break BatchStatus::Failed { job, message };
                }
                Err(RecvTimeoutError::Timeout) => {
                    let waited = started.elapsed();
                    log::error!("Batch of {total} jobs timed out after {waited:?} ({received} done)");
                    break BatchStatus::TimedOut { waited };
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::error!("Workers exited with {} of {total} jobs unreported", total - received);
                    break BatchStatus::Failed {
                        job: received,
                        message: "worker exited without reporting".to_string(),
                    };
                }
            }
        };
        if status != BatchStatus::Complete {
            abort.store(true, Ordering::SeqCst);
        }
        BatchOutcome { results, status }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_in_job_order() {
        let pool = WorkerPool::new(WorkerPoolConfig::default()).unwrap();
        let jobs: Vec<_> = (0..20u64)
            .map(|i| {
                move || {
                    std::thread::sleep(Duration::from_millis((20 - i) % 5));
                    i * i
                }
            })
            .collect();
        let outcome = pool.run(jobs);
        assert!(outcome.is_complete());
        let values = outcome.into_result().unwrap();
        assert_eq!(values, (0..20u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_panic_fails_batch_with_partial_results() {
        let pool = WorkerPool::new(WorkerPoolConfig::default().with_workers(1)).unwrap();
        let jobs: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
            Box::new(|| 1),
            Box::new(|| panic!("bad segment")),
            Box::new(|| 3),
        ];
        let outcome = pool.run(jobs.into_iter().map(|job| move || job()).collect());
        assert_eq!(
            outcome.status,
            BatchStatus::Failed {
                job: 1,
                message: "bad segment".to_string()
            }
        );
        assert_eq!(outcome.results[0], Some(1));
        assert!(matches!(outcome.error(), Some(Error::WorkerFailed { job: 1, .. })));
    }

    #[test]
    fn test_timeout_is_distinct() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::default()
                .with_workers(2)
                .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        let jobs: Vec<_> = [0u64, 500]
            .into_iter()
            .map(|ms| {
                move || {
                    std::thread::sleep(Duration::from_millis(ms));
                    ms
                }
            })
            .collect();
        let outcome = pool.run(jobs);
        assert!(matches!(outcome.status, BatchStatus::TimedOut { .. }));
        assert_eq!(outcome.completed(), 1);
        assert!(matches!(outcome.error(), Some(Error::WorkerTimeout { completed: 1, total: 2, .. })));
        assert_eq!(outcome.into_partial(), vec![0]);
    }

    #[test]
    fn test_empty_batch_and_zero_workers() {
        let pool = WorkerPool::new(WorkerPoolConfig::default()).unwrap();
        let outcome = pool.run(Vec::<fn() -> u8>::new());
        assert!(outcome.is_complete());
        assert!(WorkerPool::new(WorkerPoolConfig::default().with_workers(0)).is_err());
    }
}
