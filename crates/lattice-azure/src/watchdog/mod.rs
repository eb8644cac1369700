//! Instance watchdog: background health polling of scale sets
//!
//! A fixed pool of tokio workers pulls guard jobs from one shared queue.
//! A job is polled until it reports itself finished; between polls it waits
//! out an exponential backoff on a timer task, so no worker ever sleeps on
//! behalf of a job. Job ids are deduplicated: while a job is queued, running
//! or waiting to be re-polled, submitting another job with the same id is a
//! no-op.
//!
//! Shutdown flips a cancellation token while holding the submission lock and
//! then drops the queue sender. Every producer, including delayed requeues,
//! checks the token under the same lock, so nothing is ever sent on a closed
//! queue.

mod vmss;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lattice_common::retry::RetryConfig;
use lattice_common::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use vmss::{
    InstanceGuardResource, InstanceWatchdog, ReportHandler, VmssGuardJob, VmssHealthReport,
};

/// A unit of background work polled until it converges
#[async_trait]
pub trait Job: Send + 'static {
    /// Deduplication key
    fn id(&self) -> &str;

    /// Perform one poll
    async fn run(&mut self) -> Result<(), Error>;

    /// Whether the last poll observed the converged state
    fn finished(&self) -> bool;

    /// Called exactly once after `finished` returned true
    fn on_finished(self: Box<Self>);
}

/// Sizing and pacing of a [`WorkerPool`]
#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    /// Number of long-lived workers
    pub workers: usize,
    /// Delay between polls of an unfinished job
    pub backoff: RetryConfig,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: std::time::Duration::from_secs(5),
                max_delay: std::time::Duration::from_secs(60),
                backoff_multiplier: 2.0,
            },
        }
    }
}

impl From<&crate::config::OperatorConfig> for WatchdogConfig {
    fn from(config: &crate::config::OperatorConfig) -> Self {
        Self {
            workers: config.watchdog_workers,
            backoff: config.watchdog_backoff(),
        }
    }
}

struct Queued {
    job: Box<dyn Job>,
    attempt: u32,
}

struct PoolShared {
    sender: Mutex<Option<mpsc::UnboundedSender<Queued>>>,
    active: DashMap<String, ()>,
    shutdown: CancellationToken,
    backoff: RetryConfig,
}

impl PoolShared {
    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Queued>>> {
        // the guarded value is a plain Option, always consistent
        self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send unless shut down; returns false if the item was dropped
    fn send(&self, item: Queued) -> bool {
        let sender = self.sender();
        if self.shutdown.is_cancelled() {
            return false;
        }
        match sender.as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    fn release(&self, id: &str) {
        self.active.remove(id);
    }

    async fn process(self: &Arc<Self>, mut queued: Queued) {
        let id = queued.job.id().to_string();
        if self.shutdown.is_cancelled() {
            debug!(job = %id, "watchdog stopping, dropping job");
            self.release(&id);
            return;
        }

        queued.attempt += 1;
        if let Err(e) = queued.job.run().await {
            warn!(job = %id, attempt = queued.attempt, error = %e, "guard job failed, dropping it");
            self.release(&id);
            return;
        }

        if queued.job.finished() {
            info!(job = %id, attempts = queued.attempt, "guard job finished");
            self.release(&id);
            queued.job.on_finished();
            return;
        }

        let delay = self.backoff.delay_for_attempt(queued.attempt);
        debug!(
            job = %id,
            attempt = queued.attempt,
            delay_ms = delay.as_millis() as u64,
            "guard job not finished, requeueing"
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => shared.release(&id),
                _ = tokio::time::sleep(delay) => {
                    if !shared.send(queued) {
                        shared.release(&id);
                    }
                }
            }
        });
    }
}

/// Fixed-size pool of workers polling [`Job`]s to completion
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the workers; must be called inside a tokio runtime
    pub fn start(config: &WatchdogConfig) -> Result<Self, Error> {
        if config.workers == 0 {
            return Err(Error::validation("watchdog needs at least one worker"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Arc::new(PoolShared {
            sender: Mutex::new(Some(tx)),
            active: DashMap::new(),
            shutdown: CancellationToken::new(),
            backoff: config.backoff.clone(),
        });

        let workers = (0..config.workers)
            .map(|worker| tokio::spawn(worker_loop(worker, Arc::clone(&shared), Arc::clone(&rx))))
            .collect();

        info!(workers = config.workers, "watchdog started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Submit a job; returns false if one with the same id is already
    /// pending or the pool is stopped
    pub fn enqueue_job(&self, job: Box<dyn Job>) -> bool {
        let id = job.id().to_string();
        if self.shared.shutdown.is_cancelled() {
            debug!(job = %id, "watchdog stopped, rejecting job");
            return false;
        }

        match self.shared.active.entry(id.clone()) {
            Entry::Occupied(_) => {
                debug!(job = %id, "guard job already pending");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        if self.shared.send(Queued { job, attempt: 0 }) {
            debug!(job = %id, "guard job enqueued");
            true
        } else {
            self.shared.release(&id);
            false
        }
    }

    /// Whether a job with this id is queued, running or waiting to re-poll
    pub fn is_active(&self, id: &str) -> bool {
        self.shared.active.contains_key(id)
    }

    /// Number of jobs not yet finished or dropped
    pub fn active_jobs(&self) -> usize {
        self.shared.active.len()
    }

    /// Stop accepting jobs and close the queue. Idempotent.
    pub fn stop(&self) {
        let mut sender = self.shared.sender();
        if !self.shared.shutdown.is_cancelled() {
            info!("watchdog stopping");
        }
        self.shared.shutdown.cancel();
        sender.take();
    }

    /// Wait for every worker to exit; call after [`WorkerPool::stop`]
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *workers)
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "watchdog worker panicked");
            }
        }
    }

    /// Stop and wait for the workers
    pub async fn shutdown(&self) {
        self.stop();
        self.join().await;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<PoolShared>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>>,
) {
    debug!(worker, "watchdog worker started");
    loop {
        let next = {
            let mut queue = queue.lock().await;
            queue.recv().await
        };
        match next {
            Some(queued) => shared.process(queued).await,
            None => break,
        }
    }
    debug!(worker, "watchdog worker exiting");
}
