//! Threaded execution runtime for identify requests.
//!
//! `ReconcileEngine` is synchronous and may sleep between conflict retries.
//! This module runs it on a fixed set of named worker threads fed by a
//! bounded queue, so async front ends never block their executor and overload
//! turns into an immediate `QueueFull` instead of unbounded waiting.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::engine::{IdentifyResponse, ReconcileEngine};
use crate::error::{ExecutionError, ReconcileError, ReconcileResult};
use crate::request::IdentifyRequest;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct ReconcileRuntimeConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued requests.
    pub queue_capacity: usize,
}

impl Default for ReconcileRuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

enum Job {
    Identify {
        request: IdentifyRequest,
        reply: Sender<ReconcileResult<IdentifyResponse>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(
        workers: usize,
        queue_capacity: usize,
        engine: &Arc<ReconcileEngine>,
    ) -> Result<Self, ReconcileError> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut pool = Self {
            tx,
            workers: Vec::with_capacity(workers),
            queue_capacity,
        };
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let engine = Arc::clone(engine);
            let spawned = thread::Builder::new()
                .name(format!("reconcile-worker-{idx}"))
                .spawn(move || worker_loop(&rx, &engine));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => {
                    pool.shutdown();
                    return Err(ExecutionError::WorkerSpawn {
                        message: err.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(pool)
    }

    fn try_submit(&self, job: Job) -> Result<(), ReconcileError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(ExecutionError::Disconnected.into()),
        }
    }

    fn shutdown(self) {
        // Closing the channel lets workers drain queued jobs and exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: &Receiver<Job>, engine: &ReconcileEngine) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Identify { request, reply } => {
                let _ = reply.send(engine.identify(&request));
            }

            #[cfg(test)]
            Job::Sleep { duration, reply } => {
                thread::sleep(duration);
                let _ = reply.send(());
            }
        }
    }
}

/// Handle returned by [`ReconcileRuntime::submit`].
pub struct IdentifyHandle {
    rx: Receiver<ReconcileResult<IdentifyResponse>>,
}

impl IdentifyHandle {
    /// Waits for the request to complete.
    ///
    /// # Errors
    /// The engine's error, or `Disconnected` if the worker went away.
    pub fn join(self) -> ReconcileResult<IdentifyResponse> {
        self.rx
            .recv()
            .map_err(|_| ReconcileError::from(ExecutionError::Disconnected))?
    }

    /// Waits for the request to complete with a timeout.
    ///
    /// # Errors
    /// The engine's error, `Timeout`, or `Disconnected`.
    pub fn join_timeout(self, timeout: Duration) -> ReconcileResult<IdentifyResponse> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ReconcileError::from(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => ReconcileError::from(ExecutionError::Disconnected),
        })?
    }
}

/// A pool of threads running identify requests against one engine.
pub struct ReconcileRuntime {
    engine: Arc<ReconcileEngine>,
    pool: WorkerPool,
}

impl ReconcileRuntime {
    /// Starts the worker threads.
    ///
    /// # Errors
    /// `WorkerSpawn` if the OS refuses to create a thread.
    pub fn new(engine: ReconcileEngine, config: &ReconcileRuntimeConfig) -> Result<Self, ReconcileError> {
        let engine = Arc::new(engine);
        let pool = WorkerPool::start(config.workers, config.queue_capacity, &engine)?;
        tracing::debug!(workers = pool.workers.len(), queue = pool.queue_capacity, "runtime started");
        Ok(Self { engine, pool })
    }

    /// Queues a request without blocking.
    ///
    /// # Errors
    /// `QueueFull` when every slot is taken; `Disconnected` after shutdown.
    pub fn submit(&self, request: IdentifyRequest) -> Result<IdentifyHandle, ReconcileError> {
        let (tx, rx) = bounded::<ReconcileResult<IdentifyResponse>>(1);
        self.pool.try_submit(Job::Identify { request, reply: tx })?;
        Ok(IdentifyHandle { rx })
    }

    /// Runs a request on the pool and waits for it.
    ///
    /// # Errors
    /// Same as [`submit`](Self::submit) and [`IdentifyHandle::join`].
    pub fn identify(&self, request: IdentifyRequest) -> ReconcileResult<IdentifyResponse> {
        self.submit(request)?.join()
    }

    /// Returns a shared reference to the underlying engine.
    #[must_use]
    pub fn engine(&self) -> &ReconcileEngine {
        &self.engine
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> Result<Receiver<()>, ReconcileError> {
        let (tx, rx) = bounded::<()>(1);
        self.pool.try_submit(Job::Sleep { duration, reply: tx })?;
        Ok(rx)
    }
}

impl Drop for ReconcileRuntime {
    fn drop(&mut self) {
        let pool = std::mem::replace(
            &mut self.pool,
            WorkerPool {
                tx: bounded::<Job>(1).0,
                workers: Vec::new(),
                queue_capacity: 1,
            },
        );
        pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryContactStore;

    fn runtime(workers: usize, queue_capacity: usize) -> ReconcileRuntime {
        let engine = ReconcileEngine::new(Arc::new(InMemoryContactStore::new()));
        ReconcileRuntime::new(
            engine,
            &ReconcileRuntimeConfig {
                workers,
                queue_capacity,
            },
        )
        .unwrap()
    }

    fn request(email: &str) -> IdentifyRequest {
        IdentifyRequest::builder().email(email).build().unwrap()
    }

    #[test]
    fn identify_runs_on_a_worker() {
        let runtime = runtime(2, 8);
        let first = runtime.identify(request("doc@hillvalley.edu")).unwrap();
        let again = runtime.identify(request("doc@hillvalley.edu")).unwrap();
        assert_eq!(first, again);
        assert_eq!(runtime.engine().store().count().unwrap(), 1);
    }

    #[test]
    fn full_queue_is_rejected_immediately() {
        let runtime = runtime(1, 1);

        // Occupy the only worker, then fill the only queue slot.
        let busy = runtime.submit_sleep(Duration::from_millis(200)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let queued = runtime.submit(request("a@x.com")).unwrap();

        let err = runtime.submit(request("b@x.com")).err().unwrap();
        assert!(matches!(
            err,
            ReconcileError::Execution(ExecutionError::QueueFull { capacity: 1 })
        ));

        busy.recv_timeout(Duration::from_secs(1)).unwrap();
        queued.join_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn join_timeout_reports_timeout_while_worker_is_busy() {
        let runtime = runtime(1, 4);
        let busy = runtime.submit_sleep(Duration::from_millis(200)).unwrap();
        let handle = runtime.submit(request("a@x.com")).unwrap();

        let err = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Execution(ExecutionError::Timeout { duration_ms: 10 })
        ));
        busy.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn join_reports_disconnected_when_reply_sender_dropped() {
        let (tx, rx) = bounded::<ReconcileResult<IdentifyResponse>>(1);
        drop(tx);

        let err = IdentifyHandle { rx }.join().unwrap_err();
        assert!(matches!(err, ReconcileError::Execution(ExecutionError::Disconnected)));
    }

    #[test]
    fn join_timeout_reports_disconnected_not_timeout_when_reply_sender_dropped() {
        let (tx, rx) = bounded::<ReconcileResult<IdentifyResponse>>(1);
        drop(tx);

        let err = IdentifyHandle { rx }
            .join_timeout(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Execution(ExecutionError::Disconnected)));
    }
}
