//! Bounded pool of blocking worker threads.
//!
//! Jobs travel over a bounded crossbeam queue; a full queue is reported to
//! the caller instead of blocking the event loop. Shutdown drops the queue
//! sender and lets workers drain and exit on their own, so the shutdown path
//! never joins a thread that may be stuck in a long statement.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread;

use crate::error::EngineError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker thread count (None = one per available core)
    pub threads: Option<usize>,
    /// Maximum queued jobs before submissions are rejected
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: None,
            queue_capacity: 1024,
        }
    }
}

impl PoolConfig {
    pub fn thread_count(&self) -> usize {
        self.threads
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(|count| count.get())
                    .unwrap_or(4)
            })
            .max(1)
    }
}

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    threads: usize,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Result<Self, EngineError> {
        let threads = config.thread_count();
        let (sender, receiver) = bounded::<Job>(config.queue_capacity.max(1));

        for i in 0..threads {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("sqlroom-worker-{i}"))
                .spawn(move || worker_loop(receiver))?;
        }

        log::debug!("Started {threads} database workers");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Queue a job without blocking.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), EngineError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::PoolClosed)?;

        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EngineError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(EngineError::PoolClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop accepting jobs. Already queued jobs still run; nothing is joined.
    pub fn shutdown(&self) {
        if self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            log::info!("Worker pool stopped accepting jobs");
        }
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!(
                "Job panicked on {}",
                thread::current().name().unwrap_or("sqlroom-worker")
            );
        }
    }
}
