//! Fixed-size thread pools for blocking file I/O.
//!
//! The sender reads file content on one pool and the receiver writes it on
//! another, so the tokio tasks servicing streams never block on the disk.
//! Idle workers park on the empty queue.

use crate::error::{Result, SyncError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: String,
    queue: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(rx))?;
            workers.push(handle);
        }
        tracing::debug!("Started {} pool with {} threads", name, threads);
        Ok(Self {
            name: name.to_string(),
            queue: Some(tx),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job without waiting for it.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self.queue.as_ref().ok_or(SyncError::WorkerPoolClosed)?;
        queue
            .send(Box::new(job))
            .map_err(|_| SyncError::WorkerPoolClosed)
    }

    /// Run `job` on the pool and wait for its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move || {
            let _ = tx.send(job());
        })?;
        rx.await.map_err(|_| SyncError::WorkerPoolClosed)
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(
                "Job panicked on {}",
                thread::current().name().unwrap_or("worker")
            );
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets workers drain and exit.
        self.queue.take();
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("{} worker exited abnormally", self.name);
            }
        }
    }
}
