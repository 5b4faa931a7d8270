//! A bounded worker pool for job execution.
//!
//! Workers pull tasks from a zero-capacity channel, so `spawn` blocks
//! until an idle worker takes the task: at most `threads` jobs run at
//! once and submission is its own admission control. A panicking job is
//! caught and the worker keeps serving.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error};

use crate::{KvsError, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads.
pub struct ThreadPool {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with the given number of worker threads.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(KvsError::Config(
                "thread pool needs at least one worker".to_owned(),
            ));
        }

        // Rendezvous channel: a send completes only when a worker is
        // ready to take the task, which bounds concurrency to the
        // worker count.
        let (tx, rx) = channel::bounded::<Task>(0);
        let workers = (0..threads)
            .map(|id| spawn_worker(id, rx.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    /// Submits a task, blocking while every worker is busy.
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .as_ref()
            .expect("pool is shut down")
            .send(Box::new(task))
            .expect("thread pool has no active workers");
    }

    /// Drains the queue and joins every worker.
    pub fn shutdown(mut self) {
        self.join_workers();
    }

    fn join_workers(&mut self) {
        // Dropping the sender closes the channel; workers exit after
        // finishing their current task.
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join_workers();
    }
}

fn spawn_worker(id: usize, rx: Receiver<Task>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("pool-worker-{id}"))
        .spawn(move || loop {
            match rx.recv() {
                Ok(task) => {
                    debug!("worker {id} picked up a task");
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("worker {id}: task panicked, continuing");
                    }
                }
                Err(_) => {
                    debug!("worker {id}: queue closed, exiting");
                    return;
                }
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_every_submitted_task() {
        let pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = counter.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn concurrency_never_exceeds_pool_size() {
        let pool = ThreadPool::new(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn panicking_task_does_not_kill_the_pool() {
        let pool = ThreadPool::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        pool.spawn(|| panic!("boom"));
        let done2 = done.clone();
        pool.spawn(move || {
            done2.fetch_add(1, Ordering::SeqCst);
        });
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_workers_is_refused() {
        assert!(ThreadPool::new(0).is_err());
    }
}
