//! Fixed size thread pool fed by a bounded queue.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use derive_more::{Display, Error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[display("the job queue is full")]
    QueueFull,
    #[display("the worker pool is shut down")]
    ShutDown,
}

/// Result slot shared between a job and its [JobHandle].
struct Slot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the result of a submitted job.
///
/// The result can be taken exactly once.
pub struct JobHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> JobHandle<T> {
    /// The result, if the job has finished.
    pub fn try_result(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Block until the job has finished.
    pub fn wait(self) -> T {
        let mut value = self.slot.lock();
        loop {
            if let Some(result) = value.take() {
                return result;
            }
            value = self
                .slot
                .ready
                .wait(value)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the job has finished or `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let value = self.slot.lock();
        let (mut value, _) = self
            .slot
            .ready
            .wait_timeout_while(value, timeout, |value| value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        value.take()
    }
}

/// Runs submitted jobs on a fixed number of threads.
///
/// Dropping the pool closes the queue; workers finish the queued jobs and exit.
pub struct WorkerPool {
    sender: Option<SyncSender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` threads (at least one) with room for `capacity`
    /// jobs waiting in the queue.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|n| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("backup-worker-{n}"))
                    .spawn(move || work(&receiver))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!(target: "backup::worker", "Spawning worker thread failed: {e}");
                    None
                }
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queue `job` without blocking.
    pub fn submit<T, F>(&self, job: F) -> Result<JobHandle<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(SubmitError::ShutDown)?;
        if self.workers.is_empty() {
            return Err(SubmitError::ShutDown);
        }

        let slot = Arc::new(Slot {
            value: Mutex::new(None),
            ready: Condvar::new(),
        });
        let job_slot = Arc::clone(&slot);
        let job: Job = Box::new(move || {
            let result = job();
            *job_slot.lock() = Some(result);
            job_slot.ready.notify_all();
        });

        match sender.try_send(job) {
            Ok(()) => Ok(JobHandle { slot }),
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShutDown),
        }
    }
}

fn work(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!(target: "backup::worker", "A worker thread panicked");
            }
        }
    }
}
