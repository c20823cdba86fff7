//! Dedicated single-thread execution context per connection
//!
//! BLE stacks expect their request calls to be made off the async executor
//! yet strictly in order for a given connection. Each engine owns one
//! [`GattWorker`]: a named OS thread draining a job queue.

use std::io;
use std::sync::{mpsc, Mutex};
use std::thread;

use gattlink_core::{GattError, GattResult};
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serial executor backed by one OS thread
pub struct GattWorker {
    name: String,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
}

impl GattWorker {
    /// Start the worker thread
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (jobs, queue) = mpsc::channel::<Job>();
        let thread_name = name.clone();
        thread::Builder::new().name(name.clone()).spawn(move || {
            trace!(worker = %thread_name, "Worker started");
            while let Ok(job) = queue.recv() {
                job();
            }
            trace!(worker = %thread_name, "Worker stopped");
        })?;

        Ok(Self {
            name,
            jobs: Mutex::new(Some(jobs)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `job` on the worker thread and wait for its result
    ///
    /// Fails with `ConnectionLost` once the worker has been closed.
    pub async fn run<R, F>(&self, job: F) -> GattResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = result_tx.send(job());
        });

        {
            let jobs = self
                .jobs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let sender = jobs.as_ref().ok_or_else(|| GattError::connection_lost(None))?;
            sender
                .send(job)
                .map_err(|_| GattError::connection_lost(None))?;
        }

        result_rx
            .await
            .map_err(|_| GattError::connection_lost(None))
    }

    /// Stop accepting jobs; the thread exits after the queued ones ran
    pub fn close(&self) {
        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if sender.is_some() {
            debug!(worker = %self.name, "Worker closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl Drop for GattWorker {
    fn drop(&mut self) {
        self.close();
    }
}
