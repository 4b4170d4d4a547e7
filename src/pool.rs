#![forbid(unsafe_code)]

//! Fixed-size download pool used for one channel run.
//!
//! Jobs go through a bounded queue sized to the worker count, so `submit`
//! blocks while every worker is busy and the queue is full. Each worker sends
//! exactly one report when it exits and `wait` counts them.

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::download::{Fetcher, Job};
use crate::error::{DownloadError, PoolError, VideoError};

type JobQueue = Arc<Mutex<Receiver<Job>>>;

pub struct DownloadPool {
    jobs: Option<SyncSender<Job>>,
    reports: Receiver<Vec<VideoError>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl DownloadPool {
    pub fn new(workers: usize, cancel: CancellationToken, fetcher: Arc<dyn Fetcher>) -> Self {
        let workers = workers.max(1);
        let (jobs, queue) = mpsc::sync_channel::<Job>(workers);
        let queue: JobQueue = Arc::new(Mutex::new(queue));
        let (report_tx, reports) = mpsc::channel();

        let handles = (0..workers)
            .map(|index| {
                let worker = Worker {
                    index,
                    queue: Arc::clone(&queue),
                    fetcher: Arc::clone(&fetcher),
                    cancel: cancel.clone(),
                };
                let report = Report {
                    errors: Vec::new(),
                    sink: report_tx.clone(),
                };
                thread::spawn(move || worker.run(report))
            })
            .collect();

        Self {
            jobs: Some(jobs),
            reports,
            workers: handles,
            cancel,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job, blocking while the queue is full.
    pub fn submit(&self, job: Job) -> Result<(), PoolError> {
        if self.cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let jobs = self.jobs.as_ref().ok_or(PoolError::Closed)?;
        jobs.send(job).map_err(|_| PoolError::Closed)
    }

    /// Signals that no more jobs will be submitted.
    ///
    /// # Panics
    ///
    /// Panics when the pool was already closed.
    pub fn close(&mut self) {
        match self.jobs.take() {
            Some(jobs) => drop(jobs),
            None => panic!("download pool closed twice"),
        }
    }

    /// Blocks until every worker has reported and returns the combined
    /// failures. The pool must have been closed first.
    pub fn wait(mut self) -> Vec<VideoError> {
        debug_assert!(self.jobs.is_none(), "wait called on an open pool");
        self.jobs.take();

        let mut failures = Vec::new();
        for _ in 0..self.workers.len() {
            match self.reports.recv() {
                Ok(errors) => failures.extend(errors),
                Err(_) => break,
            }
        }
        for handle in mem::take(&mut self.workers) {
            if handle.join().is_err() {
                warn!("download worker panicked");
            }
        }
        failures
    }
}

impl Drop for DownloadPool {
    fn drop(&mut self) {
        self.jobs.take();
    }
}

struct Worker {
    index: usize,
    queue: JobQueue,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
}

impl Worker {
    fn run(self, mut report: Report) {
        while let Some(job) = self.next_job() {
            if self.cancel.is_cancelled() {
                report.push(job, DownloadError::Cancelled);
                continue;
            }
            debug!(worker = self.index, video_id = %job.video_id, "downloading");
            let fetched = panic::catch_unwind(AssertUnwindSafe(|| self.fetcher.fetch(&job)))
                .unwrap_or_else(|payload| Err(DownloadError::Panicked(panic_message(&*payload))));
            if let Err(err) = fetched {
                warn!(worker = self.index, video_id = %job.video_id, "download failed: {err}");
                report.push(job, err);
            }
        }
        debug!(worker = self.index, failures = report.errors.len(), "worker done");
    }

    /// `None` once the queue is closed and drained.
    fn next_job(&self) -> Option<Job> {
        self.queue.lock().recv().ok()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

/// A worker's failures, delivered when it exits, even by panic.
struct Report {
    errors: Vec<VideoError>,
    sink: Sender<Vec<VideoError>>,
}

impl Report {
    fn push(&mut self, job: Job, source: DownloadError) {
        self.errors.push(VideoError {
            video_id: job.video_id,
            source,
        });
    }
}

impl Drop for Report {
    fn drop(&mut self) {
        let _ = self.sink.send(mem::take(&mut self.errors));
    }
}
