//! Off-executor chunk materialization.
//!
//! A `ChunkWorker` owns one dedicated OS thread that reads chunk ranges on
//! request, so disk reads never stall the task driving the data channel.
//! The interface is the same whether the thread is alive or not: if the
//! thread could not be started, is gone, or misses the per-chunk deadline,
//! the chunk is materialized inline on the caller instead.
//!
//! After [`ChunkWorker::abandon`] (or drop) the thread exits at its next
//! job and any result still in flight is discarded.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::chunk::{ChunkRange, ChunkReader, FileSource};
use crate::core::error::TransferError;

struct Job {
    range: ChunkRange,
    reply: oneshot::Sender<std::io::Result<Bytes>>,
}

pub struct ChunkWorker {
    jobs: Option<std_mpsc::Sender<Job>>,
    abandoned: Arc<AtomicBool>,
    inline: Mutex<ChunkReader>,
    timeout: Duration,
}

impl ChunkWorker {
    /// Start a worker thread reading from `source`.
    ///
    /// Failing to start the thread is not fatal; the worker then runs
    /// every request inline.
    pub fn spawn(source: &FileSource, timeout: Duration) -> Self {
        Self::spawn_inner(source, timeout, Duration::ZERO)
    }

    /// A worker with no background thread.
    #[cfg(test)]
    pub fn inline(source: &FileSource) -> Self {
        Self {
            jobs: None,
            abandoned: Arc::new(AtomicBool::new(false)),
            inline: Mutex::new(source.reader()),
            timeout: Duration::ZERO,
        }
    }

    fn spawn_inner(source: &FileSource, timeout: Duration, job_delay: Duration) -> Self {
        let abandoned = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std_mpsc::channel::<Job>();

        let thread_abandoned = abandoned.clone();
        let mut reader = source.reader();
        let started = std::thread::Builder::new()
            .name("peerdrop-chunk-worker".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if thread_abandoned.load(Ordering::Acquire) {
                        break;
                    }
                    if !job_delay.is_zero() {
                        std::thread::sleep(job_delay);
                    }
                    let result = reader.encode_chunk(&job.range);
                    // Receiver gone means the caller timed out or abandoned us.
                    let _ = job.reply.send(result);
                }
                debug!(event = "chunk_worker_exit", "Chunk worker thread exiting");
            });

        let jobs = match started {
            Ok(_) => Some(tx),
            Err(e) => {
                warn!(
                    event = "chunk_worker_unavailable",
                    error = %e,
                    "Could not start chunk worker, materializing inline"
                );
                None
            }
        };

        Self {
            jobs,
            abandoned,
            inline: Mutex::new(source.reader()),
            timeout,
        }
    }

    /// Bytes for `range`, from the worker if it answers in time, otherwise inline.
    pub async fn materialize(&self, range: ChunkRange) -> Result<Bytes, TransferError> {
        if self.is_abandoned() {
            return Err(TransferError::Cancelled { reason: None });
        }

        if let Some(jobs) = &self.jobs {
            let (reply, rx) = oneshot::channel();
            if jobs.send(Job { range, reply }).is_ok() {
                match tokio::time::timeout(self.timeout, rx).await {
                    Ok(Ok(result)) => return result.map_err(TransferError::from),
                    Ok(Err(_)) => {
                        warn!(event = "chunk_worker_dropped", index = range.index, "Worker dropped request, falling back inline");
                    }
                    Err(_) => {
                        warn!(
                            event = "chunk_worker_timeout",
                            index = range.index,
                            timeout_ms = self.timeout.as_millis() as u64,
                            "Worker missed deadline, falling back inline"
                        );
                    }
                }
            }
        }

        self.materialize_inline(&range)
    }

    fn materialize_inline(&self, range: &ChunkRange) -> Result<Bytes, TransferError> {
        let mut reader = self
            .inline
            .lock()
            .map_err(|_| TransferError::Io("inline reader poisoned".into()))?;
        Ok(reader.encode_chunk(range)?)
    }

    /// Stop the worker thread and refuse further requests.
    pub fn abandon(&mut self) {
        self.abandoned.store(true, Ordering::Release);
        // Dropping the sender wakes the thread out of `recv`.
        self.jobs = None;
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

impl Drop for ChunkWorker {
    fn drop(&mut self) {
        self.abandon();
    }
}
