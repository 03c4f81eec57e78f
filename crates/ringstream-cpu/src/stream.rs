//! Host streams.
//!
//! Each stream is a dedicated worker thread draining a FIFO of tasks, so
//! work on one stream runs in submission order while separate streams run
//! concurrently. Panicking tasks are caught and counted; the stream keeps
//! going and the next synchronize reports the fault.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use ringstream_core::backend::{BackendError, BackendResult, PoolKind};

use crate::marker::MarkerCell;

/// One unit of stream work.
pub(crate) enum Task {
    /// Run a host closure.
    Run(Box<dyn FnOnce() + Send + 'static>),
    /// Complete a marker record.
    Signal {
        cell: Arc<MarkerCell>,
        generation: u64,
    },
    /// Block the stream until a marker record completes.
    Wait {
        cell: Arc<MarkerCell>,
        generation: u64,
    },
}

#[derive(Default)]
struct Progress {
    submitted: AtomicU64,
    completed: Mutex<u64>,
    cv: Condvar,
    faults: AtomicU64,
}

/// Host stream handle.
pub struct HostStream {
    id: u64,
    kind: PoolKind,
    sender: Option<Sender<Task>>,
    worker: Option<JoinHandle<()>>,
    progress: Arc<Progress>,
}

impl HostStream {
    pub(crate) fn spawn(id: u64, kind: PoolKind) -> BackendResult<Self> {
        let (sender, receiver) = channel::unbounded();
        let progress = Arc::new(Progress::default());
        let worker_progress = Arc::clone(&progress);

        let worker = thread::Builder::new()
            .name(format!("ringstream-{kind}-{id}"))
            .spawn(move || run_worker(id, receiver, worker_progress))
            .map_err(|e| BackendError::CreationFailed {
                object: "stream",
                message: e.to_string(),
            })?;

        Ok(Self {
            id,
            kind,
            sender: Some(sender),
            worker: Some(worker),
            progress,
        })
    }

    /// Backend-unique stream id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pool the stream was created for.
    #[must_use]
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Number of tasks submitted so far.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.progress.submitted.load(Ordering::Acquire)
    }

    pub(crate) fn submit(&self, task: Task) -> BackendResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| BackendError::operation("submit", "stream is shut down"))?;

        self.progress.submitted.fetch_add(1, Ordering::AcqRel);
        sender.send(task).map_err(|_| {
            self.progress.submitted.fetch_sub(1, Ordering::AcqRel);
            BackendError::operation("submit", format!("worker of stream {} exited", self.id))
        })
    }

    /// Block until every task submitted so far has run.
    pub(crate) fn synchronize(&self) -> BackendResult<()> {
        let target = self.submitted();
        {
            let mut completed = self.progress.completed.lock();
            while *completed < target {
                self.progress.cv.wait(&mut completed);
            }
        }

        match self.progress.faults.swap(0, Ordering::AcqRel) {
            0 => Ok(()),
            n => Err(BackendError::operation(
                "synchronize",
                format!("{n} task(s) panicked on stream {}", self.id),
            )),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        *self.progress.completed.lock() >= self.submitted()
    }

    fn shutdown(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(stream = self.id, "Stream worker panicked during shutdown");
            }
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for HostStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("submitted", &self.submitted())
            .finish()
    }
}

fn run_worker(id: u64, receiver: Receiver<Task>, progress: Arc<Progress>) {
    for task in receiver.iter() {
        match task {
            Task::Run(work) => {
                if catch_unwind(AssertUnwindSafe(work)).is_err() {
                    progress.faults.fetch_add(1, Ordering::AcqRel);
                    warn!(stream = id, "Task panicked");
                }
            }
            Task::Signal { cell, generation } => cell.signal(generation),
            Task::Wait { cell, generation } => cell.wait_for(generation),
        }

        let mut completed = progress.completed.lock();
        *completed += 1;
        progress.cv.notify_all();
    }
    trace!(stream = id, "Stream worker exited");
}
