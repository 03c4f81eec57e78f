//! CPU backend implementation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error};

use ringstream_core::backend::{
    BackendError, BackendResult, MarkerFlags, MarkerStatus, PoolKind, StreamBackend, StreamFlags,
};
use ringstream_core::context::Device;

use crate::marker::HostMarker;
use crate::stream::{HostStream, Task};

/// Counters of a [`HostBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostMetrics {
    /// Streams created.
    pub streams_created: u64,
    /// Markers created.
    pub markers_created: u64,
    /// Host tasks launched.
    pub tasks_launched: u64,
}

/// CPU-based implementation of [`StreamBackend`].
///
/// Every native stream is a worker thread and every marker a host-side
/// completion record. It's used for testing and as a fallback when no GPU
/// is available.
#[derive(Debug, Default)]
pub struct HostBackend {
    next_id: AtomicU64,
    lost: AtomicBool,
    streams_created: AtomicU64,
    markers_created: AtomicU64,
    tasks_launched: AtomicU64,
}

impl HostBackend {
    /// Create a new CPU backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// The single device this backend exposes.
    #[must_use]
    pub fn device(&self) -> Device {
        Device::new(0, "host")
    }

    /// Run `task` on `stream` after all previously submitted work.
    pub fn launch<F>(&self, stream: &HostStream, task: F) -> BackendResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check()?;
        stream.submit(Task::Run(Box::new(task)))?;
        self.tasks_launched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Make every later call fail as if the device disappeared.
    pub fn simulate_device_loss(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            error!("Host device marked lost");
        }
    }

    /// Whether [`HostBackend::simulate_device_loss`] was called.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Snapshot of the backend counters.
    #[must_use]
    pub fn metrics(&self) -> HostMetrics {
        HostMetrics {
            streams_created: self.streams_created.load(Ordering::Relaxed),
            markers_created: self.markers_created.load(Ordering::Relaxed),
            tasks_launched: self.tasks_launched.load(Ordering::Relaxed),
        }
    }

    fn check(&self) -> BackendResult<()> {
        if self.is_lost() {
            return Err(BackendError::DeviceLost("host device lost".to_string()));
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl StreamBackend for HostBackend {
    type Stream = HostStream;
    type Marker = HostMarker;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn create_stream(&self, kind: PoolKind, _flags: StreamFlags) -> BackendResult<HostStream> {
        self.check()?;
        let stream = HostStream::spawn(self.next_id(), kind)?;
        self.streams_created.fetch_add(1, Ordering::Relaxed);
        debug!(stream = stream.id(), kind = %kind, "Spawned host stream");
        Ok(stream)
    }

    fn destroy_stream(&self, stream: HostStream) -> BackendResult<()> {
        debug!(stream = stream.id(), "Stopping host stream");
        drop(stream);
        Ok(())
    }

    fn synchronize_stream(&self, stream: &HostStream) -> BackendResult<()> {
        self.check()?;
        stream.synchronize()
    }

    fn query_stream(&self, stream: &HostStream) -> BackendResult<MarkerStatus> {
        self.check()?;
        Ok(if stream.is_idle() {
            MarkerStatus::Complete
        } else {
            MarkerStatus::Pending
        })
    }

    fn create_marker(&self, flags: MarkerFlags) -> BackendResult<HostMarker> {
        self.check()?;
        self.markers_created.fetch_add(1, Ordering::Relaxed);
        Ok(HostMarker::new(self.next_id(), flags == MarkerFlags::Timing))
    }

    fn destroy_marker(&self, _marker: HostMarker) -> BackendResult<()> {
        Ok(())
    }

    fn record_marker(&self, marker: &HostMarker, stream: Option<&HostStream>) -> BackendResult<()> {
        self.check()?;
        let cell = marker.cell();
        let generation = cell.begin_record();

        match stream {
            None => {
                cell.signal(generation);
                Ok(())
            }
            Some(stream) => {
                let submitted = stream.submit(Task::Signal {
                    cell: cell.clone(),
                    generation,
                });
                if submitted.is_err() {
                    // Nothing will ever signal this record.
                    cell.signal(generation);
                }
                submitted
            }
        }
    }

    fn wait_marker(&self, stream: &HostStream, marker: &HostMarker) -> BackendResult<()> {
        self.check()?;
        let cell = marker.cell();
        stream.submit(Task::Wait {
            cell: cell.clone(),
            generation: cell.generation(),
        })
    }

    fn query_marker(&self, marker: &HostMarker) -> BackendResult<MarkerStatus> {
        self.check()?;
        Ok(if marker.cell().is_complete() {
            MarkerStatus::Complete
        } else {
            MarkerStatus::Pending
        })
    }

    fn synchronize_marker(&self, marker: &HostMarker) -> BackendResult<()> {
        self.check()?;
        marker.cell().wait_current();
        Ok(())
    }

    fn elapsed_time(&self, start: &HostMarker, end: &HostMarker) -> BackendResult<Duration> {
        self.check()?;
        if !start.timing_enabled() || !end.timing_enabled() {
            return Err(BackendError::operation(
                "elapsed_time",
                "marker created without timing",
            ));
        }
        match (start.cell().stamp(), end.cell().stamp()) {
            (Some(s), Some(e)) => Ok(e.saturating_duration_since(s)),
            _ => Err(BackendError::operation(
                "elapsed_time",
                "marker has not completed",
            )),
        }
    }
}
