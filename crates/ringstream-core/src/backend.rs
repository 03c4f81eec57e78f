//! Native stream and marker primitives.
//!
//! A backend supplies two opaque handle types: a *stream* (an ordered,
//! independently progressing sequence of asynchronous work) and a *marker*
//! (a lightweight object recorded into a stream to capture a point in time or
//! to be waited upon). The scheduler never interprets either handle; it only
//! drives them through [`StreamBackend`].
//!
//! Markers follow the usual GPU event semantics:
//!
//! - recording a marker again replaces its previous record;
//! - a wait inserted into a stream binds to the record that was current at the
//!   time of the wait call;
//! - querying a never-recorded marker reports [`MarkerStatus::Complete`].

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Pool a native stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolKind {
    /// Kernel launches and generic commands.
    Compute,
    /// Host/device data movement.
    Transfer,
}

impl PoolKind {
    /// Short lowercase name, used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::Compute => "compute",
            PoolKind::Transfer => "transfer",
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags passed to the backend when a stream is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamFlags {
    /// Stream synchronizes implicitly with the device's default stream.
    #[default]
    Default,
    /// Stream runs independently of the device's default stream.
    NonBlocking,
}

/// Flags passed to the backend when a marker is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerFlags {
    /// Marker carries a timestamp usable with [`StreamBackend::elapsed_time`].
    Timing,
    /// Pure synchronization marker; cheaper to record and wait on.
    DisableTiming,
}

/// Completion state of a marker or stream as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    /// Work captured by the marker is still in flight.
    Pending,
    /// Work captured by the marker has finished.
    Complete,
}

impl MarkerStatus {
    /// Returns true for [`MarkerStatus::Complete`].
    #[must_use]
    pub fn is_complete(self) -> bool {
        matches!(self, MarkerStatus::Complete)
    }
}

/// Failure reported by a native backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// A native object could not be created.
    #[error("Failed to create {object}: {message}")]
    CreationFailed {
        /// Object kind ("stream", "marker").
        object: &'static str,
        /// Backend-provided detail.
        message: String,
    },

    /// A native operation failed.
    #[error("{op} failed: {message}")]
    OperationFailed {
        /// Operation name.
        op: &'static str,
        /// Backend-provided detail.
        message: String,
    },

    /// The device or its context disappeared. Not recoverable.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// The backend is not compiled in or not present on this machine.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Shorthand for [`BackendError::OperationFailed`].
    pub fn operation(op: &'static str, message: impl Into<String>) -> Self {
        BackendError::OperationFailed {
            op,
            message: message.into(),
        }
    }

    /// Returns true if this error means the device is gone.
    #[must_use]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, BackendError::DeviceLost(_))
    }
}

/// Result type for native backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Native stream/marker primitives a scheduler backend must provide.
///
/// Implementations must be callable from any thread. Handles are owned by
/// the scheduler and handed back to the backend exactly once for
/// destruction.
pub trait StreamBackend: Send + Sync + 'static {
    /// Native stream handle.
    type Stream: Send + Sync + 'static;
    /// Native marker handle.
    type Marker: Send + Sync + 'static;

    /// Human readable backend name.
    fn name(&self) -> &'static str;

    /// Create a new native stream.
    fn create_stream(&self, kind: PoolKind, flags: StreamFlags) -> BackendResult<Self::Stream>;

    /// Destroy a native stream. Outstanding work must already be drained.
    fn destroy_stream(&self, stream: Self::Stream) -> BackendResult<()>;

    /// Block until all work submitted to `stream` has finished.
    fn synchronize_stream(&self, stream: &Self::Stream) -> BackendResult<()>;

    /// Non-blocking check whether `stream` has pending work.
    fn query_stream(&self, stream: &Self::Stream) -> BackendResult<MarkerStatus>;

    /// Push any host-side batched work on `stream` to the device.
    ///
    /// Backends that submit eagerly keep the default no-op.
    fn flush_stream(&self, _stream: &Self::Stream) -> BackendResult<()> {
        Ok(())
    }

    /// Create a new marker.
    fn create_marker(&self, flags: MarkerFlags) -> BackendResult<Self::Marker>;

    /// Destroy a marker.
    fn destroy_marker(&self, marker: Self::Marker) -> BackendResult<()>;

    /// Record `marker` at the current submission point of `stream`.
    ///
    /// `None` records on the device's default stream.
    fn record_marker(
        &self,
        marker: &Self::Marker,
        stream: Option<&Self::Stream>,
    ) -> BackendResult<()>;

    /// Make all future work on `stream` wait for the current record of `marker`.
    fn wait_marker(&self, stream: &Self::Stream, marker: &Self::Marker) -> BackendResult<()>;

    /// Non-blocking completion check of the current record of `marker`.
    fn query_marker(&self, marker: &Self::Marker) -> BackendResult<MarkerStatus>;

    /// Block until the current record of `marker` completes.
    fn synchronize_marker(&self, marker: &Self::Marker) -> BackendResult<()>;

    /// Time between two completed timing markers.
    fn elapsed_time(&self, start: &Self::Marker, end: &Self::Marker) -> BackendResult<Duration>;
}

/// An owned native marker, destroyed deterministically when dropped.
pub struct Marker<B: StreamBackend> {
    raw: ManuallyDrop<B::Marker>,
    backend: Arc<B>,
    timing: bool,
}

impl<B: StreamBackend> Marker<B> {
    /// Create a new marker on `backend`.
    pub fn new(backend: &Arc<B>, flags: MarkerFlags) -> BackendResult<Self> {
        let raw = backend.create_marker(flags)?;
        Ok(Self {
            raw: ManuallyDrop::new(raw),
            backend: Arc::clone(backend),
            timing: flags == MarkerFlags::Timing,
        })
    }

    /// Record this marker on `stream` (or the default stream for `None`).
    pub fn record(&self, stream: Option<&B::Stream>) -> BackendResult<()> {
        self.backend.record_marker(&self.raw, stream)
    }

    /// Non-blocking completion check.
    pub fn query(&self) -> BackendResult<MarkerStatus> {
        self.backend.query_marker(&self.raw)
    }

    /// Block until the marker's current record completes.
    pub fn synchronize(&self) -> BackendResult<()> {
        self.backend.synchronize_marker(&self.raw)
    }

    /// Time elapsed between `start` and this marker.
    pub fn elapsed_since(&self, start: &Marker<B>) -> BackendResult<Duration> {
        self.backend.elapsed_time(&start.raw, &self.raw)
    }

    /// Whether this marker was created with timing support.
    #[must_use]
    pub fn timing_enabled(&self) -> bool {
        self.timing
    }

    /// The raw native handle.
    pub fn raw(&self) -> &B::Marker {
        &self.raw
    }
}

impl<B: StreamBackend> Drop for Marker<B> {
    fn drop(&mut self) {
        // SAFETY: `raw` is never touched again after this point.
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        if let Err(e) = self.backend.destroy_marker(raw) {
            warn!(backend = self.backend.name(), error = %e, "Failed to destroy marker");
        }
    }
}

impl<B: StreamBackend> std::fmt::Debug for Marker<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marker")
            .field("backend", &self.backend.name())
            .field("timing", &self.timing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, RecordingBackend};

    #[test]
    fn test_marker_destroyed_on_drop() {
        let backend = Arc::new(RecordingBackend::new());
        let marker = Marker::new(&backend, MarkerFlags::DisableTiming).unwrap();
        let id = marker.raw().id();
        assert!(!marker.timing_enabled());

        drop(marker);

        assert!(backend.calls().contains(&Call::DestroyMarker(id)));
    }

    #[test]
    fn test_marker_status() {
        assert!(MarkerStatus::Complete.is_complete());
        assert!(!MarkerStatus::Pending.is_complete());
    }

    #[test]
    fn test_backend_error_classification() {
        assert!(BackendError::DeviceLost("gone".into()).is_device_lost());
        assert!(!BackendError::operation("record", "bad handle").is_device_lost());
        assert_eq!(
            BackendError::operation("record", "bad handle").to_string(),
            "record failed: bad handle"
        );
    }

    #[test]
    fn test_pool_kind_display() {
        assert_eq!(PoolKind::Compute.to_string(), "compute");
        assert_eq!(PoolKind::Transfer.to_string(), "transfer");
    }
}
