//! Device and context handles.
//!
//! A [`Context`] binds a backend to one [`Device`] and owns the base marker
//! every event timestamp is measured against. Contexts are shared through
//! `Arc`: each queue keeps one clone for its whole lifetime, and events keep
//! one so their timestamps stay readable after the queue is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use crate::backend::{BackendResult, Marker, MarkerFlags, StreamBackend};
use crate::error::{QueueError, Result};

/// A compute device as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    ordinal: usize,
    name: String,
}

impl Device {
    /// Create a device description.
    pub fn new(ordinal: usize, name: impl Into<String>) -> Self {
        Self {
            ordinal,
            name: name.into(),
        }
    }

    /// Device ordinal.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Execution context shared by queues and events.
pub struct Context<B: StreamBackend> {
    device: Arc<Device>,
    backend: Arc<B>,
    base: Marker<B>,
    base_time_ns: u64,
    lost: AtomicBool,
}

impl<B: StreamBackend> Context<B> {
    /// Create a context and record its base timestamp marker.
    pub fn new(device: Arc<Device>, backend: Arc<B>) -> Result<Arc<Self>> {
        let base = Marker::new(&backend, MarkerFlags::Timing)?;
        base.record(None)?;
        base.synchronize()?;

        let base_time_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        info!(
            device = device.ordinal(),
            name = device.name(),
            backend = backend.name(),
            "Created context"
        );

        Ok(Arc::new(Self {
            device,
            backend,
            base,
            base_time_ns,
            lost: AtomicBool::new(false),
        }))
    }

    /// The device this context is bound to.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The native backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Host wall-clock time (ns since the Unix epoch) of the base marker.
    #[must_use]
    pub fn base_time_ns(&self) -> u64 {
        self.base_time_ns
    }

    /// Whether the device behind this context has been lost.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Mark the context as lost. Every queue on it aborts.
    pub fn mark_lost(&self, reason: &str) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            error!(device = self.device.ordinal(), reason, "Context lost");
        }
    }

    /// Convert a backend result, marking the context lost on device loss.
    pub(crate) fn check<T>(&self, result: BackendResult<T>) -> Result<T> {
        result.map_err(|e| {
            if e.is_device_lost() {
                self.mark_lost(&e.to_string());
            }
            QueueError::Backend(e)
        })
    }

    /// Absolute timestamp (ns) of a completed timing marker.
    pub fn timestamp_ns(&self, marker: &Marker<B>) -> Result<u64> {
        let elapsed = self.check(marker.elapsed_since(&self.base))?;
        Ok(self
            .base_time_ns
            .saturating_add(elapsed.as_nanos() as u64))
    }
}

impl<B: StreamBackend> std::fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device)
            .field("backend", &self.backend.name())
            .field("lost", &self.is_lost())
            .finish()
    }
}
