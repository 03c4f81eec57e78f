//! Lazily applied queue barriers.
//!
//! A barrier records one marker on a reference stream after joining every
//! other active stream into it. Other streams do not wait eagerly: each one
//! inserts a single wait on the marker the next time it is dispatched to,
//! tracked by its `barrier_applied` flag.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::backend::{BackendResult, Marker, MarkerFlags, StreamBackend};
use crate::pool::{NativeStream, StateGuard, StreamPool};

struct BarrierMarkers<B: StreamBackend> {
    marker: OnceCell<Marker<B>>,
    join: OnceCell<Marker<B>>,
    armed: bool,
}

/// Owner of a queue's barrier markers.
pub(crate) struct BarrierController<B: StreamBackend> {
    inner: Mutex<BarrierMarkers<B>>,
}

impl<B: StreamBackend> BarrierController<B> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(BarrierMarkers {
                marker: OnceCell::new(),
                join: OnceCell::new(),
                armed: false,
            }),
        }
    }

    /// Take the barrier lock. Always acquired before any pool lock.
    pub(crate) fn lock(&self) -> BarrierGuard<'_, B> {
        BarrierGuard {
            inner: self.inner.lock(),
        }
    }
}

/// Exclusive access to the barrier markers.
pub(crate) struct BarrierGuard<'a, B: StreamBackend> {
    inner: MutexGuard<'a, BarrierMarkers<B>>,
}

impl<B: StreamBackend> BarrierGuard<'_, B> {
    /// Whether a barrier marker has been recorded.
    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.inner.armed
    }

    /// Make `stream` observe the current barrier if it has not yet.
    pub(crate) fn apply(
        &self,
        pool: &StreamPool<B>,
        state: &mut StateGuard<'_>,
        stream: &NativeStream<B>,
    ) -> BackendResult<()> {
        let index = stream.id().index;
        if state.barrier_applied[index] || !self.inner.armed {
            return Ok(());
        }
        if let Some(marker) = self.inner.marker.get() {
            stream.wait(marker)?;
            state.barrier_applied[index] = true;
            pool.note_barrier_wait();
            trace!(stream = %stream.id(), "Applied barrier");
        }
        Ok(())
    }

    /// Start a new barrier: no stream has observed it yet.
    pub(crate) fn reset_flags(&self, pools: [&StreamPool<B>; 2]) {
        for pool in pools {
            pool.lock_state().barrier_applied.fill(false);
        }
    }

    /// Create both markers on first use.
    pub(crate) fn ensure_markers(&mut self, backend: &Arc<B>) -> BackendResult<()> {
        self.inner
            .marker
            .get_or_try_init(|| Marker::new(backend, MarkerFlags::DisableTiming))?;
        self.inner
            .join
            .get_or_try_init(|| Marker::new(backend, MarkerFlags::DisableTiming))?;
        Ok(())
    }

    /// Make `reference` wait for all work currently on `stream`.
    ///
    /// The join marker is re-recorded per stream; each wait binds to the
    /// record current at the time of the call.
    pub(crate) fn join_into(
        &self,
        reference: &NativeStream<B>,
        stream: &NativeStream<B>,
    ) -> BackendResult<()> {
        if stream.id() == reference.id() {
            return Ok(());
        }
        let Some(join) = self.inner.join.get() else {
            return Ok(());
        };
        stream.record(join)?;
        reference.wait(join)
    }

    /// Record the barrier marker on `reference` and arm it.
    pub(crate) fn arm(
        &mut self,
        state: &mut StateGuard<'_>,
        reference: &NativeStream<B>,
    ) -> BackendResult<()> {
        if let Some(marker) = self.inner.marker.get() {
            reference.record(marker)?;
            self.inner.armed = true;
            state.barrier_applied[reference.id().index] = true;
            trace!(reference = %reference.id(), "Armed barrier");
        }
        Ok(())
    }
}
