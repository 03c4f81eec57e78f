//! Host markers.
//!
//! Every record of a marker gets its own generation. Recording adds the
//! generation to a pending set and enqueues a signal for it on the target
//! stream; the signal removes it. A wait captures the generation current at
//! the time of the call, so re-recording the marker elsewhere never releases
//! a wait bound to an earlier record.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct MarkerRecord {
    generation: u64,
    pending: BTreeSet<u64>,
    stamp: Option<Instant>,
}

#[derive(Debug, Default)]
pub(crate) struct MarkerCell {
    record: Mutex<MarkerRecord>,
    cv: Condvar,
}

impl MarkerCell {
    /// Start a new record; returns its generation.
    pub(crate) fn begin_record(&self) -> u64 {
        let mut record = self.record.lock();
        record.generation += 1;
        let generation = record.generation;
        record.pending.insert(generation);
        record.stamp = None;
        generation
    }

    /// Mark `generation` complete.
    pub(crate) fn signal(&self, generation: u64) {
        let mut record = self.record.lock();
        record.pending.remove(&generation);
        if generation == record.generation {
            record.stamp = Some(Instant::now());
        }
        self.cv.notify_all();
    }

    /// Generation of the current record, 0 if never recorded.
    pub(crate) fn generation(&self) -> u64 {
        self.record.lock().generation
    }

    /// Whether the current record has completed.
    pub(crate) fn is_complete(&self) -> bool {
        let record = self.record.lock();
        !record.pending.contains(&record.generation)
    }

    /// Block until `generation` has completed.
    pub(crate) fn wait_for(&self, generation: u64) {
        let mut record = self.record.lock();
        while record.pending.contains(&generation) {
            self.cv.wait(&mut record);
        }
    }

    /// Block until the current record has completed.
    pub(crate) fn wait_current(&self) {
        let target = self.generation();
        self.wait_for(target);
    }

    /// Completion time of the current record.
    pub(crate) fn stamp(&self) -> Option<Instant> {
        let record = self.record.lock();
        if record.pending.contains(&record.generation) {
            None
        } else {
            record.stamp
        }
    }
}

/// Host marker handle.
#[derive(Debug, Clone)]
pub struct HostMarker {
    cell: Arc<MarkerCell>,
    timing: bool,
    id: u64,
}

impl HostMarker {
    pub(crate) fn new(id: u64, timing: bool) -> Self {
        Self {
            cell: Arc::new(MarkerCell::default()),
            timing,
            id,
        }
    }

    /// Backend-unique marker id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the marker was created with timing support.
    #[must_use]
    pub fn timing_enabled(&self) -> bool {
        self.timing
    }

    pub(crate) fn cell(&self) -> &Arc<MarkerCell> {
        &self.cell
    }
}
