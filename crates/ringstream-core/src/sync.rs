//! Pool-wide joins and flushes.
//!
//! A flush visits every slot dispatched to since the watermark, i.e. the
//! modular range `[last_synced, cursor)`. The range is clamped to the whole
//! pool once it spans `size` or more dispatches, and split in two when it
//! wraps, so each slot is visited at most once per flush.

use std::iter::Chain;
use std::ops::Range;

use tracing::trace;

use crate::backend::{BackendResult, PoolKind, StreamBackend};
use crate::pool::{NativeStream, StreamPool};

/// Slot indices covering the cursor range `[start, end)` in a pool of `size`.
pub(crate) fn pending_slots(start: u32, end: u32, size: u32) -> Chain<Range<usize>, Range<usize>> {
    let span = end.wrapping_sub(start);
    let size_us = size as usize;

    if span >= size {
        return (0..size_us).chain(0..0);
    }
    if span == 0 {
        return (0..0).chain(0..0);
    }

    let s = (start % size) as usize;
    let e = (end % size) as usize;
    if s < e {
        (s..e).chain(0..0)
    } else {
        (s..size_us).chain(0..e)
    }
}

/// Visit every created stream dispatched to since the watermark.
///
/// Holds the pool's sync lock for the whole visit. Compute pools clear the
/// delay flag of every slot in range. With `reset` the watermark moves to the
/// cursor observed at the start, but only once every visit has succeeded; on
/// the first error the watermark stays put so a retry visits the same range.
pub(crate) fn sync_pool<B, F>(pool: &StreamPool<B>, reset: bool, mut visit: F) -> BackendResult<()>
where
    B: StreamBackend,
    F: FnMut(&NativeStream<B>) -> BackendResult<()>,
{
    let sync = pool.lock_sync();

    let (slots, end) = {
        let mut state = sync.state();
        let start = pool.last_synced();
        let end = pool.cursor();
        let slots = pending_slots(start, end, pool.size());

        if pool.kind() == PoolKind::Compute {
            for index in slots.clone() {
                state.delay[index] = false;
            }
        }

        trace!(pool = %pool.kind(), start, end, reset, "Syncing pool");
        (slots, end)
    };

    for index in slots {
        if let Some(stream) = pool.get(index) {
            visit(stream)?;
        }
    }

    if reset {
        pool.set_last_synced(&sync, end);
    }
    Ok(())
}
