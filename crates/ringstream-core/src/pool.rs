//! Fixed-capacity stream pools with round-robin dispatch.
//!
//! A pool owns `size` stream slots. Native streams are created lazily the
//! first time a slot is handed out, so a queue that only ever runs a handful
//! of commands never pays for the full pool.
//!
//! Dispatch `k` goes to slot `k mod size`. The cursor is a single atomic
//! counter, so picking a slot needs no lock; only the per-slot flags live
//! behind the pool's *state* lock.
//!
//! # Lock order
//!
//! Each pool has a coarse *sync* lock and a finer *state* lock. When both are
//! held, sync is taken first: the only way to get a [`StateGuard`] while
//! holding sync is [`SyncGuard::state`], which borrows the sync guard and so
//! cannot outlive it. Never call [`StreamPool::lock_sync`] while a
//! [`StateGuard`] obtained from [`StreamPool::lock_state`] is alive.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::backend::{
    BackendResult, Marker, MarkerStatus, PoolKind, StreamBackend, StreamFlags,
};

/// Cursor value captured when a compute stream was handed out for a command.
///
/// Tokens are totally ordered and compared against the pool cursor and its
/// synchronization watermark to decide whether a stream can be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamToken(u32);

impl StreamToken {
    #[cfg(test)]
    pub(crate) const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw cursor value.
    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }
}

/// A stream slot in one of a queue's pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    /// Owning pool.
    pub kind: PoolKind,
    /// Slot index within the pool.
    pub index: usize,
}

impl StreamId {
    /// Compute stream at `index`.
    #[must_use]
    pub fn compute(index: usize) -> Self {
        Self {
            kind: PoolKind::Compute,
            index,
        }
    }

    /// Transfer stream at `index`.
    #[must_use]
    pub fn transfer(index: usize) -> Self {
        Self {
            kind: PoolKind::Transfer,
            index,
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind, self.index)
    }
}

/// An owned native stream, destroyed when dropped.
pub(crate) struct NativeStream<B: StreamBackend> {
    raw: ManuallyDrop<B::Stream>,
    backend: Arc<B>,
    id: StreamId,
}

impl<B: StreamBackend> NativeStream<B> {
    fn create(backend: &Arc<B>, id: StreamId, flags: StreamFlags) -> BackendResult<Self> {
        let raw = backend.create_stream(id.kind, flags)?;
        Ok(Self {
            raw: ManuallyDrop::new(raw),
            backend: Arc::clone(backend),
            id,
        })
    }

    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn raw(&self) -> &B::Stream {
        &self.raw
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    pub(crate) fn synchronize(&self) -> BackendResult<()> {
        self.backend.synchronize_stream(&self.raw)
    }

    pub(crate) fn flush(&self) -> BackendResult<()> {
        self.backend.flush_stream(&self.raw)
    }

    pub(crate) fn query(&self) -> BackendResult<MarkerStatus> {
        self.backend.query_stream(&self.raw)
    }

    pub(crate) fn record(&self, marker: &Marker<B>) -> BackendResult<()> {
        marker.record(Some(&self.raw))
    }

    pub(crate) fn wait(&self, marker: &Marker<B>) -> BackendResult<()> {
        self.backend.wait_marker(&self.raw, marker.raw())
    }
}

impl<B: StreamBackend> Drop for NativeStream<B> {
    fn drop(&mut self) {
        // SAFETY: `raw` is never touched again after this point.
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        match self.backend.destroy_stream(raw) {
            Ok(()) => debug!(stream = %self.id, "Destroyed native stream"),
            Err(e) => warn!(stream = %self.id, error = %e, "Failed to destroy native stream"),
        }
    }
}

/// Per-slot flags guarded by the pool's state lock.
#[derive(Debug)]
pub(crate) struct PoolState {
    /// Slot has waited on the current barrier marker.
    pub(crate) barrier_applied: Vec<bool>,
    /// Slot was recently reused; skip it once in round robin.
    pub(crate) delay: Vec<bool>,
}

/// Guard over a pool's per-slot flags.
pub(crate) struct StateGuard<'a> {
    inner: MutexGuard<'a, PoolState>,
}

impl Deref for StateGuard<'_> {
    type Target = PoolState;

    fn deref(&self) -> &PoolState {
        &self.inner
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut PoolState {
        &mut self.inner
    }
}

/// Guard over a pool's sync lock.
///
/// Held by flushes for their whole duration and by the dispatcher's reuse
/// path until the reusing command has been submitted.
pub(crate) struct SyncGuard<'a> {
    _sync: MutexGuard<'a, ()>,
    state: &'a Mutex<PoolState>,
}

impl SyncGuard<'_> {
    /// Take the state lock while holding sync.
    pub(crate) fn state(&self) -> StateGuard<'_> {
        StateGuard {
            inner: self.state.lock(),
        }
    }
}

struct PoolCounters {
    dispatches: Vec<AtomicU64>,
    reuses: AtomicU64,
    delayed_skips: AtomicU64,
    barrier_waits: AtomicU64,
    flushes: AtomicU64,
}

/// Fixed-capacity pool of lazily created native streams.
pub(crate) struct StreamPool<B: StreamBackend> {
    kind: PoolKind,
    size: u32,
    backend: Arc<B>,
    flags: StreamFlags,
    streams: Box<[OnceCell<NativeStream<B>>]>,
    cursor: AtomicU32,
    last_synced: AtomicU32,
    active: AtomicUsize,
    sync: Mutex<()>,
    state: Mutex<PoolState>,
    counters: PoolCounters,
    created_at: Instant,
}

impl<B: StreamBackend> StreamPool<B> {
    /// Create an empty pool of `size` slots. `size` must fit in 32 bits.
    pub(crate) fn new(kind: PoolKind, size: usize, backend: Arc<B>, flags: StreamFlags) -> Self {
        let streams = (0..size).map(|_| OnceCell::new()).collect();
        let dispatches = (0..size).map(|_| AtomicU64::new(0)).collect();

        Self {
            kind,
            size: size as u32,
            backend,
            flags,
            streams,
            cursor: AtomicU32::new(0),
            last_synced: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            sync: Mutex::new(()),
            state: Mutex::new(PoolState {
                barrier_applied: vec![false; size],
                delay: vec![false; size],
            }),
            counters: PoolCounters {
                dispatches,
                reuses: AtomicU64::new(0),
                delayed_skips: AtomicU64::new(0),
                barrier_waits: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
            },
            created_at: Instant::now(),
        }
    }

    pub(crate) fn kind(&self) -> PoolKind {
        self.kind
    }

    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn cursor(&self) -> u32 {
        self.cursor.load(Ordering::Acquire)
    }

    pub(crate) fn last_synced(&self) -> u32 {
        self.last_synced.load(Ordering::Acquire)
    }

    /// Move the watermark. Callers hold the sync lock.
    pub(crate) fn set_last_synced(&self, _sync: &SyncGuard<'_>, value: u32) {
        self.last_synced.store(value, Ordering::Release);
    }

    /// Number of slots whose native stream exists.
    pub(crate) fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Whether any dispatch happened since the watermark.
    pub(crate) fn has_pending_work(&self) -> bool {
        self.cursor() != self.last_synced()
    }

    pub(crate) fn lock_state(&self) -> StateGuard<'_> {
        StateGuard {
            inner: self.state.lock(),
        }
    }

    pub(crate) fn lock_sync(&self) -> SyncGuard<'_> {
        SyncGuard {
            _sync: self.sync.lock(),
            state: &self.state,
        }
    }

    pub(crate) fn try_lock_sync(&self) -> Option<SyncGuard<'_>> {
        self.sync.try_lock().map(|guard| SyncGuard {
            _sync: guard,
            state: &self.state,
        })
    }

    /// Hand out the next slot in round-robin order.
    ///
    /// Slots flagged as recently reused are skipped once (and their flag
    /// cleared); the skipped cursor value is consumed.
    pub(crate) fn acquire(&self) -> (StreamToken, usize) {
        loop {
            let token = self.cursor.fetch_add(1, Ordering::AcqRel);
            let index = (token % self.size) as usize;

            let mut state = self.lock_state();
            if state.delay[index] {
                state.delay[index] = false;
                self.counters.delayed_skips.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            drop(state);

            self.counters.dispatches[index].fetch_add(1, Ordering::Relaxed);
            return (StreamToken(token), index);
        }
    }

    /// The native stream for `index`, created on first use.
    pub(crate) fn stream(&self, index: usize) -> BackendResult<&NativeStream<B>> {
        self.streams[index].get_or_try_init(|| {
            let id = StreamId {
                kind: self.kind,
                index,
            };
            let stream = NativeStream::create(&self.backend, id, self.flags)?;
            self.active.fetch_add(1, Ordering::AcqRel);
            debug!(stream = %id, "Created native stream");
            Ok(stream)
        })
    }

    /// The native stream for `index` if it has been created.
    pub(crate) fn get(&self, index: usize) -> Option<&NativeStream<B>> {
        self.streams.get(index).and_then(OnceCell::get)
    }

    /// Whether the stream behind `token` may be reused by a dependent command.
    ///
    /// The command that took `token` must still be the most recent one on its
    /// slot, and no flush may have moved the watermark past it.
    pub(crate) fn can_reuse(&self, token: StreamToken) -> bool {
        let is_last_command = self.cursor().wrapping_sub(token.0) <= self.size;
        is_last_command && !self.has_been_synchronized(token)
    }

    /// Whether a flush has already drained the work behind `token`.
    pub(crate) fn has_been_synchronized(&self, token: StreamToken) -> bool {
        token.0 < self.last_synced()
    }

    /// Slot index `token` was dispatched to.
    pub(crate) fn slot_of(&self, token: StreamToken) -> usize {
        (token.0 % self.size) as usize
    }

    pub(crate) fn note_reuse(&self) {
        self.counters.reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_barrier_wait(&self) {
        self.counters.barrier_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_flush(&self) {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of utilization counters.
    pub(crate) fn stats(&self) -> StreamPoolStats {
        let per_stream: Vec<u64> = self
            .counters
            .dispatches
            .iter()
            .map(|d| d.load(Ordering::Relaxed))
            .collect();
        let total: u64 = per_stream.iter().sum();
        let elapsed_secs = self.created_at.elapsed().as_secs_f64();

        StreamPoolStats {
            kind: self.kind,
            capacity: self.size as usize,
            active_streams: self.active_streams(),
            cursor: self.cursor(),
            last_synced: self.last_synced(),
            total_dispatches: total,
            per_stream_dispatches: per_stream,
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            delayed_skips: self.counters.delayed_skips.load(Ordering::Relaxed),
            barrier_waits: self.counters.barrier_waits.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            dispatches_per_second: if elapsed_secs > 0.0 {
                total as f64 / elapsed_secs
            } else {
                0.0
            },
        }
    }
}

/// Utilization snapshot of one stream pool.
#[derive(Debug, Clone)]
pub struct StreamPoolStats {
    /// Which pool.
    pub kind: PoolKind,
    /// Number of slots.
    pub capacity: usize,
    /// Slots whose native stream exists.
    pub active_streams: usize,
    /// Current dispatch cursor.
    pub cursor: u32,
    /// Synchronization watermark.
    pub last_synced: u32,
    /// Round-robin dispatches across all slots.
    pub total_dispatches: u64,
    /// Round-robin dispatches per slot.
    pub per_stream_dispatches: Vec<u64>,
    /// Commands placed on a dependency's stream instead of round robin.
    pub reuses: u64,
    /// Round-robin selections skipped because the slot was recently reused.
    pub delayed_skips: u64,
    /// Waits inserted on the barrier marker.
    pub barrier_waits: u64,
    /// Flushes performed on this pool.
    pub flushes: u64,
    /// Average dispatches per second since creation.
    pub dispatches_per_second: f64,
}

impl StreamPoolStats {
    /// Returns the most utilized slot index.
    #[must_use]
    pub fn most_utilized_stream(&self) -> Option<usize> {
        self.per_stream_dispatches
            .iter()
            .enumerate()
            .max_by_key(|(_, &count)| count)
            .map(|(idx, _)| idx)
    }

    /// Returns the least utilized slot index.
    #[must_use]
    pub fn least_utilized_stream(&self) -> Option<usize> {
        self.per_stream_dispatches
            .iter()
            .enumerate()
            .min_by_key(|(_, &count)| count)
            .map(|(idx, _)| idx)
    }

    /// Returns the utilization balance ratio (0.0 = all on one slot, 1.0 = perfectly balanced).
    #[must_use]
    pub fn balance_ratio(&self) -> f64 {
        if self.per_stream_dispatches.is_empty() || self.total_dispatches == 0 {
            return 1.0;
        }

        let n = self.per_stream_dispatches.len() as f64;
        let expected = self.total_dispatches as f64 / n;
        let variance: f64 = self
            .per_stream_dispatches
            .iter()
            .map(|&count| (count as f64 - expected).powi(2))
            .sum::<f64>()
            / n;

        let max_variance = expected.powi(2) * (n - 1.0);
        if max_variance == 0.0 {
            return 1.0;
        }

        1.0 - (variance / max_variance).sqrt()
    }
}

impl std::fmt::Display for StreamPoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pool: {}/{} streams, {} dispatches ({:.1}/s), {} reuses, {} barrier waits, {:.1}% balanced",
            self.kind,
            self.active_streams,
            self.capacity,
            self.total_dispatches,
            self.dispatches_per_second,
            self.reuses,
            self.barrier_waits,
            self.balance_ratio() * 100.0
        )
    }
}
