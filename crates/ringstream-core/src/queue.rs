//! Execution queues.
//!
//! A [`Queue`] maps a logical command queue onto two fixed pools of native
//! streams: one for compute commands and one for data transfers. Every
//! enqueue picks a stream (reusing a dependency's stream when possible),
//! makes it observe any pending barrier, inserts waits for dependencies on
//! other streams, submits the caller's native work and returns an [`Event`].
//!
//! Queues are cheap `Clone` handles over shared state and can be used from
//! many threads at once. Dropping the last handle drains both pools before
//! the native streams are destroyed.
//!
//! Lock order within a queue is barrier, then pool sync, then pool state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::backend::{BackendResult, PoolKind, StreamBackend};
use crate::barrier::BarrierController;
use crate::command::CommandKind;
use crate::config::QueueConfig;
use crate::context::Context;
use crate::dispatch::{self, Dispatch};
use crate::error::{QueueError, Result};
use crate::event::{Event, Origin};
use crate::pool::{NativeStream, StreamId, StreamPool, StreamPoolStats};
use crate::sync;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique queue identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(u64);

impl QueueId {
    pub(crate) fn next() -> Self {
        Self(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue-{}", self.0)
    }
}

/// Utilization snapshot of both pools of a queue.
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Compute pool.
    pub compute: StreamPoolStats,
    /// Transfer pool.
    pub transfer: StreamPoolStats,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.compute)?;
        write!(f, "{}", self.transfer)
    }
}

/// A borrowed native stream handed to enqueue work closures.
pub struct StreamRef<'a, B: StreamBackend> {
    stream: &'a NativeStream<B>,
}

impl<'a, B: StreamBackend> StreamRef<'a, B> {
    /// Slot the stream occupies.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.stream.id()
    }

    /// Native stream handle to submit work on.
    #[must_use]
    pub fn raw(&self) -> &'a B::Stream {
        self.stream.raw()
    }

    /// The backend owning the stream.
    #[must_use]
    pub fn backend(&self) -> &'a B {
        self.stream.backend()
    }
}

pub(crate) struct QueueShared<B: StreamBackend> {
    id: QueueId,
    config: QueueConfig,
    barrier: BarrierController<B>,
    compute: StreamPool<B>,
    transfer: StreamPool<B>,
    next_event_id: AtomicU64,
    aborted: AtomicBool,
    context: Arc<Context<B>>,
}

impl<B: StreamBackend> QueueShared<B> {
    fn pool(&self, kind: PoolKind) -> &StreamPool<B> {
        match kind {
            PoolKind::Compute => &self.compute,
            PoolKind::Transfer => &self.transfer,
        }
    }

    /// Pool a command runs on. Transfers fall back to compute without a transfer pool.
    fn pool_for(&self, kind: CommandKind) -> &StreamPool<B> {
        match kind.preferred_pool() {
            PoolKind::Transfer if self.transfer.size() > 0 => &self.transfer,
            _ => &self.compute,
        }
    }

    pub(crate) fn stream(&self, id: StreamId) -> Result<&NativeStream<B>> {
        self.pool(id.kind)
            .get(id.index)
            .ok_or_else(|| QueueError::invalid_state("created stream", format!("no stream {id}")))
    }

    fn check<T>(&self, result: BackendResult<T>) -> Result<T> {
        self.context.check(result)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(QueueError::QueueAborted);
        }
        if self.context.is_lost() {
            self.aborted.store(true, Ordering::Release);
            warn!(queue = %self.id, "Context lost, aborting queue");
            return Err(QueueError::ContextLost);
        }
        Ok(())
    }

    fn validate_wait_list(&self, deps: &[&Event<B>]) -> Result<()> {
        for dep in deps {
            dep.check_waitable()?;
            if let Some(ctx) = dep.context() {
                if !Arc::ptr_eq(ctx, &self.context) {
                    return Err(QueueError::InvalidEventWaitList(format!(
                        "event {} belongs to another context",
                        dep.id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Make `stream` wait for the latest dependency on every other stream.
    fn wait_on_dependencies(&self, stream: &NativeStream<B>, deps: &[&Event<B>]) -> Result<()> {
        let mut latest: BTreeMap<_, &Event<B>> = BTreeMap::new();
        for &dep in deps {
            let Some(origin) = dep.origin() else {
                continue;
            };
            if origin.queue_id == self.id && origin.stream == stream.id() {
                continue;
            }
            latest
                .entry((origin.queue_id, origin.stream))
                .and_modify(|current: &mut &Event<B>| {
                    if dep.id() > current.id() {
                        *current = dep;
                    }
                })
                .or_insert(dep);
        }

        for dep in latest.values() {
            dep.wait_on_stream(stream)?;
        }
        Ok(())
    }
}

impl<B: StreamBackend> Drop for QueueShared<B> {
    fn drop(&mut self) {
        for pool in [&self.compute, &self.transfer] {
            let drained = sync::sync_pool(pool, true, |stream| {
                if let Err(e) = stream.synchronize() {
                    warn!(queue = %self.id, stream = %stream.id(), error = %e, "Failed to drain stream");
                }
                Ok(())
            });
            pool.note_flush();
            if let Err(e) = drained {
                warn!(queue = %self.id, pool = %pool.kind(), error = %e, "Failed to drain pool");
            }
        }
        debug!(queue = %self.id, "Destroying queue");
    }
}

/// Handle to an execution queue.
pub struct Queue<B: StreamBackend> {
    shared: Arc<QueueShared<B>>,
}

impl<B: StreamBackend> Clone for Queue<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: StreamBackend> Queue<B> {
    /// Create a queue on `context`. Native streams are created on first use.
    pub fn new(context: Arc<Context<B>>, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        if context.is_lost() {
            return Err(QueueError::ContextLost);
        }

        let backend = context.backend();
        let compute = StreamPool::new(
            PoolKind::Compute,
            config.num_compute_streams,
            Arc::clone(backend),
            config.stream_flags,
        );
        let transfer = StreamPool::new(
            PoolKind::Transfer,
            config.num_transfer_streams,
            Arc::clone(backend),
            config.stream_flags,
        );

        let id = QueueId::next();
        info!(
            queue = %id,
            backend = backend.name(),
            compute_streams = config.num_compute_streams,
            transfer_streams = config.num_transfer_streams,
            profiling = config.profiling,
            "Created queue"
        );

        Ok(Self {
            shared: Arc::new(QueueShared {
                id,
                config,
                barrier: BarrierController::new(),
                compute,
                transfer,
                next_event_id: AtomicU64::new(1),
                aborted: AtomicBool::new(false),
                context,
            }),
        })
    }

    /// Create a queue with [`QueueConfig::default`].
    pub fn with_defaults(context: Arc<Context<B>>) -> Result<Self> {
        Self::new(context, QueueConfig::default())
    }

    pub(crate) fn from_shared(shared: Arc<QueueShared<B>>) -> Self {
        Self { shared }
    }

    /// Queue id.
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    /// The context this queue retains.
    pub fn context(&self) -> &Arc<Context<B>> {
        &self.shared.context
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Number of live handles to this queue.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Whether the queue refuses further work after a fatal error.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
    }

    /// Enqueue a command with no native work of its own.
    pub fn enqueue(&self, kind: CommandKind, deps: &[&Event<B>]) -> Result<Event<B>> {
        self.enqueue_with(kind, deps, |_| Ok(()))
    }

    /// Enqueue a command whose native work is submitted by `work`.
    ///
    /// `work` runs after the stream has been chosen, has observed any pending
    /// barrier and waits for dependencies on other streams. The returned event
    /// is recorded after `work` returns.
    pub fn enqueue_with<F>(&self, kind: CommandKind, deps: &[&Event<B>], work: F) -> Result<Event<B>>
    where
        F: FnOnce(StreamRef<'_, B>) -> Result<()>,
    {
        let shared = &*self.shared;
        shared.ensure_usable()?;
        shared.validate_wait_list(deps)?;

        let pool = shared.pool_for(kind);
        let dispatch = {
            let barrier = shared.barrier.lock();
            shared.check(dispatch::dispatch(pool, &barrier, shared.id, deps))?
        };

        shared.wait_on_dependencies(dispatch.stream(), deps)?;
        self.submit(kind, &dispatch, work)
    }

    /// Enqueue a barrier.
    ///
    /// With an empty `deps`, no command submitted afterwards on any stream
    /// runs before every command submitted before it. With a non-empty
    /// `deps`, the barrier only orders against those events. A barrier on an
    /// idle queue with no dependencies reduces to a marker.
    pub fn enqueue_barrier(&self, deps: &[&Event<B>]) -> Result<Event<B>> {
        let shared = &*self.shared;
        shared.ensure_usable()?;
        shared.validate_wait_list(deps)?;

        let mut barrier = shared.barrier.lock();
        if deps.is_empty()
            && !shared.compute.has_pending_work()
            && !shared.transfer.has_pending_work()
        {
            drop(barrier);
            debug!(queue = %shared.id, "No outstanding work, barrier reduces to a marker");
            return self.enqueue(CommandKind::Barrier, &[]);
        }

        // The reference observes the previous barrier, if it has not yet,
        // before the new marker is recorded on it.
        let dispatch = shared.check(dispatch::dispatch(&shared.compute, &barrier, shared.id, deps))?;
        let reference = dispatch.stream();
        barrier.reset_flags([&shared.compute, &shared.transfer]);
        shared.check(barrier.ensure_markers(shared.context.backend()))?;

        if deps.is_empty() {
            for pool in [&shared.compute, &shared.transfer] {
                shared.check(sync::sync_pool(pool, false, |stream| {
                    barrier.join_into(reference, stream)
                }))?;
            }
        } else {
            shared.wait_on_dependencies(reference, deps)?;
        }

        shared.check(barrier.arm(&mut dispatch.state(), reference))?;
        drop(barrier);

        debug!(queue = %shared.id, reference = %reference.id(), deps = deps.len(), "Enqueued barrier");
        self.submit(CommandKind::Barrier, &dispatch, |_| Ok(()))
    }

    fn submit<F>(&self, kind: CommandKind, dispatch: &Dispatch<'_, B>, work: F) -> Result<Event<B>>
    where
        F: FnOnce(StreamRef<'_, B>) -> Result<()>,
    {
        let shared = &*self.shared;
        let stream = dispatch.stream();
        let origin = Origin {
            queue: Arc::downgrade(&self.shared),
            queue_id: shared.id,
            context: Arc::clone(&shared.context),
            stream: stream.id(),
            token: dispatch.token(),
        };
        let id = shared.next_event_id.fetch_add(1, Ordering::Relaxed);

        let event = Event::create(kind, id, origin, shared.config.profiling, stream)?;
        event.start_on(stream)?;
        work(StreamRef { stream })?;
        event.record_on(stream)?;

        trace!(queue = %shared.id, event = id, kind = %kind, stream = %stream.id(), "Enqueued command");
        Ok(event)
    }

    /// Flush both pools.
    ///
    /// Blocking flushes join every stream dispatched to since the last
    /// blocking flush and move the watermark. Non-blocking flushes only push
    /// batched work to the device.
    pub fn flush(&self, blocking: bool) -> Result<()> {
        let shared = &*self.shared;
        shared.ensure_usable()?;

        for pool in [&shared.compute, &shared.transfer] {
            let result = if blocking {
                sync::sync_pool(pool, true, |stream| stream.synchronize())
            } else {
                sync::sync_pool(pool, false, |stream| stream.flush())
            };
            pool.note_flush();
            shared.check(result)?;
        }

        debug!(queue = %shared.id, blocking, "Flushed queue");
        Ok(())
    }

    /// Block until all submitted work has completed.
    pub fn finish(&self) -> Result<()> {
        self.flush(true)
    }

    /// Whether every created stream reports no pending work.
    pub fn is_empty(&self) -> Result<bool> {
        let shared = &*self.shared;
        shared.ensure_usable()?;

        for pool in [&shared.compute, &shared.transfer] {
            for index in 0..pool.size() as usize {
                if let Some(stream) = pool.get(index) {
                    if !shared.check(stream.query())?.is_complete() {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Utilization snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            compute: self.shared.compute.stats(),
            transfer: self.shared.transfer.stats(),
        }
    }
}

impl<B: StreamBackend> std::fmt::Debug for Queue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::backend::BackendError;
    use crate::config::QueueConfigBuilder;
    use crate::context::Device;
    use crate::testing::{Call, RecordingBackend};

    type Rec = RecordingBackend;

    fn setup(compute: usize, transfer: usize) -> (Arc<Rec>, Arc<Context<Rec>>, Queue<Rec>) {
        let backend = Arc::new(RecordingBackend::new());
        let ctx =
            Context::new(Arc::new(Device::new(0, "recording")), Arc::clone(&backend)).unwrap();
        let config = QueueConfigBuilder::new()
            .with_compute_streams(compute)
            .with_transfer_streams(transfer)
            .build();
        let queue = Queue::new(Arc::clone(&ctx), config).unwrap();
        (backend, ctx, queue)
    }

    fn raw_id(queue: &Queue<Rec>, id: StreamId) -> u32 {
        queue.shared.stream(id).unwrap().raw().id()
    }

    fn waits(backend: &Rec) -> Vec<(u32, u32)> {
        backend
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Wait { stream, marker } => Some((stream, marker)),
                _ => None,
            })
            .collect()
    }

    fn kernel(queue: &Queue<Rec>, deps: &[&Event<Rec>]) -> Event<Rec> {
        queue.enqueue(CommandKind::KernelLaunch, deps).unwrap()
    }

    #[test]
    fn test_round_robin_without_dependencies() {
        let (_backend, _ctx, queue) = setup(4, 0);
        let slots: Vec<usize> = (0..6)
            .map(|_| kernel(&queue, &[]).stream_id().unwrap().index)
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(queue.stats().compute.active_streams, 4);
    }

    #[test]
    fn test_event_ids_increase() {
        let (_backend, _ctx, queue) = setup(2, 0);
        let a = kernel(&queue, &[]);
        let b = kernel(&queue, &[]);
        assert!(b.id() > a.id());
        assert!(a.is_recorded() && a.is_started());
        assert_eq!(a.queue_id(), Some(queue.id()));
    }

    #[test]
    fn test_dependent_command_reuses_stream() {
        let (backend, _ctx, queue) = setup(4, 0);
        let producer = kernel(&queue, &[]);
        backend.clear_calls();

        let consumer = kernel(&queue, &[&producer]);
        assert_eq!(consumer.stream_id(), producer.stream_id());
        assert_eq!(consumer.stream_token(), producer.stream_token());
        assert!(waits(&backend).is_empty());

        let stats = queue.stats().compute;
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.cursor, 1);
    }

    #[test]
    fn test_reused_slot_is_delayed_once() {
        let (_backend, _ctx, queue) = setup(4, 0);
        let producer = kernel(&queue, &[]);
        kernel(&queue, &[&producer]);

        let slots: Vec<usize> = (0..4)
            .map(|_| kernel(&queue, &[]).stream_id().unwrap().index)
            .collect();
        // Cursor 4 lands on the delayed slot 0 and skips to slot 1.
        assert_eq!(slots, vec![1, 2, 3, 1]);
        assert_eq!(queue.stats().compute.delayed_skips, 1);
    }

    #[test]
    fn test_reuse_after_flush_falls_back() {
        let (backend, _ctx, queue) = setup(4, 0);
        let producer = kernel(&queue, &[]);
        queue.finish().unwrap();
        backend.clear_calls();

        let consumer = kernel(&queue, &[&producer]);
        assert_ne!(consumer.stream_id(), producer.stream_id());
        assert_eq!(queue.stats().compute.reuses, 0);

        let end = producer.with_end_marker(|m| m.raw().id()).unwrap();
        let stream = raw_id(&queue, consumer.stream_id().unwrap());
        assert_eq!(waits(&backend), vec![(stream, end)]);
    }

    #[test]
    fn test_reuse_window_expires() {
        let (backend, _ctx, queue) = setup(2, 0);
        let producer = kernel(&queue, &[]);
        kernel(&queue, &[]);
        kernel(&queue, &[]);
        backend.clear_calls();

        // Slot 0 has run another command since the producer.
        let consumer = kernel(&queue, &[&producer]);
        assert_eq!(consumer.stream_id(), Some(StreamId::compute(1)));
        assert_eq!(waits(&backend).len(), 1);
    }

    #[test]
    fn test_dependencies_on_two_streams_fall_back() {
        let (backend, _ctx, queue) = setup(4, 0);
        let a = kernel(&queue, &[]);
        let b = kernel(&queue, &[]);
        backend.clear_calls();

        let c = kernel(&queue, &[&a, &b]);
        assert_eq!(c.stream_id(), Some(StreamId::compute(2)));
        assert_eq!(waits(&backend).len(), 2);
        assert_eq!(queue.stats().compute.reuses, 0);
    }

    #[test]
    fn test_only_latest_dependency_per_stream_waited() {
        let (backend, _ctx, queue) = setup(4, 2);
        let first = queue.enqueue(CommandKind::BufferWrite, &[]).unwrap();
        let _other = queue.enqueue(CommandKind::BufferWrite, &[]).unwrap();
        let second = queue.enqueue(CommandKind::BufferWrite, &[]).unwrap();
        assert_eq!(first.stream_id(), second.stream_id());
        backend.clear_calls();

        let consumer = kernel(&queue, &[&first, &second]);
        let end = second.with_end_marker(|m| m.raw().id()).unwrap();
        let stream = raw_id(&queue, consumer.stream_id().unwrap());
        assert_eq!(waits(&backend), vec![(stream, end)]);
    }

    #[test]
    fn test_transfer_routing() {
        let (_backend, _ctx, queue) = setup(2, 2);
        let write = queue.enqueue(CommandKind::BufferWrite, &[]).unwrap();
        assert_eq!(write.stream_id(), Some(StreamId::transfer(0)));
        assert_eq!(write.stream_token(), None);

        let (_backend, _ctx, queue) = setup(2, 0);
        let write = queue.enqueue(CommandKind::BufferWrite, &[]).unwrap();
        assert_eq!(write.stream_id(), Some(StreamId::compute(0)));
        assert!(write.stream_token().is_some());
    }

    #[test]
    fn test_enqueue_with_runs_work_on_chosen_stream() {
        let (_backend, _ctx, queue) = setup(4, 0);
        kernel(&queue, &[]);

        let mut seen = None;
        let event = queue
            .enqueue_with(CommandKind::KernelLaunch, &[], |stream| {
                seen = Some(stream.id());
                assert_eq!(stream.backend().name(), "recording");
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, event.stream_id());
    }

    #[test]
    fn test_enqueue_work_failure_propagates() {
        let (_backend, _ctx, queue) = setup(2, 0);
        let err = queue
            .enqueue_with(CommandKind::KernelLaunch, &[], |_| {
                Err(BackendError::operation("launch", "bad grid").into())
            })
            .unwrap_err();
        assert!(err.is_backend_failure());
        assert!(!queue.is_aborted());
    }

    #[test]
    fn test_barrier_waits_once_per_stream() {
        let (backend, _ctx, queue) = setup(4, 0);
        for _ in 0..3 {
            kernel(&queue, &[]);
        }
        backend.clear_calls();

        let barrier = queue.enqueue_barrier(&[]).unwrap();
        assert_eq!(barrier.kind(), CommandKind::Barrier);
        let reference_slot = barrier.stream_id().unwrap();
        assert_eq!(reference_slot, StreamId::compute(3));
        let reference = raw_id(&queue, reference_slot);

        // The reference joined each of the three other streams.
        let joins = waits(&backend);
        assert_eq!(joins.len(), 3);
        assert!(joins.iter().all(|&(stream, _)| stream == reference));

        backend.clear_calls();
        for _ in 0..4 {
            kernel(&queue, &[]);
        }
        let applied = waits(&backend);
        assert_eq!(applied.len(), 3);
        let streams: BTreeSet<u32> = applied.iter().map(|&(s, _)| s).collect();
        let markers: BTreeSet<u32> = applied.iter().map(|&(_, m)| m).collect();
        assert_eq!(streams.len(), 3);
        assert!(!streams.contains(&reference));
        assert_eq!(markers.len(), 1);

        backend.clear_calls();
        for _ in 0..4 {
            kernel(&queue, &[]);
        }
        assert!(waits(&backend).is_empty());
        assert_eq!(queue.stats().compute.barrier_waits, 3);
    }

    #[test]
    fn test_barrier_joins_transfer_streams() {
        let (backend, _ctx, queue) = setup(2, 2);
        kernel(&queue, &[]);
        queue.enqueue(CommandKind::BufferRead, &[]).unwrap();
        backend.clear_calls();

        queue.enqueue_barrier(&[]).unwrap();
        let transfer = raw_id(&queue, StreamId::transfer(0));
        let recorded_on_transfer = backend
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Record { stream: Some(s), .. } if *s == transfer));
        assert!(recorded_on_transfer);

        backend.clear_calls();
        queue.enqueue(CommandKind::BufferRead, &[]).unwrap();
        queue.enqueue(CommandKind::BufferRead, &[]).unwrap();
        assert_eq!(waits(&backend).len(), 2);
        assert_eq!(queue.stats().transfer.barrier_waits, 2);
    }

    #[test]
    fn test_barrier_on_idle_queue_is_marker() {
        let (backend, _ctx, queue) = setup(4, 0);
        let event = queue.enqueue_barrier(&[]).unwrap();
        assert_eq!(event.kind(), CommandKind::Barrier);
        assert!(event.is_recorded());
        assert!(waits(&backend).is_empty());

        kernel(&queue, &[]);
        assert!(waits(&backend).is_empty());
    }

    #[test]
    fn test_barrier_with_wait_list() {
        let (backend, _ctx, queue) = setup(4, 0);
        kernel(&queue, &[]);
        let dep = kernel(&queue, &[]);
        backend.clear_calls();

        let barrier = queue.enqueue_barrier(&[&dep]).unwrap();
        // The dependency's stream is reused as reference, so nothing to join.
        assert_eq!(barrier.stream_id(), dep.stream_id());
        assert!(waits(&backend).is_empty());

        backend.clear_calls();
        let after = kernel(&queue, &[]);
        assert_ne!(after.stream_id(), dep.stream_id());
        assert_eq!(waits(&backend).len(), 1);
    }

    #[test]
    fn test_flush_non_blocking_keeps_watermark() {
        let (backend, _ctx, queue) = setup(2, 0);
        kernel(&queue, &[]);
        backend.clear_calls();

        queue.flush(false).unwrap();
        let calls = backend.calls();
        assert!(calls.iter().any(|c| matches!(c, Call::FlushStream(_))));
        assert!(!calls.iter().any(|c| matches!(c, Call::SyncStream(_))));
        assert_eq!(queue.stats().compute.last_synced, 0);

        queue.flush(true).unwrap();
        assert_eq!(queue.stats().compute.last_synced, 1);
    }

    #[test]
    fn test_second_barrier_reference_skips_observed_marker() {
        let (backend, _ctx, queue) = setup(4, 0);
        for _ in 0..3 {
            kernel(&queue, &[]);
        }
        let first = queue.enqueue_barrier(&[]).unwrap();
        for _ in 0..3 {
            kernel(&queue, &[]);
        }
        assert_eq!(queue.stats().compute.barrier_waits, 3);
        backend.clear_calls();

        // The same slot is chosen again and already observed the first marker.
        let second = queue.enqueue_barrier(&[]).unwrap();
        assert_eq!(second.stream_id(), first.stream_id());
        let reference = raw_id(&queue, StreamId::compute(3));
        let joins = waits(&backend);
        assert_eq!(joins.len(), 3);
        assert!(joins.iter().all(|&(stream, _)| stream == reference));
        assert_eq!(queue.stats().compute.barrier_waits, 3);
    }

    #[test]
    fn test_barrier_does_not_count_as_flush() {
        let (_backend, _ctx, queue) = setup(4, 0);
        kernel(&queue, &[]);
        kernel(&queue, &[]);
        queue.enqueue_barrier(&[]).unwrap();
        assert_eq!(queue.stats().compute.flushes, 0);

        queue.flush(true).unwrap();
        let stats = queue.stats();
        assert_eq!(stats.compute.flushes, 1);
        assert_eq!(stats.transfer.flushes, 1);
    }

    #[test]
    fn test_failed_finish_keeps_watermark() {
        let (backend, _ctx, queue) = setup(4, 0);
        kernel(&queue, &[]);
        kernel(&queue, &[]);
        backend.clear_calls();

        backend.fail_next(BackendError::operation("synchronize", "device busy"));
        assert!(queue.finish().is_err());
        assert!(!queue.is_aborted());
        assert_eq!(queue.stats().compute.last_synced, 0);

        // The retry joins the same streams again.
        backend.clear_calls();
        queue.finish().unwrap();
        let syncs = backend
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::SyncStream(_)))
            .count();
        assert_eq!(syncs, 2);
        assert_eq!(queue.stats().compute.last_synced, 2);
    }

    #[test]
    fn test_in_order_queue_uses_one_stream() {
        let backend = Arc::new(RecordingBackend::new());
        let ctx = Context::new(Arc::new(Device::new(0, "recording")), backend).unwrap();
        let config = QueueConfigBuilder::new().with_in_order(true).build();
        let queue = Queue::new(Arc::clone(&ctx), config).unwrap();

        let write = queue.enqueue(CommandKind::BufferWrite, &[]).unwrap();
        let launch = kernel(&queue, &[]);
        let read = queue.enqueue(CommandKind::BufferRead, &[]).unwrap();
        assert_eq!(write.stream_id(), Some(StreamId::compute(0)));
        assert_eq!(launch.stream_id(), write.stream_id());
        assert_eq!(read.stream_id(), write.stream_id());

        let config = QueueConfigBuilder::new()
            .with_in_order(true)
            .with_compute_streams(2)
            .build();
        assert!(matches!(
            Queue::new(ctx, config),
            Err(QueueError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_is_empty() {
        let (backend, _ctx, queue) = setup(2, 0);
        assert!(queue.is_empty().unwrap());
        kernel(&queue, &[]);
        backend.set_pending(true);
        assert!(!queue.is_empty().unwrap());
        backend.set_pending(false);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_teardown_flushes_before_destroy() {
        let (backend, _ctx, queue) = setup(4, 2);
        kernel(&queue, &[]);
        kernel(&queue, &[]);
        queue.enqueue(CommandKind::BufferCopy, &[]).unwrap();
        backend.clear_calls();

        drop(queue);

        let calls = backend.calls();
        let syncs: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::SyncStream(_)))
            .map(|(i, _)| i)
            .collect();
        let destroys: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::DestroyStream(_)))
            .map(|(i, _)| i)
            .collect();

        assert_eq!(syncs.len(), 3);
        assert_eq!(destroys.len(), 3);
        assert!(syncs.iter().max() < destroys.iter().min());
    }

    #[test]
    fn test_queue_retains_context() {
        let (_backend, ctx, queue) = setup(2, 0);
        assert_eq!(Arc::strong_count(&ctx), 2);

        let clone = queue.clone();
        assert_eq!(queue.reference_count(), 2);
        assert_eq!(Arc::strong_count(&ctx), 2);

        drop(queue);
        drop(clone);
        assert_eq!(Arc::strong_count(&ctx), 1);
    }

    #[test]
    fn test_event_outlives_queue() {
        let (_backend, ctx, queue) = setup(2, 0);
        let event = kernel(&queue, &[]);
        assert!(event.queue().is_some());
        drop(queue);

        assert!(event.queue().is_none());
        assert!(event.is_completed().unwrap());
        assert!(Arc::ptr_eq(event.context().unwrap(), &ctx));
    }

    #[test]
    fn test_device_loss_aborts_queue() {
        let (backend, ctx, queue) = setup(2, 0);
        backend.lose_device();

        let err = queue.enqueue(CommandKind::KernelLaunch, &[]).unwrap_err();
        assert!(err.is_fatal());
        assert!(ctx.is_lost());

        assert!(matches!(
            queue.enqueue(CommandKind::KernelLaunch, &[]),
            Err(QueueError::ContextLost)
        ));
        assert!(queue.is_aborted());
        assert!(matches!(queue.finish(), Err(QueueError::QueueAborted)));
    }

    #[test]
    fn test_backend_error_is_not_fatal() {
        let (backend, _ctx, queue) = setup(2, 0);
        backend.fail_next(BackendError::CreationFailed {
            object: "stream",
            message: "out of resources".into(),
        });

        let err = queue.enqueue(CommandKind::KernelLaunch, &[]).unwrap_err();
        assert!(err.is_backend_failure());
        assert!(!err.is_fatal());
        assert!(queue.enqueue(CommandKind::KernelLaunch, &[]).is_ok());
    }

    #[test]
    fn test_wait_list_validation() {
        let (_backend, _ctx, queue) = setup(2, 0);
        let user = Event::user(CommandKind::User);
        assert!(matches!(
            queue.enqueue(CommandKind::KernelLaunch, &[&user]),
            Err(QueueError::InvalidEventWaitList(_))
        ));
        user.set_complete().unwrap();
        assert!(queue.enqueue(CommandKind::KernelLaunch, &[&user]).is_ok());

        let (_b, _c, other) = setup(2, 0);
        let foreign = kernel(&other, &[]);
        assert!(matches!(
            queue.enqueue(CommandKind::KernelLaunch, &[&foreign]),
            Err(QueueError::InvalidEventWaitList(_))
        ));
    }

    #[test]
    fn test_profiling_timestamps() {
        let backend = Arc::new(RecordingBackend::new());
        let ctx =
            Context::new(Arc::new(Device::new(0, "recording")), Arc::clone(&backend)).unwrap();
        let config = QueueConfigBuilder::minimal().with_profiling(true).build();
        let queue = Queue::new(ctx, config).unwrap();

        let event = kernel(&queue, &[]);
        let queued = event.queued_time().unwrap();
        let start = event.start_time().unwrap();
        let end = event.end_time().unwrap();
        assert!(queued <= start && start <= end);
    }

    #[test]
    fn test_concurrent_enqueue() {
        let (_backend, _ctx, queue) = setup(8, 2);
        std::thread::scope(|s| {
            for t in 0..4 {
                let queue = &queue;
                s.spawn(move || {
                    let mut prev: Option<Event<Rec>> = None;
                    for i in 0..50 {
                        let kind = if (t + i) % 5 == 0 {
                            CommandKind::BufferWrite
                        } else {
                            CommandKind::KernelLaunch
                        };
                        let deps: Vec<&Event<Rec>> = prev.iter().collect();
                        let event = queue.enqueue(kind, &deps).unwrap();
                        prev = Some(event);
                    }
                });
            }
        });
        queue.enqueue_barrier(&[]).unwrap();
        queue.finish().unwrap();

        let stats = queue.stats();
        assert_eq!(stats.compute.last_synced, stats.compute.cursor);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let backend = Arc::new(RecordingBackend::new());
        let ctx = Context::new(Arc::new(Device::new(0, "recording")), backend).unwrap();
        let config = QueueConfigBuilder::new().with_compute_streams(0).build();
        assert!(matches!(
            Queue::new(ctx, config),
            Err(QueueError::InvalidConfig(_))
        ));
    }
}
