//! Event ledger.
//!
//! Every enqueued command yields an [`Event`]. An event moves through
//!
//! ```text
//! Unrecorded -> Queued -> Running -> Completed
//!      \           \         \          \
//!       +-----------+---------+----------+--> Released
//! ```
//!
//! Recording inserts the event's end marker into its stream; completion is
//! observed by polling that marker and is never forced. The coarse
//! [`ExecutionStatus`] reported by [`Event::status`] never regresses: once
//! an event has been seen complete it stays complete.
//!
//! `Event` is a cheap `Clone` handle. The logical reference count
//! ([`Event::retain`] / [`Event::release`]) is separate from the number of
//! handles; when it reaches zero the event's native markers are destroyed
//! and every further operation fails.
//!
//! Events carry a weak reference to their queue and may outlive it. User
//! events have no queue at all and are completed from the host.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::trace;

use crate::backend::{Marker, MarkerFlags, StreamBackend};
use crate::command::CommandKind;
use crate::context::Context;
use crate::error::{QueueError, Result};
use crate::pool::{NativeStream, StreamId, StreamToken};
use crate::queue::{Queue, QueueId, QueueShared};

/// Coarse execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionStatus {
    /// Not yet recorded into a stream.
    Submitted,
    /// Recorded, completion not yet observed.
    Running,
    /// Completion observed.
    Complete,
}

impl ExecutionStatus {
    /// Short name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Submitted => "submitted",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Complete => "complete",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventState {
    /// Created, completion marker not yet recorded.
    Unrecorded,
    /// Recorded; the stream has not been observed reaching the command.
    Queued,
    /// The start marker completed; the end marker has not.
    Running,
    /// The end marker completed.
    Completed,
    /// Reference count reached zero.
    Released,
}

/// Where a queue event was submitted.
pub(crate) struct Origin<B: StreamBackend> {
    pub(crate) queue: Weak<QueueShared<B>>,
    pub(crate) queue_id: QueueId,
    pub(crate) context: Arc<Context<B>>,
    pub(crate) stream: StreamId,
    pub(crate) token: Option<StreamToken>,
}

struct UserSignal {
    done: Mutex<bool>,
    cv: Condvar,
}

enum Source<B: StreamBackend> {
    Queue(Origin<B>),
    User(UserSignal),
}

struct EventMarkers<B: StreamBackend> {
    end: Marker<B>,
    start: Option<Marker<B>>,
    queued: Option<Marker<B>>,
}

struct EventInner<B: StreamBackend> {
    kind: CommandKind,
    id: u64,
    source: Source<B>,
    markers: RwLock<Option<EventMarkers<B>>>,
    refcount: AtomicU32,
    recorded: AtomicBool,
    started: AtomicBool,
    waited_on: AtomicBool,
    completed: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
enum Stamp {
    Queued,
    Start,
    End,
}

impl Stamp {
    fn as_str(self) -> &'static str {
        match self {
            Stamp::Queued => "queued",
            Stamp::Start => "start",
            Stamp::End => "end",
        }
    }
}

/// Handle to one enqueued command.
pub struct Event<B: StreamBackend> {
    inner: Arc<EventInner<B>>,
}

impl<B: StreamBackend> Clone for Event<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: StreamBackend> Event<B> {
    /// Create an unrecorded event on `stream`.
    ///
    /// With `profiling` the event owns timing markers and its queued marker
    /// is recorded immediately.
    pub(crate) fn create(
        kind: CommandKind,
        id: u64,
        origin: Origin<B>,
        profiling: bool,
        stream: &NativeStream<B>,
    ) -> Result<Self> {
        let ctx = &origin.context;
        let backend = ctx.backend();

        let (queued, start) = if profiling {
            let queued = ctx.check(Marker::new(backend, MarkerFlags::Timing))?;
            ctx.check(stream.record(&queued))?;
            let start = ctx.check(Marker::new(backend, MarkerFlags::Timing))?;
            (Some(queued), Some(start))
        } else {
            (None, None)
        };
        let end_flags = if profiling {
            MarkerFlags::Timing
        } else {
            MarkerFlags::DisableTiming
        };
        let end = ctx.check(Marker::new(backend, end_flags))?;

        Ok(Self {
            inner: Arc::new(EventInner {
                kind,
                id,
                source: Source::Queue(origin),
                markers: RwLock::new(Some(EventMarkers { end, start, queued })),
                refcount: AtomicU32::new(1),
                recorded: AtomicBool::new(false),
                started: AtomicBool::new(false),
                waited_on: AtomicBool::new(false),
                completed: AtomicBool::new(false),
            }),
        })
    }

    /// Create a host-controlled event with no queue.
    ///
    /// It is pending until [`Event::set_complete`] is called.
    pub fn user(kind: CommandKind) -> Self {
        Self {
            inner: Arc::new(EventInner {
                kind,
                id: 0,
                source: Source::User(UserSignal {
                    done: Mutex::new(false),
                    cv: Condvar::new(),
                }),
                markers: RwLock::new(None),
                refcount: AtomicU32::new(1),
                recorded: AtomicBool::new(false),
                started: AtomicBool::new(false),
                waited_on: AtomicBool::new(false),
                completed: AtomicBool::new(false),
            }),
        }
    }

    /// Command kind.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.inner.kind
    }

    /// Queue-assigned id. Ids increase with submission order; user events use 0.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether this is a user event.
    #[must_use]
    pub fn is_user(&self) -> bool {
        matches!(self.inner.source, Source::User(_))
    }

    /// Id of the submitting queue.
    #[must_use]
    pub fn queue_id(&self) -> Option<QueueId> {
        self.origin().map(|o| o.queue_id)
    }

    /// The submitting queue, if it is still alive.
    #[must_use]
    pub fn queue(&self) -> Option<Queue<B>> {
        self.origin()
            .and_then(|o| o.queue.upgrade())
            .map(Queue::from_shared)
    }

    /// The context the event was created in.
    #[must_use]
    pub fn context(&self) -> Option<&Arc<Context<B>>> {
        self.origin().map(|o| &o.context)
    }

    /// Stream the command was submitted to.
    #[must_use]
    pub fn stream_id(&self) -> Option<StreamId> {
        self.origin().map(|o| o.stream)
    }

    /// Compute-stream token, `None` for transfer streams and user events.
    #[must_use]
    pub fn stream_token(&self) -> Option<StreamToken> {
        self.origin().and_then(|o| o.token)
    }

    /// Whether the completion marker has been recorded.
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.inner.recorded.load(Ordering::Acquire)
    }

    /// Whether the start marker has been inserted.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Whether [`Event::wait`] has returned successfully.
    #[must_use]
    pub fn has_been_waited_on(&self) -> bool {
        self.inner.waited_on.load(Ordering::Acquire)
    }

    /// Current logical reference count.
    #[must_use]
    pub fn reference_count(&self) -> u32 {
        self.inner.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn origin(&self) -> Option<&Origin<B>> {
        match &self.inner.source {
            Source::Queue(origin) => Some(origin),
            Source::User(_) => None,
        }
    }

    fn queue_origin(&self) -> Result<&Origin<B>> {
        self.origin()
            .ok_or_else(|| QueueError::invalid_state("queue event", "user event"))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.reference_count() == 0 {
            return Err(QueueError::invalid_state("reference count > 0", "released"));
        }
        Ok(())
    }

    fn released() -> QueueError {
        QueueError::invalid_state("reference count > 0", "released")
    }

    /// Record the completion marker at the current end of the event's stream.
    ///
    /// Fails if the event is already recorded or its queue is gone.
    pub fn record(&self) -> Result<()> {
        let origin = self.queue_origin()?;
        let queue = origin
            .queue
            .upgrade()
            .ok_or_else(|| QueueError::invalid_state("live queue", "queue dropped"))?;
        let stream = queue.stream(origin.stream)?;
        self.record_on(stream)
    }

    pub(crate) fn record_on(&self, stream: &NativeStream<B>) -> Result<()> {
        let origin = self.queue_origin()?;
        let guard = self.inner.markers.write();
        let markers = guard.as_ref().ok_or_else(Self::released)?;
        if self.is_recorded() {
            return Err(QueueError::invalid_state("unrecorded", "recorded"));
        }

        origin.context.check(stream.record(&markers.end))?;
        self.inner.recorded.store(true, Ordering::Release);
        trace!(event = self.inner.id, stream = %stream.id(), "Recorded event");
        Ok(())
    }

    /// Insert the start marker at the current end of the event's stream.
    ///
    /// Valid once. Without profiling only the started flag is set.
    pub fn start(&self) -> Result<()> {
        let origin = self.queue_origin()?;
        let queue = origin
            .queue
            .upgrade()
            .ok_or_else(|| QueueError::invalid_state("live queue", "queue dropped"))?;
        let stream = queue.stream(origin.stream)?;
        self.start_on(stream)
    }

    pub(crate) fn start_on(&self, stream: &NativeStream<B>) -> Result<()> {
        let origin = self.queue_origin()?;
        let guard = self.inner.markers.write();
        let markers = guard.as_ref().ok_or_else(Self::released)?;
        if self.is_started() {
            return Err(QueueError::invalid_state("not started", "started"));
        }

        if let Some(start) = &markers.start {
            origin.context.check(stream.record(start))?;
        }
        self.inner.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Poll the coarse execution status.
    ///
    /// Unrecorded events are `Submitted`, recorded ones `Running` until their
    /// end marker completes. Never regresses.
    pub fn status(&self) -> Result<ExecutionStatus> {
        self.ensure_live()?;
        if self.inner.completed.load(Ordering::Acquire) {
            return Ok(ExecutionStatus::Complete);
        }
        let Source::Queue(origin) = &self.inner.source else {
            return Ok(ExecutionStatus::Submitted);
        };

        let guard = self.inner.markers.read();
        let markers = guard.as_ref().ok_or_else(Self::released)?;
        if !self.is_recorded() {
            return Ok(ExecutionStatus::Submitted);
        }

        if origin.context.check(markers.end.query())?.is_complete() {
            self.inner.completed.store(true, Ordering::Release);
            Ok(ExecutionStatus::Complete)
        } else {
            Ok(ExecutionStatus::Running)
        }
    }

    /// Whether completion has been observed.
    pub fn is_completed(&self) -> Result<bool> {
        Ok(self.status()? == ExecutionStatus::Complete)
    }

    /// Poll the fine-grained lifecycle state.
    ///
    /// `Running` is only distinguishable from `Queued` when the event owns a
    /// start marker (profiling enabled).
    pub fn state(&self) -> Result<EventState> {
        if self.reference_count() == 0 {
            return Ok(EventState::Released);
        }
        match self.status()? {
            ExecutionStatus::Submitted => Ok(EventState::Unrecorded),
            ExecutionStatus::Complete => Ok(EventState::Completed),
            ExecutionStatus::Running => {
                let origin = self.queue_origin()?;
                let guard = self.inner.markers.read();
                let markers = guard.as_ref().ok_or_else(Self::released)?;
                match &markers.start {
                    Some(start) if self.is_started() => {
                        if origin.context.check(start.query())?.is_complete() {
                            Ok(EventState::Running)
                        } else {
                            Ok(EventState::Queued)
                        }
                    }
                    _ => Ok(EventState::Queued),
                }
            }
        }
    }

    /// Block until the command completes.
    ///
    /// Fails with an invalid-state error if the event was never recorded.
    /// User events block until [`Event::set_complete`].
    pub fn wait(&self) -> Result<()> {
        self.ensure_live()?;
        match &self.inner.source {
            Source::User(signal) => {
                let mut done = signal.done.lock();
                while !*done {
                    signal.cv.wait(&mut done);
                }
            }
            Source::Queue(origin) => {
                let guard = self.inner.markers.read();
                let markers = guard.as_ref().ok_or_else(Self::released)?;
                if !self.is_recorded() {
                    return Err(QueueError::invalid_state("recorded", "unrecorded"));
                }
                origin.context.check(markers.end.synchronize())?;
            }
        }

        self.inner.completed.store(true, Ordering::Release);
        self.inner.waited_on.store(true, Ordering::Release);
        Ok(())
    }

    /// Wait for every event in `events`, stopping at the first failure.
    pub fn wait_all(events: &[&Event<B>]) -> Result<()> {
        events.iter().try_for_each(|event| event.wait())
    }

    /// Complete a user event and wake its waiters.
    pub fn set_complete(&self) -> Result<()> {
        self.ensure_live()?;
        let Source::User(signal) = &self.inner.source else {
            return Err(QueueError::invalid_state("user event", "queue event"));
        };

        let mut done = signal.done.lock();
        *done = true;
        self.inner.recorded.store(true, Ordering::Release);
        self.inner.completed.store(true, Ordering::Release);
        signal.cv.notify_all();
        Ok(())
    }

    /// Nanosecond timestamp of command submission.
    pub fn queued_time(&self) -> Result<u64> {
        self.timestamp(Stamp::Queued)
    }

    /// Nanosecond timestamp of command start.
    pub fn start_time(&self) -> Result<u64> {
        self.timestamp(Stamp::Start)
    }

    /// Nanosecond timestamp of command completion.
    pub fn end_time(&self) -> Result<u64> {
        self.timestamp(Stamp::End)
    }

    fn timestamp(&self, stamp: Stamp) -> Result<u64> {
        self.ensure_live()?;
        let Source::Queue(origin) = &self.inner.source else {
            return Err(QueueError::ProfilingUnavailable(
                "user events carry no timestamps".to_string(),
            ));
        };

        let guard = self.inner.markers.read();
        let markers = guard.as_ref().ok_or_else(Self::released)?;
        let marker = match stamp {
            Stamp::Queued => markers.queued.as_ref(),
            Stamp::Start => markers.start.as_ref(),
            Stamp::End => Some(&markers.end).filter(|m| m.timing_enabled()),
        }
        .ok_or_else(|| {
            QueueError::ProfilingUnavailable("profiling is disabled on this queue".to_string())
        })?;

        let reached = match stamp {
            Stamp::Queued => true,
            Stamp::Start => self.is_started(),
            Stamp::End => self.is_recorded(),
        };
        if !reached || !origin.context.check(marker.query())?.is_complete() {
            return Err(QueueError::ProfilingUnavailable(format!(
                "{} timestamp of event {} is not available yet",
                stamp.as_str(),
                self.inner.id
            )));
        }

        origin.context.timestamp_ns(marker)
    }

    /// Increment the logical reference count.
    pub fn retain(&self) -> Result<()> {
        self.inner
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count + 1)
            })
            .map(|_| ())
            .map_err(|_| Self::released())
    }

    /// Decrement the logical reference count.
    ///
    /// At zero the event's native markers are destroyed. Releasing an event
    /// whose count is already zero is an invalid-state error.
    pub fn release(&self) -> Result<()> {
        let previous = self
            .inner
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| Self::released())?;

        if previous == 1 {
            self.inner.markers.write().take();
            trace!(event = self.inner.id, kind = %self.inner.kind, "Released event");
        }
        Ok(())
    }

    /// Check that the event may appear in a dependency list.
    pub(crate) fn check_waitable(&self) -> Result<()> {
        if self.reference_count() == 0 {
            return Err(QueueError::InvalidEventWaitList(format!(
                "event {} has been released",
                self.inner.id
            )));
        }
        match &self.inner.source {
            Source::User(_) if !self.inner.completed.load(Ordering::Acquire) => {
                Err(QueueError::InvalidEventWaitList(
                    "user event is not complete".to_string(),
                ))
            }
            Source::Queue(_) if !self.is_recorded() => Err(QueueError::InvalidEventWaitList(
                format!("event {} has not been recorded", self.inner.id),
            )),
            _ => Ok(()),
        }
    }

    /// Make `stream` wait for this event's completion marker.
    pub(crate) fn wait_on_stream(&self, stream: &NativeStream<B>) -> Result<()> {
        let Source::Queue(origin) = &self.inner.source else {
            return Ok(());
        };
        let guard = self.inner.markers.read();
        let markers = guard.as_ref().ok_or_else(Self::released)?;
        origin.context.check(stream.wait(&markers.end))
    }

    #[cfg(test)]
    pub(crate) fn with_end_marker<R>(&self, f: impl FnOnce(&Marker<B>) -> R) -> Option<R> {
        self.inner.markers.read().as_ref().map(|m| f(&m.end))
    }
}

impl<B: StreamBackend> std::fmt::Debug for Event<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("stream", &self.stream_id())
            .field("recorded", &self.is_recorded())
            .field("refcount", &self.reference_count())
            .finish()
    }
}
