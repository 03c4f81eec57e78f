//! Stream selection for new commands.
//!
//! Compute commands whose dependencies all sit on one compute stream of the
//! same queue, and whose producer is still the most recent command there,
//! are placed on that stream directly. Same-stream ordering then replaces
//! an explicit cross-stream wait. Everything else goes round robin.

use tracing::debug;

use crate::backend::{BackendResult, PoolKind, StreamBackend};
use crate::barrier::BarrierGuard;
use crate::event::Event;
use crate::pool::{NativeStream, StateGuard, StreamPool, StreamToken, SyncGuard};
use crate::queue::QueueId;

/// A stream chosen for one command.
///
/// On the reuse path this holds the pool's sync lock until dropped, so no
/// flush can move the watermark past the reused token while the command is
/// being submitted.
pub(crate) struct Dispatch<'q, B: StreamBackend> {
    pool: &'q StreamPool<B>,
    stream: &'q NativeStream<B>,
    token: Option<StreamToken>,
    sync: Option<SyncGuard<'q>>,
}

impl<'q, B: StreamBackend> Dispatch<'q, B> {
    pub(crate) fn stream(&self) -> &'q NativeStream<B> {
        self.stream
    }

    /// Compute token for the command, `None` on transfer streams.
    pub(crate) fn token(&self) -> Option<StreamToken> {
        self.token
    }

    pub(crate) fn is_reuse(&self) -> bool {
        self.sync.is_some()
    }

    /// Lock the pool's flags, going through the held sync guard if any.
    pub(crate) fn state(&self) -> StateGuard<'_> {
        match &self.sync {
            Some(sync) => sync.state(),
            None => self.pool.lock_state(),
        }
    }
}

/// Pick a stream in `pool` for a command depending on `deps`.
///
/// The caller holds the barrier lock; the chosen stream observes any armed
/// barrier before this returns.
pub(crate) fn dispatch<'q, B: StreamBackend>(
    pool: &'q StreamPool<B>,
    barrier: &BarrierGuard<'_, B>,
    queue: QueueId,
    deps: &[&Event<B>],
) -> BackendResult<Dispatch<'q, B>> {
    let reuse = match pool.kind() {
        PoolKind::Compute => try_reuse(pool, queue, deps),
        PoolKind::Transfer => None,
    };

    let (index, token, sync) = match reuse {
        Some((token, sync)) => (pool.slot_of(token), Some(token), Some(sync)),
        None => {
            let (token, index) = pool.acquire();
            let token = (pool.kind() == PoolKind::Compute).then_some(token);
            (index, token, None)
        }
    };

    let stream = pool.stream(index)?;
    let dispatch = Dispatch {
        pool,
        stream,
        token,
        sync,
    };

    {
        let mut state = dispatch.state();
        if dispatch.is_reuse() {
            state.delay[index] = true;
        }
        barrier.apply(pool, &mut state, stream)?;
    }

    if dispatch.is_reuse() {
        pool.note_reuse();
        debug!(stream = %stream.id(), token = ?token, "Reusing dependency stream");
    }
    Ok(dispatch)
}

/// The single reusable compute token among `deps`, with the sync lock held.
fn try_reuse<'q, B: StreamBackend>(
    pool: &'q StreamPool<B>,
    queue: QueueId,
    deps: &[&Event<B>],
) -> Option<(StreamToken, SyncGuard<'q>)> {
    let mut candidate: Option<StreamToken> = None;

    for dep in deps {
        let Some(origin) = dep.origin() else {
            continue;
        };
        if origin.queue_id != queue {
            continue;
        }
        let Some(token) = origin.token else {
            continue;
        };
        if !pool.can_reuse(token) {
            continue;
        }
        match candidate {
            None => candidate = Some(token),
            Some(existing) if existing == token => {}
            Some(_) => return None,
        }
    }

    let token = candidate?;
    let sync = pool.try_lock_sync()?;
    // A flush may have moved the watermark before we got the lock.
    pool.can_reuse(token).then_some((token, sync))
}
