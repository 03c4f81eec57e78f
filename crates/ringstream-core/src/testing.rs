//! Call-recording backend used by the unit tests.
//!
//! Every native call is appended to a log so tests can assert the exact
//! sequence of records, waits, joins and destructions the scheduler issues.
//! Markers complete immediately unless [`RecordingBackend::set_pending`] is on.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{
    BackendError, BackendResult, MarkerFlags, MarkerStatus, PoolKind, StreamBackend, StreamFlags,
};

/// One logged native call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CreateStream { stream: u32, kind: PoolKind },
    DestroyStream(u32),
    SyncStream(u32),
    FlushStream(u32),
    CreateMarker(u32),
    DestroyMarker(u32),
    Record { marker: u32, stream: Option<u32> },
    Wait { stream: u32, marker: u32 },
}

#[derive(Debug)]
pub(crate) struct RecStream {
    id: u32,
}

impl RecStream {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug)]
pub(crate) struct RecMarker {
    id: u32,
}

impl RecMarker {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingBackend {
    next_id: AtomicU32,
    calls: Mutex<Vec<Call>>,
    pending: AtomicBool,
    lost: AtomicBool,
    fail_next: Mutex<Option<BackendError>>,
}

impl RecordingBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// While set, markers and streams report pending work.
    pub(crate) fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    /// Make the next native call fail with `error`.
    pub(crate) fn fail_next(&self, error: BackendError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Every call from now on reports a lost device.
    pub(crate) fn lose_device(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check(&self) -> BackendResult<()> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(BackendError::DeviceLost("recording backend".into()));
        }
        match self.fail_next.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn log(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn status(&self) -> MarkerStatus {
        if self.pending.load(Ordering::SeqCst) {
            MarkerStatus::Pending
        } else {
            MarkerStatus::Complete
        }
    }
}

impl StreamBackend for RecordingBackend {
    type Stream = RecStream;
    type Marker = RecMarker;

    fn name(&self) -> &'static str {
        "recording"
    }

    fn create_stream(&self, kind: PoolKind, _flags: StreamFlags) -> BackendResult<RecStream> {
        self.check()?;
        let id = self.next_id();
        self.log(Call::CreateStream { stream: id, kind });
        Ok(RecStream { id })
    }

    fn destroy_stream(&self, stream: RecStream) -> BackendResult<()> {
        self.log(Call::DestroyStream(stream.id));
        Ok(())
    }

    fn synchronize_stream(&self, stream: &RecStream) -> BackendResult<()> {
        self.check()?;
        self.log(Call::SyncStream(stream.id));
        Ok(())
    }

    fn query_stream(&self, _stream: &RecStream) -> BackendResult<MarkerStatus> {
        self.check()?;
        Ok(self.status())
    }

    fn flush_stream(&self, stream: &RecStream) -> BackendResult<()> {
        self.check()?;
        self.log(Call::FlushStream(stream.id));
        Ok(())
    }

    fn create_marker(&self, _flags: MarkerFlags) -> BackendResult<RecMarker> {
        self.check()?;
        let id = self.next_id();
        self.log(Call::CreateMarker(id));
        Ok(RecMarker { id })
    }

    fn destroy_marker(&self, marker: RecMarker) -> BackendResult<()> {
        self.log(Call::DestroyMarker(marker.id));
        Ok(())
    }

    fn record_marker(&self, marker: &RecMarker, stream: Option<&RecStream>) -> BackendResult<()> {
        self.check()?;
        self.log(Call::Record {
            marker: marker.id,
            stream: stream.map(|s| s.id),
        });
        Ok(())
    }

    fn wait_marker(&self, stream: &RecStream, marker: &RecMarker) -> BackendResult<()> {
        self.check()?;
        self.log(Call::Wait {
            stream: stream.id,
            marker: marker.id,
        });
        Ok(())
    }

    fn query_marker(&self, _marker: &RecMarker) -> BackendResult<MarkerStatus> {
        self.check()?;
        Ok(self.status())
    }

    fn synchronize_marker(&self, _marker: &RecMarker) -> BackendResult<()> {
        self.check()
    }

    fn elapsed_time(&self, start: &RecMarker, end: &RecMarker) -> BackendResult<Duration> {
        self.check()?;
        // Later markers have larger ids, which keeps timestamps monotonic.
        Ok(Duration::from_micros(u64::from(end.id.saturating_sub(start.id))))
    }
}
