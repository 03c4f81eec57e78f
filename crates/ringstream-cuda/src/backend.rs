//! CUDA driver backend.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cudarc::driver::result as cuda_result;
use cudarc::driver::sys as cuda_sys;
use cudarc::driver::{CudaContext, DriverError};
use tracing::{debug, info};

use ringstream_core::backend::{
    BackendError, BackendResult, MarkerFlags, MarkerStatus, PoolKind, StreamBackend, StreamFlags,
};
use ringstream_core::context::Device;

/// Raw CUDA stream owned by the scheduler.
#[derive(Debug)]
pub struct CudaStreamHandle {
    raw: cuda_sys::CUstream,
    kind: PoolKind,
}

impl CudaStreamHandle {
    /// Pool the stream was created for.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Raw driver handle, for launching kernels or copies on this stream.
    ///
    /// # Safety
    ///
    /// The handle must not be destroyed or used after the owning queue drops.
    pub unsafe fn raw(&self) -> cuda_sys::CUstream {
        self.raw
    }
}

// CUDA streams can be used from any thread once the context is bound.
unsafe impl Send for CudaStreamHandle {}
unsafe impl Sync for CudaStreamHandle {}

/// Raw CUDA event used as a scheduler marker.
#[derive(Debug)]
pub struct CudaMarker {
    raw: cuda_sys::CUevent,
    timing: bool,
}

impl CudaMarker {
    /// Whether the event was created with timing enabled.
    pub fn timing_enabled(&self) -> bool {
        self.timing
    }
}

unsafe impl Send for CudaMarker {}
unsafe impl Sync for CudaMarker {}

/// [`StreamBackend`] over the CUDA driver API.
pub struct CudaBackend {
    ctx: Arc<CudaContext>,
    ordinal: usize,
    name: String,
    streams_created: AtomicU64,
}

impl CudaBackend {
    /// Open device `ordinal`.
    pub fn new(ordinal: usize) -> BackendResult<Self> {
        let ctx = std::panic::catch_unwind(|| CudaContext::new(ordinal))
            .map_err(|_| BackendError::Unavailable("CUDA driver library not found".to_string()))?
            .map_err(|e| BackendError::CreationFailed {
                object: "context",
                message: format!("device {ordinal}: {e}"),
            })?;
        let name = ctx.name().map_err(|e| map_err("device name", e))?;

        info!(ordinal, name = %name, "Opened CUDA device");
        Ok(Self {
            ctx,
            ordinal,
            name,
            streams_created: AtomicU64::new(0),
        })
    }

    /// The device this backend drives.
    pub fn device(&self) -> Device {
        Device::new(self.ordinal, self.name.clone())
    }

    /// Underlying cudarc context.
    pub fn inner(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    /// Number of streams created so far.
    pub fn streams_created(&self) -> u64 {
        self.streams_created.load(Ordering::Relaxed)
    }

    fn bind(&self) -> BackendResult<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| map_err("bind context", e))
    }
}

impl StreamBackend for CudaBackend {
    type Stream = CudaStreamHandle;
    type Marker = CudaMarker;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn create_stream(&self, kind: PoolKind, flags: StreamFlags) -> BackendResult<CudaStreamHandle> {
        self.bind()?;
        let stream_kind = match flags {
            StreamFlags::Default => cuda_result::stream::StreamKind::Default,
            StreamFlags::NonBlocking => cuda_result::stream::StreamKind::NonBlocking,
        };
        let raw = cuda_result::stream::create(stream_kind).map_err(|e| BackendError::CreationFailed {
            object: "stream",
            message: e.to_string(),
        })?;
        self.streams_created.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %kind, ?flags, "Created CUDA stream");
        Ok(CudaStreamHandle { raw, kind })
    }

    fn destroy_stream(&self, stream: CudaStreamHandle) -> BackendResult<()> {
        self.bind()?;
        // Safety: the scheduler hands each stream back exactly once, drained.
        unsafe { cuda_result::stream::destroy(stream.raw) }.map_err(|e| map_err("destroy stream", e))
    }

    fn synchronize_stream(&self, stream: &CudaStreamHandle) -> BackendResult<()> {
        self.bind()?;
        unsafe { cuda_result::stream::synchronize(stream.raw) }
            .map_err(|e| map_err("synchronize stream", e))
    }

    fn query_stream(&self, stream: &CudaStreamHandle) -> BackendResult<MarkerStatus> {
        self.bind()?;
        match unsafe { cuda_sys::cuStreamQuery(stream.raw) } {
            cuda_sys::CUresult::CUDA_SUCCESS => Ok(MarkerStatus::Complete),
            cuda_sys::CUresult::CUDA_ERROR_NOT_READY => Ok(MarkerStatus::Pending),
            code => Err(map_err("query stream", DriverError(code))),
        }
    }

    fn create_marker(&self, flags: MarkerFlags) -> BackendResult<CudaMarker> {
        self.bind()?;
        let (cu_flags, timing) = match flags {
            MarkerFlags::Timing => (cuda_sys::CUevent_flags::CU_EVENT_DEFAULT, true),
            MarkerFlags::DisableTiming => (cuda_sys::CUevent_flags::CU_EVENT_DISABLE_TIMING, false),
        };
        let raw = cuda_result::event::create(cu_flags).map_err(|e| BackendError::CreationFailed {
            object: "marker",
            message: e.to_string(),
        })?;
        Ok(CudaMarker { raw, timing })
    }

    fn destroy_marker(&self, marker: CudaMarker) -> BackendResult<()> {
        self.bind()?;
        unsafe { cuda_result::event::destroy(marker.raw) }.map_err(|e| map_err("destroy event", e))
    }

    fn record_marker(
        &self,
        marker: &CudaMarker,
        stream: Option<&CudaStreamHandle>,
    ) -> BackendResult<()> {
        self.bind()?;
        let raw_stream = stream.map_or(ptr::null_mut(), |s| s.raw);
        unsafe { cuda_result::event::record(marker.raw, raw_stream) }
            .map_err(|e| map_err("record event", e))
    }

    fn wait_marker(&self, stream: &CudaStreamHandle, marker: &CudaMarker) -> BackendResult<()> {
        self.bind()?;
        unsafe {
            cuda_result::stream::wait_event(
                stream.raw,
                marker.raw,
                cuda_sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
        }
        .map_err(|e| map_err("wait event", e))
    }

    fn query_marker(&self, marker: &CudaMarker) -> BackendResult<MarkerStatus> {
        self.bind()?;
        match unsafe { cuda_result::event::query(marker.raw) } {
            Ok(()) => Ok(MarkerStatus::Complete),
            Err(e) if e.0 == cuda_sys::CUresult::CUDA_ERROR_NOT_READY => Ok(MarkerStatus::Pending),
            Err(e) => Err(map_err("query event", e)),
        }
    }

    fn synchronize_marker(&self, marker: &CudaMarker) -> BackendResult<()> {
        self.bind()?;
        unsafe { cuda_result::event::synchronize(marker.raw) }
            .map_err(|e| map_err("synchronize event", e))
    }

    fn elapsed_time(&self, start: &CudaMarker, end: &CudaMarker) -> BackendResult<Duration> {
        if !start.timing || !end.timing {
            return Err(BackendError::operation(
                "elapsed_time",
                "event created without timing",
            ));
        }
        self.bind()?;
        let ms = unsafe { cuda_result::event::elapsed(start.raw, end.raw) }
            .map_err(|e| map_err("event elapsed time", e))?;
        Ok(Duration::from_secs_f64(f64::from(ms.max(0.0)) / 1000.0))
    }
}

impl std::fmt::Debug for CudaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaBackend")
            .field("ordinal", &self.ordinal)
            .field("name", &self.name)
            .field("streams_created", &self.streams_created())
            .finish()
    }
}

/// Sticky driver errors leave the context unusable.
fn is_context_fatal(code: cuda_sys::CUresult) -> bool {
    use cuda_sys::CUresult::*;
    matches!(
        code,
        CUDA_ERROR_LAUNCH_FAILED
            | CUDA_ERROR_ILLEGAL_ADDRESS
            | CUDA_ERROR_ILLEGAL_INSTRUCTION
            | CUDA_ERROR_HARDWARE_STACK_ERROR
            | CUDA_ERROR_ECC_UNCORRECTABLE
            | CUDA_ERROR_CONTEXT_IS_DESTROYED
            | CUDA_ERROR_DEINITIALIZED
            | CUDA_ERROR_NO_DEVICE
    )
}

fn map_err(op: &'static str, e: DriverError) -> BackendError {
    if is_context_fatal(e.0) {
        BackendError::DeviceLost(format!("{op}: {e:?}"))
    } else {
        BackendError::operation(op, format!("{e:?}"))
    }
}
