//! CUDA Backend for RingStream
//!
//! This crate provides a [`StreamBackend`](ringstream_core::StreamBackend)
//! over the CUDA driver API using cudarc. Native streams are CUDA streams and
//! markers are CUDA events.
//!
//! # Requirements
//!
//! - NVIDIA GPU and driver
//! - the `cuda` feature
//!
//! Without the feature, [`CudaBackend::new`] always fails with
//! [`BackendError::Unavailable`](ringstream_core::BackendError::Unavailable).
//!
//! # Example
//!
//! ```ignore
//! use ringstream_core::prelude::*;
//! use ringstream_cuda::cuda_context;
//!
//! let queue = Queue::with_defaults(cuda_context(0)?)?;
//! let copy = queue.enqueue(CommandKind::BufferWrite, &[])?;
//! queue.enqueue(CommandKind::KernelLaunch, &[&copy])?.wait()?;
//! ```

#![warn(missing_docs)]

#[cfg(feature = "cuda")]
mod backend;

#[cfg(feature = "cuda")]
pub use backend::{CudaBackend, CudaMarker, CudaStreamHandle};

use std::sync::Arc;

use ringstream_core::context::Context;
use ringstream_core::error::Result;

// Placeholder implementation when CUDA is not available
#[cfg(not(feature = "cuda"))]
mod stub {
    use std::convert::Infallible;
    use std::time::Duration;

    use ringstream_core::backend::{
        BackendError, BackendResult, MarkerFlags, MarkerStatus, PoolKind, StreamBackend,
        StreamFlags,
    };
    use ringstream_core::context::Device;

    fn unavailable<T>() -> BackendResult<T> {
        Err(BackendError::Unavailable(
            "CUDA feature not enabled".to_string(),
        ))
    }

    /// Stub CUDA backend when the `cuda` feature is disabled.
    #[derive(Debug)]
    pub struct CudaBackend {
        _never: Infallible,
    }

    impl CudaBackend {
        /// Always fails when CUDA is not available.
        pub fn new(_ordinal: usize) -> BackendResult<Self> {
            unavailable()
        }

        /// The device this backend drives.
        pub fn device(&self) -> Device {
            match self._never {}
        }
    }

    impl StreamBackend for CudaBackend {
        type Stream = Infallible;
        type Marker = Infallible;

        fn name(&self) -> &'static str {
            "cuda"
        }

        fn create_stream(&self, _kind: PoolKind, _flags: StreamFlags) -> BackendResult<Infallible> {
            unavailable()
        }

        fn destroy_stream(&self, stream: Infallible) -> BackendResult<()> {
            match stream {}
        }

        fn synchronize_stream(&self, stream: &Infallible) -> BackendResult<()> {
            match *stream {}
        }

        fn query_stream(&self, stream: &Infallible) -> BackendResult<MarkerStatus> {
            match *stream {}
        }

        fn create_marker(&self, _flags: MarkerFlags) -> BackendResult<Infallible> {
            unavailable()
        }

        fn destroy_marker(&self, marker: Infallible) -> BackendResult<()> {
            match marker {}
        }

        fn record_marker(&self, marker: &Infallible, _stream: Option<&Infallible>) -> BackendResult<()> {
            match *marker {}
        }

        fn wait_marker(&self, stream: &Infallible, _marker: &Infallible) -> BackendResult<()> {
            match *stream {}
        }

        fn query_marker(&self, marker: &Infallible) -> BackendResult<MarkerStatus> {
            match *marker {}
        }

        fn synchronize_marker(&self, marker: &Infallible) -> BackendResult<()> {
            match *marker {}
        }

        fn elapsed_time(&self, start: &Infallible, _end: &Infallible) -> BackendResult<Duration> {
            match *start {}
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaBackend;

/// Create a context on CUDA device `ordinal`.
pub fn cuda_context(ordinal: usize) -> Result<Arc<Context<CudaBackend>>> {
    let backend = Arc::new(CudaBackend::new(ordinal)?);
    let device = Arc::new(backend.device());
    Context::new(device, backend)
}

/// Check if CUDA is available at runtime.
///
/// This function returns false if:
/// - CUDA feature is not enabled
/// - CUDA libraries are not installed on the system
/// - No CUDA devices are present
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Get CUDA device count.
///
/// Returns 0 if CUDA is not available or libraries are not installed.
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        // cudarc panics if CUDA libraries are not found, so we catch that
        std::panic::catch_unwind(|| {
            cudarc::driver::CudaContext::device_count().unwrap_or(0) as usize
        })
        .unwrap_or(0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}
