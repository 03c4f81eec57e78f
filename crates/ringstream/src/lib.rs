//! # RingStream
//!
//! Asynchronous execution-queue scheduler for stream-based accelerators.
//!
//! RingStream turns a logical command queue into work on bounded pools of
//! native streams, keeping the ordering guarantees of the queue while letting
//! independent commands overlap.
//!
//! ## Features
//!
//! - **Round-robin stream pools** for compute and transfer work
//! - **Dependency-aware reuse** of the stream a dependency already runs on
//! - **Lazy barriers** that cost one native wait per stream, paid on next use
//! - **Event ledger** with monotonic status, refcounts and optional timestamps
//! - **Flushes** that only touch streams used since the last join
//!
//! ## Quick Start
//!
//! ```ignore
//! use ringstream::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let queue = Queue::with_defaults(ringstream::host_context()?)?;
//!
//!     let upload = queue.enqueue(CommandKind::BufferWrite, &[])?;
//!     let kernel = queue.enqueue_with(CommandKind::KernelLaunch, &[&upload], |stream| {
//!         stream.backend().launch(stream.raw(), || println!("running"))?;
//!         Ok(())
//!     })?;
//!     queue.enqueue_barrier(&[])?;
//!
//!     kernel.wait()?;
//!     queue.finish()
//! }
//! ```
//!
//! ## Backends
//!
//! - **CPU** - Host worker threads, for testing and fallback (always available)
//! - **CUDA** - NVIDIA GPUs (requires `cuda` feature)
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────── Queue ──────────────────────────────┐
//! │  enqueue ──► Dispatcher ──► compute pool  [s0 s1 s2 ... sN]      │
//! │                 │       └─► transfer pool [t0 t1 ... tM]         │
//! │  barrier ──► Barrier controller (marker + per-stream flags)      │
//! │  flush   ──► Synchronizer (streams in [last_synced, cursor))     │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 │ StreamBackend
//!                     ┌───────────┴───────────┐
//!                     │  HostBackend │ CudaBackend │
//!                     └─────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

use std::sync::Arc;

// Re-export core types
pub use ringstream_core::*;

// Re-export CPU backend (always available)
pub use ringstream_cpu::{host_context, HostBackend, HostMarker, HostMetrics, HostStream};

// CUDA backend; a stub that reports unavailability without the `cuda` feature
pub use ringstream_cuda::{cuda_context, CudaBackend};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::availability::BackendKind;
    pub use crate::{host_context, queue_on_host, HostBackend};
    pub use ringstream_core::prelude::*;
}

/// Create a host-backed queue with `config`.
pub fn queue_on_host(config: QueueConfig) -> Result<Queue<HostBackend>> {
    Queue::new(host_context()?, config)
}

/// Create a CUDA-backed queue on device `ordinal` with `config`.
pub fn queue_on_cuda(ordinal: usize, config: QueueConfig) -> Result<Queue<CudaBackend>> {
    Queue::new(cuda_context(ordinal)?, config)
}

/// Shared handle to whichever backend context [`availability::best_context`] picked.
#[derive(Debug, Clone)]
pub enum AnyContext {
    /// Host worker-thread backend.
    Host(Arc<Context<HostBackend>>),
    /// CUDA backend.
    Cuda(Arc<Context<CudaBackend>>),
}

impl AnyContext {
    /// Which backend this context runs on.
    pub fn kind(&self) -> availability::BackendKind {
        match self {
            AnyContext::Host(_) => availability::BackendKind::Cpu,
            AnyContext::Cuda(_) => availability::BackendKind::Cuda,
        }
    }
}

/// Check availability of backends at runtime.
pub mod availability {
    use super::*;

    /// Backend families this crate can drive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum BackendKind {
        /// Host worker threads.
        Cpu,
        /// NVIDIA CUDA.
        Cuda,
    }

    impl std::fmt::Display for BackendKind {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                BackendKind::Cpu => f.write_str("cpu"),
                BackendKind::Cuda => f.write_str("cuda"),
            }
        }
    }

    /// Check if CUDA is available.
    pub fn cuda() -> bool {
        ringstream_cuda::is_cuda_available()
    }

    /// Get list of available backends.
    pub fn available_backends() -> Vec<BackendKind> {
        let mut backends = vec![BackendKind::Cpu];
        if cuda() {
            backends.push(BackendKind::Cuda);
        }
        backends
    }

    /// Open a context on the best available backend.
    ///
    /// Tries CUDA device 0 first and falls back to the host backend.
    pub fn best_context() -> Result<AnyContext> {
        if cuda() {
            match cuda_context(0) {
                Ok(ctx) => {
                    tracing::info!("Auto-selected CUDA backend");
                    return Ok(AnyContext::Cuda(ctx));
                }
                Err(e) => tracing::warn!(error = %e, "CUDA detected but unusable"),
            }
        }

        tracing::info!("Auto-selected CPU backend (no GPU available)");
        Ok(AnyContext::Host(host_context()?))
    }
}
