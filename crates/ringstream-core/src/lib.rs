//! # RingStream Core
//!
//! Backend-agnostic asynchronous execution-queue scheduler.
//!
//! A [`Queue`] maps a logical command queue onto bounded pools of native
//! streams supplied by a [`StreamBackend`]. It provides:
//!
//! - round-robin stream dispatch with dependency-aware stream reuse;
//! - lazily applied queue-wide barriers;
//! - a typed [`Event`] ledger with monotonic status and optional timestamps;
//! - blocking and non-blocking flushes, and a draining teardown.
//!
//! ## Core Abstractions
//!
//! - [`StreamBackend`] - Native stream/marker primitives
//! - [`Context`] - Device binding and timestamp base shared by queues and events
//! - [`Queue`] - The scheduler
//! - [`Event`] - Per-command lifecycle handle
//!
//! ## Example
//!
//! ```ignore
//! use ringstream_core::prelude::*;
//!
//! let queue = Queue::new(context, QueueConfig::default())?;
//! let upload = queue.enqueue(CommandKind::BufferWrite, &[])?;
//! let kernel = queue.enqueue(CommandKind::KernelLaunch, &[&upload])?;
//! kernel.wait()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod pool;
pub mod queue;

mod barrier;
mod dispatch;
mod sync;

#[cfg(test)]
mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{
        BackendError, BackendResult, Marker, MarkerFlags, MarkerStatus, PoolKind, StreamBackend,
        StreamFlags,
    };
    pub use crate::command::CommandKind;
    pub use crate::config::{
        QueueConfig, QueueConfigBuilder, DEFAULT_COMPUTE_STREAMS, DEFAULT_TRANSFER_STREAMS,
    };
    pub use crate::context::{Context, Device};
    pub use crate::error::{QueueError, Result};
    pub use crate::event::{Event, EventState, ExecutionStatus};
    pub use crate::pool::{StreamId, StreamPoolStats, StreamToken};
    pub use crate::queue::{Queue, QueueId, QueueStats, StreamRef};
}

// Re-exports for convenience
pub use backend::{BackendError, StreamBackend};
pub use command::CommandKind;
pub use config::{QueueConfig, QueueConfigBuilder};
pub use context::{Context, Device};
pub use error::{QueueError, Result};
pub use event::{Event, EventState, ExecutionStatus};
pub use queue::{Queue, QueueStats};
