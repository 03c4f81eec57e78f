//! CPU Backend for RingStream
//!
//! This crate provides a host-thread implementation of the
//! [`StreamBackend`](ringstream_core::StreamBackend) trait. Each native
//! stream is a worker thread executing submitted closures in order, and
//! markers are host-side completion records with timestamps. It has no
//! hardware requirements and is used for testing and as a fallback.
//!
//! # Example
//!
//! ```ignore
//! use ringstream_core::prelude::*;
//! use ringstream_cpu::host_context;
//!
//! let ctx = host_context()?;
//! let queue = Queue::with_defaults(ctx)?;
//! let event = queue.enqueue_with(CommandKind::KernelLaunch, &[], |stream| {
//!     stream.backend().launch(stream.raw(), || println!("hello from a host stream"))?;
//!     Ok(())
//! })?;
//! event.wait()?;
//! ```

#![warn(missing_docs)]

mod marker;
mod runtime;
mod stream;

use std::sync::Arc;

use ringstream_core::context::Context;
use ringstream_core::error::Result;

pub use marker::HostMarker;
pub use runtime::{HostBackend, HostMetrics};
pub use stream::HostStream;

/// Create a context on a fresh [`HostBackend`].
pub fn host_context() -> Result<Arc<Context<HostBackend>>> {
    let backend = Arc::new(HostBackend::new());
    let device = Arc::new(backend.device());
    Context::new(device, backend)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use ringstream_core::prelude::*;

    use super::*;

    #[test]
    fn test_host_context() {
        let ctx = host_context().unwrap();
        assert_eq!(ctx.backend().name(), "cpu");
        assert_eq!(ctx.device().ordinal(), 0);
    }

    #[test]
    fn test_queue_runs_dependency_chain_in_order() {
        let ctx = host_context().unwrap();
        let queue = Queue::new(ctx, QueueConfig::default()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut prev: Option<Event<HostBackend>> = None;
        for i in 0..16 {
            let kind = if i % 3 == 0 {
                CommandKind::BufferWrite
            } else {
                CommandKind::KernelLaunch
            };
            let deps: Vec<&Event<HostBackend>> = prev.iter().collect();
            let log = Arc::clone(&log);
            let event = queue
                .enqueue_with(kind, &deps, move |stream| {
                    stream.backend().launch(stream.raw(), move || {
                        std::thread::sleep(std::time::Duration::from_micros(200));
                        log.lock().push(i);
                    })?;
                    Ok(())
                })
                .unwrap();
            prev = Some(event);
        }

        prev.unwrap().wait().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_queue_barrier_orders_all_streams() {
        let ctx = host_context().unwrap();
        let config = QueueConfigBuilder::new()
            .with_compute_streams(4)
            .with_transfer_streams(2)
            .build();
        let queue = Queue::new(ctx, config).unwrap();
        let before = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let before = Arc::clone(&before);
            let kind = if i % 2 == 0 {
                CommandKind::KernelLaunch
            } else {
                CommandKind::BufferCopy
            };
            queue
                .enqueue_with(kind, &[], move |stream| {
                    stream.backend().launch(stream.raw(), move || {
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        before.fetch_add(1, Ordering::SeqCst);
                    })?;
                    Ok(())
                })
                .unwrap();
        }

        queue.enqueue_barrier(&[]).unwrap();

        let observed = Arc::new(Mutex::new(Vec::new()));
        let mut after = Vec::new();
        for i in 0..6 {
            let before = Arc::clone(&before);
            let observed = Arc::clone(&observed);
            let kind = if i % 2 == 0 {
                CommandKind::KernelLaunch
            } else {
                CommandKind::BufferRead
            };
            after.push(
                queue
                    .enqueue_with(kind, &[], move |stream| {
                        stream.backend().launch(stream.raw(), move || {
                            observed.lock().push(before.load(Ordering::SeqCst));
                        })?;
                        Ok(())
                    })
                    .unwrap(),
            );
        }

        queue.finish().unwrap();
        assert!(observed.lock().iter().all(|&count| count == 8));
        assert_eq!(observed.lock().len(), 6);
        for event in &after {
            assert!(event.is_completed().unwrap());
        }
    }

    #[test]
    fn test_profiled_timestamps_are_ordered() {
        let ctx = host_context().unwrap();
        let config = QueueConfigBuilder::minimal().with_profiling(true).build();
        let queue = Queue::new(ctx, config).unwrap();

        let event = queue
            .enqueue_with(CommandKind::KernelLaunch, &[], |stream| {
                stream.backend().launch(stream.raw(), || {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                })?;
                Ok(())
            })
            .unwrap();
        event.wait().unwrap();

        let queued = event.queued_time().unwrap();
        let start = event.start_time().unwrap();
        let end = event.end_time().unwrap();
        assert!(queued <= start);
        assert!(end >= start + 1_000_000);
    }

    #[test]
    fn test_device_loss_aborts_queue() {
        let ctx = host_context().unwrap();
        let queue = Queue::new(Arc::clone(&ctx), QueueConfig::minimal()).unwrap();
        queue.enqueue(CommandKind::KernelLaunch, &[]).unwrap();

        ctx.backend().simulate_device_loss();
        let err = queue.enqueue(CommandKind::KernelLaunch, &[]).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            queue.enqueue(CommandKind::KernelLaunch, &[]),
            Err(QueueError::ContextLost)
        ));
        assert!(matches!(queue.finish(), Err(QueueError::QueueAborted)));
    }
}
