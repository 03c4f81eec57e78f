//! Queue configuration.

use crate::backend::StreamFlags;
use crate::error::{QueueError, Result};

/// Default number of compute streams per queue.
pub const DEFAULT_COMPUTE_STREAMS: usize = 64;

/// Default number of transfer streams per queue.
pub const DEFAULT_TRANSFER_STREAMS: usize = 16;

/// Configuration for an execution queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Capacity of the compute stream pool.
    pub num_compute_streams: usize,
    /// Capacity of the transfer stream pool. Zero routes transfers to compute streams.
    pub num_transfer_streams: usize,
    /// Whether events carry queued/start/end timestamps.
    pub profiling: bool,
    /// Flags used when creating native streams.
    pub stream_flags: StreamFlags,
    /// Run every command in submission order.
    ///
    /// An in-order queue owns a single compute stream and no transfer pool, so
    /// transfers share that stream; [`QueueConfig::validate`] rejects any other
    /// pool sizes.
    pub in_order: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_compute_streams: DEFAULT_COMPUTE_STREAMS,
            num_transfer_streams: DEFAULT_TRANSFER_STREAMS,
            profiling: false,
            stream_flags: StreamFlags::Default,
            in_order: false,
        }
    }
}

impl QueueConfig {
    /// Creates a minimal configuration (one compute stream, no transfer pool).
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            num_compute_streams: 1,
            num_transfer_streams: 0,
            profiling: false,
            stream_flags: StreamFlags::Default,
            in_order: true,
        }
    }

    /// Creates a throughput-oriented configuration with non-blocking streams.
    #[must_use]
    pub fn performance() -> Self {
        Self {
            num_compute_streams: DEFAULT_COMPUTE_STREAMS,
            num_transfer_streams: DEFAULT_TRANSFER_STREAMS,
            profiling: false,
            stream_flags: StreamFlags::NonBlocking,
            in_order: false,
        }
    }

    /// Checks the configuration for values the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_compute_streams == 0 {
            return Err(QueueError::InvalidConfig(
                "queue needs at least one compute stream".to_string(),
            ));
        }
        if self.in_order && (self.num_compute_streams != 1 || self.num_transfer_streams != 0) {
            return Err(QueueError::InvalidConfig(format!(
                "in-order queue needs 1 compute and 0 transfer streams, got {} and {}",
                self.num_compute_streams, self.num_transfer_streams
            )));
        }
        // Pool slots are addressed by `token % size` with 32-bit tokens.
        if self.num_compute_streams > u32::MAX as usize
            || self.num_transfer_streams > u32::MAX as usize
        {
            return Err(QueueError::InvalidConfig(
                "stream pool size exceeds 32-bit cursor range".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`QueueConfig`].
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder seeded with [`QueueConfig::minimal`].
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config: QueueConfig::minimal(),
        }
    }

    /// Creates a builder seeded with [`QueueConfig::performance`].
    #[must_use]
    pub fn performance() -> Self {
        Self {
            config: QueueConfig::performance(),
        }
    }

    /// Sets the number of compute streams.
    #[must_use]
    pub fn with_compute_streams(mut self, count: usize) -> Self {
        self.config.num_compute_streams = count;
        self
    }

    /// Sets the number of transfer streams.
    #[must_use]
    pub fn with_transfer_streams(mut self, count: usize) -> Self {
        self.config.num_transfer_streams = count;
        self
    }

    /// Enables or disables event timestamps.
    #[must_use]
    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.config.profiling = enabled;
        self
    }

    /// Sets native stream creation flags.
    #[must_use]
    pub fn with_stream_flags(mut self, flags: StreamFlags) -> Self {
        self.config.stream_flags = flags;
        self
    }

    /// Makes the queue in-order.
    ///
    /// Enabling it also sizes the pools to one compute stream and no transfer
    /// streams; later stream-count overrides fail validation.
    #[must_use]
    pub fn with_in_order(mut self, in_order: bool) -> Self {
        self.config.in_order = in_order;
        if in_order {
            self.config.num_compute_streams = 1;
            self.config.num_transfer_streams = 0;
        }
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> QueueConfig {
        self.config
    }
}
