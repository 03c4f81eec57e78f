//! Command kinds carried by events.

use crate::backend::PoolKind;

/// The kind of command an event stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// ND-range kernel launch.
    KernelLaunch,
    /// Device-to-host buffer read.
    BufferRead,
    /// Rectangular device-to-host buffer read.
    BufferReadRect,
    /// Host-to-device buffer write.
    BufferWrite,
    /// Rectangular host-to-device buffer write.
    BufferWriteRect,
    /// Device-to-device buffer copy.
    BufferCopy,
    /// Rectangular device-to-device buffer copy.
    BufferCopyRect,
    /// Buffer fill with a pattern.
    BufferFill,
    /// Map a buffer into host memory.
    BufferMap,
    /// Unmap a previously mapped buffer.
    BufferUnmap,
    /// Unified shared memory copy.
    UsmMemcpy,
    /// Unified shared memory fill.
    UsmFill,
    /// Unified shared memory prefetch.
    UsmPrefetch,
    /// Marker with no native work.
    Marker,
    /// Queue-wide barrier.
    Barrier,
    /// Host-controlled user event.
    User,
}

impl CommandKind {
    /// Whether this command moves data and belongs on a transfer stream.
    #[must_use]
    pub fn is_transfer(self) -> bool {
        matches!(
            self,
            CommandKind::BufferRead
                | CommandKind::BufferReadRect
                | CommandKind::BufferWrite
                | CommandKind::BufferWriteRect
                | CommandKind::BufferCopy
                | CommandKind::BufferCopyRect
                | CommandKind::BufferFill
                | CommandKind::BufferMap
                | CommandKind::BufferUnmap
                | CommandKind::UsmMemcpy
                | CommandKind::UsmFill
                | CommandKind::UsmPrefetch
        )
    }

    /// The pool this command prefers.
    #[must_use]
    pub fn preferred_pool(self) -> PoolKind {
        if self.is_transfer() {
            PoolKind::Transfer
        } else {
            PoolKind::Compute
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::KernelLaunch => "kernel_launch",
            CommandKind::BufferRead => "buffer_read",
            CommandKind::BufferReadRect => "buffer_read_rect",
            CommandKind::BufferWrite => "buffer_write",
            CommandKind::BufferWriteRect => "buffer_write_rect",
            CommandKind::BufferCopy => "buffer_copy",
            CommandKind::BufferCopyRect => "buffer_copy_rect",
            CommandKind::BufferFill => "buffer_fill",
            CommandKind::BufferMap => "buffer_map",
            CommandKind::BufferUnmap => "buffer_unmap",
            CommandKind::UsmMemcpy => "usm_memcpy",
            CommandKind::UsmFill => "usm_fill",
            CommandKind::UsmPrefetch => "usm_prefetch",
            CommandKind::Marker => "marker",
            CommandKind::Barrier => "barrier",
            CommandKind::User => "user",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
