//! GPU driver boundary.
//!
//! The scatter compute shader itself runs in the host's render backend;
//! this crate only allocates buffers, submits dispatch requests and polls
//! asynchronous copies back to the CPU. [`ScatterDriver`] is that seam.
//! Buffer handles are reference counted and shared between the cache
//! entry and any in-flight readback; the driver observes the last handle
//! dropping and reclaims the allocation.

pub mod dispatch;
pub mod fake;
pub mod readback;

use std::sync::Arc;

use crate::core::types::Result;
use dispatch::ScatterDispatch;

/// Driver-unique buffer identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// One GPU buffer allocation. Opaque to this crate beyond its size.
#[derive(Debug)]
pub struct GpuBuffer {
    pub id: BufferId,
    pub label: String,
    pub size: u64,
}

/// Shared ownership of a GPU buffer. Dropping the last handle releases
/// the allocation back to the driver.
pub type BufferHandle = Arc<GpuBuffer>;

/// Identifies one enqueued buffer-to-CPU copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReadbackTicket(pub u64);

/// The compute execution service, implemented by the host render backend.
/// Called only from the render-submission context.
pub trait ScatterDriver: Send + Sync {
    fn create_buffer(&self, label: &str, size: u64) -> BufferHandle;

    /// Submit one scatter compute dispatch. The shader writes placement
    /// records into the dispatch's result buffer and a running count into
    /// its progress buffer.
    fn dispatch(&self, dispatch: &ScatterDispatch) -> Result<()>;

    /// Enqueue an asynchronous copy of `buffer` into CPU-visible staging.
    fn enqueue_copy(&self, buffer: &BufferHandle) -> ReadbackTicket;

    /// Take the copied bytes if the copy has completed, at most
    /// `max_bytes` of them. `None` while still in flight. Consumes the
    /// ticket on success.
    fn poll_copy(&self, ticket: ReadbackTicket, max_bytes: usize) -> Option<Vec<u8>>;
}
