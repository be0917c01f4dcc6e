//! Native queue provider seam.
//!
//! The currency model never talks to an accelerator runtime directly. All
//! native operations go through the [`QueueProvider`] trait: create/destroy a
//! command queue, enqueue a completion callback, block until the queue is
//! drained, and resolve which device a queue belongs to. The provider is
//! installed process-wide once; if nothing is installed explicitly, the
//! in-process [`HostQueueProvider`](crate::host::HostQueueProvider) is used.

use std::sync::Arc;
use std::sync::OnceLock;

use crate::device::DeviceId;
use crate::error::{Result, StreamError};
use crate::host::HostQueueProvider;

/// Opaque identifier for one native command queue.
///
/// Handle `0` is reserved for the shared default (null) queue, which every
/// provider accepts and never destroys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(u64);

impl QueueHandle {
    /// The shared default queue (the null stream's queue).
    pub const DEFAULT: QueueHandle = QueueHandle(0);

    /// Creates a handle from a raw id. Providers mint these; id 0 is
    /// reserved for the default queue.
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Returns true if this is the shared default queue.
    #[must_use]
    pub fn is_default(self) -> bool {
        self.0 == 0
    }
}

/// Completion status the native layer reports to a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// All work enqueued before the callback completed successfully.
    Success,
    /// The queue reported a failure for prior work.
    Failed,
}

/// Callback handed to the native layer. Invoked once all previously
/// enqueued work on the queue has completed.
pub type NativeCallback = Box<dyn FnOnce(CompletionStatus) + Send + 'static>;

/// Provider of native asynchronous command queues.
///
/// Implementations wrap an accelerator runtime (or simulate one on the
/// host). Enqueue operations must be non-blocking; only
/// [`block_until_idle`](QueueProvider::block_until_idle) may block, and it
/// must wait only for work enqueued before the call.
pub trait QueueProvider: Send + Sync + 'static {
    /// Creates a new command queue bound to `device`.
    fn create(&self, device: DeviceId, non_blocking: bool) -> Result<QueueHandle>;

    /// Destroys a queue. The default queue cannot be destroyed.
    fn destroy(&self, handle: QueueHandle) -> Result<()>;

    /// Enqueues a completion callback behind all work currently on the
    /// queue. Must not block.
    fn enqueue_callback(&self, handle: QueueHandle, callback: NativeCallback) -> Result<()>;

    /// Blocks the calling thread until all work enqueued on the queue
    /// before this call has completed.
    fn block_until_idle(&self, handle: QueueHandle) -> Result<()>;

    /// Returns true if the queue has no outstanding work right now.
    fn is_idle(&self, handle: QueueHandle) -> Result<bool>;

    /// Returns the device a queue is bound to.
    fn device_of(&self, handle: QueueHandle) -> Result<DeviceId>;

    /// Number of devices the backend exposes.
    fn device_count(&self) -> usize;

    /// Makes `device` the active native execution context for the calling
    /// thread. Fails with [`StreamError::InvalidDevice`] for an
    /// out-of-range ordinal.
    fn set_device(&self, device: DeviceId) -> Result<()>;
}

static PROVIDER: OnceLock<Arc<dyn QueueProvider>> = OnceLock::new();

/// Installs the process-wide queue provider.
///
/// May be called at most once, before any stream or device operation. Once
/// any operation has run, the default host provider is already in place and
/// installation fails.
pub fn install_provider(provider: Arc<dyn QueueProvider>) -> Result<()> {
    let mut installed = false;
    let _ = PROVIDER.get_or_init(|| {
        installed = true;
        provider
    });
    if installed {
        Ok(())
    } else {
        Err(StreamError::Configuration(
            "a queue provider is already installed".into(),
        ))
    }
}

/// Returns the process-wide queue provider, installing the in-process host
/// provider on first use if none was installed.
pub fn provider() -> &'static Arc<dyn QueueProvider> {
    PROVIDER.get_or_init(|| {
        tracing::info!("no queue provider installed, defaulting to host simulation");
        Arc::new(HostQueueProvider::default())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_default_reserved() {
        assert!(QueueHandle::DEFAULT.is_default());
        assert_eq!(QueueHandle::DEFAULT.raw(), 0);
        assert!(!QueueHandle::new(1).is_default());
    }

    #[test]
    fn test_handle_equality() {
        assert_eq!(QueueHandle::new(3), QueueHandle::new(3));
        assert_ne!(QueueHandle::new(3), QueueHandle::new(4));
    }
}
