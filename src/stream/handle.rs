//! The stream handle and its currency operations.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::context;
use crate::device::{current_device, DeviceId};
use crate::error::{Result, StreamError};
use crate::provider::{provider, CompletionStatus, QueueHandle};

use super::dispatcher::{CallbackDispatcher, StreamStats};

static NULL_STREAM: OnceLock<Stream> = OnceLock::new();

struct StreamInner {
    handle: QueueHandle,
    /// Bound device; `None` for the null stream, which is available
    /// identically on every device.
    device: Option<DeviceId>,
    dispatcher: CallbackDispatcher,
    freed: AtomicBool,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        // Pending callbacks hold stream clones, so by the time the last
        // clone drops the dispatcher is already drained.
        if self.device.is_some() && !self.freed.load(Ordering::Acquire) {
            debug!(handle = self.handle.raw(), "releasing stream queue");
            if let Err(e) = provider().destroy(self.handle) {
                warn!(handle = self.handle.raw(), error = %e, "failed to release stream queue");
            }
        }
        self.dispatcher.shutdown();
    }
}

/// An asynchronous command queue bound to one device, or the shared
/// device-agnostic null stream.
///
/// `Stream` is a cheap clone; all clones refer to the same queue. A
/// non-null stream owns its queue exclusively and releases it exactly once,
/// either through [`Stream::destroy`] or when the last clone drops. The
/// null stream is a process-wide singleton and is never destroyed.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    /// Creates a new stream with its own queue on the calling thread's
    /// current device.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Returns a builder for stream construction flags.
    #[must_use]
    pub fn builder() -> StreamBuilder {
        StreamBuilder::default()
    }

    /// Returns the shared null stream.
    ///
    /// The null stream is current whenever nothing has been explicitly
    /// activated, resolves on every device, and cannot be constructed any
    /// other way.
    pub fn null() -> &'static Stream {
        NULL_STREAM.get_or_init(|| Stream {
            inner: Arc::new(StreamInner {
                handle: QueueHandle::DEFAULT,
                device: None,
                dispatcher: CallbackDispatcher::spawn(QueueHandle::DEFAULT.raw()),
                freed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the bound device, or `None` for the null stream.
    #[must_use]
    pub fn device(&self) -> Option<DeviceId> {
        self.inner.device
    }

    /// Returns true for the null stream.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.inner.device.is_none()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(StreamError::UseAfterFree);
        }
        Ok(())
    }

    /// Maps a backend failure to `UseAfterFree` when a concurrent
    /// `destroy` released the queue after the liveness check passed.
    fn queue_error(&self, err: StreamError) -> StreamError {
        if self.inner.freed.load(Ordering::Acquire) {
            StreamError::UseAfterFree
        } else {
            err
        }
    }

    /// The device slot this stream activates on: its bound device, or the
    /// calling thread's current device for the null stream.
    fn slot(&self) -> DeviceId {
        self.inner.device.unwrap_or_else(current_device)
    }

    /// Pushes this stream as current for the calling thread. The returned
    /// guard pops back to the previous stream when dropped, on every exit
    /// path, nesting with other stream scopes.
    pub fn activate(&self) -> Result<StreamGuard> {
        self.ensure_live()?;
        let slot = self.slot();
        context::push_stream(slot, self.clone());
        Ok(StreamGuard {
            slot,
            _not_send: PhantomData,
        })
    }

    /// Makes this stream current for the calling thread without scoping.
    /// It stays current until another activation changes it.
    pub fn make_current(&self) -> Result<()> {
        self.ensure_live()?;
        context::set_stream_top(self.slot(), self.clone());
        Ok(())
    }

    /// Schedules `callback(stream, status, payload)` to run once all work
    /// enqueued on this stream so far has completed.
    ///
    /// Never blocks. Callbacks scheduled on one stream from one thread run
    /// in FIFO order, on the stream's dispatch thread, never on the
    /// scheduling thread.
    pub fn add_callback<T, F>(&self, callback: F, payload: T) -> Result<()>
    where
        F: FnOnce(&Stream, CompletionStatus, T) + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_live()?;
        let stream = self.clone();
        let job = Box::new(move |status| callback(&stream, status, payload));
        self.inner
            .dispatcher
            .schedule(provider(), self.inner.handle, job)
            .map_err(|e| self.queue_error(e))?;
        Ok(())
    }

    /// Blocks until every operation and callback enqueued on this stream
    /// before this call has completed.
    ///
    /// Work enqueued concurrently after the call is not waited on. If a
    /// callback panicked since the last synchronize, the captured failure
    /// is returned as [`StreamError::Callback`] after the drain.
    pub fn synchronize(&self) -> Result<()> {
        self.ensure_live()?;
        let watermark = self.inner.dispatcher.watermark();
        provider()
            .block_until_idle(self.inner.handle)
            .map_err(|e| self.queue_error(e))?;
        self.inner.dispatcher.wait_drained(watermark);
        self.surface_failures()
    }

    /// Returns true if all work on this stream has completed.
    pub fn is_done(&self) -> Result<bool> {
        self.ensure_live()?;
        let idle = provider()
            .is_idle(self.inner.handle)
            .map_err(|e| self.queue_error(e))?;
        Ok(idle && self.inner.dispatcher.is_drained())
    }

    /// Releases the stream's queue after draining it.
    ///
    /// Any further operation on this stream (or a clone of it) fails with
    /// [`StreamError::UseAfterFree`]. The null stream cannot be destroyed.
    pub fn destroy(&self) -> Result<()> {
        if self.is_null() {
            return Err(StreamError::Configuration(
                "the null stream is shared and cannot be destroyed".into(),
            ));
        }
        if self
            .inner
            .freed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StreamError::UseAfterFree);
        }

        let watermark = self.inner.dispatcher.watermark();
        provider().block_until_idle(self.inner.handle)?;
        self.inner.dispatcher.wait_drained(watermark);
        let outcome = self.surface_failures();

        provider().destroy(self.inner.handle)?;
        self.inner.dispatcher.shutdown();
        debug!(handle = self.inner.handle.raw(), "stream destroyed");
        outcome
    }

    /// Returns a snapshot of this stream's callback dispatch counters.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.inner.dispatcher.stats()
    }

    fn surface_failures(&self) -> Result<()> {
        let failures = self.inner.dispatcher.take_failures();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StreamError::Callback(failures.join("; ")))
        }
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}

impl Eq for Stream {}

impl Hash for Stream {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.handle.hash(state);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Stream(null)")
        } else {
            f.debug_struct("Stream")
                .field("handle", &self.inner.handle.raw())
                .field("device", &self.inner.device)
                .finish()
        }
    }
}

/// Construction flags for [`Stream`].
///
/// Mirrors the native creation options: `non_blocking` requests a queue
/// that does not synchronize with the default queue. Requesting `null`
/// always fails; the null stream is only reachable through
/// [`Stream::null`].
#[derive(Debug, Default)]
pub struct StreamBuilder {
    null: bool,
    non_blocking: bool,
}

impl StreamBuilder {
    /// Creates a builder with default flags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the null stream. Building with this flag set is always
    /// rejected, with or without other flags.
    #[must_use]
    pub fn null(mut self, null: bool) -> Self {
        self.null = null;
        self
    }

    /// Requests a queue that does not synchronize with the default queue.
    #[must_use]
    pub fn non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    /// Builds the stream on the calling thread's current device.
    pub fn build(self) -> Result<Stream> {
        if self.null {
            return Err(StreamError::Configuration(
                "the null stream is a fixed singleton; use Stream::null()".into(),
            ));
        }

        let queues = provider();
        let handle = queues.create(current_device(), self.non_blocking)?;
        // The native layer is authoritative for the binding.
        let device = queues.device_of(handle)?;
        debug!(handle = handle.raw(), device, "created stream");

        Ok(Stream {
            inner: Arc::new(StreamInner {
                handle,
                device: Some(device),
                dispatcher: CallbackDispatcher::spawn(handle.raw()),
                freed: AtomicBool::new(false),
            }),
        })
    }
}

/// Scope guard for an active stream; pops the stream stack on drop.
#[derive(Debug)]
#[must_use = "the stream stays current only while the guard is alive"]
pub struct StreamGuard {
    slot: DeviceId,
    // Currency stacks are per-thread; the guard must drop on the thread
    // that created it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        context::pop_stream(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_stream_is_a_singleton() {
        let a = Stream::null().clone();
        let b = Stream::null().clone();
        assert_eq!(a, b);
        assert!(a.is_null());
        assert_eq!(a.device(), None);
    }

    #[test]
    fn test_builder_rejects_null_flag() {
        match Stream::builder().null(true).build() {
            Err(StreamError::Configuration(_)) => {}
            other => panic!("expected Configuration error, got {other:?}"),
        }
        // Still rejected when combined with other flags.
        assert!(Stream::builder().null(true).non_blocking(true).build().is_err());
    }

    #[test]
    fn test_streams_compare_by_queue() {
        let a = Stream::new().unwrap();
        let b = Stream::new().unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a, *Stream::null());
    }

    #[test]
    fn test_stream_binds_to_current_device() {
        std::thread::spawn(|| {
            let stream = Stream::new().unwrap();
            assert_eq!(stream.device(), Some(0));

            let _scope = crate::device::Device::new(1).activate().unwrap();
            let stream = Stream::new().unwrap();
            assert_eq!(stream.device(), Some(1));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_destroy_is_exactly_once() {
        let stream = Stream::new().unwrap();
        let clone = stream.clone();
        stream.destroy().unwrap();

        assert!(matches!(clone.destroy(), Err(StreamError::UseAfterFree)));
        assert!(matches!(clone.synchronize(), Err(StreamError::UseAfterFree)));
        assert!(matches!(clone.is_done(), Err(StreamError::UseAfterFree)));
        assert!(matches!(
            clone.add_callback(|_, _, ()| {}, ()),
            Err(StreamError::UseAfterFree)
        ));
        assert!(matches!(clone.activate(), Err(StreamError::UseAfterFree)));
        assert!(matches!(clone.make_current(), Err(StreamError::UseAfterFree)));
    }

    #[test]
    fn test_null_stream_cannot_be_destroyed() {
        assert!(matches!(
            Stream::null().destroy(),
            Err(StreamError::Configuration(_))
        ));
    }
}
