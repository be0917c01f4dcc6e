//! Streams: owned asynchronous command queues and the shared null stream.
//!
//! A [`Stream`] wraps one native command queue bound to the device that was
//! current when it was created. [`Stream::null`] is the process-wide default
//! stream: shared, device-agnostic, never destroyed, and current whenever
//! nothing has been explicitly activated. Host callbacks scheduled with
//! [`Stream::add_callback`] run in FIFO order per stream, after all work
//! enqueued before them, on a dedicated dispatch thread.

mod dispatcher;
mod handle;

pub use dispatcher::StreamStats;
pub use handle::{Stream, StreamBuilder, StreamGuard};
