//! # curstream
//!
//! Host-side device/stream currency model for asynchronous accelerator
//! queues.
//!
//! The crate answers one question deterministically on every host thread:
//! *which device and which stream executes the next enqueued operation?*
//! Devices and streams are activated either scoped (RAII guards that push
//! on construction and pop on drop, exception-safe and nestable) or
//! unscoped ([`Device::make_current`] / [`Stream::make_current`]). Each
//! thread carries its own stacks; nothing is shared between threads except
//! the streams themselves.
//!
//! Native queue operations go through the [`QueueProvider`] seam. By
//! default an in-process simulation ([`HostQueueProvider`]) is used, where
//! each queue is a worker thread draining a FIFO of jobs.
//!
//! ## Example
//!
//! ```
//! use curstream::{get_current_stream, Stream};
//!
//! # fn main() -> curstream::Result<()> {
//! let stream = Stream::new()?;
//! {
//!     let _scope = stream.activate()?;
//!     assert_eq!(get_current_stream()?, stream);
//!     stream.add_callback(|_, _, tag| println!("done: {tag}"), 7)?;
//! }
//! stream.synchronize()?;
//! assert!(get_current_stream()?.is_null());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod context;
mod device;
mod error;
pub mod host;
mod provider;
mod stream;

pub use context::get_current_stream;
pub use device::{current_device, Device, DeviceGuard, DeviceId};
pub use error::{Result, StreamError};
pub use host::{HostProviderConfig, HostProviderConfigBuilder, HostQueueProvider};
pub use provider::{
    install_provider, provider, CompletionStatus, NativeCallback, QueueHandle, QueueProvider,
};
pub use stream::{Stream, StreamBuilder, StreamGuard, StreamStats};
