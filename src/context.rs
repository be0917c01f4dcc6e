//! Per-thread currency stacks.
//!
//! Each host thread carries its own device stack and, per device, a stack of
//! current streams. The stacks live in a process-wide registry keyed by
//! thread id and are initialized lazily: a thread that never pushed anything
//! sees device 0 and the null stream. Entries are reclaimed when the owning
//! thread exits.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::device::DeviceId;
use crate::error::{Result, StreamError};
use crate::provider::provider;
use crate::stream::Stream;

#[derive(Default)]
struct ThreadState {
    device_stack: Vec<DeviceId>,
    /// Current-stream stack per device; an absent or empty stack means the
    /// null stream is current on that device.
    stream_stacks: HashMap<DeviceId, Vec<Stream>>,
}

static REGISTRY: OnceLock<Mutex<HashMap<ThreadId, ThreadState>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<ThreadId, ThreadState>> {
    REGISTRY.get_or_init(Default::default)
}

/// Removes this thread's registry entry when the thread exits.
struct ExitGuard {
    id: ThreadId,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(map) = REGISTRY.get() {
            map.lock().remove(&self.id);
        }
    }
}

thread_local! {
    static EXIT_GUARD: ExitGuard = ExitGuard {
        id: thread::current().id(),
    };
}

fn with_state<R>(f: impl FnOnce(&mut ThreadState) -> R) -> R {
    EXIT_GUARD.with(|_| ());
    let mut map = registry().lock();
    let state = map.entry(thread::current().id()).or_default();
    f(state)
}

pub(crate) fn device_top() -> Option<DeviceId> {
    with_state(|state| state.device_stack.last().copied())
}

pub(crate) fn push_device(device: DeviceId) {
    with_state(|state| state.device_stack.push(device));
}

/// Pops the device stack and returns the device that becomes current.
pub(crate) fn pop_device() -> Option<DeviceId> {
    with_state(|state| {
        state.device_stack.pop();
        state.device_stack.last().copied()
    })
}

/// Replaces the current device without scoping (push if the stack is empty).
pub(crate) fn set_device_top(device: DeviceId) {
    with_state(|state| match state.device_stack.last_mut() {
        Some(top) => *top = device,
        None => state.device_stack.push(device),
    });
}

pub(crate) fn stream_top(device: DeviceId) -> Option<Stream> {
    with_state(|state| {
        state
            .stream_stacks
            .get(&device)
            .and_then(|stack| stack.last().cloned())
    })
}

pub(crate) fn push_stream(device: DeviceId, stream: Stream) {
    with_state(|state| {
        state
            .stream_stacks
            .entry(device)
            .or_default()
            .push(stream);
    });
}

pub(crate) fn pop_stream(device: DeviceId) {
    with_state(|state| {
        if let Some(stack) = state.stream_stacks.get_mut(&device) {
            stack.pop();
        }
    });
}

/// Replaces the current stream on a device without scoping.
pub(crate) fn set_stream_top(device: DeviceId, stream: Stream) {
    with_state(|state| {
        let stack = state.stream_stacks.entry(device).or_default();
        match stack.last_mut() {
            Some(top) => *top = stream,
            None => stack.push(stream),
        }
    });
}

/// Returns the current stream for the calling thread's current device.
///
/// Each device has an independent current-stream slot; a device whose slot
/// was never set defaults to the null stream. The null stream resolves on
/// every device; for any other stream the current device ordinal must be
/// resolvable by the backend, otherwise [`StreamError::DeviceState`] is
/// returned.
pub fn get_current_stream() -> Result<Stream> {
    let device = crate::device::current_device();
    match stream_top(device) {
        Some(stream) if !stream.is_null() => {
            let count = provider().device_count();
            if device >= count {
                return Err(StreamError::DeviceState(format!(
                    "device {device} is not resolvable (backend reports {count} devices)"
                )));
            }
            Ok(stream)
        }
        Some(stream) => Ok(stream),
        None => Ok(Stream::null().clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_stack_default_empty() {
        std::thread::spawn(|| {
            assert_eq!(device_top(), None);
            push_device(2);
            push_device(1);
            assert_eq!(device_top(), Some(1));
            assert_eq!(pop_device(), Some(2));
            assert_eq!(pop_device(), None);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_set_device_top_replaces() {
        std::thread::spawn(|| {
            set_device_top(3);
            assert_eq!(device_top(), Some(3));
            set_device_top(1);
            assert_eq!(device_top(), Some(1));
            assert_eq!(pop_device(), None);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_stream_slots_are_per_device() {
        std::thread::spawn(|| {
            let stream = Stream::null().clone();
            push_stream(0, stream);
            assert!(stream_top(0).is_some());
            assert!(stream_top(1).is_none());
            pop_stream(0);
            assert!(stream_top(0).is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_current_stream_defaults_to_null() {
        std::thread::spawn(|| {
            let stream = get_current_stream().unwrap();
            assert!(stream.is_null());
        })
        .join()
        .unwrap();
    }
}
