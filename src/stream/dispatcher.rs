//! Per-stream callback dispatch.
//!
//! Each stream owns one dispatcher: a FIFO of pending callbacks serialized
//! by a monotonic sequence counter, drained by a dedicated dispatch thread.
//! A callback becomes runnable only once the native queue reports that all
//! work enqueued before it has completed; the dispatch thread then invokes
//! callbacks strictly in submission order. A panicking callback is captured
//! and reported at the next synchronize without stopping later callbacks.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::error::Result;
use crate::provider::{CompletionStatus, QueueHandle, QueueProvider};

/// A callback with its stream reference and payload already applied.
pub(crate) type CallbackJob = Box<dyn FnOnce(CompletionStatus) + Send + 'static>;

/// Dispatch counters for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Callbacks accepted for dispatch.
    pub scheduled: u64,
    /// Callbacks that ran, including failed ones.
    pub completed: u64,
    /// Callbacks that panicked.
    pub failed: u64,
}

struct PendingCallback {
    seq: u64,
    job: CallbackJob,
}

struct DispatchState {
    /// Callbacks awaiting their completion notification, in sequence order.
    pending: VecDeque<PendingCallback>,
    /// Completion notifications from the native queue not yet consumed.
    ready: VecDeque<CompletionStatus>,
    next_seq: u64,
    executed: u64,
    failures: Vec<String>,
    shutdown: bool,
}

struct DispatchShared {
    /// Raw queue handle, for log context.
    queue: u64,
    state: Mutex<DispatchState>,
    progress: Condvar,
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl DispatchShared {
    /// Called by the native queue once all work before a callback is done.
    fn notify(&self, status: CompletionStatus) {
        let mut state = self.state.lock();
        state.ready.push_back(status);
        self.progress.notify_all();
    }

    fn run(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown && state.pending.is_empty() {
                        return;
                    }
                    if !state.pending.is_empty() && !state.ready.is_empty() {
                        break;
                    }
                    self.progress.wait(&mut state);
                }
                (state.pending.pop_front(), state.ready.pop_front())
            };
            if let (Some(callback), Some(status)) = next {
                self.invoke(callback, status);
            }
        }
    }

    fn invoke(&self, callback: PendingCallback, status: CompletionStatus) {
        let PendingCallback { seq, job } = callback;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(status)));
        self.completed.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        state.executed = seq + 1;
        if let Err(payload) = outcome {
            let message = panic_message(payload);
            error!(seq, queue = self.queue, message = %message, "stream callback panicked");
            self.failed.fetch_add(1, Ordering::Relaxed);
            state.failures.push(message);
        }
        self.progress.notify_all();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "callback panicked".to_string(),
        },
    }
}

/// FIFO callback dispatcher for one stream.
pub(crate) struct CallbackDispatcher {
    shared: Arc<DispatchShared>,
}

impl CallbackDispatcher {
    /// Spawns the dispatch thread for the given queue.
    pub(crate) fn spawn(queue: u64) -> Self {
        let shared = Arc::new(DispatchShared {
            queue,
            state: Mutex::new(DispatchState {
                pending: VecDeque::new(),
                ready: VecDeque::new(),
                next_seq: 0,
                executed: 0,
                failures: Vec::new(),
                shutdown: false,
            }),
            progress: Condvar::new(),
            scheduled: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        std::thread::Builder::new()
            .name(format!("curstream-cb{queue}"))
            .spawn(move || worker.run())
            .expect("failed to spawn callback dispatch thread");

        Self { shared }
    }

    /// Enrolls a callback and enqueues its completion notifier on the
    /// native queue. Returns the callback's sequence number.
    pub(crate) fn schedule(
        &self,
        queues: &Arc<dyn QueueProvider>,
        handle: QueueHandle,
        job: CallbackJob,
    ) -> Result<u64> {
        let notifier = Arc::clone(&self.shared);
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.pending.push_back(PendingCallback { seq, job });

        // Enqueue the notifier while holding the lock so the native
        // notification order matches the pending order.
        if let Err(e) =
            queues.enqueue_callback(handle, Box::new(move |status| notifier.notify(status)))
        {
            state.pending.pop_back();
            return Err(e);
        }

        state.next_seq = seq + 1;
        self.shared.scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    /// Sequence number the next scheduled callback would get. Everything
    /// below this is covered by a drain up to this watermark.
    pub(crate) fn watermark(&self) -> u64 {
        self.shared.state.lock().next_seq
    }

    /// Blocks until all callbacks below `watermark` have executed.
    pub(crate) fn wait_drained(&self, watermark: u64) {
        let mut state = self.shared.state.lock();
        while state.executed < watermark && !state.shutdown {
            self.shared.progress.wait(&mut state);
        }
    }

    /// True when every scheduled callback has executed.
    pub(crate) fn is_drained(&self) -> bool {
        let state = self.shared.state.lock();
        state.executed == state.next_seq
    }

    /// Takes the captured callback failures, clearing them.
    pub(crate) fn take_failures(&self) -> Vec<String> {
        std::mem::take(&mut self.shared.state.lock().failures)
    }

    /// Stops the dispatch thread once its pending work is done.
    pub(crate) fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.progress.notify_all();
    }

    /// Returns a snapshot of the dispatch counters.
    pub(crate) fn stats(&self) -> StreamStats {
        StreamStats {
            scheduled: self.shared.scheduled.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostProviderConfig, HostQueueProvider};

    fn test_provider() -> Arc<dyn QueueProvider> {
        Arc::new(HostQueueProvider::new(HostProviderConfig::default()))
    }

    #[test]
    fn test_callbacks_release_in_sequence_order() {
        let queues = test_provider();
        let handle = queues.create(0, false).unwrap();
        let dispatcher = CallbackDispatcher::spawn(handle.raw());

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50u64 {
            let order = Arc::clone(&order);
            let seq = dispatcher
                .schedule(&queues, handle, Box::new(move |_| order.lock().push(i)))
                .unwrap();
            assert_eq!(seq, i);
        }

        queues.block_until_idle(handle).unwrap();
        dispatcher.wait_drained(50);
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
        assert!(dispatcher.is_drained());
        queues.destroy(handle).unwrap();
    }

    #[test]
    fn test_panic_is_captured_and_later_callbacks_run() {
        let queues = test_provider();
        let handle = queues.create(0, false).unwrap();
        let dispatcher = CallbackDispatcher::spawn(handle.raw());

        let ran = Arc::new(Mutex::new(false));
        dispatcher
            .schedule(&queues, handle, Box::new(|_| panic!("boom")))
            .unwrap();
        let ran_clone = Arc::clone(&ran);
        dispatcher
            .schedule(&queues, handle, Box::new(move |_| *ran_clone.lock() = true))
            .unwrap();

        queues.block_until_idle(handle).unwrap();
        dispatcher.wait_drained(2);

        assert!(*ran.lock());
        let failures = dispatcher.take_failures();
        assert_eq!(failures, vec!["boom".to_string()]);
        assert!(dispatcher.take_failures().is_empty());

        let stats = dispatcher.stats();
        assert_eq!(stats.scheduled, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        queues.destroy(handle).unwrap();
    }

    #[test]
    fn test_drain_with_nothing_scheduled() {
        let dispatcher = CallbackDispatcher::spawn(0);
        dispatcher.wait_drained(0);
        assert!(dispatcher.is_drained());
        assert_eq!(dispatcher.stats(), StreamStats::default());
    }
}
