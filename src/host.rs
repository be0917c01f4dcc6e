//! In-process queue provider.
//!
//! Simulates asynchronous device queues on the host: each queue is a worker
//! thread draining a FIFO of jobs, so enqueued callbacks run off the caller's
//! thread in submission order, exactly like a native command queue with only
//! host-visible work on it. This is the process default provider and the
//! backend for all tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::device::DeviceId;
use crate::error::{Result, StreamError};
use crate::provider::{CompletionStatus, NativeCallback, QueueHandle, QueueProvider};

/// Configuration for the host queue provider.
#[derive(Debug, Clone)]
pub struct HostProviderConfig {
    /// Number of simulated devices.
    pub device_count: usize,
    /// Artificial delay applied before each callback fires, to widen the
    /// window between enqueue and completion.
    pub callback_latency: Option<Duration>,
}

impl Default for HostProviderConfig {
    fn default() -> Self {
        Self {
            device_count: 4,
            callback_latency: None,
        }
    }
}

impl HostProviderConfig {
    /// Creates a single-device configuration.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            device_count: 1,
            callback_latency: None,
        }
    }
}

/// Builder for [`HostProviderConfig`].
#[derive(Debug, Default)]
pub struct HostProviderConfigBuilder {
    config: HostProviderConfig,
}

impl HostProviderConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of simulated devices.
    #[must_use]
    pub fn with_device_count(mut self, count: usize) -> Self {
        self.config.device_count = count;
        self
    }

    /// Sets the artificial callback latency.
    #[must_use]
    pub fn with_callback_latency(mut self, latency: Duration) -> Self {
        self.config.callback_latency = Some(latency);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> HostProviderConfig {
        self.config
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    jobs: VecDeque<Job>,
    /// False once the queue is released; the worker drains what is left
    /// and exits.
    open: bool,
    /// True while the worker is executing a job.
    running: bool,
    /// Jobs accepted so far.
    enqueued: u64,
    /// Jobs fully finished, bumped only after `running` is cleared.
    completed: u64,
}

/// One simulated command queue: a FIFO of jobs drained by a dedicated
/// worker thread.
struct HostQueue {
    handle: QueueHandle,
    device: DeviceId,
    state: Mutex<QueueState>,
    work_available: Condvar,
    job_done: Condvar,
}

impl HostQueue {
    fn spawn(handle: QueueHandle, device: DeviceId) -> Arc<Self> {
        let queue = Arc::new(Self {
            handle,
            device,
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                open: true,
                running: false,
                enqueued: 0,
                completed: 0,
            }),
            work_available: Condvar::new(),
            job_done: Condvar::new(),
        });

        let worker = Arc::clone(&queue);
        std::thread::Builder::new()
            .name(format!("curstream-q{}", handle.raw()))
            .spawn(move || worker.run())
            .expect("failed to spawn queue worker thread");

        queue
    }

    fn run(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        state.running = true;
                        break Some(job);
                    }
                    if !state.open {
                        break None;
                    }
                    self.work_available.wait(&mut state);
                }
            };

            match job {
                Some(job) => {
                    job();
                    let mut state = self.state.lock();
                    state.running = false;
                    state.completed += 1;
                    self.job_done.notify_all();
                }
                None => return,
            }
        }
    }

    fn push(&self, job: Job) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(StreamError::Backend(format!(
                "queue {} already released",
                self.handle.raw()
            )));
        }
        state.jobs.push_back(job);
        state.enqueued += 1;
        self.work_available.notify_one();
        Ok(())
    }

    /// Waits until every job submitted before this call has fully
    /// finished. Jobs submitted afterwards are not waited on.
    fn fence(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(StreamError::Backend(format!(
                "queue {} already released",
                self.handle.raw()
            )));
        }
        let target = state.enqueued;
        while state.completed < target {
            self.job_done.wait(&mut state);
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.completed == state.enqueued
    }

    fn close(&self) {
        self.state.lock().open = false;
        self.work_available.notify_all();
    }
}

/// In-process [`QueueProvider`] backed by worker threads.
pub struct HostQueueProvider {
    config: HostProviderConfig,
    queues: Mutex<HashMap<u64, Arc<HostQueue>>>,
    default_queue: OnceLock<Arc<HostQueue>>,
    next_handle: AtomicU64,
}

impl HostQueueProvider {
    /// Creates a provider with the given configuration.
    #[must_use]
    pub fn new(config: HostProviderConfig) -> Self {
        info!(
            device_count = config.device_count,
            "initializing host queue provider"
        );
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
            default_queue: OnceLock::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Returns the provider configuration.
    pub fn config(&self) -> &HostProviderConfig {
        &self.config
    }

    fn queue(&self, handle: QueueHandle) -> Result<Arc<HostQueue>> {
        if handle.is_default() {
            // The shared default queue lives for the whole process.
            let queue = self
                .default_queue
                .get_or_init(|| HostQueue::spawn(QueueHandle::DEFAULT, 0));
            return Ok(Arc::clone(queue));
        }
        self.queues
            .lock()
            .get(&handle.raw())
            .cloned()
            .ok_or_else(|| StreamError::Backend(format!("unknown queue handle {}", handle.raw())))
    }
}

impl Default for HostQueueProvider {
    fn default() -> Self {
        Self::new(HostProviderConfig::default())
    }
}

impl QueueProvider for HostQueueProvider {
    fn create(&self, device: DeviceId, non_blocking: bool) -> Result<QueueHandle> {
        if device >= self.config.device_count {
            return Err(StreamError::InvalidDevice {
                ordinal: device,
                count: self.config.device_count,
            });
        }

        let handle = QueueHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let queue = HostQueue::spawn(handle, device);
        self.queues.lock().insert(handle.raw(), queue);

        debug!(
            handle = handle.raw(),
            device, non_blocking, "created host queue"
        );
        Ok(handle)
    }

    fn destroy(&self, handle: QueueHandle) -> Result<()> {
        if handle.is_default() {
            return Err(StreamError::Backend(
                "the default queue cannot be destroyed".into(),
            ));
        }
        let queue = self
            .queues
            .lock()
            .remove(&handle.raw())
            .ok_or_else(|| StreamError::Backend(format!("unknown queue handle {}", handle.raw())))?;
        queue.close();
        debug!(handle = handle.raw(), "destroyed host queue");
        Ok(())
    }

    fn enqueue_callback(&self, handle: QueueHandle, callback: NativeCallback) -> Result<()> {
        let queue = self.queue(handle)?;
        let latency = self.config.callback_latency;
        queue.push(Box::new(move || {
            if let Some(delay) = latency {
                std::thread::sleep(delay);
            }
            callback(CompletionStatus::Success);
        }))
    }

    fn block_until_idle(&self, handle: QueueHandle) -> Result<()> {
        self.queue(handle)?.fence()
    }

    fn is_idle(&self, handle: QueueHandle) -> Result<bool> {
        Ok(self.queue(handle)?.is_idle())
    }

    fn device_of(&self, handle: QueueHandle) -> Result<DeviceId> {
        Ok(self.queue(handle)?.device)
    }

    fn device_count(&self) -> usize {
        self.config.device_count
    }

    fn set_device(&self, device: DeviceId) -> Result<()> {
        if device >= self.config.device_count {
            return Err(StreamError::InvalidDevice {
                ordinal: device,
                count: self.config.device_count,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_config_builder() {
        let config = HostProviderConfigBuilder::new()
            .with_device_count(2)
            .with_callback_latency(Duration::from_millis(1))
            .build();
        assert_eq!(config.device_count, 2);
        assert_eq!(config.callback_latency, Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_create_rejects_invalid_device() {
        let provider = HostQueueProvider::new(HostProviderConfig::minimal());
        match provider.create(1, false) {
            Err(StreamError::InvalidDevice { ordinal: 1, count: 1 }) => {}
            other => panic!("expected InvalidDevice, got {other:?}"),
        }
    }

    #[test]
    fn test_callbacks_run_in_fifo_order() {
        let provider = HostQueueProvider::default();
        let handle = provider.create(0, false).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = Arc::clone(&order);
            provider
                .enqueue_callback(
                    handle,
                    Box::new(move |status| {
                        assert_eq!(status, CompletionStatus::Success);
                        order.lock().push(i);
                    }),
                )
                .unwrap();
        }

        provider.block_until_idle(handle).unwrap();
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
        assert!(provider.is_idle(handle).unwrap());
        provider.destroy(handle).unwrap();
    }

    #[test]
    fn test_destroy_drains_remaining_work() {
        let provider = HostQueueProvider::default();
        let handle = provider.create(0, false).unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            provider
                .enqueue_callback(handle, Box::new(move |_| tx.send(i).unwrap()))
                .unwrap();
        }
        provider.destroy(handle).unwrap();

        // Work enqueued before destroy still completes.
        for i in 0..3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
        }

        // The handle is gone afterwards.
        assert!(provider.block_until_idle(handle).is_err());
        assert!(provider.destroy(handle).is_err());
    }

    #[test]
    fn test_idle_immediately_after_block_until_idle() {
        let provider = HostQueueProvider::default();
        let handle = provider.create(0, false).unwrap();

        // block_until_idle must not return while the worker is still
        // inside (or winding down) the last job.
        for _ in 0..200 {
            provider
                .enqueue_callback(handle, Box::new(|_| {}))
                .unwrap();
            provider.block_until_idle(handle).unwrap();
            assert!(provider.is_idle(handle).unwrap());
        }
        provider.destroy(handle).unwrap();
    }

    #[test]
    fn test_default_queue_shared_and_indestructible() {
        let provider = HostQueueProvider::default();
        assert_eq!(provider.device_of(QueueHandle::DEFAULT).unwrap(), 0);
        provider.block_until_idle(QueueHandle::DEFAULT).unwrap();
        assert!(provider.destroy(QueueHandle::DEFAULT).is_err());
    }

    #[test]
    fn test_device_of_reports_binding() {
        let provider = HostQueueProvider::default();
        let handle = provider.create(2, true).unwrap();
        assert_eq!(provider.device_of(handle).unwrap(), 2);
        provider.destroy(handle).unwrap();
    }

    #[test]
    fn test_set_device_validates_ordinal() {
        let provider = HostQueueProvider::default();
        provider.set_device(3).unwrap();
        assert!(provider.set_device(4).is_err());
    }
}
