//! Accelerator device currency.
//!
//! A [`Device`] is a plain value naming one device ordinal. Activating it
//! makes it the calling thread's current device and the active native
//! execution context, either scoped through [`Device::activate`] or
//! unscoped through [`Device::make_current`]. Ordinals are validated at
//! first activation, not at construction.

use std::marker::PhantomData;

use tracing::{debug, warn};

use crate::context;
use crate::error::Result;
use crate::provider::provider;

/// Device ordinal.
pub type DeviceId = usize;

/// Returns the calling thread's current device, defaulting to device 0.
#[must_use]
pub fn current_device() -> DeviceId {
    context::device_top().unwrap_or(0)
}

/// One accelerator device, identified by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    id: DeviceId,
}

impl Device {
    /// Creates a device value. The ordinal is checked against the backend
    /// at first activation.
    #[must_use]
    pub fn new(id: DeviceId) -> Self {
        Self { id }
    }

    /// Creates a device value for the calling thread's current device.
    #[must_use]
    pub fn current() -> Self {
        Self {
            id: current_device(),
        }
    }

    /// Returns the device ordinal.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Pushes this device as current for the calling thread and makes it
    /// the active native context. The returned guard pops back to the
    /// previous device when dropped, on every exit path.
    pub fn activate(&self) -> Result<DeviceGuard> {
        provider().set_device(self.id)?;
        context::push_device(self.id);
        debug!(device = self.id, "device scope entered");
        Ok(DeviceGuard {
            _not_send: PhantomData,
        })
    }

    /// Makes this device current for the calling thread without scoping.
    /// It stays current until another activation changes it.
    pub fn make_current(&self) -> Result<()> {
        provider().set_device(self.id)?;
        context::set_device_top(self.id);
        Ok(())
    }
}

/// Scope guard for an active device; pops the device stack on drop.
#[derive(Debug)]
#[must_use = "the device stays current only while the guard is alive"]
pub struct DeviceGuard {
    // Currency stacks are per-thread; the guard must drop on the thread
    // that created it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        let restored = context::pop_device().unwrap_or(0);
        debug!(device = restored, "device scope exited");
        if let Err(e) = provider().set_device(restored) {
            warn!(device = restored, error = %e, "failed to restore device context");
        }
    }
}
