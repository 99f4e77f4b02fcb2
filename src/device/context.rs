use std::sync::Arc;

use tracing::{debug, info};

use super::memory::{DeviceBuffer, MemFlags, MemoryLedger};
use super::{DeviceError, DeviceInfo};

/// Compute context bound to a single device. Owns the device memory budget.
///
/// Cheap to clone; the context is released when the last clone (including the
/// ones held by buffers' ledgers) goes away.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    device: DeviceInfo,
    ledger: Arc<MemoryLedger>,
}

impl Context {
    pub fn create(device: &DeviceInfo) -> Result<Self, DeviceError> {
        if device.global_mem_bytes == 0 {
            return Err(DeviceError::Creation {
                what: "context",
                reason: format!("device '{}' reports no global memory", device.name),
            });
        }

        info!(device = %device.name, kind = %device.kind, "compute context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                device: device.clone(),
                ledger: Arc::new(MemoryLedger::new(device.global_mem_bytes)),
            }),
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.inner.device
    }

    pub fn create_buffer(&self, size_bytes: usize, flags: MemFlags) -> Result<DeviceBuffer, DeviceError> {
        DeviceBuffer::allocate(&self.inner.ledger, size_bytes, flags)
    }

    /// Bytes currently allocated on the device.
    pub fn memory_in_use(&self) -> usize {
        self.inner.ledger.used()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.inner.device.name)
            .field("memory_in_use", &self.memory_in_use())
            .finish()
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        debug!(device = %self.device.name, "compute context released");
    }
}
