use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use super::DeviceError;

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Access mode a buffer was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFlags {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Byte accounting for one context's device memory.
#[derive(Debug)]
pub(crate) struct MemoryLedger {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryLedger {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub(crate) fn reserve(&self, bytes: usize) -> Result<(), DeviceError> {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let available = self.limit.saturating_sub(used);
            if bytes > available {
                return Err(DeviceError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
            match self.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => used = current,
            }
        }
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

/// A device memory allocation holding `i32` elements.
///
/// Cloning retains the same allocation; the memory goes back to the context
/// when the last clone is dropped.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    id: u64,
    flags: MemFlags,
    size_bytes: usize,
    data: Mutex<Vec<i32>>,
    ledger: Arc<MemoryLedger>,
}

impl DeviceBuffer {
    pub(crate) fn allocate(
        ledger: &Arc<MemoryLedger>,
        size_bytes: usize,
        flags: MemFlags,
    ) -> Result<Self, DeviceError> {
        ledger.reserve(size_bytes)?;
        let elements = size_bytes.div_ceil(std::mem::size_of::<i32>());
        let id = BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        trace!(buffer_id = id, size_bytes, ?flags, "device buffer allocated");

        Ok(Self {
            inner: Arc::new(BufferInner {
                id,
                flags,
                size_bytes,
                data: Mutex::new(vec![0; elements]),
                ledger: Arc::clone(ledger),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn flags(&self) -> MemFlags {
        self.inner.flags
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.size_bytes
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.inner.size_bytes.div_ceil(std::mem::size_of::<i32>())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `src` into the start of the buffer.
    pub(crate) fn write(&self, src: &[i32]) -> Result<(), DeviceError> {
        let mut data = self.inner.data.lock();
        let dst = data.get_mut(..src.len()).ok_or_else(|| {
            DeviceError::InvalidBuffer(format!(
                "write of {} elements into buffer {} of {} elements",
                src.len(),
                self.inner.id,
                self.len()
            ))
        })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Copy the first `len` elements out of the buffer.
    pub(crate) fn read(&self, len: usize) -> Result<Vec<i32>, DeviceError> {
        let data = self.inner.data.lock();
        data.get(..len).map(|s| s.to_vec()).ok_or_else(|| {
            DeviceError::InvalidBuffer(format!(
                "read of {} elements from buffer {} of {} elements",
                len,
                self.inner.id,
                self.len()
            ))
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<i32>> {
        self.inner.data.lock()
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.inner.id)
            .field("flags", &self.inner.flags)
            .field("size_bytes", &self.inner.size_bytes)
            .finish()
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.ledger.release(self.size_bytes);
        trace!(buffer_id = self.id, size_bytes = self.size_bytes, "device buffer released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_accounted_and_released_once() {
        let ledger = Arc::new(MemoryLedger::new(1024));
        let buf = DeviceBuffer::allocate(&ledger, 400, MemFlags::ReadWrite).unwrap();
        let clone = buf.clone();
        assert_eq!(ledger.used(), 400);

        drop(buf);
        assert_eq!(ledger.used(), 400);
        drop(clone);
        assert_eq!(ledger.used(), 0);
    }

    #[test]
    fn test_allocation_beyond_limit_fails() {
        let ledger = Arc::new(MemoryLedger::new(100));
        let _held = DeviceBuffer::allocate(&ledger, 80, MemFlags::ReadOnly).unwrap();
        let err = DeviceBuffer::allocate(&ledger, 40, MemFlags::ReadOnly).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::OutOfMemory { requested: 40, available: 20 }
        ));
    }

    #[test]
    fn test_write_then_read_prefix() {
        let ledger = Arc::new(MemoryLedger::new(1024));
        let buf = DeviceBuffer::allocate(&ledger, 32, MemFlags::ReadWrite).unwrap();
        assert_eq!(buf.len(), 8);

        buf.write(&[1, 2, 3]).unwrap();
        assert_eq!(buf.read(3).unwrap(), vec![1, 2, 3]);
        assert!(buf.write(&[0; 9]).is_err());
        assert!(buf.read(9).is_err());
    }
}
