//! Fixed-size pool of device buffer sets shared by the pipeline stages.
//!
//! Slots are handed out from a FIFO free list. All slots always share one
//! allocation size; changing it waits until every other slot is back on the
//! free list and then reallocates the whole pool under the write lock.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use crate::device::{Context, DeviceBuffer, DeviceError, MemFlags};

/// Default number of buffer sets: one per pipeline stage.
pub const POOL_SIZE: usize = 3;

/// One pool slot: two input buffers and one output buffer of equal size.
#[derive(Debug, Clone)]
pub struct BufferSet {
    pub a: DeviceBuffer,
    pub b: DeviceBuffer,
    pub c: DeviceBuffer,
}

impl BufferSet {
    fn allocate(context: &Context, size_bytes: usize) -> Result<Self, DeviceError> {
        Ok(Self {
            a: context.create_buffer(size_bytes, MemFlags::ReadOnly)?,
            b: context.create_buffer(size_bytes, MemFlags::ReadOnly)?,
            c: context.create_buffer(size_bytes, MemFlags::WriteOnly)?,
        })
    }
}

struct PoolState {
    free: VecDeque<usize>,
    held: Vec<bool>,
    /// Per-buffer byte size of the current allocation, `None` before the
    /// first resize or after a failed one.
    allocated_bytes: Option<usize>,
}

pub struct BufferPool {
    context: Context,
    size: usize,
    slots: RwLock<Vec<Option<BufferSet>>>,
    state: Mutex<PoolState>,
    available: Condvar,
    drained: Condvar,
}

impl BufferPool {
    /// Create a pool of `size` slots. No device memory is allocated until the
    /// first [`ensure_capacity`](Self::ensure_capacity).
    pub fn new(context: &Context, size: usize) -> Self {
        let size = size.max(1);
        Self {
            context: context.clone(),
            size,
            slots: RwLock::new(vec![None; size]),
            state: Mutex::new(PoolState {
                free: (0..size).collect(),
                held: vec![false; size],
                allocated_bytes: None,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Take a free slot, blocking until one is released.
    pub fn acquire(&self) -> usize {
        let mut state = self.state.lock();
        loop {
            if let Some(idx) = state.free.pop_front() {
                state.held[idx] = true;
                return idx;
            }
            self.available.wait(&mut state);
        }
    }

    /// Return a slot taken with [`acquire`](Self::acquire).
    pub fn release(&self, idx: usize) {
        let mut state = self.state.lock();
        debug_assert!(
            state.held.get(idx).copied().unwrap_or(false),
            "release of buffer slot {} which is not held",
            idx
        );
        match state.held.get_mut(idx) {
            Some(held) if *held => *held = false,
            _ => return,
        }
        state.free.push_back(idx);
        self.available.notify_one();
        self.drained.notify_all();
    }

    /// Make every slot `required_bytes` per buffer.
    ///
    /// `held` is the slot owned by the caller. When the size changes, the call
    /// blocks until all other slots have been released so no task of the old
    /// size is still using its buffers.
    pub fn ensure_capacity(&self, required_bytes: usize, held: usize) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.allocated_bytes == Some(required_bytes) {
            return Ok(());
        }

        while state
            .held
            .iter()
            .enumerate()
            .any(|(idx, in_use)| *in_use && idx != held)
        {
            debug!(required_bytes, "waiting for in-flight tasks before resize");
            self.drained.wait(&mut state);
        }

        let mut slots = self.slots.write();
        // Old allocations go back to the device before the new ones are made.
        slots.iter_mut().for_each(|slot| *slot = None);
        state.allocated_bytes = None;

        for (idx, slot) in slots.iter_mut().enumerate() {
            *slot = Some(BufferSet::allocate(&self.context, required_bytes).map_err(|e| {
                debug!(slot = idx, error = %e, "buffer set allocation failed");
                e
            })?);
        }
        state.allocated_bytes = Some(required_bytes);

        info!(
            slots = self.size,
            bytes_per_buffer = required_bytes,
            device_bytes = self.context.memory_in_use(),
            "buffer pool allocated"
        );
        Ok(())
    }

    /// The buffers of slot `idx`.
    pub fn buffer_set(&self, idx: usize) -> Result<BufferSet, DeviceError> {
        self.slots
            .read()
            .get(idx)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| DeviceError::InvalidBuffer(format!("buffer slot {} is not allocated", idx)))
    }

    pub fn allocated_bytes(&self) -> Option<usize> {
        self.state.lock().allocated_bytes
    }

    /// Number of slots currently on the free list.
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferPool")
            .field("size", &self.size)
            .field("free", &state.free)
            .field("allocated_bytes", &state.allocated_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::{DeviceKind, Platform};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn context(mem: usize) -> Context {
        let config = DeviceConfig {
            global_mem_bytes: mem,
            ..DeviceConfig::default()
        };
        let device = Platform::new(&config).device(DeviceKind::Gpu).unwrap();
        Context::create(&device).unwrap()
    }

    #[test]
    fn test_acquire_hands_out_distinct_slots() {
        let pool = BufferPool::new(&context(1 << 20), POOL_SIZE);
        let mut got: Vec<usize> = (0..POOL_SIZE).map(|_| pool.acquire()).collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = Arc::new(BufferPool::new(&context(1 << 20), 1));
        let first = pool.acquire();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        pool.release(first);
        assert_eq!(waiter.join().unwrap(), first);
    }

    #[test]
    fn test_ensure_capacity_allocates_all_slots_once() {
        let ctx = context(1 << 20);
        let pool = BufferPool::new(&ctx, POOL_SIZE);
        let idx = pool.acquire();

        pool.ensure_capacity(64, idx).unwrap();
        assert_eq!(pool.allocated_bytes(), Some(64));
        assert_eq!(ctx.memory_in_use(), 64 * 3 * POOL_SIZE);

        // Same size is a no-op: buffer identity is preserved.
        let before = pool.buffer_set(idx).unwrap().a.id();
        pool.ensure_capacity(64, idx).unwrap();
        assert_eq!(pool.buffer_set(idx).unwrap().a.id(), before);

        pool.ensure_capacity(128, idx).unwrap();
        assert_eq!(ctx.memory_in_use(), 128 * 3 * POOL_SIZE);
        assert_ne!(pool.buffer_set(idx).unwrap().a.id(), before);
    }

    #[test]
    fn test_resize_waits_for_other_slots() {
        let pool = Arc::new(BufferPool::new(&context(1 << 20), POOL_SIZE));
        let mine = pool.acquire();
        pool.ensure_capacity(32, mine).unwrap();
        let other = pool.acquire();

        let resizer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.ensure_capacity(64, mine))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!resizer.is_finished());
        assert_eq!(pool.allocated_bytes(), Some(32));

        pool.release(other);
        resizer.join().unwrap().unwrap();
        assert_eq!(pool.allocated_bytes(), Some(64));
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let pool = BufferPool::new(&context(1000), POOL_SIZE);
        let idx = pool.acquire();
        let err = pool.ensure_capacity(400, idx).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { .. }));
        assert_eq!(pool.allocated_bytes(), None);
        assert!(pool.buffer_set(idx).is_err());
    }

    #[test]
    fn test_unallocated_slot_is_an_error() {
        let pool = BufferPool::new(&context(1 << 20), POOL_SIZE);
        assert!(pool.buffer_set(0).is_err());
        assert!(pool.buffer_set(7).is_err());
    }
}
