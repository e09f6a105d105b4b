//! Fixed-block memory pools.
//!
//! The teacher has no allocator of any kind (`r3_kernel` only ever hands out
//! statically-sized, statically-placed kernel objects), so this module is
//! grounded directly on spec.md §4.6 plus the fixed-block-pool idiom common
//! to the retrieval pack's other embedded-allocator examples: one
//! contiguous backing buffer sliced into equal blocks, threaded into a
//! singly-linked free list by writing a "next" pointer into each free
//! block's own first machine word (no separate free-list storage, so
//! allocating from or returning to the pool never touches the heap).
//!
//! Blocking follows the same shape as every other primitive here: waiting
//! allocators queue on a [`crate::wait::WaitList`] and retry under
//! [`crate::wait::wait_until`] each time a block is freed.
use core::{mem, ptr::NonNull};

use alloc::{
    alloc::{alloc, Layout},
    boxed::Box,
};

use crate::{
    clock::{Duration, Time},
    error::{Error, Result},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    scheduler,
    wait::{self, WaitList},
};

/// A pool of `block_count` fixed-size blocks of `block_size` bytes each.
pub struct MemoryPool {
    storage: NonNull<u8>,
    block_size: usize,
    block_count: usize,
    layout: Layout,
    free_head: CpuLockCell<Option<NonNull<u8>>>,
    /// Number of blocks currently allocated (spec.md §3's "blocks allocated
    /// count"). Kept alongside `free_head` rather than derived from it so
    /// [`Self::allocated`] doesn't need to walk the free list.
    allocated: CpuLockCell<usize>,
    wait_list: WaitList,
}

unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    /// Create a pool of `block_count` blocks, each `block_size` bytes,
    /// aligned to `align` (which must be a power of two). `block_size` must
    /// be at least `size_of::<usize>()`, since a free block's first word
    /// doubles as the free-list's "next" pointer.
    pub fn new(block_count: usize, block_size: usize, align: usize) -> Result<&'static Self> {
        if block_count == 0
            || block_size < mem::size_of::<usize>()
            || !align.is_power_of_two()
            || align < mem::align_of::<usize>()
        {
            return Err(Error::InvalidArgument);
        }
        let total = block_size
            .checked_mul(block_count)
            .ok_or(Error::InvalidArgument)?;
        let layout = Layout::from_size_align(total, align).map_err(|_| Error::InvalidArgument)?;

        // Safety: `layout` has nonzero size (`block_count >= 1` and
        // `block_size >= size_of::<usize>()`).
        let storage = NonNull::new(unsafe { alloc(layout) }).ok_or(Error::OutOfMemory)?;

        let pool = Box::leak(Box::new(Self {
            storage,
            block_size,
            block_count,
            layout,
            free_head: CpuLockCell::new(None),
            allocated: CpuLockCell::new(0),
            wait_list: WaitList::new(),
        }));

        // Thread every block onto the free list, last block first so the
        // list ends up in ascending address order (not load-bearing, just
        // predictable for tests).
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        for i in (0..pool.block_count).rev() {
            let block = unsafe { pool.storage.as_ptr().add(i * pool.block_size) };
            let block = NonNull::new(block).unwrap();
            let next = *pool.free_head.read(&token);
            unsafe { write_next(block, next) };
            *pool.free_head.write(&mut token) = Some(block);
        }
        drop(token);
        drop(lock);

        Ok(pool)
    }

    /// The fixed size of each block, in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The number of blocks in the pool.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// The layout of the pool's entire backing allocation.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The number of blocks currently allocated (not free).
    pub fn allocated(&'static self) -> Result<usize> {
        let mut lock = klock::lock_cpu()?;
        let token = lock.borrow_mut();
        Ok(*self.allocated.read(&token))
    }

    fn try_alloc_block(&self, token: &mut CpuLockTokenRefMut<'_>) -> Option<NonNull<u8>> {
        let head = self.free_head.write(token);
        let block = (*head)?;
        *head = unsafe { read_next(block) };
        *self.allocated.write(token) += 1;
        Some(block)
    }

    /// Block until a free block is available, then claim it.
    pub fn alloc(&'static self) -> Result<NonNull<u8>> {
        wait::wait_until(&self.wait_list, None, |token| self.try_alloc_block(token))
    }

    /// Non-blocking variant of [`Self::alloc`]. ISR-safe.
    pub fn try_alloc(&'static self) -> Result<NonNull<u8>> {
        wait::try_once(|token| self.try_alloc_block(token))
    }

    /// As [`Self::alloc`], but gives up and returns [`Error::Timeout`] if no
    /// block becomes free within `timeout`.
    pub fn timed_alloc(&'static self, timeout: Duration) -> Result<NonNull<u8>> {
        let deadline = crate::clock::now()
            .checked_add(timeout)
            .unwrap_or(Time(u64::MAX));
        wait::wait_until(&self.wait_list, Some(deadline), |token| {
            self.try_alloc_block(token)
        })
    }

    /// Return `block` to the pool and wake one waiting allocator, if any.
    /// ISR-safe. Returns [`Error::InvalidArgument`] if `block` does not lie
    /// within this pool's region at a block-aligned offset, without
    /// touching the free list.
    ///
    /// # Safety
    /// If `block` does belong to this pool, it must not already be freed
    /// (a double free is not caught by the `owns` check above).
    pub unsafe fn free(&'static self, block: NonNull<u8>) -> Result<()> {
        if !self.owns(block) {
            return Err(Error::InvalidArgument);
        }
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let head = self.free_head.write(&mut token);
        let prev_head = *head;
        unsafe { write_next(block, prev_head) };
        *head = Some(block);
        *self.allocated.write(&mut token) -= 1;
        wait::wake_one(&self.wait_list, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    fn owns(&self, block: NonNull<u8>) -> bool {
        let base = self.storage.as_ptr() as usize;
        let addr = block.as_ptr() as usize;
        addr >= base
            && (addr - base) < self.block_size * self.block_count
            && (addr - base) % self.block_size == 0
    }

    /// Rebuild the free list from scratch, reclaiming every block
    /// regardless of whether it was ever freed, and wake every waiter so
    /// each re-polls. Intended for recovering a pool after the threads that
    /// held its blocks have been torn down; spec.md §4.6 calls for this
    /// explicitly since, unlike a mutex, a leaked block has no owner to
    /// abandon it automatically.
    pub fn reset(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        *self.free_head.write(&mut token) = None;
        for i in (0..self.block_count).rev() {
            let block = unsafe { self.storage.as_ptr().add(i * self.block_size) };
            let block = NonNull::new(block).unwrap();
            let next = *self.free_head.read(&token);
            unsafe { write_next(block, next) };
            *self.free_head.write(&mut token) = Some(block);
        }
        *self.allocated.write(&mut token) = 0;
        wait::wake_all(&self.wait_list, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// # Safety
/// `block` must point to a valid, writable region of at least
/// `size_of::<usize>()` bytes.
unsafe fn write_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
    let raw = next.map_or(0usize, |p| p.as_ptr() as usize);
    unsafe { block.as_ptr().cast::<usize>().write_unaligned(raw) };
}

/// # Safety
/// `block` must point to a valid, readable region of at least
/// `size_of::<usize>()` bytes, previously written by [`write_next`].
unsafe fn read_next(block: NonNull<u8>) -> Option<NonNull<u8>> {
    let raw = unsafe { block.as_ptr().cast::<usize>().read_unaligned() };
    NonNull::new(raw as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_block_smaller_than_a_pointer() {
        assert!(MemoryPool::new(4, 1, 1).is_err());
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        assert!(MemoryPool::new(4, 16, 3).is_err());
    }

    #[test]
    fn free_list_threading_round_trips() {
        let mut buf = [0u8; 32];
        let a = NonNull::new(buf.as_mut_ptr()).unwrap();
        let b = NonNull::new(unsafe { buf.as_mut_ptr().add(16) }).unwrap();
        unsafe {
            write_next(a, Some(b));
            write_next(b, None);
            assert_eq!(read_next(a), Some(b));
            assert_eq!(read_next(b), None);
        }
    }
}
