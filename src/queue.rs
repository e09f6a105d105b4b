//! Priority message queues.
//!
//! The teacher has no message-passing primitive at all, so this module is
//! grounded directly on spec.md §4.7. Every slot holds exactly `msg_size`
//! bytes; a `send` of fewer bytes zero-pads the remainder so a receiver
//! never observes a previous message's leftover bytes. Rather than thread a
//! free-list pointer through the message bytes themselves (which would
//! force every message at least pointer-sized, ruling out the spec's own
//! 4-byte-message test scenario), each slot's bookkeeping -- its link and
//! priority -- lives in a separate fixed array of [`Slot`] records, built
//! with the same [`crate::utils::intrusive_list`] machinery every other
//! wait/ready queue in this crate uses. The payload bytes are a plain flat
//! buffer, indexed by slot, untouched except by `copy_nonoverlapping`.
//!
//! A slot is in exactly one of two lists at a time -- the free list or the
//! priority-ordered occupied ring -- so both lists share one `Link` per
//! slot, the same sharing discipline [`crate::wait::WaitNode`] uses for a
//! thread's one wait attachment point.
use core::{cell::Cell, ptr::NonNull};

use alloc::{
    alloc::{alloc, Layout},
    boxed::Box,
};

use crate::{
    clock::{self, Duration, Time},
    error::{Error, Result},
    klock,
    scheduler,
    utils::intrusive_list::{Link, List, ListNode},
    wait::{self, WaitList},
};

struct Slot {
    link: Link<Slot>,
    priority: Cell<u8>,
    /// Byte offset of this slot's payload within the queue's backing
    /// buffer. Fixed at construction.
    offset: usize,
}

unsafe impl ListNode for Slot {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
}

/// A fixed-capacity queue of fixed-size messages, delivered in descending
/// priority order and FIFO among messages of equal priority.
pub struct MessageQueue {
    storage: NonNull<u8>,
    msg_size: usize,
    capacity: usize,
    layout: Layout,
    slots: Box<[Slot]>,
    free: List<Slot>,
    occupied: List<Slot>,
    send_wait: WaitList,
    recv_wait: WaitList,
}

unsafe impl Send for MessageQueue {}
unsafe impl Sync for MessageQueue {}

impl MessageQueue {
    /// Create a queue holding up to `capacity` messages of at most
    /// `msg_size` bytes each.
    pub fn new(capacity: usize, msg_size: usize) -> Result<&'static Self> {
        if capacity == 0 || msg_size == 0 {
            return Err(Error::InvalidArgument);
        }
        let total = msg_size.checked_mul(capacity).ok_or(Error::InvalidArgument)?;
        let layout = Layout::from_size_align(total, 1).map_err(|_| Error::InvalidArgument)?;
        // Safety: `layout` has nonzero size (`capacity >= 1`, `msg_size >= 1`).
        let storage = NonNull::new(unsafe { alloc(layout) }).ok_or(Error::OutOfMemory)?;

        let slots: Box<[Slot]> = (0..capacity)
            .map(|i| Slot {
                link: Link::new(),
                priority: Cell::new(0),
                offset: i * msg_size,
            })
            .collect();

        let queue = Box::leak(Box::new(Self {
            storage,
            msg_size,
            capacity,
            layout,
            slots,
            free: List::new(),
            occupied: List::new(),
            send_wait: WaitList::new(),
            recv_wait: WaitList::new(),
        }));

        // Safety: not yet reachable from any other thread, and each slot is
        // pushed exactly once.
        for slot in queue.slots.iter() {
            unsafe { queue.free.push_back(NonNull::from(slot)) };
        }

        Ok(queue)
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The layout of the queue's backing payload buffer.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Number of messages currently queued.
    pub fn len(&'static self) -> Result<usize> {
        let _lock = klock::lock_cpu()?;
        Ok(self.occupied.len())
    }

    pub fn is_full(&'static self) -> Result<bool> {
        Ok(self.len()? >= self.capacity)
    }

    /// Copy `data` into `slot`'s payload, zero-padding the remainder up to
    /// `self.msg_size` so a later receiver never observes bytes left over
    /// from whatever message last occupied this slot.
    ///
    /// # Safety
    /// `data.len() <= self.msg_size`, `slot` must belong to `self.slots`.
    unsafe fn write_payload(&self, slot: &Slot, data: &[u8]) {
        let dst = unsafe { self.storage.as_ptr().add(slot.offset) };
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        if data.len() < self.msg_size {
            unsafe { dst.add(data.len()).write_bytes(0, self.msg_size - data.len()) };
        }
    }

    /// Copy `slot`'s full `self.msg_size`-byte payload into `out`.
    ///
    /// # Safety
    /// `slot` must belong to `self.slots`; `out.len() >= self.msg_size`.
    unsafe fn read_payload(&self, slot: &Slot, out: &mut [u8]) {
        let src = unsafe { self.storage.as_ptr().add(slot.offset) };
        unsafe { core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), self.msg_size) };
    }

    /// Insert `slot` (just filled) into the occupied ring, ordered by
    /// descending priority, FIFO among equal priorities. Mirrors
    /// [`crate::wait::insert_ordered`], operating on a slot's stored
    /// priority rather than a thread's effective priority.
    fn insert_occupied(&self, slot: NonNull<Slot>) {
        let prio = unsafe { slot.as_ref() }.priority.get();
        let mut cursor = self.occupied.back();
        while let Some(existing) = cursor {
            if unsafe { existing.as_ref() }.priority.get() >= prio {
                break;
            }
            cursor = self.occupied.prev_of(existing);
        }
        unsafe { self.occupied.insert_after(cursor, slot) };
    }

    fn send_impl(&'static self, data: &[u8], priority: u8, deadline: Option<Time>) -> Result<()> {
        if data.len() > self.msg_size {
            return Err(Error::MessageTooBig);
        }
        if scheduler::in_handler_mode() {
            return Err(Error::Permission);
        }
        loop {
            let mut lock = klock::lock_cpu()?;
            let mut token = lock.borrow_mut();

            if let Some(slot) = self.free.pop_front() {
                unsafe { self.write_payload(slot.as_ref(), data) };
                let slot_ref = unsafe { slot.as_ref() };
                slot_ref.priority.set(priority);
                self.insert_occupied(slot);
                wait::wake_one(&self.recv_wait, &mut token);
                drop(token);
                scheduler::unlock_cpu_and_check_preemption(lock);
                return Ok(());
            }

            let me = scheduler::current_thread(&token).ok_or(Error::Permission)?;
            if unsafe { me.as_ref() }.take_interrupted(&mut token) {
                return Err(Error::Interrupted);
            }
            if let Some(d) = deadline {
                if clock::now() >= d {
                    return Err(Error::Timeout);
                }
            }

            let node = unsafe { me.as_ref() }.wait_node();
            wait::link(&self.send_wait, node, deadline, &mut token);
            drop(token);
            scheduler::suspend_current(lock);
        }
    }

    /// Block until a slot is free, then enqueue `data` (zero-padded to
    /// [`Self::msg_size`] if shorter) at `priority`.
    pub fn send(&'static self, data: &[u8], priority: u8) -> Result<()> {
        self.send_impl(data, priority, None)
    }

    /// Non-blocking variant of [`Self::send`]. ISR-safe.
    pub fn try_send(&'static self, data: &[u8], priority: u8) -> Result<()> {
        if data.len() > self.msg_size {
            return Err(Error::MessageTooBig);
        }
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let slot = self.free.pop_front().ok_or(Error::WouldBlock)?;
        unsafe { self.write_payload(slot.as_ref(), data) };
        let slot_ref = unsafe { slot.as_ref() };
        slot_ref.priority.set(priority);
        self.insert_occupied(slot);
        wait::wake_one(&self.recv_wait, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// As [`Self::send`], but gives up and returns [`Error::Timeout`] if no
    /// slot frees up within `timeout`.
    pub fn timed_send(&'static self, data: &[u8], priority: u8, timeout: Duration) -> Result<()> {
        let deadline = clock::now().checked_add(timeout).unwrap_or(Time(u64::MAX));
        self.send_impl(data, priority, Some(deadline))
    }

    /// Dequeue the full [`Self::msg_size`]-byte payload into `out`, and
    /// return its priority. Returns [`Error::MessageTooBig`] if `out` is
    /// smaller than [`Self::msg_size`], without consuming the message.
    fn receive_impl(&'static self, out: &mut [u8], deadline: Option<Time>) -> Result<u8> {
        if out.len() < self.msg_size {
            return Err(Error::MessageTooBig);
        }
        if scheduler::in_handler_mode() {
            return Err(Error::Permission);
        }
        loop {
            let mut lock = klock::lock_cpu()?;
            let mut token = lock.borrow_mut();

            if let Some(slot) = self.occupied.front() {
                let slot_ref = unsafe { slot.as_ref() };
                unsafe { self.occupied.remove(slot) };
                unsafe { self.read_payload(slot_ref, out) };
                let priority = slot_ref.priority.get();
                unsafe { self.free.push_back(slot) };
                wait::wake_one(&self.send_wait, &mut token);
                drop(token);
                scheduler::unlock_cpu_and_check_preemption(lock);
                return Ok(priority);
            }

            let me = scheduler::current_thread(&token).ok_or(Error::Permission)?;
            if unsafe { me.as_ref() }.take_interrupted(&mut token) {
                return Err(Error::Interrupted);
            }
            if let Some(d) = deadline {
                if clock::now() >= d {
                    return Err(Error::Timeout);
                }
            }

            let node = unsafe { me.as_ref() }.wait_node();
            wait::link(&self.recv_wait, node, deadline, &mut token);
            drop(token);
            scheduler::suspend_current(lock);
        }
    }

    /// Block until a message is available, then dequeue the
    /// highest-priority, oldest one into `out`, returning its priority.
    pub fn receive(&'static self, out: &mut [u8]) -> Result<u8> {
        self.receive_impl(out, None)
    }

    /// Non-blocking variant of [`Self::receive`]. ISR-safe.
    pub fn try_receive(&'static self, out: &mut [u8]) -> Result<u8> {
        if out.len() < self.msg_size {
            return Err(Error::MessageTooBig);
        }
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let slot = self.occupied.front().ok_or(Error::WouldBlock)?;
        let slot_ref = unsafe { slot.as_ref() };
        unsafe { self.occupied.remove(slot) };
        unsafe { self.read_payload(slot_ref, out) };
        let priority = slot_ref.priority.get();
        unsafe { self.free.push_back(slot) };
        wait::wake_one(&self.send_wait, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(priority)
    }

    /// As [`Self::receive`], but gives up and returns [`Error::Timeout`] if
    /// no message arrives within `timeout`.
    pub fn timed_receive(&'static self, out: &mut [u8], timeout: Duration) -> Result<u8> {
        let deadline = clock::now().checked_add(timeout).unwrap_or(Time(u64::MAX));
        self.receive_impl(out, Some(deadline))
    }

    /// Discard every queued message, returning every slot to the free list,
    /// and wake every waiter on both sides so each re-polls. A receiver
    /// already blocked on an empty queue has nothing new to see and simply
    /// waits again; this is not special-cased.
    pub fn reset(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        while let Some(slot) = self.occupied.pop_front() {
            unsafe { self.free.push_back(slot) };
        }
        wait::wake_all(&self.send_wait, &mut token);
        wait::wake_all(&self.recv_wait, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity_or_size() {
        assert!(MessageQueue::new(0, 4).is_err());
        assert!(MessageQueue::new(4, 0).is_err());
    }

    #[test]
    fn new_fills_free_list_and_reports_dimensions() {
        // Construction touches neither CPU Lock nor the scheduler, so this
        // exercises the real allocation path directly, unlike the mutex/
        // semaphore/mempool primitives whose `new()` needs a live port.
        let q = MessageQueue::new(3, 4).unwrap();
        assert_eq!(q.msg_size(), 4);
        assert_eq!(q.capacity(), 3);
        assert_eq!(q.free.len(), 3);
        assert!(q.occupied.is_empty());
    }

    #[test]
    fn insert_occupied_orders_by_priority_then_fifo() {
        let q = MessageQueue::new(4, 4).unwrap();
        let slots: alloc::vec::Vec<NonNull<Slot>> =
            q.slots.iter().map(NonNull::from).collect();

        for (i, &prio) in [5u8, 1, 5, 3].iter().enumerate() {
            unsafe { slots[i].as_ref() }.priority.set(prio);
            q.insert_occupied(slots[i]);
        }

        let order: alloc::vec::Vec<u8> = q
            .occupied
            .iter()
            .map(|p| unsafe { p.as_ref() }.priority.get())
            .collect();
        // Two priority-5 slots (inserted 1st and 3rd) stay FIFO relative to
        // each other, both ahead of 3 and then 1.
        assert_eq!(order, alloc::vec![5, 5, 3, 1]);
    }

    /// Drives `insert_occupied`/removal through a random sequence of sends
    /// and receives (bypassing CPU Lock, which a standalone unit test has no
    /// live port to provide) and checks the ring's defining invariant
    /// directly -- non-increasing priority, strictly increasing insertion
    /// order within equal priority -- rather than duplicating the insertion
    /// algorithm in a second reference implementation. Mirrors the
    /// `r3_kernel/src/utils/prio_bitmap.rs` quickcheck model in spirit (an
    /// independently-checked invariant instead of a hand-written oracle).
    #[quickcheck_macros::quickcheck]
    fn occupied_ring_stays_priority_ordered(ops: Vec<(bool, u8)>) -> bool {
        let _ = env_logger::builder().is_test(true).try_init();
        let q = MessageQueue::new(4, 1).unwrap();
        let mut seq_of_slot = std::collections::HashMap::new();
        let mut next_seq: u64 = 0;

        for (send, priority) in ops {
            log::trace!("send={send} priority={priority}");
            if send {
                if let Some(slot) = q.free.pop_front() {
                    unsafe { slot.as_ref() }.priority.set(priority);
                    seq_of_slot.insert(slot.as_ptr() as usize, next_seq);
                    next_seq += 1;
                    q.insert_occupied(slot);
                }
            } else if let Some(slot) = q.occupied.pop_front() {
                seq_of_slot.remove(&(slot.as_ptr() as usize));
                unsafe { q.free.push_back(slot) };
            }

            let entries: Vec<(u8, u64)> = q
                .occupied
                .iter()
                .map(|p| {
                    let prio = unsafe { p.as_ref() }.priority.get();
                    let seq = seq_of_slot[&(p.as_ptr() as usize)];
                    (prio, seq)
                })
                .collect();
            for pair in entries.windows(2) {
                let (p0, s0) = pair[0];
                let (p1, s1) = pair[1];
                if p0 < p1 || (p0 == p1 && s0 >= s1) {
                    return false;
                }
            }
        }
        true
    }
}
