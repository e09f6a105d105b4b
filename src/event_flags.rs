//! Event flags: bit-mask AND/OR wait with optional clear-on-consume.
//!
//! spec.md describes this primitive twice: as a per-thread intrinsic
//! (`Thread::flags_raise`/`flags_wait`, used for targeted wakeups) and as a
//! standalone object shared by many waiters (this module). Both share the
//! same bit-test/consume core, [`poll`], so the AND/OR/clear semantics are
//! defined exactly once (grounded on `r3_kernel/src/event_group.rs`'s
//! `poll`/`wait` split).
//!
//! The mask width is pinned at 32 bits (one of spec.md's resolved Open
//! Questions; see DESIGN.md).
use crate::{
    clock::{Duration, Time},
    error::Result,
    klock::{self, CpuLockCell},
    scheduler,
    utils::Init,
    wait::{self, WaitList},
};

/// Whether a wait is satisfied by any one bit in the mask, or requires
/// every bit in the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Satisfied when at least one bit in the mask is set.
    Any,
    /// Satisfied only when every bit in the mask is set.
    All,
}

/// The shared bit-test/consume core used by both this module's
/// [`EventFlags`] and [`crate::thread::Thread`]'s per-thread flags.
///
/// A `mask` of zero means "any currently-set bit" regardless of which,
/// per spec.md §3's note on the source's typedef; this is realized by
/// expanding a zero mask to all 32 bits before testing.
///
/// Returns the bits that satisfied the wait (before clearing) on success,
/// mutating `bits` in place if `clear` is requested.
pub(crate) fn poll(bits: &mut u32, mask: u32, mode: WaitMode, clear: bool) -> Option<u32> {
    let effective_mask = if mask == 0 { u32::MAX } else { mask };
    let current = *bits;
    let satisfied = match mode {
        WaitMode::Any => current & effective_mask != 0,
        WaitMode::All => current & effective_mask == effective_mask,
    };
    if !satisfied {
        return None;
    }
    let observed = current & effective_mask;
    if clear {
        *bits = current & !effective_mask;
    }
    Some(observed)
}

/// A standalone event-flags object shared by any number of waiting
/// threads (spec.md §3's "Event flags object"), as distinct from the
/// per-thread flags embedded directly in [`crate::thread::Thread`].
pub struct EventFlags {
    bits: CpuLockCell<u32>,
    wait_list: WaitList,
}

impl Init for EventFlags {
    const INIT: Self = Self {
        bits: CpuLockCell::new(0),
        wait_list: WaitList::new(),
    };
}

impl EventFlags {
    /// Create a new event-flags object, initially with no bits set.
    pub fn new() -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::INIT))
    }

    /// OR `mask` into the current bits and wake every waiter whose
    /// condition is now satisfied. ISR-safe.
    pub fn raise(&'static self, mask: u32) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        *self.bits.write(&mut token) |= mask;
        wait::wake_all(&self.wait_list, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Clear `mask` from the current bits without waking anyone (clearing
    /// can never satisfy a wait).
    pub fn clear(&'static self, mask: u32) -> Result<u32> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let cell = self.bits.write(&mut token);
        let prev = *cell;
        *cell &= !mask;
        Ok(prev)
    }

    /// The current bits, without consuming them.
    pub fn get(&'static self) -> Result<u32> {
        let lock = klock::lock_cpu()?;
        Ok(*self.bits.read(&lock))
    }

    /// Block until `mask` is satisfied according to `mode`, optionally
    /// clearing the satisfying bits atomically on success.
    pub fn wait(&'static self, mask: u32, mode: WaitMode, clear: bool) -> Result<u32> {
        wait::wait_until(&self.wait_list, None, |token| {
            poll(self.bits.write(token), mask, mode, clear)
        })
    }

    /// Non-blocking variant of [`Self::wait`]. ISR-safe.
    pub fn try_wait(&'static self, mask: u32, mode: WaitMode, clear: bool) -> Result<u32> {
        wait::try_once(|token| poll(self.bits.write(token), mask, mode, clear))
    }

    /// As [`Self::wait`], but gives up and returns [`crate::Error::Timeout`]
    /// if `mask` is not satisfied within `timeout`.
    pub fn timed_wait(
        &'static self,
        mask: u32,
        mode: WaitMode,
        clear: bool,
        timeout: Duration,
    ) -> Result<u32> {
        let deadline = self.deadline(timeout);
        wait::wait_until(&self.wait_list, Some(deadline), |token| {
            poll(self.bits.write(token), mask, mode, clear)
        })
    }

    fn deadline(&self, timeout: Duration) -> Time {
        crate::clock::now().checked_add(timeout).unwrap_or(Time(u64::MAX))
    }
}

unsafe impl Send for EventFlags {}
unsafe impl Sync for EventFlags {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_mode_matches_single_bit() {
        let mut bits = 0b0010u32;
        assert_eq!(poll(&mut bits, 0b1011, WaitMode::Any, false), Some(0b0010));
    }

    #[test]
    fn all_mode_requires_every_bit() {
        let mut bits = 0b0010u32;
        assert_eq!(poll(&mut bits, 0b1011, WaitMode::All, false), None);
        bits = 0b1011;
        assert_eq!(poll(&mut bits, 0b1011, WaitMode::All, false), Some(0b1011));
    }

    #[test]
    fn clear_on_consume_removes_only_matched_bits() {
        let mut bits = 0b1111u32;
        let observed = poll(&mut bits, 0b0011, WaitMode::All, true).unwrap();
        assert_eq!(observed, 0b0011);
        assert_eq!(bits, 0b1100);
    }

    #[test]
    fn zero_mask_means_any_bit() {
        let mut bits = 0u32;
        assert_eq!(poll(&mut bits, 0, WaitMode::Any, false), None);
        bits = 0b0100;
        assert_eq!(poll(&mut bits, 0, WaitMode::Any, false), Some(0b0100));
    }

    #[test]
    fn raise_is_idempotent() {
        let mut bits = 0b0001u32;
        bits |= 0b0001;
        bits |= 0b0001;
        assert_eq!(bits, 0b0001);
    }
}
