//! Counting and binary semaphores.
//!
//! Grounded on `r3_kernel/src/semaphore.rs`'s `SemaphoreCb`/`signal`/
//! `wait_one`, generalized to optionally cap the count at 1 (a binary
//! semaphore) and to expose [`Semaphore::reset`], which the teacher's
//! object does not have.
use crate::{
    clock::{Duration, Time},
    error::{Error, Result},
    klock::{self, CpuLockCell},
    scheduler,
    wait::{self, WaitList},
};

/// A counting semaphore, or (with `max_count` set to 1) a binary one.
pub struct Semaphore {
    count: CpuLockCell<u32>,
    max_count: u32,
    wait_list: WaitList,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// A semaphore starting at `initial_count`, never exceeding `max_count`.
    pub fn new(initial_count: u32, max_count: u32) -> Result<&'static Self> {
        if initial_count > max_count {
            return Err(Error::InvalidArgument);
        }
        Ok(alloc::boxed::Box::leak(alloc::boxed::Box::new(Self {
            count: CpuLockCell::new(initial_count),
            max_count,
            wait_list: WaitList::new(),
        })))
    }

    /// A binary semaphore (`max_count == 1`), starting either held (`false`)
    /// or available (`true`).
    pub fn new_binary(available: bool) -> &'static Self {
        Self::new(if available { 1 } else { 0 }, 1).expect("0 or 1 <= 1")
    }

    /// Increment the count (capped at `max_count`) and wake one waiter if
    /// any is blocked. ISR-safe. Returns [`Error::WouldOverflow`] if the
    /// semaphore is already at its maximum count.
    pub fn post(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let cell = self.count.write(&mut token);
        if *cell >= self.max_count {
            return Err(Error::WouldOverflow);
        }
        *cell += 1;
        wait::wake_one(&self.wait_list, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&'static self) -> Result<()> {
        wait::wait_until(&self.wait_list, None, |token| {
            try_take(self.count.write(token))
        })
    }

    /// Non-blocking variant of [`Self::wait`]. ISR-safe.
    pub fn try_wait(&'static self) -> Result<()> {
        wait::try_once(|token| try_take(self.count.write(token)))
    }

    /// As [`Self::wait`], but gives up and returns [`Error::Timeout`] if the
    /// count is not positive within `timeout`.
    pub fn timed_wait(&'static self, timeout: Duration) -> Result<()> {
        let deadline = crate::clock::now()
            .checked_add(timeout)
            .unwrap_or(Time(u64::MAX));
        wait::wait_until(&self.wait_list, Some(deadline), |token| {
            try_take(self.count.write(token))
        })
    }

    /// The current count, without consuming it.
    pub fn get(&'static self) -> Result<u32> {
        let lock = klock::lock_cpu()?;
        Ok(*self.count.read(&lock))
    }

    /// Force the count to `value` (clamped to `max_count`) and wake every
    /// waiter, so each can re-poll against the new count. Not part of the
    /// teacher's semaphore; added since spec.md calls for a way to recover
    /// a semaphore stuck at zero without tearing it down.
    pub fn reset(&'static self, value: u32) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        *self.count.write(&mut token) = value.min(self.max_count);
        wait::wake_all(&self.wait_list, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// Decrement `count` if positive. Shared by the blocking and non-blocking
/// wait variants via [`wait::wait_until`]/[`wait::try_once`].
fn try_take(count: &mut u32) -> Option<()> {
    if *count > 0 {
        *count -= 1;
        Some(())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_initial_above_max() {
        assert!(Semaphore::new(2, 1).is_err());
        assert!(Semaphore::new(1, 1).is_ok());
    }

    #[test]
    fn try_take_decrements_only_when_positive() {
        let mut count = 1u32;
        assert_eq!(try_take(&mut count), Some(()));
        assert_eq!(count, 0);
        assert_eq!(try_take(&mut count), None);
    }
}
