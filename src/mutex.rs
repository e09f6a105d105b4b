//! Mutexes with priority inheritance, priority ceiling, and robustness.
//!
//! Grounded on `r3_kernel/src/mutex.rs`'s `lock_core`/`unlock_mutex_unchecked`/
//! `abandon_held_mutexes`, generalized from ceiling-only (the teacher's only
//! supported protocol) to both `inherit` and `protect`, plus the recursive,
//! errorcheck, and robust variants spec.md §4.3 requires and the teacher's
//! mutex does not implement.
//!
//! Unlike the teacher, which recomputes a task's effective priority as a
//! simple `min` over held mutexes' ceilings (ceiling-only, lower numbers more
//! urgent), this module recomputes the owning thread's *inherited* priority
//! as a `max` over every held mutex's boost source -- the ceiling for
//! `protect`, or the highest-priority current waiter for `inherit` -- since
//! this crate supports both protocols side by side and runs priorities the
//! opposite way (higher is more urgent). See [`recompute_inherited_priority`].
use core::ptr::NonNull;

use alloc::boxed::Box;

use crate::{
    clock::{self, Duration, Time},
    error::{Error, Result},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    scheduler,
    thread::{Priority, Thread},
    utils::intrusive_list::{Link, ListNode},
    wait::{self, WaitList},
};

/// How recursive locking by the owner is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// A second `lock()` by the owner is undefined behaviour upstream;
    /// here it deterministically returns [`Error::Deadlock`].
    Normal,
    /// A second `lock()` by the owner returns [`Error::Deadlock`].
    ErrorCheck,
    /// A second `lock()` by the owner increments a recursion count, up to
    /// a configured limit.
    Recursive,
}

/// The priority-inversion avoidance protocol attached to a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// No boosting: a low-priority owner can block a high-priority waiter
    /// for an unbounded time.
    None,
    /// Priority inheritance: the owner's inherited priority is raised to
    /// the priority of the highest-priority current waiter.
    Inherit,
    /// Priority ceiling: the owner's inherited priority is raised to a
    /// fixed ceiling for as long as the mutex is held, regardless of
    /// whether anyone is waiting.
    Protect,
}

/// Whether a mutex notifies the next locker when a prior owner died while
/// holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Robustness {
    /// An owner's termination silently abandons the mutex to the next
    /// waiter (or leaves it unowned).
    Stalled,
    /// An owner's termination marks the mutex inconsistent; the next
    /// successful locker observes [`Error::OwnerDead`] and must call
    /// [`Mutex::make_consistent`] before unlocking, or the mutex becomes
    /// permanently [`Error::NotRecoverable`].
    Robust,
}

pub(crate) struct AcquiredMutexTag;

/// *Mutex control block* -- the state data of a mutex.
pub struct Mutex {
    mutex_type: MutexType,
    protocol: Protocol,
    robustness: Robustness,
    recursion_limit: u32,

    owner: CpuLockCell<Option<NonNull<Thread>>>,
    recursion_count: CpuLockCell<u32>,
    ceiling: CpuLockCell<Option<Priority>>,
    inconsistent: CpuLockCell<bool>,
    not_recoverable: CpuLockCell<bool>,

    wait_list: WaitList,
    owner_link: Link<Mutex, AcquiredMutexTag>,
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

unsafe impl ListNode<AcquiredMutexTag> for Mutex {
    fn link(&self) -> &Link<Self> {
        &self.owner_link
    }
}

/// Builds a [`Mutex`] with non-default configuration. Mirrors the teacher's
/// `cfg::mutex` builder, collapsed from compile-time object-table entries to
/// a plain runtime constructor (see DESIGN.md's note on `Box::leak`).
pub struct MutexBuilder {
    mutex_type: MutexType,
    protocol: Protocol,
    robustness: Robustness,
    ceiling: Option<Priority>,
    recursion_limit: u32,
}

impl MutexBuilder {
    pub fn new() -> Self {
        Self {
            mutex_type: MutexType::Normal,
            protocol: Protocol::None,
            robustness: Robustness::Stalled,
            ceiling: None,
            recursion_limit: u32::MAX,
        }
    }

    pub fn mutex_type(mut self, t: MutexType) -> Self {
        self.mutex_type = t;
        self
    }

    pub fn protocol(mut self, p: Protocol) -> Self {
        self.protocol = p;
        self
    }

    pub fn robust(mut self) -> Self {
        self.robustness = Robustness::Robust;
        self
    }

    /// Priority ceiling. Only consulted when [`Protocol::Protect`] is
    /// selected; a `Protect` mutex built without one never raises the
    /// owner's priority.
    pub fn ceiling(mut self, p: Priority) -> Self {
        self.ceiling = Some(p);
        self
    }

    pub fn recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn build(self) -> &'static Mutex {
        Box::leak(Box::new(Mutex {
            mutex_type: self.mutex_type,
            protocol: self.protocol,
            robustness: self.robustness,
            recursion_limit: self.recursion_limit,
            owner: CpuLockCell::new(None),
            recursion_count: CpuLockCell::new(0),
            ceiling: CpuLockCell::new(self.ceiling),
            inconsistent: CpuLockCell::new(false),
            not_recoverable: CpuLockCell::new(false),
            wait_list: WaitList::new(),
            owner_link: Link::new(),
        }))
    }
}

impl Default for MutexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// A `normal`, unprotected, non-robust mutex -- the common case.
    pub fn new() -> &'static Self {
        MutexBuilder::new().build()
    }

    fn is_owned_by(&self, thread: NonNull<Thread>, token: &CpuLockTokenRefMut<'_>) -> bool {
        matches!(*self.owner.read(token), Some(o) if core::ptr::eq(o.as_ptr(), thread.as_ptr()))
    }

    /// Give ownership to `thread`: set owner/count, link into its
    /// acquired-mutex list, and recompute its inherited priority (which may
    /// now include this mutex's ceiling).
    fn acquire(&'static self, thread: NonNull<Thread>, token: &mut CpuLockTokenRefMut<'_>) {
        *self.owner.write(token) = Some(thread);
        *self.recursion_count.write(token) = 1;
        // Safety: `self` is not already linked into `thread`'s acquired list
        // -- a mutex is never owned by two threads, and `release` always
        // unlinks before a new `acquire`.
        unsafe {
            thread
                .as_ref()
                .acquired_mutexes()
                .push_back(NonNull::from(self));
        }
        recompute_inherited_priority(thread, token);
    }

    /// Clear ownership, unlinking `self` from `thread`'s acquired-mutex
    /// list. Does not touch the wait list or recompute anyone's priority;
    /// callers do that afterwards (see [`Self::release_and_transfer`]).
    fn release(&'static self, thread: NonNull<Thread>, token: &mut CpuLockTokenRefMut<'_>) {
        unsafe {
            thread
                .as_ref()
                .acquired_mutexes()
                .remove(NonNull::from(self));
        }
        *self.owner.write(token) = None;
        *self.recursion_count.write(token) = 0;
    }

    /// Shared tail of `unlock()` and a condition variable's atomic
    /// unlock-and-wait: release ownership, restore the outgoing owner's
    /// priority, and either transfer ownership directly to the
    /// highest-priority waiter (mutex ownership transfer must be atomic
    /// across the context switch, per spec.md §1) or, if the mutex just
    /// became permanently broken, wake everyone so they observe
    /// [`Error::NotRecoverable`] on retry.
    fn release_and_transfer(&'static self, me: NonNull<Thread>, token: &mut CpuLockTokenRefMut<'_>) {
        let became_not_recoverable =
            self.robustness == Robustness::Robust && *self.inconsistent.read(token);
        if became_not_recoverable {
            *self.not_recoverable.write(token) = true;
        }

        self.release(me, token);
        recompute_inherited_priority(me, token);

        if became_not_recoverable {
            wait::wake_all(&self.wait_list, token);
        } else if let Some(next_owner) = wait::peek(&self.wait_list) {
            wait::wake_one(&self.wait_list, token);
            self.acquire(next_owner, token);
        }
    }

    /// Used by [`crate::condvar::CondVar::wait`] to atomically give up the
    /// mutex before linking into the condition variable's wait list.
    /// Assumes the mutex is held exactly once (condition variables are not
    /// meaningfully composable with recursive mutexes; see POSIX).
    pub(crate) fn release_for_wait(&'static self, me: NonNull<Thread>, token: &mut CpuLockTokenRefMut<'_>) {
        self.release_and_transfer(me, token);
    }

    fn relock_as_owner(&self, token: &mut CpuLockTokenRefMut<'_>) -> Result<()> {
        match self.mutex_type {
            MutexType::Recursive => {
                let count = self.recursion_count.write(token);
                if *count >= self.recursion_limit {
                    Err(Error::WouldOverflow)
                } else {
                    *count += 1;
                    Ok(())
                }
            }
            MutexType::ErrorCheck | MutexType::Normal => Err(Error::Deadlock),
        }
    }

    fn lock_impl(&'static self, deadline: Option<Time>) -> Result<()> {
        if scheduler::in_handler_mode() {
            return Err(Error::Permission);
        }
        let mut already_waited = false;
        loop {
            let mut lock = klock::lock_cpu()?;
            let mut token = lock.borrow_mut();
            let me = scheduler::current_thread(&token).ok_or(Error::Permission)?;

            if already_waited {
                if self.is_owned_by(me, &token) {
                    // Ownership was transferred to us directly by `unlock`
                    // while we were suspended.
                    drop(token);
                    return self.finish_acquired(lock);
                }
            } else if self.is_owned_by(me, &token) {
                return self.relock_as_owner(&mut token);
            }

            if *self.not_recoverable.read(&token) {
                return Err(Error::NotRecoverable);
            }

            if !already_waited && self.owner.read(&token).is_none() {
                self.acquire(me, &mut token);
                drop(token);
                return self.finish_acquired(lock);
            }

            if unsafe { me.as_ref() }.take_interrupted(&mut token) {
                if let Some(owner) = *self.owner.read(&token) {
                    recompute_inherited_priority(owner, &mut token);
                }
                return Err(Error::Interrupted);
            }
            if let Some(d) = deadline {
                if clock::now() >= d {
                    // We undo any boost our own wait induced on the current
                    // owner; per spec.md §4.3 the timed-out caller is
                    // responsible for this, not the owner.
                    if let Some(owner) = *self.owner.read(&token) {
                        recompute_inherited_priority(owner, &mut token);
                    }
                    return Err(Error::Timeout);
                }
            }

            let node = unsafe { me.as_ref() }.wait_node();
            wait::link(&self.wait_list, node, deadline, &mut token);
            if let Some(owner) = *self.owner.read(&token) {
                recompute_inherited_priority(owner, &mut token);
            }
            already_waited = true;
            drop(token);
            scheduler::suspend_current(lock);
        }
    }

    /// Common tail once `me` has just become owner (either by taking an
    /// unowned mutex or by direct transfer from `unlock`): clear/report the
    /// robust "owner died" indication and perform the reschedule check.
    fn finish_acquired(&'static self, mut lock: klock::CpuLockGuard) -> Result<()> {
        let was_inconsistent = {
            let mut token = lock.borrow_mut();
            let cell = self.inconsistent.write(&mut token);
            // The new owner is on notice; it does not inherit the
            // inconsistency until it fails to call `make_consistent` and
            // unlocks anyway (handled in `release_and_transfer`).
            *cell
        };
        scheduler::unlock_cpu_and_check_preemption(lock);
        if was_inconsistent {
            Err(Error::OwnerDead)
        } else {
            Ok(())
        }
    }

    pub fn lock(&'static self) -> Result<()> {
        self.lock_impl(None)
    }

    pub fn timed_lock(&'static self, timeout: Duration) -> Result<()> {
        let deadline = clock::now().checked_add(timeout).unwrap_or(Time(u64::MAX));
        self.lock_impl(Some(deadline))
    }

    /// ISR-unsafe non-blocking variant: returns [`Error::WouldBlock`]
    /// instead of suspending.
    pub fn try_lock(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let me = scheduler::current_thread(&token).ok_or(Error::Permission)?;

        if self.is_owned_by(me, &token) {
            return self.relock_as_owner(&mut token);
        }
        if *self.not_recoverable.read(&token) {
            return Err(Error::NotRecoverable);
        }
        if self.owner.read(&token).is_some() {
            return Err(Error::WouldBlock);
        }
        self.acquire(me, &mut token);
        drop(token);
        self.finish_acquired(lock)
    }

    pub fn unlock(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let me = scheduler::current_thread(&token).ok_or(Error::Permission)?;

        if !self.is_owned_by(me, &token) {
            return Err(
                if matches!(self.mutex_type, MutexType::ErrorCheck | MutexType::Recursive)
                    || self.robustness == Robustness::Robust
                {
                    Error::Permission
                } else {
                    Error::NotRecoverable
                },
            );
        }

        {
            let count = self.recursion_count.write(&mut token);
            if *count > 1 {
                *count -= 1;
                return Ok(());
            }
        }

        self.release_and_transfer(me, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Clear the "inconsistent" indication on a robust mutex the caller has
    /// just locked with [`Error::OwnerDead`]. Must be called by the owner
    /// before unlocking, or the mutex becomes permanently
    /// [`Error::NotRecoverable`].
    pub fn make_consistent(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let me = scheduler::current_thread(&token).ok_or(Error::Permission)?;
        if !self.is_owned_by(me, &token) {
            return Err(Error::Permission);
        }
        *self.inconsistent.write(&mut token) = false;
        Ok(())
    }

    /// Replace the priority ceiling, returning the previous one (spec.md
    /// §4.3's `prio_ceiling`). Briefly locks and unlocks the mutex with no
    /// protocol boost of its own to make the swap atomic with respect to
    /// concurrent lockers.
    pub fn prio_ceiling(&'static self, new: Priority) -> Result<Priority> {
        self.lock()?;
        let old = {
            let lock = klock::lock_cpu()?;
            (*self.ceiling.read(&lock)).unwrap_or(Priority::IDLE)
        };
        {
            let mut lock = klock::lock_cpu()?;
            let mut token = lock.borrow_mut();
            *self.ceiling.write(&mut token) = Some(new);
        }
        self.unlock()?;
        Ok(old)
    }
}

/// Terminate-time cleanup: release every mutex `thread` still holds. Called
/// once from [`crate::thread::Thread::terminate`] with CPU Lock held.
/// Robust mutexes are marked inconsistent; non-robust ones are silently
/// abandoned to the next waiter, matching the teacher's
/// `abandon_held_mutexes` except generalized to also perform ownership
/// transfer (the teacher leaves that to a later `unlock_cpu_and_check_preemption`
/// call it never issues from this path, since its mutexes have no waiters
/// concept distinct from priority-ceiling min-recompute).
pub(crate) fn abandon_held_mutexes(thread: &'static Thread, token: &mut CpuLockTokenRefMut<'_>) {
    let me = NonNull::from(thread);
    while let Some(node) = thread.acquired_mutexes().front() {
        let mutex = unsafe { node.as_ref() };
        if mutex.robustness == Robustness::Robust {
            *mutex.inconsistent.write(token) = true;
        }
        mutex.release(me, token);
        if let Some(next_owner) = wait::peek(&mutex.wait_list) {
            wait::wake_one(&mutex.wait_list, token);
            mutex.acquire(next_owner, token);
        }
    }
}

/// Recompute `thread`'s inherited priority from scratch as the maximum
/// boost source across every mutex it currently holds: a `protect` mutex
/// always contributes its ceiling; an `inherit` mutex contributes the
/// priority of its highest-priority current waiter, if any. Called after
/// any change that could move this maximum -- a new waiter linking in, a
/// waiter leaving (by timeout, interrupt, or being granted ownership), or
/// the set of held mutexes itself changing.
fn recompute_inherited_priority(thread: NonNull<Thread>, token: &mut CpuLockTokenRefMut<'_>) {
    let mut best = Priority::IDLE;
    for node in unsafe { thread.as_ref() }.acquired_mutexes().iter() {
        let mutex = unsafe { node.as_ref() };
        match mutex.protocol {
            Protocol::Protect => {
                if let Some(ceiling) = *mutex.ceiling.read(token) {
                    best = best.max(ceiling);
                }
            }
            Protocol::Inherit => {
                if let Some(waiter) = wait::peek(&mutex.wait_list) {
                    best = best.max(unsafe { waiter.as_ref() }.effective_priority());
                }
            }
            Protocol::None => {}
        }
    }
    unsafe { thread.as_ref() }.set_inherited_priority(best, token);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_normal_stalled() {
        // Can't construct a live `Mutex` without a running kernel (it needs
        // `Box::leak`), but the builder's field defaults are plain data and
        // are worth pinning down directly.
        let b = MutexBuilder::new();
        assert_eq!(b.mutex_type, MutexType::Normal);
        assert_eq!(b.protocol, Protocol::None);
        assert_eq!(b.robustness, Robustness::Stalled);
        assert_eq!(b.ceiling, None);
    }
}
