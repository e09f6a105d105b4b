//! Condition variables.
//!
//! The teacher has no standalone condition variable; this module assembles
//! one from two pieces the teacher does have: [`crate::wait`]'s generic
//! link/suspend machinery, and [`crate::mutex::Mutex::release_for_wait`] (a
//! thin wrapper the mutex module exposes specifically for this -- its body
//! is exactly `r3_kernel/src/mutex.rs`'s `unlock_mutex_unchecked`, the piece
//! that makes giving up the mutex and waking the next owner atomic with
//! respect to a context switch).
//!
//! A wait here is therefore: atomically give up the mutex and link onto the
//! condition variable's own wait list in one critical section (so no
//! `signal`/`broadcast` from another thread can be lost between the two),
//! suspend, and on resume always reacquire the mutex before returning --
//! mirroring POSIX's `pthread_cond_wait`, including reacquiring on a timed
//! out or interrupted wait.
use core::ptr::NonNull;

use crate::{
    clock::{self, Duration, Time},
    error::{Error, Result},
    klock,
    mutex::Mutex,
    scheduler,
    wait::{self, WaitList},
};

/// A condition variable, always used together with a [`Mutex`] that guards
/// the condition it waits on.
pub struct CondVar {
    wait_list: WaitList,
}

unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    pub fn new() -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self {
            wait_list: WaitList::new(),
        }))
    }

    /// Atomically release `mutex` and block until woken by [`Self::signal`]
    /// or [`Self::broadcast`] (or spuriously -- callers must re-check their
    /// condition in a loop, as with any condition variable), then reacquire
    /// `mutex` before returning.
    pub fn wait(&'static self, mutex: &'static Mutex) -> Result<()> {
        self.wait_impl(mutex, None)
    }

    /// As [`Self::wait`], but gives up and returns [`Error::Timeout`] if not
    /// woken within `timeout`. The mutex is still reacquired before
    /// returning, timeout or not.
    pub fn timed_wait(&'static self, mutex: &'static Mutex, timeout: Duration) -> Result<()> {
        let deadline = clock::now().checked_add(timeout).unwrap_or(Time(u64::MAX));
        self.wait_impl(mutex, Some(deadline))
    }

    fn wait_impl(&'static self, mutex: &'static Mutex, deadline: Option<Time>) -> Result<()> {
        if scheduler::in_handler_mode() {
            return Err(Error::Permission);
        }

        let me: NonNull<crate::thread::Thread> = {
            let mut lock = klock::lock_cpu()?;
            let mut token = lock.borrow_mut();
            let me = scheduler::current_thread(&token).ok_or(Error::Permission)?;
            mutex.release_for_wait(me, &mut token);
            let node = unsafe { me.as_ref() }.wait_node();
            wait::link(&self.wait_list, node, deadline, &mut token);
            drop(token);
            scheduler::suspend_current(lock);
            me
        };

        let wake_reason = {
            let mut lock = klock::lock_cpu()?;
            let mut token = lock.borrow_mut();
            let interrupted = unsafe { me.as_ref() }.take_interrupted(&mut token);
            if interrupted {
                Err(Error::Interrupted)
            } else if deadline.is_some_and(|d| clock::now() >= d) {
                Err(Error::Timeout)
            } else {
                Ok(())
            }
        };

        let relock_result = mutex.lock();
        match wake_reason {
            Err(e) => Err(e),
            Ok(()) => relock_result,
        }
    }

    /// Wake the longest-waiting thread, if any. ISR-safe.
    pub fn signal(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        wait::wake_one(&self.wait_list, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wake every waiting thread. ISR-safe.
    pub fn broadcast(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        wait::wake_all(&self.wait_list, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}
