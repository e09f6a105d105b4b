//! CPU Lock: the kernel's single critical section.
//!
//! Every kernel object's mutable state lives in a [`CpuLockCell`], which can
//! only be read or written while holding a [`CpuLockToken`]. The only way to
//! obtain one is [`lock_cpu`], which asks the port to mask interrupts. This
//! makes data races on kernel state a compile error rather than a runtime
//! hazard: there is no `unsafe` needed at call sites, only inside this
//! module and the port.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{error::Error, port, utils::Init};

/// Zero-sized tag identifying the single CPU Lock token family used by this
/// kernel (there is exactly one kernel instance per address space, so no
/// generic parameter is needed here unlike a multi-instance design).
pub(crate) struct CpuLockTag(());

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken = tokenlock::UnsyncSingletonToken<CpuLockTag>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole = tokenlock::SingletonTokenId<CpuLockTag>;

/// A cell that can only be accessed while CPU Lock is held.
pub(crate) struct CpuLockCell<T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole>);

impl<T> CpuLockCell<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<T: Init> Init for CpuLockCell<T> {
    const INIT: Self = Self(Init::INIT);
}

impl<T: ?Sized> ops::Deref for CpuLockCell<T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: fmt::Debug + Clone> fmt::Debug for CpuLockCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(lock) = lock_cpu() {
            write!(f, "CpuLockCell({:?})", self.0.read(&lock))
        } else {
            f.write_str("CpuLockCell(<locked>)")
        }
    }
}

/// Attempt to enter CPU Lock and get an RAII guard.
///
/// Returns [`Error::Permission`] if CPU Lock is already active (this
/// indicates a bug: the kernel never tries to nest CPU Lock).
pub(crate) fn lock_cpu() -> Result<CpuLockGuard, Error> {
    // Safety: `try_enter_cpu_lock` is meant to be called only here.
    if unsafe { port::port().try_enter_cpu_lock() } {
        // Safety: we just entered CPU Lock, and no `CpuLockGuard` can exist
        // yet (entering just succeeded).
        Ok(unsafe { assume_cpu_lock() })
    } else {
        Err(Error::Permission)
    }
}

/// Assume CPU Lock is already active and produce a guard for it.
///
/// # Safety
/// CPU Lock must genuinely be active, and no other [`CpuLockGuard`] may
/// exist at the same time.
pub(crate) unsafe fn assume_cpu_lock() -> CpuLockGuard {
    debug_assert!(port::port().is_cpu_lock_active());
    CpuLockGuard {
        // Safety: upheld by caller.
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for CPU Lock. Dropping it releases the lock.
///
/// A [`CpuLockToken`] can be borrowed from this guard to access
/// [`CpuLockCell`]s.
pub(crate) struct CpuLockGuard {
    token: CpuLockToken,
}

impl CpuLockGuard {
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_> {
        self.token.borrow_mut()
    }
}

impl Drop for CpuLockGuard {
    fn drop(&mut self) {
        // Safety: CPU Lock is active and we are the sole holder.
        unsafe { port::port().leave_cpu_lock() };
    }
}

impl ops::Deref for CpuLockGuard {
    type Target = CpuLockToken;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl ops::DerefMut for CpuLockGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Equivalent to `&'a mut CpuLockGuard` but does not consume memory for a
/// double indirection. Always prefer this in function signatures; unlike a
/// real `&mut`, it does not auto-reborrow, so call [`reborrow`] explicitly
/// when passing it along.
///
/// [`reborrow`]: tokenlock::UnsyncSingletonTokenRefMut::borrow_mut
pub(crate) type CpuLockTokenRefMut<'a> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag>;
