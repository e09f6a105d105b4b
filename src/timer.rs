//! Software timers.
//!
//! A [`Timer`] reuses the same sorted timeout-list mechanism the clock
//! subsystem already uses to wake up timed waits: arming a timer inserts a
//! [`crate::clock::Timeout`] node, and firing it is just another timeout
//! target. The only addition is that a periodic timer reschedules itself
//! (`deadline += period`) as part of firing.
//!
//! Timer callbacks run in tick (interrupt) context, with CPU Lock held, and
//! must therefore be brief and must not call any operation that may block.
use core::{
    cell::Cell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use alloc::boxed::Box;

use crate::{
    clock::{self, Duration, Time, Timeout, TimeoutTarget},
    klock::CpuLockTokenRefMut,
};

/// A callback invoked when a timer fires. Receives the opaque context value
/// the timer was created with.
pub type TimerCallback = fn(usize);

pub(crate) struct TimerCb {
    timeout: Timeout,
    period: Cell<Option<Duration>>,
    callback: TimerCallback,
    context: usize,
    armed: AtomicBool,
}

impl TimerCb {
    fn new(callback: TimerCallback, context: usize) -> NonNull<Self> {
        let this = Box::new(Self {
            // Safety: overwritten before `timeout` is ever inserted into a
            // list, since `target` is set to point back at this `TimerCb`
            // only once its final address is known.
            timeout: Timeout::new(TimeoutTarget::Timer(NonNull::dangling())),
            period: Cell::new(None),
            callback,
            context,
            armed: AtomicBool::new(false),
        });
        let ptr = NonNull::from(Box::leak(this));
        // Safety: `ptr` now has a stable 'static address; patch the
        // self-referential target.
        unsafe {
            (*ptr.as_ptr())
                .timeout
                .set_target(TimeoutTarget::Timer(ptr));
        }
        ptr
    }
}

/// A one-shot or periodic software timer.
///
/// Cloning a `Timer` yields another handle to the same underlying timer;
/// the timer itself lives for the lifetime of the program once created
/// (there is no `drop`-time cancellation -- call [`Timer::stop`] first if a
/// timer must stop firing before the program ends).
#[derive(Clone, Copy)]
pub struct Timer {
    cb: NonNull<TimerCb>,
}

unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

impl Timer {
    /// Create a new, initially stopped timer. `callback` is invoked with
    /// `context` every time the timer fires.
    pub fn new(callback: TimerCallback, context: usize) -> Self {
        Self {
            cb: TimerCb::new(callback, context),
        }
    }

    fn cb(&self) -> &'static TimerCb {
        unsafe { self.cb.as_ref() }
    }

    /// Arm the timer to fire once after `delay`.
    pub fn start_oneshot(&self, delay: Duration) {
        self.arm(delay, None);
    }

    /// Arm the timer to fire every `period`, starting after `period`.
    pub fn start_periodic(&self, period: Duration) {
        self.arm(period, Some(period));
    }

    fn arm(&self, delay: Duration, period: Option<Duration>) {
        let cb = self.cb();
        let mut lock = match crate::klock::lock_cpu() {
            Ok(lock) => lock,
            Err(_) => return,
        };
        let mut token = lock.borrow_mut();
        let timeouts = clock::TIMEOUTS.write(&mut token);
        if cb.armed.load(Ordering::Relaxed) {
            timeouts.remove(NonNull::from(&cb.timeout));
        }
        cb.period.set(period);
        cb.armed.store(true, Ordering::Relaxed);
        let deadline = clock::now().checked_add(delay).unwrap_or(Time(u64::MAX));
        unsafe {
            timeouts.insert(NonNull::from(&cb.timeout), deadline);
        }
    }

    /// Disarm the timer. A no-op if it is already stopped.
    pub fn stop(&self) {
        let cb = self.cb();
        let Ok(mut lock) = crate::klock::lock_cpu() else {
            return;
        };
        let mut token = lock.borrow_mut();
        if cb.armed.swap(false, Ordering::Relaxed) {
            clock::TIMEOUTS
                .write(&mut token)
                .remove(NonNull::from(&cb.timeout));
        }
    }

    /// Whether the timer is currently armed (pending or periodic).
    pub fn is_armed(&self) -> bool {
        self.cb().armed.load(Ordering::Relaxed)
    }
}

/// Invoked by [`crate::clock::on_tick`] when a timer's deadline elapses.
/// CPU Lock is held for the duration of the call.
pub(crate) fn fire(cb: NonNull<TimerCb>, token: &mut CpuLockTokenRefMut<'_>) {
    let cb = unsafe { cb.as_ref() };
    (cb.callback)(cb.context);
    if let Some(period) = cb.period.get() {
        let deadline = clock::now().checked_add(period).unwrap_or(Time(u64::MAX));
        unsafe {
            clock::TIMEOUTS
                .write(token)
                .insert(NonNull::from(&cb.timeout), deadline);
        }
    } else {
        cb.armed.store(false, Ordering::Relaxed);
    }
}
