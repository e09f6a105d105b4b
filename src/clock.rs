//! Monotonic time and the tick-driven timeout subsystem.
//!
//! Time is tracked as a 64-bit tick count maintained by the port. At this
//! width there is no practical wraparound to worry about (a 1kHz tick would
//! take over 500 million years to wrap), so unlike designs built around a
//! 32-bit tick counter, the timeout list here is simply kept sorted by
//! absolute deadline with no headroom/zone bookkeeping.
use core::{cell::Cell, ptr::NonNull};

use crate::{
    klock::CpuLockCell,
    timer::TimerCb,
    utils::{
        intrusive_list::{Link, List, ListNode},
        Init,
    },
};

/// A point in time, measured in ticks since [`crate::start`] was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(pub u64);

impl Time {
    pub const ZERO: Self = Self(0);

    pub fn checked_add(self, d: Duration) -> Option<Self> {
        self.0.checked_add(d.0).map(Self)
    }
}

impl core::ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0.wrapping_add(rhs.0))
    }
}

impl core::ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0.wrapping_sub(rhs.0))
    }
}

/// A span of time, measured in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(pub u64);

impl Duration {
    pub const ZERO: Self = Self(0);

    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    pub const fn ticks(self) -> u64 {
        self.0
    }
}

/// The current tick count.
pub fn now() -> Time {
    crate::port::port().tick_now()
}

/// An adjustable offset applied on top of the monotonic tick clock to
/// produce [`system_time`]. The timeout list is always keyed on the raw
/// tick count, never on this value, so adjusting it can never perturb a
/// pending timeout.
#[cfg(feature = "system_time")]
static SYSTEM_TIME_OFFSET: core::sync::atomic::AtomicI64 = core::sync::atomic::AtomicI64::new(0);

/// A coarse, adjustable wall-clock time derived from the tick counter: the
/// tick counter plus a settable offset. Unlike [`now`], this is not
/// guaranteed monotonic across a call to [`set_system_time`].
#[cfg(feature = "system_time")]
pub fn system_time() -> Time {
    let offset = SYSTEM_TIME_OFFSET.load(core::sync::atomic::Ordering::Relaxed);
    Time(now().0.wrapping_add(offset as u64))
}

/// Adjust [`system_time`] to read `new_time` from this point on, without
/// touching the underlying tick counter or any pending timeout.
#[cfg(feature = "system_time")]
pub fn set_system_time(new_time: Time) {
    let offset = new_time.0.wrapping_sub(now().0) as i64;
    SYSTEM_TIME_OFFSET.store(offset, core::sync::atomic::Ordering::Relaxed);
}

/// What should happen when a [`Timeout`] elapses.
#[derive(Clone, Copy)]
pub(crate) enum TimeoutTarget {
    /// Interrupt a thread's current wait with [`crate::Error::Timeout`].
    WaitTimeout(NonNull<crate::thread::Thread>),
    /// Fire a software timer's callback.
    Timer(NonNull<TimerCb>),
}

/// A node in the global sorted timeout list. Normally stack-allocated in the
/// frame of the blocking call that created it (a thread waiting with a
/// timeout) or embedded in a [`crate::timer::Timer`] object.
pub(crate) struct Timeout {
    link: Link<Timeout>,
    deadline: Cell<Time>,
    target: Cell<Option<TimeoutTarget>>,
}

unsafe impl ListNode for Timeout {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
}

impl Timeout {
    pub(crate) const fn new(target: TimeoutTarget) -> Self {
        Self {
            link: Link::new(),
            deadline: Cell::new(Time::ZERO),
            target: Cell::new(Some(target)),
        }
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.link.is_linked()
    }

    /// Overwrite the fire target. Used by [`crate::timer::TimerCb`] to patch
    /// in its own address once it is known (after boxing).
    pub(crate) fn set_target(&self, target: TimeoutTarget) {
        self.target.set(Some(target));
    }
}

/// The global list of pending timeouts, sorted by ascending deadline (the
/// head always has the nearest deadline).
pub(crate) struct TimeoutList {
    list: List<Timeout>,
}

impl Init for TimeoutList {
    const INIT: Self = Self { list: List::new() };
}

impl TimeoutList {
    /// Insert `timeout` (not currently linked) to fire at `deadline`.
    ///
    /// # Safety
    /// `timeout` must outlive its presence in this list; the caller must
    /// call [`Self::remove`] before `timeout` is dropped or reused if it has
    /// not already fired.
    pub(crate) unsafe fn insert(&self, timeout: NonNull<Timeout>, deadline: Time) {
        unsafe { timeout.as_ref() }.deadline.set(deadline);

        let mut cursor = self.list.back();
        while let Some(node) = cursor {
            if unsafe { node.as_ref() }.deadline.get() <= deadline {
                break;
            }
            cursor = self.list.prev_of(node);
        }
        unsafe { self.list.insert_after(cursor, timeout) };
    }

    /// Remove `timeout` if it is still pending. Idempotent: a no-op if it
    /// already fired (and was removed by [`Self::process`]) or was never
    /// inserted.
    pub(crate) fn remove(&self, timeout: NonNull<Timeout>) {
        if unsafe { timeout.as_ref() }.is_linked() {
            unsafe { self.list.remove(timeout) };
        }
    }

    /// The deadline of the nearest pending timeout, if any.
    pub(crate) fn next_deadline(&self) -> Option<Time> {
        self.list
            .front()
            .map(|n| unsafe { n.as_ref() }.deadline.get())
    }

    /// Pop and return the targets of every timeout whose deadline has
    /// elapsed as of `now`, in deadline order, up to this pass's capacity.
    /// If more than that are simultaneously due, the rest are left at the
    /// head of the list (still past their deadline) and are picked up by
    /// the next call -- [`on_tick`] runs again on the very next tick, so
    /// nothing is lost, only delayed by one tick in the pathological case.
    pub(crate) fn pop_elapsed(&self, now: Time) -> ArrayVecTargets {
        let mut out = ArrayVecTargets::new();
        while !out.is_full() {
            let Some(node) = self.list.front() else {
                break;
            };
            let deadline = unsafe { node.as_ref() }.deadline.get();
            if deadline > now {
                break;
            }
            unsafe { self.list.remove(node) };
            if let Some(target) = unsafe { node.as_ref() }.target.get() {
                // Safety: loop condition just checked `!out.is_full()`.
                unsafe { out.push_unchecked(target) };
            }
        }
        out
    }
}

/// Bounded collection of elapsed timeout targets drained in one tick
/// processing pass. Bounded to avoid allocating inside the tick handler;
/// in the pathological case of more simultaneous expirations than this
/// holds, [`TimeoutList::pop_elapsed`] is simply called again next tick.
pub(crate) type ArrayVecTargets = arrayvec::ArrayVec<TimeoutTarget, 16>;

pub(crate) static TIMEOUTS: CpuLockCell<TimeoutList> = CpuLockCell::new(TimeoutList::INIT);

/// Called by the port on every tick interrupt. Advances the clock, pops any
/// elapsed timeouts, and dispatches them.
pub fn on_tick() {
    let mut lock = match crate::klock::lock_cpu() {
        Ok(lock) => lock,
        Err(_) => return,
    };
    let now = now();
    let elapsed = {
        let mut token = lock.borrow_mut();
        TIMEOUTS.write(&mut token).pop_elapsed(now)
    };
    let mut token = lock.borrow_mut();
    for target in elapsed {
        match target {
            TimeoutTarget::WaitTimeout(thread) => {
                crate::wait::wake_by_timeout(thread, &mut token);
            }
            TimeoutTarget::Timer(timer) => {
                crate::timer::fire(timer, &mut token);
            }
        }
    }
    drop(token);
    crate::scheduler::unlock_cpu_and_check_preemption(lock);
}
