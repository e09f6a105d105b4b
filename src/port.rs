//! The interface a CPU port must implement.
//!
//! This kernel never touches hardware directly. Context switching, interrupt
//! masking, and the tick source are all delegated to an implementation of
//! [`Port`] supplied at [`crate::start`]. Everything in this crate above
//! this module is written purely in terms of the operations below, and is
//! portable to any CPU a port has been written for.
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::clock::Time;

/// The CPU-specific half of the kernel.
///
/// All methods that mutate global interrupt or scheduling state are `unsafe`
/// because they are meant to be called only by the kernel's own critical
/// section and scheduling code, never by application code directly.
pub trait Port: Sync {
    /// Whether the calling context is an interrupt handler.
    fn interrupts_in_handler_mode(&self) -> bool;

    /// Attempt to enter CPU Lock -- the kernel's single global critical
    /// section, entered by masking interrupts up to the kernel-managed
    /// priority ceiling. Returns `false` if CPU Lock is already active
    /// (nesting is a caller bug, not masked transparently).
    ///
    /// # Safety
    /// Meant to be called only by [`crate::klock::lock_cpu`].
    unsafe fn try_enter_cpu_lock(&self) -> bool;

    /// Leave CPU Lock previously entered by [`Self::try_enter_cpu_lock`].
    ///
    /// # Safety
    /// CPU Lock must currently be active, and the caller must be the holder
    /// of the single outstanding guard.
    unsafe fn leave_cpu_lock(&self);

    /// Whether CPU Lock (the kernel's critical section) is currently held.
    fn is_cpu_lock_active(&self) -> bool;

    /// Whether `priority` is valid for use as a mutex priority ceiling or
    /// thread base priority on this port. A port with a shallow interrupt
    /// priority space may reject very high priorities.
    fn priority_is_valid(&self, priority: u8) -> bool {
        let _ = priority;
        true
    }

    /// Ask the scheduler to recompute which thread should run and perform
    /// the actual switch if needed. Called by the kernel core every time a
    /// scheduling decision might have changed (a thread became ready, a
    /// thread blocked, a priority changed). Must not return until the
    /// calling logical thread has regained the CPU (if it is still the one
    /// that should run) or must be treated as a full yield-and-return by
    /// the caller, mirroring [`Self::yield_cpu`].
    ///
    /// # Safety
    /// Must be called with CPU Lock *not* held.
    unsafe fn scheduler_reschedule(&self);

    /// Give up the CPU unconditionally and block the calling logical thread
    /// until the scheduler dispatches it again.
    ///
    /// # Safety
    /// Must be called with CPU Lock not held, from the thread giving up the
    /// CPU, after the kernel has already updated that thread's state (e.g.
    /// to `Waiting`).
    unsafe fn yield_cpu(&self);

    /// Start the scheduler. Called once at boot, after the first thread has
    /// been made ready. Does not return.
    fn scheduler_start(&self) -> !;

    /// Build the initial register frame for a newly created thread so that
    /// when the scheduler first switches to it, execution begins at
    /// `entry(arg)` running on `stack`.
    ///
    /// `port_data` is a single machine word reserved in every [`Thread`] for
    /// the port's own bookkeeping (typically the saved stack pointer); the
    /// kernel core never reads or interprets it. Implementations write
    /// whatever they need into it here and update it again on every
    /// context switch performed from [`Self::scheduler_reschedule`] /
    /// [`Self::yield_cpu`].
    ///
    /// [`Thread`]: crate::thread::Thread
    ///
    /// # Safety
    /// `stack` must be valid for the lifetime of the thread and not
    /// otherwise accessed while the thread is alive.
    unsafe fn thread_init(
        &self,
        stack: &mut [core::mem::MaybeUninit<u8>],
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        port_data: &core::cell::Cell<usize>,
    );

    /// The current tick count, as maintained by the port's tick source.
    fn tick_now(&self) -> Time;

    /// Ask the port to deliver a tick-derived wakeup no later than
    /// `deadline`. Ports with a free-running periodic tick may ignore this
    /// and rely on polling `tick_now` every tick; ports with a
    /// programmable one-shot timer use it to avoid unnecessary ticks.
    fn tick_sleep_until(&self, deadline: Time) {
        let _ = deadline;
    }
}

static PORT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the active port. Called once by [`crate::start`].
pub(crate) fn set_port(port: &'static dyn Port) {
    // `dyn Port` is a fat pointer; box it so the atomic can hold a single
    // thin pointer to a stable address.
    let boxed: alloc::boxed::Box<&'static dyn Port> = alloc::boxed::Box::new(port);
    PORT.store(
        alloc::boxed::Box::into_raw(boxed) as *mut (),
        Ordering::Release,
    );
}

/// Returns the active port.
///
/// # Panics
/// Panics if called before [`crate::start`].
pub(crate) fn port() -> &'static dyn Port {
    let ptr = PORT.load(Ordering::Acquire) as *mut &'static dyn Port;
    assert!(!ptr.is_null(), "kernel used before `rtos_kernel::start`");
    unsafe { *ptr }
}
