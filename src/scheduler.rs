//! Thread selection, the ready queue, and the reschedule points shared by
//! every blocking primitive.
//!
//! Grounded on `r3_kernel/src/task/readyqueue.rs`'s `BitmapQueue`
//! (segregated per-priority lists plus a summary bitmap) and on
//! `r3_kernel/src/task.rs`'s `choose_next_running_task` /
//! `unlock_cpu_and_check_preemption`, collapsed from their `Traits:
//! KernelTraits` generic parameterization to the single concrete kernel
//! instance this crate implements.
//!
//! [`crate::utils::prio_bitmap::PrioBitmap256`] indexes bit 0 as the
//! highest priority; this crate's [`crate::thread::Priority`] runs the
//! other way (255 is most urgent), so every bucket lookup here goes through
//! [`bucket_of`] to flip it.
use core::ptr::NonNull;

use alloc::{boxed::Box, vec::Vec};

use crate::{
    error::Result,
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    thread::{Priority, Thread},
    utils::intrusive_list::{Link, List, ListNode},
    utils::prio_bitmap::PrioBitmap256,
};

/// Stack size given to the idle thread. It does nothing but loop, so this
/// only needs to cover one context-switch frame.
const IDLE_STACK_SIZE: usize = 1024;

pub(crate) struct ReadyTag;

unsafe impl ListNode<ReadyTag> for Thread {
    fn link(&self) -> &Link<Self> {
        &self.ready_link
    }
}

fn bucket_of_raw(raw_priority: u8) -> u8 {
    255 - raw_priority
}

fn bucket_of(p: Priority) -> u8 {
    bucket_of_raw(p.get())
}

struct SchedulerState {
    ready: Box<[List<Thread, ReadyTag>]>,
    bitmap: PrioBitmap256,
    current: Option<NonNull<Thread>>,
    /// Depth of nested [`lock`] calls; the scheduler only preempts again
    /// once this returns to zero (save/restore semantics per spec.md).
    lock_depth: u32,
    preemptive: bool,
    /// The one thread that never appears in `ready`/`bitmap`: the fallback
    /// when nothing else is runnable.
    idle: Option<NonNull<Thread>>,
}

impl SchedulerState {
    fn new() -> Self {
        let mut ready = Vec::with_capacity(256);
        for _ in 0..256 {
            ready.push(List::new());
        }
        Self {
            ready: ready.into_boxed_slice(),
            bitmap: PrioBitmap256::new(),
            current: None,
            lock_depth: 0,
            preemptive: true,
            idle: None,
        }
    }

    /// The priority of the highest-priority ready thread, if any is
    /// waiting in the bitmap-backed queue (the idle thread is never in
    /// here).
    fn highest_ready_priority(&self) -> Option<u8> {
        self.bitmap.find_lowest_set().map(|bucket| 255 - bucket)
    }
}

unsafe impl Send for SchedulerState {}
unsafe impl Sync for SchedulerState {}

static SCHED: CpuLockCell<Option<SchedulerState>> = CpuLockCell::new(None);

extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        // Nothing to do; a real port would WFI/WFE here. Reschedule points
        // elsewhere are what actually give the CPU back to an application
        // thread the moment one becomes ready.
        core::hint::spin_loop();
    }
}

/// Prepare the ready queue and spawn the idle thread. Must be called before
/// any call to [`crate::thread::Thread::spawn`]. Idempotent: a second call
/// is a no-op that returns `Ok(())`.
pub fn initialize() -> Result<()> {
    {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        if SCHED.read(&token).is_some() {
            return Ok(());
        }
        *SCHED.write(&mut token) = Some(SchedulerState::new());
    }

    let idle = Thread::spawn_idle(idle_entry, 0, IDLE_STACK_SIZE)?;
    let mut lock = klock::lock_cpu()?;
    let mut token = lock.borrow_mut();
    SCHED.write(&mut token).as_mut().unwrap().idle = Some(NonNull::from(idle));
    Ok(())
}

/// Begin scheduling: dispatch the highest-priority ready thread. Never
/// returns on success.
pub fn start() -> ! {
    let mut lock = klock::lock_cpu().expect("scheduler::start called with CPU Lock held");
    let mut token = lock.borrow_mut();
    choose_next_running_task(&mut token);
    drop(token);
    drop(lock);
    crate::port::port().scheduler_start()
}

/// Whether the calling context is an interrupt handler.
pub(crate) fn in_handler_mode() -> bool {
    crate::port::port().interrupts_in_handler_mode()
}

/// The thread currently considered "running" by the kernel, if any.
pub(crate) fn current_thread(token: &CpuLockTokenRefMut<'_>) -> Option<NonNull<Thread>> {
    SCHED.read(token).as_ref()?.current
}

/// Cooperatively lock the scheduler: while locked, reschedule points do not
/// switch threads, though ISRs still run. Nests; the scheduler resumes
/// preempting once the matching number of [`unlock`] calls bring the depth
/// back to zero.
pub fn lock() -> Result<()> {
    let mut guard = klock::lock_cpu()?;
    let mut token = guard.borrow_mut();
    if let Some(state) = SCHED.write(&mut token).as_mut() {
        state.lock_depth += 1;
    }
    Ok(())
}

/// Reverse one [`lock`] call. A reschedule is attempted immediately if this
/// brings the lock depth back to zero.
pub fn unlock() -> Result<()> {
    let mut guard = klock::lock_cpu()?;
    let mut token = guard.borrow_mut();
    if let Some(state) = SCHED.write(&mut token).as_mut() {
        state.lock_depth = state.lock_depth.saturating_sub(1);
    }
    drop(token);
    unlock_cpu_and_check_preemption(guard);
    Ok(())
}

pub fn is_locked() -> bool {
    klock::lock_cpu()
        .ok()
        .and_then(|lock| SCHED.read(&lock).as_ref().map(|s| s.lock_depth > 0))
        .unwrap_or(false)
}

/// Enable or disable preemptive time-slicing among equal-priority ready
/// threads. The scheduler starts out preemptive.
pub fn set_preemptive(enabled: bool) -> Result<()> {
    let mut lock = klock::lock_cpu()?;
    let mut token = lock.borrow_mut();
    if let Some(state) = SCHED.write(&mut token).as_mut() {
        state.preemptive = enabled;
    }
    Ok(())
}

pub fn is_preemptive() -> bool {
    klock::lock_cpu()
        .ok()
        .and_then(|lock| SCHED.read(&lock).as_ref().map(|s| s.preemptive))
        .unwrap_or(true)
}

/// A scoped guard returned by [`critical_section`]: locks the scheduler on
/// construction, restores the prior lock depth on drop.
pub struct SchedulerLock(());

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        let _ = unlock();
    }
}

/// Lock the scheduler for the lifetime of the returned guard (spec.md
/// §4.1's `critical_section`).
pub fn critical_section() -> Result<SchedulerLock> {
    lock()?;
    Ok(SchedulerLock(()))
}

/// Voluntarily give up the remainder of the calling thread's time slice.
/// Other ready threads of equal or higher priority get a turn before this
/// thread runs again; lower-priority threads do not preempt it regardless.
pub fn yield_now() -> Result<()> {
    if in_handler_mode() {
        return Err(crate::error::Error::Permission);
    }
    let mut lock = klock::lock_cpu()?;
    let mut token = lock.borrow_mut();
    if let Some(me) = current_thread(&token) {
        unsafe { me.as_ref() }.set_ready(&mut token);
    }
    drop(token);
    suspend_current(lock);
    Ok(())
}

/// Insert `thread` into the ready queue at its current effective priority.
/// `thread` must not already be in the ready queue.
pub(crate) fn enqueue_ready(thread: NonNull<Thread>, token: &mut CpuLockTokenRefMut<'_>) {
    let prio = unsafe { thread.as_ref() }.effective_priority();
    let state = SCHED
        .write(token)
        .as_mut()
        .expect("scheduler not initialized");
    let bucket = bucket_of(prio);
    // Safety: caller guarantees `thread` is not already linked into
    // `ReadyTag`.
    unsafe { state.ready[bucket as usize].push_back(thread) };
    state.bitmap.set(bucket);
}

/// Remove `thread` (currently Ready at `prio`) from the ready queue.
pub(crate) fn dequeue_ready(
    thread: NonNull<Thread>,
    prio: Priority,
    token: &mut CpuLockTokenRefMut<'_>,
) {
    let state = SCHED
        .write(token)
        .as_mut()
        .expect("scheduler not initialized");
    let bucket = bucket_of(prio);
    unsafe { state.ready[bucket as usize].remove(thread) };
    if state.ready[bucket as usize].is_empty() {
        state.bitmap.clear(bucket);
    }
}

/// Move `thread` from the `old` priority bucket to the `new` one. `thread`
/// must currently be linked at `old`.
pub(crate) fn reorder_ready(
    thread: NonNull<Thread>,
    old: Priority,
    new: Priority,
    token: &mut CpuLockTokenRefMut<'_>,
) {
    if old == new {
        return;
    }
    dequeue_ready(thread, old, token);
    enqueue_ready(thread, token);
}

/// Pop the highest-priority ready thread (FIFO within its band), fall back
/// to the idle thread if none is ready, and record it as Running.
///
/// Does not touch whatever thread was previously current: callers that are
/// replacing a still-runnable thread (an explicit yield, a preemption) must
/// call [`Thread::set_ready`] on it themselves before calling this, the same
/// way the teacher's `choose_next_running_task` folds that into one
/// operation -- done here as two steps so the two call sites that don't
/// need a requeue (blocking, termination) don't have to special-case it.
///
/// [`Thread::set_ready`]: crate::thread::Thread::set_ready
fn choose_next_running_task(token: &mut CpuLockTokenRefMut<'_>) {
    let next = {
        let state = SCHED
            .write(token)
            .as_mut()
            .expect("scheduler not initialized");
        let popped = state.highest_ready_priority().and_then(|prio| {
            let bucket = bucket_of_raw(prio);
            let popped = state.ready[bucket as usize].pop_front();
            if state.ready[bucket as usize].is_empty() {
                state.bitmap.clear(bucket);
            }
            popped
        });
        let next = popped.or(state.idle);
        state.current = next;
        next
    };
    if let Some(next) = next {
        unsafe { next.as_ref() }.set_running(token);
    }
}

/// Relinquish CPU Lock, pick the next thread to run, and ask the port to
/// switch to it. Used by [`crate::wait::wait_until`] once the calling
/// thread has been linked into a wait list and marked suspended, and by
/// [`yield_now`] after requeuing the calling thread as Ready.
pub(crate) fn suspend_current(mut lock: CpuLockGuard) {
    let mut token = lock.borrow_mut();
    choose_next_running_task(&mut token);
    drop(token);
    drop(lock);
    // Safety: CPU Lock was released by the drop above.
    unsafe { crate::port::port().yield_cpu() };
}

/// Relinquish CPU Lock and, if a higher-priority thread than the one
/// presently running is now ready, preempt it: requeue the current thread
/// as Ready, dispatch the new highest-priority thread, and ask the port to
/// perform the switch. Every kernel operation that might have made a
/// higher-priority thread ready (wake, priority change, thread creation)
/// ends by calling this.
pub(crate) fn unlock_cpu_and_check_preemption(mut lock: CpuLockGuard) {
    let mut token = lock.borrow_mut();
    let should_preempt = match SCHED.read(&token).as_ref() {
        None => false,
        Some(state) if state.lock_depth > 0 => false,
        Some(state) => {
            let current_priority = state
                .current
                .map(|t| unsafe { t.as_ref() }.effective_priority().get())
                .unwrap_or(0);
            state
                .highest_ready_priority()
                .map(|p| p > current_priority)
                .unwrap_or(false)
        }
    };

    if should_preempt {
        if let Some(current) = current_thread(&token) {
            unsafe { current.as_ref() }.set_ready(&mut token);
        }
        choose_next_running_task(&mut token);
    }
    drop(token);
    drop(lock);

    if should_preempt {
        // Safety: CPU Lock was released by the drop above.
        unsafe { crate::port::port().scheduler_reschedule() };
    }
}

/// Relinquish CPU Lock, pick the next thread to run, and hand control to
/// the port. Called once by [`crate::thread::Thread::exit`] after the
/// exiting thread has been fully torn down; the exiting thread's stack
/// must never be touched again after this call.
pub(crate) fn exit_current_and_reschedule(mut lock: CpuLockGuard) -> ! {
    let mut token = lock.borrow_mut();
    choose_next_running_task(&mut token);
    drop(token);
    drop(lock);
    crate::port::port().scheduler_start()
}
