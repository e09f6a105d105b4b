//! Thread control block and lifecycle state machine.
//!
//! Grounded on `r3_kernel/src/task.rs`'s `TaskCb`/`TaskSt` (collapsed from
//! its `Traits: KernelTraits` generic parameterization to a single concrete
//! type, per this crate's single-kernel-instance design) and on
//! `r3_kernel/src/event_group.rs`'s bit-test core, reused here via
//! [`crate::event_flags::poll`] for the per-thread flag operations.
use core::{
    cell::Cell,
    mem::MaybeUninit,
    ptr::NonNull,
};

use alloc::boxed::Box;

use crate::{
    clock::{Duration, Time, TimeoutTarget},
    error::{Error, Result},
    event_flags::{self, WaitMode},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    mutex::Mutex,
    scheduler,
    utils::intrusive_list::{Link, List, ListNode},
    wait::{self, WaitList, WaitNode},
};

/// A thread priority. Priorities span the full [`u8`] range; 0 is reserved
/// for the idle thread and cannot be assigned to an application thread
/// (spec.md §3: "Priority none is invalid"). Higher values are more urgent,
/// the opposite of the teacher's `TaskPriority` convention -- see
/// `scheduler.rs`'s ready-bitmap indexing for where that flip is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Self = Self(1);
    pub const MAX: Self = Self(255);

    /// Reserved for the idle thread; rejected by [`Self::new`].
    pub(crate) const IDLE: Self = Self(0);

    pub fn new(value: u8) -> Result<Self> {
        if value == 0 {
            Err(Error::InvalidArgument)
        } else {
            Ok(Self(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// A thread's stable identity, comparable and hashable without dereferencing
/// the thread itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(NonNull<Thread>);

unsafe impl Send for ThreadId {}
unsafe impl Sync for ThreadId {}

/// Thread lifecycle state (spec.md §4.2's state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Undefined,
    Initializing,
    Ready,
    Running,
    Suspended,
    Terminated,
    Destroyed,
}

pub(crate) struct ChildTag;

const STACK_GUARD_WORD: u32 = 0xA5A5_A5A5;
const GUARD_LEN: usize = core::mem::size_of::<u32>();

/// *Thread control block* -- the state data of a thread.
pub struct Thread {
    assigned_priority: Cell<Priority>,
    inherited_priority: Cell<Priority>,
    /// `max(assigned, inherited)`, recomputed on every change to either.
    /// Plain [`Cell`] rather than [`CpuLockCell`], matching [`WaitNode`]'s
    /// fields: every access happens while CPU Lock is held by convention,
    /// but the type system doesn't need to enforce it for this one field
    /// because [`wait::link`]/[`wait::insert_ordered`] read it to order a
    /// wait list while the caller's token isn't threaded all the way
    /// through a comparison closure.
    effective_priority: Cell<Priority>,

    state: CpuLockCell<ThreadState>,
    interrupted: CpuLockCell<bool>,

    stack_ptr: NonNull<u8>,
    stack_len: usize,

    exit_code: CpuLockCell<usize>,

    flags: CpuLockCell<u32>,
    flags_waiters: WaitList,

    wait_node: WaitNode,
    pub(crate) timeout: crate::clock::Timeout,

    join_waiters: WaitList,
    detached: CpuLockCell<bool>,

    parent: Cell<Option<NonNull<Thread>>>,
    children: List<Thread, ChildTag>,
    child_link: Link<Thread>,

    acquired_mutexes: List<Mutex, crate::mutex::AcquiredMutexTag>,

    pub(crate) ready_link: Link<Thread>,

    /// Reserved for the port's own bookkeeping (typically a saved stack
    /// pointer). The kernel core never reads this.
    port_data: Cell<usize>,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

unsafe impl ListNode<ChildTag> for Thread {
    fn link(&self) -> &Link<Self> {
        &self.child_link
    }
}

impl Thread {
    /// Create a thread with its own heap-allocated stack, ready to run
    /// `entry(arg)`.
    ///
    /// The new thread is linked as a child of the calling thread (if any)
    /// and made Ready. Corresponds to spec.md §4.2's "create: -> ready".
    pub fn spawn(
        priority: Priority,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        stack_size: usize,
    ) -> Result<&'static Thread> {
        if priority == Priority::IDLE || !crate::port::port().priority_is_valid(priority.get()) {
            return Err(Error::InvalidArgument);
        }
        Self::spawn_with(priority, entry, arg, stack_size)
    }

    /// Create the kernel's one idle thread. Called once from
    /// [`crate::scheduler::initialize`]; never exposed to application code,
    /// since [`Priority::IDLE`] is otherwise rejected by [`Self::spawn`].
    pub(crate) fn spawn_idle(
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        stack_size: usize,
    ) -> Result<&'static Thread> {
        Self::spawn_with(Priority::IDLE, entry, arg, stack_size)
    }

    fn spawn_with(
        priority: Priority,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        stack_size: usize,
    ) -> Result<&'static Thread> {
        let is_idle = priority == Priority::IDLE;
        if stack_size < 2 * GUARD_LEN {
            return Err(Error::InvalidArgument);
        }

        let mut stack =
            alloc::vec![MaybeUninit::<u8>::uninit(); stack_size].into_boxed_slice();
        write_guard(&mut stack[..GUARD_LEN]);
        write_guard(&mut stack[stack.len() - GUARD_LEN..]);
        let stack: &'static mut [MaybeUninit<u8>] = Box::leak(stack);
        let stack_ptr = NonNull::new(stack.as_mut_ptr() as *mut u8).unwrap();
        let stack_len = stack.len();

        let thread: &'static Thread = Box::leak(Box::new(Self {
            assigned_priority: Cell::new(priority),
            inherited_priority: Cell::new(Priority::IDLE),
            effective_priority: Cell::new(priority),
            state: CpuLockCell::new(ThreadState::Initializing),
            interrupted: CpuLockCell::new(false),
            stack_ptr,
            stack_len,
            exit_code: CpuLockCell::new(0),
            flags: CpuLockCell::new(0),
            flags_waiters: WaitList::new(),
            wait_node: WaitNode::new(),
            timeout: crate::clock::Timeout::new(TimeoutTarget::WaitTimeout(NonNull::dangling())),
            join_waiters: WaitList::new(),
            detached: CpuLockCell::new(false),
            parent: Cell::new(None),
            children: List::new(),
            child_link: Link::new(),
            acquired_mutexes: List::new(),
            ready_link: Link::new(),
            port_data: Cell::new(0),
        }));

        // Safety: `thread` just reached its final `'static` address.
        unsafe { thread.wait_node.bind(NonNull::from(thread)) };
        thread
            .timeout
            .set_target(TimeoutTarget::WaitTimeout(NonNull::from(thread)));

        let stack_slice =
            unsafe { core::slice::from_raw_parts_mut(stack_ptr.as_ptr().cast(), stack_len) };
        // Safety: `stack_slice` is exclusively owned by this not-yet-started
        // thread, and is valid for the thread's lifetime.
        unsafe {
            crate::port::port().thread_init(stack_slice, entry, arg, &thread.port_data);
        }

        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        if let Some(parent) = scheduler::current_thread(&token) {
            thread.parent.set(Some(parent));
            // Safety: `thread` is not linked into any `ChildTag` list yet.
            unsafe {
                parent
                    .as_ref()
                    .children
                    .push_back(NonNull::from(thread))
            };
        }
        if is_idle {
            // The idle thread is the scheduler's fallback, not a candidate
            // in its own right: it must never appear in `ready`/`bitmap`
            // (see `SchedulerState::idle`), so it goes straight to Ready
            // without `enqueue_ready`.
            *thread.state.write(&mut token) = ThreadState::Ready;
        } else {
            thread.set_ready(&mut token);
        }
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);

        Ok(thread)
    }

    pub fn id(&'static self) -> ThreadId {
        ThreadId(NonNull::from(self))
    }

    pub fn priority(&'static self) -> Priority {
        self.assigned_priority.get()
    }

    /// Set the thread's assigned priority. Re-sorts the thread within the
    /// ready list or its current wait list if its effective priority
    /// changes, and may trigger an immediate reschedule.
    pub fn set_priority(&'static self, p: Priority) -> Result<()> {
        if p == Priority::IDLE {
            return Err(Error::InvalidArgument);
        }
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        self.assigned_priority.set(p);
        self.recompute_effective_priority(&mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Boost (or lower) the thread's inherited priority. Called by the
    /// mutex lock/unlock path; never exposed directly to application code.
    pub(crate) fn set_inherited_priority(
        &'static self,
        p: Priority,
        token: &mut CpuLockTokenRefMut<'_>,
    ) {
        self.inherited_priority.set(p);
        self.recompute_effective_priority(token);
    }

    pub(crate) fn inherited_priority(&self) -> Priority {
        self.inherited_priority.get()
    }

    fn recompute_effective_priority(&'static self, token: &mut CpuLockTokenRefMut<'_>) {
        let old = self.effective_priority.get();
        let new = self.assigned_priority.get().max(self.inherited_priority.get());
        if new == old {
            return;
        }
        self.effective_priority.set(new);
        match *self.state.read(token) {
            ThreadState::Ready => scheduler::reorder_ready(NonNull::from(self), old, new, token),
            ThreadState::Suspended => wait::reorder(&self.wait_node, token),
            _ => {}
        }
    }

    pub(crate) fn effective_priority(&self) -> Priority {
        self.effective_priority.get()
    }

    /// Suspend the calling thread until `self` reaches the Destroyed state,
    /// then return its exit code.
    pub fn join(&'static self) -> Result<usize> {
        if scheduler::in_handler_mode() {
            return Err(Error::Permission);
        }
        {
            let mut lock = klock::lock_cpu()?;
            let token = lock.borrow_mut();
            if let Some(me) = scheduler::current_thread(&token) {
                if core::ptr::eq(me.as_ptr(), self as *const Thread as *mut Thread) {
                    return Err(Error::Deadlock);
                }
            }
        }
        wait::wait_until(&self.join_waiters, None, |token| {
            if *self.state.read(token) == ThreadState::Destroyed {
                Some(*self.exit_code.read(token))
            } else {
                None
            }
        })
    }

    /// Mark the thread's storage reclaimable at termination without a
    /// matching [`Self::join`].
    pub fn detach(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        *self.detached.write(&mut token) = true;
        Ok(())
    }

    pub(crate) fn is_detached(&self, token: &CpuLockTokenRefMut<'_>) -> bool {
        *self.detached.read(token)
    }

    /// Set (or clear) the interrupted flag, waking the thread if it is
    /// currently suspended. ISR-safe. Returns the previous flag value.
    pub fn interrupt(&'static self, value: bool) -> Result<bool> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let prev = {
            let cell = self.interrupted.write(&mut token);
            let prev = *cell;
            *cell = value;
            prev
        };
        if value && *self.state.read(&token) == ThreadState::Suspended {
            if self.wait_node.is_linked() {
                wait::unlink(&self.wait_node, &mut token);
            }
            self.set_ready(&mut token);
        }
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(prev)
    }

    pub(crate) fn take_interrupted(&self, token: &mut CpuLockTokenRefMut<'_>) -> bool {
        let cell = self.interrupted.write(token);
        let v = *cell;
        *cell = false;
        v
    }

    /// Asynchronously terminate the thread: unlink it from any wait/timeout
    /// list, abandon its held mutexes, and wake its joiner.
    pub fn kill(&'static self) -> Result<()> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        self.terminate(&mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Self-terminate. Does not return.
    pub fn exit(exit_code: usize) -> ! {
        let mut lock = klock::lock_cpu().expect("Thread::exit called with CPU Lock already held");
        let mut token = lock.borrow_mut();
        let me = scheduler::current_thread(&token).expect("Thread::exit called outside a thread");
        *unsafe { me.as_ref() }.exit_code.write(&mut token) = exit_code;
        unsafe { me.as_ref() }.terminate(&mut token);
        drop(token);
        scheduler::exit_current_and_reschedule(lock)
    }

    /// Shared by [`Self::kill`] and [`Self::exit`]. Transitions through
    /// Terminated to Destroyed, releasing everything the thread held.
    /// A real reaper-thread handoff (spec.md §4.2) is collapsed to this
    /// synchronous finalization since nothing here ever actually preempts
    /// mid-teardown.
    pub(crate) fn terminate(&'static self, token: &mut CpuLockTokenRefMut<'_>) {
        if *self.state.read(token) == ThreadState::Destroyed {
            return;
        }
        if self.wait_node.is_linked() {
            wait::unlink(&self.wait_node, token);
        } else {
            crate::clock::TIMEOUTS
                .write(token)
                .remove(NonNull::from(&self.timeout));
        }
        if *self.state.read(token) == ThreadState::Ready {
            scheduler::dequeue_ready(NonNull::from(self), self.effective_priority.get(), token);
        }
        *self.state.write(token) = ThreadState::Terminated;
        crate::mutex::abandon_held_mutexes(self, token);
        debug_assert!(self.acquired_mutexes.is_empty());
        *self.state.write(token) = ThreadState::Destroyed;
        wait::wake_all(&self.join_waiters, token);
    }

    pub(crate) fn set_suspended(&'static self, token: &mut CpuLockTokenRefMut<'_>) {
        *self.state.write(token) = ThreadState::Suspended;
    }

    pub(crate) fn set_ready(&'static self, token: &mut CpuLockTokenRefMut<'_>) {
        *self.state.write(token) = ThreadState::Ready;
        scheduler::enqueue_ready(NonNull::from(self), token);
    }

    pub(crate) fn set_running(&'static self, token: &mut CpuLockTokenRefMut<'_>) {
        *self.state.write(token) = ThreadState::Running;
    }

    pub(crate) fn state(&self, token: &CpuLockTokenRefMut<'_>) -> ThreadState {
        *self.state.read(token)
    }

    pub(crate) fn wait_node(&'static self) -> &'static WaitNode {
        &self.wait_node
    }

    pub(crate) fn arm_timeout(&'static self, deadline: Time, token: &mut CpuLockTokenRefMut<'_>) {
        unsafe {
            crate::clock::TIMEOUTS
                .write(token)
                .insert(NonNull::from(&self.timeout), deadline)
        };
    }

    pub(crate) fn disarm_timeout(&'static self, token: &mut CpuLockTokenRefMut<'_>) {
        crate::clock::TIMEOUTS
            .write(token)
            .remove(NonNull::from(&self.timeout));
    }

    pub(crate) fn acquired_mutexes(&self) -> &List<Mutex, crate::mutex::AcquiredMutexTag> {
        &self.acquired_mutexes
    }

    /// OR `mask` into the thread's event-flag word, waking anything waiting
    /// on it. ISR-safe. Returns the bits as they stood before the raise.
    pub fn flags_raise(&'static self, mask: u32) -> Result<u32> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let prev = {
            let cell = self.flags.write(&mut token);
            let prev = *cell;
            *cell |= mask;
            prev
        };
        wait::wake_all(&self.flags_waiters, &mut token);
        drop(token);
        scheduler::unlock_cpu_and_check_preemption(lock);
        Ok(prev)
    }

    pub fn flags_wait(&'static self, mask: u32, mode: WaitMode, clear: bool) -> Result<u32> {
        wait::wait_until(&self.flags_waiters, None, |token| {
            event_flags::poll(self.flags.write(token), mask, mode, clear)
        })
    }

    pub fn flags_try_wait(&'static self, mask: u32, mode: WaitMode, clear: bool) -> Result<u32> {
        wait::try_once(|token| event_flags::poll(self.flags.write(token), mask, mode, clear))
    }

    pub fn flags_timed_wait(
        &'static self,
        mask: u32,
        mode: WaitMode,
        clear: bool,
        timeout: Duration,
    ) -> Result<u32> {
        let deadline = crate::clock::now()
            .checked_add(timeout)
            .unwrap_or(Time(u64::MAX));
        wait::wait_until(&self.flags_waiters, Some(deadline), |token| {
            event_flags::poll(self.flags.write(token), mask, mode, clear)
        })
    }

    /// Observe the thread's flags without blocking or consuming them.
    pub fn flags_get(&'static self, mask: u32) -> Result<u32> {
        let lock = klock::lock_cpu()?;
        let bits = *self.flags.read(&lock);
        let effective_mask = if mask == 0 { u32::MAX } else { mask };
        Ok(bits & effective_mask)
    }

    /// Clear `mask` from the thread's flags without blocking. Returns the
    /// bits as they stood before the clear.
    pub fn flags_clear(&'static self, mask: u32) -> Result<u32> {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();
        let cell = self.flags.write(&mut token);
        let prev = *cell;
        *cell &= !mask;
        Ok(prev)
    }
}

fn write_guard(bytes: &mut [MaybeUninit<u8>]) {
    for (b, v) in bytes.iter_mut().zip(STACK_GUARD_WORD.to_ne_bytes()) {
        b.write(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rejects_zero() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(1).is_ok());
        assert_eq!(Priority::new(200).unwrap().get(), 200);
    }

    #[test]
    fn priority_ordering_matches_raw_value() {
        assert!(Priority::new(200).unwrap() > Priority::new(100).unwrap());
    }
}
