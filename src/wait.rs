//! The blocking retry loop shared by every synchronization primitive.
//!
//! Every primitive in this crate (mutex, semaphore, condvar, event flags,
//! memory pool, message queue) blocks the same way: try the operation under
//! CPU Lock; if it cannot complete, link the calling thread's wait node into
//! the primitive's wait list (and, for timed calls, the clock's timeout
//! list), suspend, and on every wake re-enter CPU Lock and retry from the
//! top. [`wait_until`] is that loop, written once; each primitive supplies
//! only the primitive-specific "try it now" closure.
//!
//! Spurious wakes are permitted by design (the spec calls for this
//! explicitly): the loop does not care why it was woken, it simply retries.
use core::ptr::NonNull;

use crate::{
    clock::{self, Time},
    error::{Error, Result},
    klock::{self, CpuLockTokenRefMut},
    scheduler,
    thread::Thread,
    utils::intrusive_list::{Link, ListNode},
};

/// A thread's attachment point to a primitive's wait list.
///
/// Every [`Thread`] embeds exactly one of these (spec.md §3's "wait node
/// pointer... non-null iff the thread is linked into some primitive's wait
/// list"), reused across however many waits that thread performs over its
/// lifetime -- never two at once, since a thread cannot be waiting on two
/// primitives simultaneously.
pub(crate) struct WaitNode {
    link: Link<WaitNode>,
    /// Back-pointer to the owning thread. Patched in once, right after the
    /// thread is allocated, the same way [`crate::timer::TimerCb`] patches
    /// its self-referential [`crate::clock::Timeout`] target.
    thread: core::cell::Cell<Option<NonNull<Thread>>>,
    /// The specific wait list this node is currently linked into, if any.
    /// Needed so an asynchronous wake (timeout firing in tick context, or
    /// [`Thread::interrupt`] from an ISR) can unlink the node without
    /// knowing in advance which primitive the thread happened to be
    /// blocked on.
    owner_list: core::cell::Cell<Option<NonNull<WaitList>>>,
}

unsafe impl ListNode for WaitNode {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
}

impl WaitNode {
    pub(crate) const fn new() -> Self {
        Self {
            link: Link::new(),
            thread: core::cell::Cell::new(None),
            owner_list: core::cell::Cell::new(None),
        }
    }

    /// # Safety
    /// Must be called exactly once, right after the owning [`Thread`]
    /// reaches its final `'static` address.
    pub(crate) unsafe fn bind(&self, thread: NonNull<Thread>) {
        self.thread.set(Some(thread));
    }

    pub(crate) fn thread(&self) -> NonNull<Thread> {
        self.thread.get().expect("WaitNode used before bind()")
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.owner_list.get().is_some()
    }
}

/// A primitive's wait list: an intrusive list of [`WaitNode`]s kept sorted
/// by descending effective priority of the waiting thread, FIFO within a
/// priority band (spec.md §4.1's `link_node`).
pub(crate) type WaitList = crate::utils::intrusive_list::List<WaitNode>;

/// Link `node` (the calling thread's wait node) into `wait_list`, ordered by
/// the owning thread's current effective priority, and mark the thread
/// suspended. If `deadline` is given, also link the thread's timeout node
/// into the clock's timeout list.
///
/// Must be called with CPU Lock held, and `node` must not already be
/// linked anywhere.
/// Insert `node` into `wait_list`, ordered by its thread's current effective
/// priority (highest first, FIFO within a priority band). Does not touch the
/// thread's state or timeout; shared by [`link`] (first insertion) and
/// [`reorder`] (repositioning after a priority change).
fn insert_ordered(wait_list: &'static WaitList, node: &'static WaitNode) {
    let thread = node.thread();
    let prio = unsafe { thread.as_ref() }.effective_priority();

    let mut cursor = wait_list.back();
    while let Some(existing) = cursor {
        let existing_thread = unsafe { existing.as_ref() }.thread();
        if unsafe { existing_thread.as_ref() }.effective_priority() >= prio {
            break;
        }
        cursor = wait_list.prev_of(existing);
    }
    unsafe { wait_list.insert_after(cursor, NonNull::from(node)) };
    node.owner_list.set(Some(NonNull::from(wait_list)));
}

pub(crate) fn link(
    wait_list: &'static WaitList,
    node: &'static WaitNode,
    deadline: Option<Time>,
    token: &mut CpuLockTokenRefMut<'_>,
) {
    let thread = node.thread();
    insert_ordered(wait_list, node);

    if let Some(deadline) = deadline {
        unsafe { thread.as_ref() }.arm_timeout(deadline, token);
    }

    unsafe { thread.as_ref() }.set_suspended(token);
}

/// Reposition `node`'s thread within whatever wait list it is currently
/// linked into, after a change to its effective priority. A no-op if `node`
/// is not currently linked into any wait list.
///
/// Mirrors the teacher's `wait::reorder_wait_of_task`.
pub(crate) fn reorder(node: &'static WaitNode, _token: &mut CpuLockTokenRefMut<'_>) {
    if let Some(list) = node.owner_list.get() {
        let list = unsafe { list.as_ref() };
        unsafe { list.remove(NonNull::from(node)) };
        node.owner_list.set(None);
        insert_ordered(list, node);
    }
}

/// Unlink `node` from whatever wait list it is in (a no-op if it is not
/// linked into any) and disarm its timeout. Idempotent, as required by
/// spec.md §4.1.
pub(crate) fn unlink(node: &'static WaitNode, token: &mut CpuLockTokenRefMut<'_>) {
    if let Some(list) = node.owner_list.take() {
        unsafe { list.as_ref().remove(NonNull::from(node)) };
    }
    unsafe { node.thread().as_ref() }.disarm_timeout(token);
}

/// Pop the highest-priority, oldest waiter from `wait_list` (if any), move
/// it to Ready, and return its thread. Used by primitives that need to
/// inspect (and usually act on behalf of) the next waiter -- e.g. a mutex
/// transferring ownership -- before it actually resumes.
pub(crate) fn wake_one(
    wait_list: &'static WaitList,
    token: &mut CpuLockTokenRefMut<'_>,
) -> Option<NonNull<Thread>> {
    let node = wait_list.front()?;
    let node_ref = unsafe { node.as_ref() };
    let thread = node_ref.thread();
    unlink(node_ref, token);
    unsafe { thread.as_ref() }.set_ready(token);
    Some(thread)
}

/// Wake every waiter on `wait_list`. Each one re-enters [`wait_until`]'s
/// loop and re-evaluates its own condition; most will simply see
/// `would_block`/`timeout` again unless the primitive's state genuinely
/// changed for all of them (e.g. [`crate::semaphore::Semaphore::reset`]).
pub(crate) fn wake_all(wait_list: &'static WaitList, token: &mut CpuLockTokenRefMut<'_>) {
    while wake_one(wait_list, token).is_some() {}
}

/// The highest-priority, oldest thread currently waiting, without removing
/// it. Used by [`crate::mutex::Mutex::unlock`] to transfer ownership to the
/// next owner atomically, in the same critical section that wakes it.
pub(crate) fn peek(wait_list: &'static WaitList) -> Option<NonNull<Thread>> {
    wait_list
        .front()
        .map(|node| unsafe { node.as_ref() }.thread())
}

/// Called from tick (interrupt) context when a waiting thread's timeout
/// elapses. Unlinks it from its wait list and makes it Ready; the thread's
/// own retry loop will observe `now() >= deadline` and return
/// [`Error::Timeout`].
pub(crate) fn wake_by_timeout(thread: NonNull<Thread>, token: &mut CpuLockTokenRefMut<'_>) {
    let node = unsafe { thread.as_ref() }.wait_node();
    if node.is_linked() {
        unlink(node, token);
    }
    unsafe { thread.as_ref() }.set_ready(token);
}

/// The generic blocking loop. `try_once` attempts the operation and, on
/// success, performs whatever side effect completes it (e.g. decrementing a
/// semaphore count) and returns `Some(value)`; on failure it must leave
/// state untouched and return `None`.
///
/// Mirrors the teacher's `WaitQueue::wait`/`wait_timeout`, collapsed to a
/// closure since this crate's primitives do not share one wait-payload
/// enum.
pub(crate) fn wait_until<T>(
    wait_list: &'static WaitList,
    deadline: Option<Time>,
    mut try_once: impl FnMut(&mut CpuLockTokenRefMut<'_>) -> Option<T>,
) -> Result<T> {
    if scheduler::in_handler_mode() {
        return Err(Error::Permission);
    }
    loop {
        let mut lock = klock::lock_cpu()?;
        let mut token = lock.borrow_mut();

        if let Some(value) = try_once(&mut token) {
            return Ok(value);
        }

        let me = scheduler::current_thread(&token).ok_or(Error::Permission)?;
        if unsafe { me.as_ref() }.take_interrupted(&mut token) {
            return Err(Error::Interrupted);
        }
        if let Some(deadline) = deadline {
            if clock::now() >= deadline {
                return Err(Error::Timeout);
            }
        }

        let node = unsafe { me.as_ref() }.wait_node();
        link(wait_list, node, deadline, &mut token);
        drop(token);
        scheduler::suspend_current(lock);
    }
}

/// Non-blocking variant: attempt the operation once under CPU Lock and
/// return [`Error::WouldBlock`] instead of suspending. ISR-safe as long as
/// `try_once` itself is (it never touches the wait list or the scheduler).
pub(crate) fn try_once<T>(
    mut try_once: impl FnMut(&mut CpuLockTokenRefMut<'_>) -> Option<T>,
) -> Result<T> {
    let mut lock = klock::lock_cpu()?;
    let mut token = lock.borrow_mut();
    try_once(&mut token).ok_or(Error::WouldBlock)
}
