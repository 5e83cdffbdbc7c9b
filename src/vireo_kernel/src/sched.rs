//! The scheduler.
//!
//! A strict-priority preemptive scheduler: the runnable thread with the
//! highest effective priority runs, FIFO within a priority, with an
//! optional round-robin time slice. The current thread remains linked in
//! the ready list at its proper position; the `current` pointer marks it.
//!
//! All operations run inside kernel critical sections. Blocking operations
//! are split into a bookkeeping half ([`block_begin`]) executed under the
//! caller's CPU Lock and a suspension half ([`block_finish`]) that opens an
//! interrupt window so the pended context switch can be taken.
use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::{
    fatal_error,
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockToken, CpuLockTokenRefMut},
    list::{SleepListTag, ThreadList, ThreadRef},
    mutex, stack,
    tcb::{SchedulingPolicy, ThreadState, UnblockReason},
    thread, tick,
    utils::Init,
    KernelTraits, PortThreading,
};

/// The kernel-global state: the scheduler's queues and the tick clock.
///
/// A single instance exists per kernel trait type, reachable through
/// [`KernelTraits::state`].
pub struct KernelState<Traits: PortThreading> {
    /// The currently running thread. `None` before boot and while the
    /// current thread is exiting.
    pub(crate) current: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,

    /// Runnable threads, ordered by effective priority (descending), FIFO
    /// within a priority. Includes the current thread.
    pub(crate) ready: ThreadList<Traits>,

    /// Threads with a wake deadline, ordered by deadline (ascending).
    /// Membership is in addition to a wait-list membership.
    pub(crate) sleeping: ThreadList<Traits, SleepListTag>,

    /// Threads that have exited but are still observable by joiners.
    pub(crate) terminated: ThreadList<Traits>,

    /// Ticks since boot.
    pub(crate) tick: CpuLockCell<Traits, u64>,

    /// Head of the deferred-reclamation list of exited detached threads,
    /// drained by the idle thread.
    #[cfg(feature = "thread-detach")]
    pub(crate) reap_head: CpuLockCell<Traits, Option<NonNull<dyn thread::Reclaim<Traits>>>>,
}

// Safety: all mutable state is behind `CpuLockCell`s, serialized by the
// CPU Lock on this single-core system.
unsafe impl<Traits: PortThreading> Send for KernelState<Traits> {}
unsafe impl<Traits: PortThreading> Sync for KernelState<Traits> {}

impl<Traits: PortThreading> Init for KernelState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current: Init::INIT,
        ready: Init::INIT,
        sleeping: Init::INIT,
        terminated: Init::INIT,
        tick: Init::INIT,
        #[cfg(feature = "thread-detach")]
        reap_head: Init::INIT,
    };
}

impl<Traits: PortThreading> KernelState<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: PortThreading> Default for KernelState<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> KernelState<Traits> {
    pub(crate) fn running_thread(&self, token: &CpuLockToken<Traits>) -> Option<ThreadRef<Traits>> {
        self.current.get(token)
    }
}

/// Fail with `NotPermitted` if the current context cannot block (an
/// interrupt service routine).
#[inline]
pub(crate) fn expect_waitable_context<Traits: KernelTraits>(
) -> Result<(), crate::error::ContextError> {
    if Traits::is_in_interrupt_context() {
        Err(crate::error::ContextError::NotPermitted)
    } else {
        Ok(())
    }
}

/// The currently running thread. Fatal if the scheduler is not started.
pub(crate) fn current<Traits: KernelTraits>(token: &CpuLockToken<Traits>) -> ThreadRef<Traits> {
    match Traits::state().current.get(token) {
        Some(thread) => thread,
        None => fatal_error!(Traits, "no current thread"),
    }
}

/// Request a context switch if the ready list head is not the current
/// thread.
pub(crate) fn check_preemption<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let state = Traits::state();
    let head = state.ready.first(lock.borrow_mut());
    if head != state.current.get(&*lock) {
        Traits::request_context_switch();
    }
}

/// Make `thread` runnable and insert it at the tail of its priority group.
/// Preempts the current thread if the newcomer outranks it.
pub(crate) fn add_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    let cb = thread.cb();
    log::trace!(
        "thread {:p} becomes runnable at priority {}",
        thread.as_ptr(),
        cb.effective_priority(&*lock)
    );
    if cb.state(&*lock) == ThreadState::Created {
        // The first transition to Runnable invalidates identifiers minted
        // before the thread existed as a schedulable entity.
        cb.bump_sequence_number(&mut lock.borrow_mut());
    }
    cb.set_state(&mut lock.borrow_mut(), ThreadState::Runnable);
    cb.set_slice_left(&mut lock.borrow_mut(), 0);
    Traits::state().ready.insert_priority(lock.borrow_mut(), thread);
    check_preemption(lock);
}

/// Move the current thread to the tail of its priority group and request a
/// context switch if that changes the ready list head.
pub(crate) fn yield_current<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let cur = current(&*lock);
    Traits::state().ready.reposition(lock.borrow_mut(), cur, false);
    check_preemption(lock);
}

/// First half of a blocking operation: take the current thread off the
/// ready list and park it on `list` in the given state.
///
/// `list` must stay at a stable address until the wait ends; the waits the
/// kernel creates satisfy this because the list either lives in a
/// synchronization object the blocked caller borrows, or in the blocked
/// caller's own stack frame.
pub(crate) fn block_begin<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    list: &ThreadList<Traits>,
    state: ThreadState,
) -> ThreadRef<Traits> {
    let cur = current(&*lock);
    let cb = cur.cb();
    Traits::state().ready.remove(lock.borrow_mut(), cur);
    cb.set_state(&mut lock.borrow_mut(), state);
    list.insert_priority(lock.borrow_mut(), cur);
    cb.set_blocked_list(&mut lock.borrow_mut(), Some(NonNull::from(list)));
    cur
}

/// Second half of a blocking operation: let the pended context switch run,
/// and return once the thread is runnable again, along with the reason it
/// was woken.
pub(crate) fn block_finish<Traits: KernelTraits>(
    guard: CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
) -> (CpuLockGuard<Traits>, UnblockReason) {
    Traits::request_context_switch();
    loop {
        // Temporarily release CPU Lock so the context switch can be taken.
        // Safety: (1) no CPU-Lock-protected state is accessed while
        // unlocked; (2) CPU Lock is held on entry; (3) it is re-acquired
        // before the loop is left.
        unsafe { Traits::leave_cpu_lock() };
        unsafe { Traits::enter_cpu_lock() };

        if thread.cb().state(&*guard) == ThreadState::Runnable {
            break;
        }
    }
    let reason = thread.cb().unblock_reason(&*guard);
    (guard, reason)
}

/// Block the current thread on `list` until [`unblock`]ed.
pub(crate) fn block<Traits: KernelTraits>(
    mut guard: CpuLockGuard<Traits>,
    list: &ThreadList<Traits>,
    state: ThreadState,
) -> (CpuLockGuard<Traits>, UnblockReason) {
    let thread = block_begin(guard.borrow_mut(), list, state);
    block_finish(guard, thread)
}

/// Like [`block`], but the wait also ends (with
/// [`UnblockReason::Timeout`]) once the tick clock reaches `deadline`.
/// A deadline at or before the current time completes immediately.
pub(crate) fn block_until<Traits: KernelTraits>(
    mut guard: CpuLockGuard<Traits>,
    list: &ThreadList<Traits>,
    state: ThreadState,
    deadline: tick::TickPoint,
) -> (CpuLockGuard<Traits>, UnblockReason) {
    if deadline <= tick::now_locked(guard.borrow_mut()) {
        return (guard, UnblockReason::Timeout);
    }
    let thread = block_begin(guard.borrow_mut(), list, state);
    set_wake_deadline(guard.borrow_mut(), thread, deadline);
    block_finish(guard, thread)
}

/// Register a wake deadline for a thread parked by [`block_begin`]: the
/// tick handler will time the wait out once the clock reaches `deadline`.
pub(crate) fn set_wake_deadline<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
    deadline: tick::TickPoint,
) {
    thread
        .cb()
        .set_wake_deadline(&mut lock.borrow_mut(), deadline.as_ticks());
    thread.cb().set_in_sleep_list(&mut lock.borrow_mut(), true);
    Traits::state().sleeping.insert_deadline(lock, thread);
}

/// Take `thread` out of its wait and return it to the ready list.
///
/// Removes the thread from its wait list and, if present, from the
/// sleeping list; records `reason` for the woken call to read; requests a
/// context switch if the woken thread preempts the current one.
pub(crate) fn unblock<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
    reason: UnblockReason,
) {
    make_runnable_from_wait(lock.borrow_mut(), thread, reason);
    check_preemption(lock);
}

/// The core of [`unblock`], shared with the tick handler's timeout sweep
/// (which performs a single preemption check after the whole sweep).
fn make_runnable_from_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
    reason: UnblockReason,
) {
    let cb = thread.cb();
    debug_assert!(cb.state(&*lock).is_blocked());

    if let Some(list) = cb.blocked_list(&*lock) {
        // Safety: the wait list outlives the wait (see `block_begin`)
        unsafe { list.as_ref() }.remove(lock.borrow_mut(), thread);
        cb.set_blocked_list(&mut lock.borrow_mut(), None);
    }
    if cb.in_sleep_list(&*lock) {
        Traits::state().sleeping.remove(lock.borrow_mut(), thread);
        cb.set_in_sleep_list(&mut lock.borrow_mut(), false);
    }

    cb.set_unblock_reason(&mut lock.borrow_mut(), reason);
    cb.set_state(&mut lock.borrow_mut(), ThreadState::Runnable);
    Traits::state().ready.insert_priority(lock.borrow_mut(), thread);

    // Leaving a mutex's waiter set may deflate the owner's inherited
    // priority.
    if let Some(mutex) = cb.blocked_on_mutex(&*lock) {
        cb.set_blocked_on_mutex(&mut lock.borrow_mut(), None);
        // Safety: a mutex with waiters is kept alive by its waiters
        unsafe { mutex.as_ref() }.on_waiter_removed(lock.borrow_mut());
    }
}

/// Wake `thread` with [`UnblockReason::Signal`] if it is blocked; no-op
/// otherwise. Used by the signal delivery machinery.
#[cfg(feature = "signals")]
pub(crate) fn interrupt_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    if thread.cb().state(&*lock).is_blocked() {
        unblock(lock.borrow_mut(), thread, UnblockReason::Signal);
    }
}

/// Terminate the current thread: move it to the terminated list, leave its
/// group, and hand any held mutexes to their next waiters. The caller
/// (the thread exiter) runs the exit hooks around this and then discards
/// the execution context.
pub(crate) fn remove_current<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> ThreadRef<Traits> {
    let cur = current(&*lock);
    let cb = cur.cb();
    log::trace!("thread {:p} terminates", cur.as_ptr());

    mutex::abandon_held_mutexes(lock.borrow_mut(), cur);

    Traits::state().ready.remove(lock.borrow_mut(), cur);
    cb.set_state(&mut lock.borrow_mut(), ThreadState::Terminated);
    Traits::state().terminated.push_back(lock.borrow_mut(), cur);

    if let Some(group) = cb.group(&*lock) {
        // Safety: the group outlives its member threads
        unsafe { group.as_ref() }.remove(lock.borrow_mut(), cur);
        cb.set_group(&mut lock.borrow_mut(), None);
    }

    Traits::state().current.replace(&mut *lock, None);
    cur
}

/// Drop a terminated thread's membership in the terminated list. Called
/// when its storage is about to be reclaimed.
pub(crate) fn discard_terminated<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    debug_assert_eq!(thread.cb().state(&*lock), ThreadState::Terminated);
    Traits::state().terminated.remove(lock.borrow_mut(), thread);
    thread.cb().bump_sequence_number(&mut lock.borrow_mut());
}

/// The tick interrupt handler.
///
/// Advances the tick clock, checks the current thread's stack guard,
/// charges the round-robin slice, and wakes every sleeper whose deadline
/// has passed. Returns `true` iff a context switch is needed.
///
/// # Safety
///
/// Must be called from the tick interrupt with CPU Lock inactive.
pub(crate) unsafe fn tick_interrupt<Traits: KernelTraits>() -> bool {
    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        fatal_error!(Traits, "tick interrupt inside a kernel critical section")
    };
    let mut lock = guard.borrow_mut();
    let state = Traits::state();

    let now = tick::advance(lock.borrow_mut());

    if let Some(cur) = state.current.get(&*lock) {
        let cb = cur.cb();

        if !cb.stack().guard_intact() {
            fatal_error!(Traits, "stack overflow detected");
        }

        if cb.scheduling_policy(&*lock) == SchedulingPolicy::RoundRobin {
            let left = cb.slice_left(&*lock).saturating_sub(1);
            if left == 0 {
                // Slice expired: recharge and step behind equal-priority
                // peers.
                cb.set_slice_left(&mut lock.borrow_mut(), Traits::ROUND_ROBIN_QUANTUM);
                state.ready.reposition(lock.borrow_mut(), cur, false);
            } else {
                cb.set_slice_left(&mut lock.borrow_mut(), left);
            }
        }
    }

    while let Some(first) = state.sleeping.first(lock.borrow_mut()) {
        if first.cb().wake_deadline(&*lock) > now.as_ticks() {
            break;
        }
        make_runnable_from_wait(lock.borrow_mut(), first, UnblockReason::Timeout);
    }

    state.ready.first(lock.borrow_mut()) != state.current.get(&*lock)
}

/// The context-switch handler.
///
/// Saves `current_sp` into the outgoing thread's stack save slot, elects
/// the ready list head as the new current thread, and returns its saved
/// stack pointer.
///
/// # Safety
///
/// Must be called from the context-switch handler with CPU Lock active.
pub(crate) unsafe fn switch_context<Traits: KernelTraits>(current_sp: *mut u8) -> *mut u8 {
    // Safety: the caller guarantees CPU Lock is active
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let state = Traits::state();

    if let Some(outgoing) = state.current.get(&*lock) {
        let stack = outgoing.cb().stack();
        #[cfg(feature = "stack-pointer-check")]
        if !stack.check_stack_pointer(current_sp) {
            fatal_error!(Traits, "stack pointer outside the thread's stack");
        }
        stack.set_stack_pointer(lock.borrow_mut(), current_sp);
    }

    let Some(next) = state.ready.first(lock.borrow_mut()) else {
        // The idle thread never blocks, so the ready list cannot drain.
        fatal_error!(Traits, "ready list empty")
    };
    state.current.replace(&mut *lock, Some(next));

    let cb = next.cb();
    if cb.scheduling_policy(&*lock) == SchedulingPolicy::RoundRobin && cb.slice_left(&*lock) == 0 {
        cb.set_slice_left(&mut lock.borrow_mut(), Traits::ROUND_ROBIN_QUANTUM);
    }

    let sp = cb.stack().stack_pointer(lock.borrow_mut());

    // The CPU Lock is owned by the calling interrupt handler.
    core::mem::forget(lock);
    sp
}

/// Initialize the scheduler (see [`crate::PortToKernel::boot`]).
pub(crate) unsafe fn boot<Traits: KernelTraits>(
    main_stack_bottom: *mut u8,
    main_stack_size: usize,
) {
    // Safety: forwarded from the `boot` contract
    let main_stack = unsafe { stack::Stack::borrowed(main_stack_bottom, main_stack_size) };
    let main = Box::leak(Box::new(thread::MainThread::new(
        main_stack,
        Traits::MAIN_THREAD_PRIORITY,
        SchedulingPolicy::RoundRobin,
    )));

    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        fatal_error!(Traits, "boot inside a kernel critical section")
    };
    main.adopt_current_context(guard.borrow_mut());
    drop(guard);

    log::debug!(
        "scheduler started; main thread at priority {}",
        Traits::MAIN_THREAD_PRIORITY
    );
    thread::spawn_idle::<Traits>();
}

/// Push an exited detached thread onto the deferred-reclamation list.
#[cfg(feature = "thread-detach")]
pub(crate) fn enqueue_reclaim<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    item: NonNull<dyn thread::Reclaim<Traits>>,
) {
    let state = Traits::state();
    let head = state.reap_head.get(&*lock);
    // Safety: `item` points to a live, leaked thread object
    unsafe { item.as_ref() }
        .next_reclaim()
        .replace(&mut *lock, head);
    state.reap_head.replace(&mut *lock, Some(item));
}

/// Reclaim one exited detached thread, if any. Runs on the idle thread's
/// stack, never on the stack being freed.
#[cfg(feature = "thread-detach")]
pub(crate) fn reclaim_one<Traits: KernelTraits>() {
    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        return;
    };
    let item = {
        let mut lock = guard.borrow_mut();
        let state = Traits::state();
        let head = state.reap_head.get(&*lock);
        if let Some(item) = head {
            // Safety: `item` points to a live, leaked thread object
            let next = unsafe { item.as_ref() }.next_reclaim().get(&*lock);
            state.reap_head.replace(&mut *lock, next);
        }
        head
    };
    drop(guard);
    if let Some(item) = item {
        // Safety: the pointer was minted from `Box::into_raw` by the detach
        // protocol and has left every kernel structure
        drop(unsafe { Box::from_raw(item.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tcb::SchedulingPolicy,
        test_utils::{self, define_test_traits},
        thread::{DynamicThread, DynamicThreadParameters},
        PortToKernel,
    };
    use alloc::{boxed::Box, vec::Vec};

    define_test_traits!(struct SleepOrderTraits);

    /// Spec scenario: sleepers with deadlines {100, 50, 200, 75, 150} must
    /// reach the ready list in the order T2, T4, T1, T5, T3.
    #[test]
    fn sleepers_wake_in_deadline_order() {
        test_utils::boot_kernel::<SleepOrderTraits>();

        let deadlines = [100u64, 50, 200, 75, 150];
        let threads: Vec<DynamicThread<SleepOrderTraits>> = deadlines
            .iter()
            .map(|_| {
                let thread = DynamicThread::new(
                    DynamicThreadParameters {
                        stack_size: 256,
                        priority: 10,
                        ..Default::default()
                    },
                    || {},
                );
                thread.start().unwrap();
                thread
            })
            .collect();

        // Park each thread on its own wait list with a wake deadline, the
        // way `block_until` would.
        let wait_lists: Vec<Box<ThreadList<SleepOrderTraits>>> =
            (0..deadlines.len()).map(|_| Box::new(ThreadList::new())).collect();
        {
            let mut guard = klock::lock_cpu::<SleepOrderTraits>().unwrap();
            for (index, thread) in threads.iter().enumerate() {
                let this = ThreadRef::new(thread.control_block().unwrap());
                SleepOrderTraits::state()
                    .ready
                    .remove(guard.borrow_mut(), this);
                this.cb()
                    .set_state(&mut guard.borrow_mut(), ThreadState::Sleeping);
                wait_lists[index].insert_priority(guard.borrow_mut(), this);
                this.cb().set_blocked_list(
                    &mut guard.borrow_mut(),
                    Some(NonNull::from(&*wait_lists[index])),
                );
                set_wake_deadline(
                    guard.borrow_mut(),
                    this,
                    tick::TickPoint::from_ticks(deadlines[index]),
                );
            }
        }

        let mut woken: Vec<usize> = Vec::new();
        for _ in 0..250 {
            // Safety: CPU Lock inactive, standing in for the tick ISR
            unsafe { SleepOrderTraits::tick_interrupt() };
            let guard = klock::lock_cpu::<SleepOrderTraits>().unwrap();
            for (index, thread) in threads.iter().enumerate() {
                let cb = thread.control_block().unwrap();
                if cb.state(&*guard) == ThreadState::Runnable && !woken.contains(&index) {
                    woken.push(index);
                }
            }
        }

        assert_eq!(woken, [1, 3, 0, 4, 2]);
        for thread in threads {
            core::mem::forget(thread);
        }
    }

    define_test_traits!(struct RoundRobinTraits);

    #[test]
    fn round_robin_slice_rotates_equal_priorities() {
        test_utils::boot_kernel::<RoundRobinTraits>();

        let peer = DynamicThread::<RoundRobinTraits>::new(
            DynamicThreadParameters {
                stack_size: 256,
                priority: RoundRobinTraits::MAIN_THREAD_PRIORITY,
                scheduling_policy: SchedulingPolicy::RoundRobin,
                ..Default::default()
            },
            || {},
        );
        peer.start().unwrap();

        let mut needed = false;
        for _ in 0..RoundRobinTraits::ROUND_ROBIN_QUANTUM {
            assert!(!needed, "slice expired early");
            // Safety: CPU Lock inactive, standing in for the tick ISR
            needed = unsafe { RoundRobinTraits::tick_interrupt() };
        }
        assert!(needed, "slice expiry must demand a context switch");

        let mut guard = klock::lock_cpu::<RoundRobinTraits>().unwrap();
        let head = RoundRobinTraits::state().ready.first(guard.borrow_mut());
        assert_eq!(
            head.map(|t| t.as_ptr()),
            Some(peer.control_block().unwrap() as *const _)
        );
        drop(guard);
        core::mem::forget(peer);
    }

    define_test_traits!(struct OverflowTraits);

    /// Spec scenario: a write into the guard region is caught by the next
    /// tick and routed through the fatal-error path.
    #[test]
    #[should_panic(expected = "stack overflow")]
    fn stack_overflow_is_fatal() {
        crate::fatal::set_fatal_error_hook(|info| panic!("{}", info.message));
        let bottom = test_utils::boot_kernel::<OverflowTraits>();
        // Clobber the guard of the running thread's stack.
        unsafe { (bottom as *mut u32).write_volatile(0) };
        // Safety: CPU Lock inactive, standing in for the tick ISR
        unsafe { OverflowTraits::tick_interrupt() };
    }

    define_test_traits!(struct AddPreemptTraits);

    #[test]
    fn higher_priority_arrival_requests_preemption() {
        test_utils::boot_kernel::<AddPreemptTraits>();
        test_utils::take_switch_request(AddPreemptTraits::port_flags());

        let lower = DynamicThread::<AddPreemptTraits>::new(
            DynamicThreadParameters {
                stack_size: 256,
                priority: 1,
                ..Default::default()
            },
            || {},
        );
        lower.start().unwrap();
        assert!(!test_utils::take_switch_request(AddPreemptTraits::port_flags()));

        let higher = DynamicThread::<AddPreemptTraits>::new(
            DynamicThreadParameters {
                stack_size: 256,
                priority: 200,
                ..Default::default()
            },
            || {},
        );
        higher.start().unwrap();
        assert!(test_utils::take_switch_request(AddPreemptTraits::port_flags()));

        core::mem::forget(lower);
        core::mem::forget(higher);
    }
}
