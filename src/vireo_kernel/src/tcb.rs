//! Thread control blocks.
//!
//! A [`ThreadControlBlock`] is the canonical identity of a thread inside
//! the kernel: its stack, priorities, scheduling policy, state, list
//! memberships, and its ties to the synchronization and signal subsystems.
//! The user-facing thread objects in [`crate::thread`] each embed exactly
//! one control block.
use core::{fmt, ptr::NonNull};

use crate::{
    klock::{CpuLockCell, CpuLockToken, CpuLockTokenRefMut},
    list::{Node, ThreadList, ThreadRef},
    mutex::Mutex,
    sched,
    stack::Stack,
    thread::RunnableThread,
    utils::Init,
    KernelTraits, PortThreading,
};

#[cfg(feature = "signals")]
use crate::signals::SignalsReceiverControlBlock;

/// Scheduling policy of a thread.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SchedulingPolicy {
    /// The thread runs until it blocks or is preempted by a higher-priority
    /// thread.
    Fifo,
    /// Like [`Self::Fifo`], but the thread additionally yields to
    /// equal-priority peers when its time slice expires.
    RoundRobin,
}

/// State of a thread. Exactly one kernel list owns a control block in each
/// state.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ThreadState {
    /// Constructed but not yet started.
    Created,
    /// Ready to run or currently running.
    Runnable,
    /// In a timed sleep.
    Sleeping,
    /// Waiting to acquire a mutex.
    BlockedOnMutex,
    /// Waiting on a semaphore.
    BlockedOnSemaphore,
    /// Waiting for another thread to terminate.
    BlockedOnJoin,
    /// Waiting for a signal.
    BlockedOnSignal,
    /// Held off the ready list by the signal delivery machinery.
    Suspended,
    /// Finished executing; observable by joiners.
    Terminated,
    /// Ownership surrendered to the kernel; the thread reclaims itself
    /// after exit. Only ever reported through a detached handle.
    Detached,
}

impl ThreadState {
    /// Whether a thread in this state can be unblocked.
    pub(crate) fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::Sleeping
                | Self::BlockedOnMutex
                | Self::BlockedOnSemaphore
                | Self::BlockedOnJoin
                | Self::BlockedOnSignal
                | Self::Suspended
        )
    }
}

/// Why a blocked thread was returned to the ready list.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum UnblockReason {
    /// The condition the thread was waiting for came true.
    Normal,
    /// The wait deadline expired.
    Timeout,
    /// A signal delivery request targeted the thread.
    Signal,
}

/// *Thread control block* — the state data of a thread.
#[repr(C)]
pub struct ThreadControlBlock<Traits: PortThreading> {
    /// The port's per-thread state.
    ///
    /// Placed at the beginning of the struct so that assembly code can
    /// refer to it easily.
    pub port_state: Traits::PortThreadState,

    stack: Stack<Traits>,

    base_priority: CpuLockCell<Traits, u8>,

    /// `max(base_priority, boosts from held priority-inheritance and
    /// priority-protect mutexes)`. Determines the thread's position in
    /// every priority-ordered list; reposition after changing it.
    effective_priority: CpuLockCell<Traits, u8>,

    policy: CpuLockCell<Traits, SchedulingPolicy>,
    state: CpuLockCell<Traits, ThreadState>,

    /// Round-robin ticks left in the current slice.
    slice_left: CpuLockCell<Traits, u32>,

    /// Node of the state-owning list (ready, waiter queue, terminated).
    link: Node<Traits>,

    /// Node of the sleeping list.
    sleep_link: Node<Traits>,
    in_sleep_list: CpuLockCell<Traits, bool>,
    wake_deadline: CpuLockCell<Traits, u64>,

    /// The wait list owning this thread while it is blocked. Read by
    /// `unblock` and the tick handler to take the thread out of the wait.
    blocked_list: CpuLockCell<Traits, Option<NonNull<ThreadList<Traits>>>>,
    unblock_reason: CpuLockCell<Traits, UnblockReason>,

    /// The mutex this thread is blocked on, if any. Walked by the
    /// priority-inheritance cascade.
    blocked_on_mutex: CpuLockCell<Traits, Option<NonNull<Mutex<Traits>>>>,

    /// The most recently locked still-held mutex; the rest are chained
    /// through [`Mutex`]'s `prev_held` link.
    last_mutex_held: CpuLockCell<Traits, Option<NonNull<Mutex<Traits>>>>,

    /// The thread object this control block is embedded in.
    owner: CpuLockCell<Traits, Option<NonNull<dyn RunnableThread<Traits>>>>,

    #[cfg(feature = "signals")]
    signals: CpuLockCell<Traits, Option<NonNull<SignalsReceiverControlBlock<Traits>>>>,

    /// Node and membership of the thread group, if any.
    group_link: Node<Traits>,
    group: CpuLockCell<Traits, Option<NonNull<crate::group::ThreadGroupControlBlock<Traits>>>>,

    /// Incremented when the thread first becomes runnable and when the
    /// control block is invalidated, so stale
    /// [`ThreadIdentifier`](crate::thread::ThreadIdentifier)s resolve to
    /// no thread.
    sequence_number: CpuLockCell<Traits, usize>,
}

// Safety: all mutable state is behind `CpuLockCell`s; the raw pointers are
// only dereferenced inside kernel critical sections.
unsafe impl<Traits: PortThreading> Send for ThreadControlBlock<Traits> {}
unsafe impl<Traits: PortThreading> Sync for ThreadControlBlock<Traits> {}

impl<Traits: PortThreading> ThreadControlBlock<Traits> {
    pub(crate) fn new(stack: Stack<Traits>, priority: u8, policy: SchedulingPolicy) -> Self {
        Self {
            port_state: Traits::PortThreadState::INIT,
            stack,
            base_priority: CpuLockCell::new(priority),
            effective_priority: CpuLockCell::new(priority),
            policy: CpuLockCell::new(policy),
            state: CpuLockCell::new(ThreadState::Created),
            slice_left: CpuLockCell::new(0),
            link: Init::INIT,
            sleep_link: Init::INIT,
            in_sleep_list: Init::INIT,
            wake_deadline: Init::INIT,
            blocked_list: Init::INIT,
            unblock_reason: CpuLockCell::new(UnblockReason::Normal),
            blocked_on_mutex: Init::INIT,
            last_mutex_held: Init::INIT,
            owner: CpuLockCell::new(None),
            #[cfg(feature = "signals")]
            signals: Init::INIT,
            group_link: Init::INIT,
            group: Init::INIT,
            sequence_number: CpuLockCell::new(0),
        }
    }

    pub fn stack(&self) -> &Stack<Traits> {
        &self.stack
    }

    pub(crate) fn link(&self) -> &Node<Traits> {
        &self.link
    }

    pub(crate) fn sleep_link(&self) -> &Node<Traits> {
        &self.sleep_link
    }

    pub(crate) fn group_link(&self) -> &Node<Traits> {
        &self.group_link
    }

    pub(crate) fn priority(&self, token: &CpuLockToken<Traits>) -> u8 {
        self.base_priority.get(token)
    }

    pub(crate) fn effective_priority(&self, token: &CpuLockToken<Traits>) -> u8 {
        self.effective_priority.get(token)
    }

    pub(crate) fn set_effective_priority(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        priority: u8,
    ) {
        self.effective_priority.replace(&mut **lock, priority);
    }

    pub(crate) fn scheduling_policy(&self, token: &CpuLockToken<Traits>) -> SchedulingPolicy {
        self.policy.get(token)
    }

    pub(crate) fn set_scheduling_policy(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        policy: SchedulingPolicy,
    ) {
        self.policy.replace(&mut **lock, policy);
        self.slice_left.replace(&mut **lock, 0);
    }

    pub(crate) fn state(&self, token: &CpuLockToken<Traits>) -> ThreadState {
        self.state.get(token)
    }

    pub(crate) fn set_state(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, state: ThreadState) {
        self.state.replace(&mut **lock, state);
    }

    pub(crate) fn slice_left(&self, token: &CpuLockToken<Traits>) -> u32 {
        self.slice_left.get(token)
    }

    pub(crate) fn set_slice_left(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, left: u32) {
        self.slice_left.replace(&mut **lock, left);
    }

    pub(crate) fn wake_deadline(&self, token: &CpuLockToken<Traits>) -> u64 {
        self.wake_deadline.get(token)
    }

    pub(crate) fn set_wake_deadline(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, at: u64) {
        self.wake_deadline.replace(&mut **lock, at);
    }

    pub(crate) fn in_sleep_list(&self, token: &CpuLockToken<Traits>) -> bool {
        self.in_sleep_list.get(token)
    }

    pub(crate) fn set_in_sleep_list(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, x: bool) {
        self.in_sleep_list.replace(&mut **lock, x);
    }

    pub(crate) fn blocked_list(
        &self,
        token: &CpuLockToken<Traits>,
    ) -> Option<NonNull<ThreadList<Traits>>> {
        self.blocked_list.get(token)
    }

    pub(crate) fn set_blocked_list(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        list: Option<NonNull<ThreadList<Traits>>>,
    ) {
        self.blocked_list.replace(&mut **lock, list);
    }

    pub(crate) fn unblock_reason(&self, token: &CpuLockToken<Traits>) -> UnblockReason {
        self.unblock_reason.get(token)
    }

    pub(crate) fn set_unblock_reason(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        reason: UnblockReason,
    ) {
        self.unblock_reason.replace(&mut **lock, reason);
    }

    pub(crate) fn blocked_on_mutex(
        &self,
        token: &CpuLockToken<Traits>,
    ) -> Option<NonNull<Mutex<Traits>>> {
        self.blocked_on_mutex.get(token)
    }

    pub(crate) fn set_blocked_on_mutex(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        mutex: Option<NonNull<Mutex<Traits>>>,
    ) {
        self.blocked_on_mutex.replace(&mut **lock, mutex);
    }

    pub(crate) fn last_mutex_held(
        &self,
        token: &CpuLockToken<Traits>,
    ) -> Option<NonNull<Mutex<Traits>>> {
        self.last_mutex_held.get(token)
    }

    pub(crate) fn set_last_mutex_held(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        mutex: Option<NonNull<Mutex<Traits>>>,
    ) {
        self.last_mutex_held.replace(&mut **lock, mutex);
    }

    pub(crate) fn owner(
        &self,
        token: &CpuLockToken<Traits>,
    ) -> Option<NonNull<dyn RunnableThread<Traits>>> {
        self.owner.get(token)
    }

    pub(crate) fn set_owner(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        owner: Option<NonNull<dyn RunnableThread<Traits>>>,
    ) {
        self.owner.replace(&mut **lock, owner);
    }

    #[cfg(feature = "signals")]
    pub(crate) fn signals_receiver(
        &self,
        token: &CpuLockToken<Traits>,
    ) -> Option<NonNull<SignalsReceiverControlBlock<Traits>>> {
        self.signals.get(token)
    }

    #[cfg(feature = "signals")]
    pub(crate) fn set_signals_receiver(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        receiver: Option<NonNull<SignalsReceiverControlBlock<Traits>>>,
    ) {
        self.signals.replace(&mut **lock, receiver);
    }

    pub(crate) fn group(
        &self,
        token: &CpuLockToken<Traits>,
    ) -> Option<NonNull<crate::group::ThreadGroupControlBlock<Traits>>> {
        self.group.get(token)
    }

    pub(crate) fn set_group(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        group: Option<NonNull<crate::group::ThreadGroupControlBlock<Traits>>>,
    ) {
        self.group.replace(&mut **lock, group);
    }

    pub(crate) fn sequence_number(&self, token: &CpuLockToken<Traits>) -> usize {
        self.sequence_number.get(token)
    }

    pub(crate) fn bump_sequence_number(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        let n = self.sequence_number.get(&**lock).wrapping_add(1);
        self.sequence_number.replace(&mut **lock, n);
    }
}

impl<Traits: KernelTraits> ThreadControlBlock<Traits> {
    /// Change the thread's base priority.
    ///
    /// If the thread sits on a priority-ordered list, it is repositioned.
    /// When the change lowers the effective priority, `always_behind`
    /// selects the tail of the new priority group; otherwise the thread
    /// goes to the head (and keeps running ahead of its new peers, if it
    /// is the current thread). A preemption check follows.
    pub(crate) fn set_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        priority: u8,
        always_behind: bool,
    ) {
        if self.base_priority.get(&*lock) == priority {
            return;
        }
        self.base_priority.replace(&mut *lock, priority);

        let old_effective = self.effective_priority.get(&*lock);
        let new_effective =
            crate::mutex::evaluate_effective_priority(lock.borrow_mut(), self, priority);
        if new_effective == old_effective {
            return;
        }
        self.effective_priority.replace(&mut *lock, new_effective);

        let to_front = new_effective < old_effective && !always_behind;
        self.reposition_after_priority_change(lock.borrow_mut(), to_front);

        // The boost may have to travel down a chain of priority-inheritance
        // mutex owners.
        if let Some(mutex) = self.blocked_on_mutex.get(&*lock) {
            // Safety: a thread blocked on a mutex keeps it alive
            let mutex = unsafe { mutex.as_ref() };
            mutex.on_waiter_priority_changed(lock.borrow_mut());
        }

        sched::check_preemption(lock.borrow_mut());
    }

    /// Reposition this thread within whatever priority-ordered list holds
    /// it, after `effective_priority` has changed.
    pub(crate) fn reposition_after_priority_change(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        to_front_of_group: bool,
    ) {
        let this = ThreadRef::new(self);
        match self.state.get(&*lock) {
            ThreadState::Runnable => {
                Traits::state()
                    .ready
                    .reposition(lock.borrow_mut(), this, to_front_of_group);
            }
            state if state.is_blocked() => {
                if let Some(list) = self.blocked_list.get(&*lock) {
                    // Safety: the wait list outlives the wait (see
                    // `sched::block`)
                    let list = unsafe { list.as_ref() };
                    list.reposition(lock.borrow_mut(), this, to_front_of_group);
                }
            }
            _ => {}
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadControlBlock<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadControlBlock")
            .field("self", &(self as *const _))
            .field("port_state", &self.port_state)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
