//! Thread objects.
//!
//! [`ThreadCommon`] couples a thread control block with the join
//! semaphore; the concrete thread objects ([`DynamicThread`],
//! [`StaticThread`], and the boot-context [`MainThread`]) each embed one
//! and plug into the kernel through the [`RunnableThread`] capability: the
//! thread runner calls `run`, and the exiter runs the exit hooks around
//! the scheduler's `remove` (the second hook posts the join semaphore).
//!
//! [`this_thread`] holds the operations a thread applies to itself.
use alloc::boxed::Box;
use core::{
    cell::UnsafeCell,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    error::{JoinError, StartError, WaitError},
    fatal_error,
    group::{ThreadGroup, ThreadGroupControlBlock},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    list::ThreadRef,
    sched,
    semaphore::Semaphore,
    stack::Stack,
    tcb::{SchedulingPolicy, ThreadControlBlock, ThreadState},
    utils::AlignedStackStorage,
    KernelTraits, PortThreading,
};

#[cfg(feature = "thread-detach")]
use crate::error::DetachError;
#[cfg(feature = "signals")]
use crate::{
    error::{GenerateSignalError, QueueSignalError},
    signals::{self, SignalSet, SignalsReceiverControlBlock},
};

/// What the kernel needs from a thread object: the entry point and the
/// exit hooks. The exit hooks run inside the exiting thread's final kernel
/// critical section.
pub(crate) trait RunnableThread<Traits: PortThreading>: Send + Sync {
    /// The thread's body. Called exactly once, by the thread runner, on
    /// the thread's own stack.
    fn run(&self);

    /// First exit hook: runs before the thread is removed from the
    /// scheduler.
    fn exit0_hook(&self, lock: CpuLockTokenRefMut<'_, Traits>);

    /// Second exit hook: runs after removal; posts the join semaphore.
    fn exit1_hook(&self, lock: CpuLockTokenRefMut<'_, Traits>);

    /// The public face of this thread object.
    fn as_thread(&self) -> &dyn Thread<Traits>;
}

/// Deferred reclamation of exited detached threads: the intrusive link the
/// scheduler's reaper list threads through.
#[cfg(feature = "thread-detach")]
pub(crate) trait Reclaim<Traits: PortThreading>: Send {
    fn next_reclaim(&self) -> &CpuLockCell<Traits, Option<NonNull<dyn Reclaim<Traits>>>>;
}

/// Operations available on every thread object.
pub trait Thread<Traits: PortThreading> {
    /// Wait for the thread to terminate.
    ///
    /// Interruptions by signal delivery are transparent: the wait is
    /// retried.
    fn join(&self) -> Result<(), JoinError>;

    /// The thread's base priority.
    fn priority(&self) -> u8;

    /// The thread's effective priority (the base plus any boost from held
    /// mutexes).
    fn effective_priority(&self) -> u8;

    /// Change the thread's base priority. With `always_behind`, a thread
    /// whose priority drops goes to the tail of its new priority group
    /// instead of the head.
    fn set_priority(&self, priority: u8, always_behind: bool);

    fn scheduling_policy(&self) -> SchedulingPolicy;

    fn set_scheduling_policy(&self, policy: SchedulingPolicy);

    fn state(&self) -> ThreadState;

    fn identifier(&self) -> ThreadIdentifier<Traits>;

    /// Usable stack size, in bytes.
    fn stack_size(&self) -> usize;

    /// Maximum stack usage observed so far, in bytes.
    fn stack_high_water_mark(&self) -> usize;

    /// Post a generated signal to this thread.
    #[cfg(feature = "signals")]
    fn generate_signal(&self, number: u8) -> Result<(), GenerateSignalError>;

    /// Post a queued signal with a payload to this thread.
    #[cfg(feature = "signals")]
    fn queue_signal(&self, number: u8, value: usize) -> Result<(), QueueSignalError>;

    /// The set of generated signals not yet accepted by this thread.
    #[cfg(feature = "signals")]
    fn pending_signal_set(&self) -> SignalSet;
}

/// Implement [`Thread`] by delegation to a `common: ThreadCommon` field.
macro_rules! impl_thread_via_common {
    ( [ $($generics:tt)* ] $Ty:ty ) => {
        impl<$($generics)*> Thread<Traits> for $Ty {
            fn join(&self) -> Result<(), JoinError> {
                self.common.join()
            }

            fn priority(&self) -> u8 {
                self.common.read(|cb, token| cb.priority(token))
            }

            fn effective_priority(&self) -> u8 {
                self.common.read(|cb, token| cb.effective_priority(token))
            }

            fn set_priority(&self, priority: u8, always_behind: bool) {
                self.common.set_priority(priority, always_behind)
            }

            fn scheduling_policy(&self) -> SchedulingPolicy {
                self.common.read(|cb, token| cb.scheduling_policy(token))
            }

            fn set_scheduling_policy(&self, policy: SchedulingPolicy) {
                self.common.set_scheduling_policy(policy)
            }

            fn state(&self) -> ThreadState {
                self.common.read(|cb, token| cb.state(token))
            }

            fn identifier(&self) -> ThreadIdentifier<Traits> {
                self.common.identifier()
            }

            fn stack_size(&self) -> usize {
                self.common.tcb().stack().size()
            }

            fn stack_high_water_mark(&self) -> usize {
                self.common.tcb().stack().high_water_mark()
            }

            #[cfg(feature = "signals")]
            fn generate_signal(&self, number: u8) -> Result<(), GenerateSignalError> {
                self.common.generate_signal(number)
            }

            #[cfg(feature = "signals")]
            fn queue_signal(&self, number: u8, value: usize) -> Result<(), QueueSignalError> {
                self.common.queue_signal(number, value)
            }

            #[cfg(feature = "signals")]
            fn pending_signal_set(&self) -> SignalSet {
                self.common.pending_signal_set()
            }
        }
    };
}

/// The part shared by every thread object: the control block and the join
/// semaphore.
pub(crate) struct ThreadCommon<Traits: KernelTraits> {
    tcb: ThreadControlBlock<Traits>,
    join_semaphore: Semaphore<Traits>,
}

impl<Traits: KernelTraits> ThreadCommon<Traits> {
    pub(crate) fn new(stack: Stack<Traits>, priority: u8, policy: SchedulingPolicy) -> Self {
        Self {
            tcb: ThreadControlBlock::new(stack, priority, policy),
            join_semaphore: Semaphore::with_max(0, 1),
        }
    }

    pub(crate) fn tcb(&self) -> &ThreadControlBlock<Traits> {
        &self.tcb
    }

    fn read<R>(
        &self,
        f: impl FnOnce(&ThreadControlBlock<Traits>, &klock::CpuLockToken<Traits>) -> R,
    ) -> R {
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            unreachable!("thread query inside a kernel critical section")
        };
        f(&self.tcb, &lock)
    }

    fn set_priority(&self, priority: u8, always_behind: bool) {
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("priority change inside a kernel critical section")
        };
        self.tcb
            .set_priority(guard.borrow_mut(), priority, always_behind);
    }

    fn set_scheduling_policy(&self, policy: SchedulingPolicy) {
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("policy change inside a kernel critical section")
        };
        self.tcb
            .set_scheduling_policy(&mut guard.borrow_mut(), policy);
    }

    fn identifier(&self) -> ThreadIdentifier<Traits> {
        self.read(|cb, token| ThreadIdentifier {
            control_block: Some(NonNull::from(cb)),
            sequence_number: cb.sequence_number(token),
        })
    }

    #[cfg(feature = "signals")]
    fn generate_signal(&self, number: u8) -> Result<(), GenerateSignalError> {
        match signals::post_signal(
            ThreadRef::new(&self.tcb),
            number,
            signals::SignalPost::Generate,
        ) {
            Ok(()) => Ok(()),
            Err(QueueSignalError::InvalidArgument) => Err(GenerateSignalError::InvalidArgument),
            Err(QueueSignalError::NotSupported) => Err(GenerateSignalError::NotSupported),
            Err(QueueSignalError::NoSpace) => Err(GenerateSignalError::NoSpace),
            Err(QueueSignalError::Again) => unreachable!("generated signals coalesce"),
        }
    }

    #[cfg(feature = "signals")]
    fn queue_signal(&self, number: u8, value: usize) -> Result<(), QueueSignalError> {
        signals::post_signal(
            ThreadRef::new(&self.tcb),
            number,
            signals::SignalPost::Queue(value),
        )
    }

    #[cfg(feature = "signals")]
    fn pending_signal_set(&self) -> SignalSet {
        signals::pending_signal_set_of(ThreadRef::new(&self.tcb))
    }

    /// Register the thread with the scheduler: bind the owner object,
    /// join a thread group (the creator's if none is given), build the
    /// initial stack frame, and make the thread runnable.
    fn start_internal(
        &self,
        owner: NonNull<dyn RunnableThread<Traits>>,
        group: Option<&ThreadGroupControlBlock<Traits>>,
        #[cfg(feature = "signals")] receiver: Option<NonNull<SignalsReceiverControlBlock<Traits>>>,
    ) -> Result<(), StartError> {
        let mut guard = klock::lock_cpu::<Traits>()?;
        let mut lock = guard.borrow_mut();

        if self.tcb.state(&*lock) != ThreadState::Created {
            return Err(StartError::InvalidArgument);
        }

        self.tcb.set_owner(&mut lock.borrow_mut(), Some(owner));
        #[cfg(feature = "signals")]
        self.tcb.set_signals_receiver(&mut lock.borrow_mut(), receiver);

        let group = match group {
            Some(group) => Some(NonNull::from(group)),
            None => Traits::state()
                .running_thread(&*lock)
                .and_then(|creator| creator.cb().group(&*lock)),
        };
        if let Some(group) = group {
            self.tcb.set_group(&mut lock.borrow_mut(), Some(group));
            // Safety: thread groups outlive their member threads
            unsafe { group.as_ref() }.add(lock.borrow_mut(), ThreadRef::new(&self.tcb));
        }

        self.tcb.stack().initialize(lock.borrow_mut(), &self.tcb)?;
        sched::add_thread(lock.borrow_mut(), ThreadRef::new(&self.tcb));
        Ok(())
    }

    fn join(&self) -> Result<(), JoinError> {
        sched::expect_waitable_context::<Traits>()?;
        {
            let Ok(lock) = klock::lock_cpu::<Traits>() else {
                unreachable!("join inside a kernel critical section")
            };
            if sched::current(&*lock) == ThreadRef::new(&self.tcb) {
                return Err(JoinError::Deadlock);
            }
        }
        loop {
            match self.join_semaphore.wait() {
                Ok(()) => return Ok(()),
                Err(WaitError::Interrupted) => continue,
                Err(WaitError::NotPermitted) => return Err(JoinError::NotPermitted),
            }
        }
    }

    fn post_join_semaphore(&self, lock: CpuLockTokenRefMut<'_, Traits>) {
        // A failed post means the thread was already posted for — no
        // joiner loses a wakeup.
        let _ = self.join_semaphore.post_locked(lock);
    }
}

/// The entry point of every thread, reached through the initial stack
/// frame the port builds: runs the thread's body, then exits.
///
/// # Safety
///
/// Only meant to be called by the port, once, on the thread's own stack.
pub unsafe fn thread_entry<Traits: KernelTraits>(tcb: *const ThreadControlBlock<Traits>) -> ! {
    let owner = {
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            fatal_error!(Traits, "thread entry inside a kernel critical section")
        };
        // Safety: the port passes the control block the frame was built for
        match unsafe { (*tcb).owner(&*lock) } {
            Some(owner) => owner,
            None => fatal_error!(Traits, "thread entry without an owner"),
        }
    };
    // Safety: the owner object outlives the thread's execution
    let runnable = unsafe { &*owner.as_ptr() };
    runnable.run();
    thread_exit::<Traits>(runnable)
}

/// The thread exiter: exit hook 0, scheduler removal, exit hook 1 (posts
/// the join semaphore), then the context is discarded. Never returns.
pub(crate) fn thread_exit<Traits: KernelTraits>(runnable: &dyn RunnableThread<Traits>) -> ! {
    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        fatal_error!(Traits, "thread exit inside a kernel critical section")
    };
    runnable.exit0_hook(guard.borrow_mut());
    let current = sched::remove_current(guard.borrow_mut());
    runnable.exit1_hook(guard.borrow_mut());

    // CPU Lock stays active across the final dispatch.
    core::mem::forget(guard);
    // Safety: CPU Lock is active and `current` is the calling thread
    unsafe { Traits::exit_and_dispatch(current.as_ptr()) }
}

/// An identifier of a thread: a control block paired with its sequence
/// number at mint time. A stale identifier — one whose thread has exited
/// and been reclaimed or restarted — resolves to no thread.
pub struct ThreadIdentifier<Traits: PortThreading> {
    control_block: Option<NonNull<ThreadControlBlock<Traits>>>,
    sequence_number: usize,
}

impl<Traits: PortThreading> Clone for ThreadIdentifier<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for ThreadIdentifier<Traits> {}

impl<Traits: PortThreading> PartialEq for ThreadIdentifier<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.control_block == other.control_block && self.sequence_number == other.sequence_number
    }
}
impl<Traits: PortThreading> Eq for ThreadIdentifier<Traits> {}

impl<Traits: PortThreading> fmt::Debug for ThreadIdentifier<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadIdentifier")
            .field("control_block", &self.control_block)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

impl<Traits: PortThreading> ThreadIdentifier<Traits> {
    /// An identifier representing no thread.
    pub const fn invalid() -> Self {
        Self {
            control_block: None,
            sequence_number: 0,
        }
    }

    pub(crate) fn new(thread: ThreadRef<Traits>, sequence_number: usize) -> Self {
        Self {
            control_block: Some(NonNull::from(thread.cb())),
            sequence_number,
        }
    }
}

impl<Traits: KernelTraits> ThreadIdentifier<Traits> {
    /// Resolve the identifier to the thread it was minted for, or `None`
    /// if that thread no longer exists.
    ///
    /// The check compares the control block's sequence number with the
    /// minted one, which makes a stale match on a reused control block
    /// vanishingly unlikely (it would take the counter wrapping around
    /// exactly).
    pub fn thread(&self) -> Option<&'static dyn Thread<Traits>> {
        let control_block = self.control_block?;
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            unreachable!("identifier resolution inside a kernel critical section")
        };
        // Safety: see above — the sequence check guards against reuse
        let cb = unsafe { &*control_block.as_ptr() };
        if cb.sequence_number(&*lock) != self.sequence_number {
            return None;
        }
        let owner = cb.owner(&*lock)?;
        // Safety: a thread with a matching sequence number is alive, and
        // its owner object lives at least as long
        let runnable: &'static dyn RunnableThread<Traits> = unsafe { &*owner.as_ptr() };
        Some(runnable.as_thread())
    }
}

// ---------------------------------------------------------------------------
// The main thread

/// The thread object adopted for the boot context.
pub(crate) struct MainThread<Traits: KernelTraits> {
    common: ThreadCommon<Traits>,
    #[cfg(feature = "signals")]
    receiver: SignalsReceiverControlBlock<Traits>,
}

impl<Traits: KernelTraits> MainThread<Traits> {
    pub(crate) fn new(stack: Stack<Traits>, priority: u8, policy: SchedulingPolicy) -> Self {
        Self {
            common: ThreadCommon::new(stack, priority, policy),
            #[cfg(feature = "signals")]
            receiver: SignalsReceiverControlBlock::new(),
        }
    }

    /// Adopt the calling (boot) context as this thread: it becomes both
    /// runnable and current without ever passing through the thread
    /// runner.
    pub(crate) fn adopt_current_context(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let tcb = self.common.tcb();
        let runnable: &dyn RunnableThread<Traits> = self;
        tcb.set_owner(&mut lock.borrow_mut(), Some(NonNull::from(runnable)));
        #[cfg(feature = "signals")]
        tcb.set_signals_receiver(&mut lock.borrow_mut(), Some(NonNull::from(&self.receiver)));

        tcb.bump_sequence_number(&mut lock.borrow_mut());
        tcb.set_state(&mut lock.borrow_mut(), ThreadState::Runnable);
        tcb.set_slice_left(&mut lock.borrow_mut(), Traits::ROUND_ROBIN_QUANTUM);
        let this = ThreadRef::new(tcb);
        Traits::state().ready.insert_priority(lock.borrow_mut(), this);
        Traits::state().current.replace(&mut *lock, Some(this));
    }
}

impl_thread_via_common!([Traits: KernelTraits] MainThread<Traits>);

impl<Traits: KernelTraits> RunnableThread<Traits> for MainThread<Traits> {
    fn run(&self) {
        // The main thread never enters through the runner.
        fatal_error!(Traits, "main thread runner entered")
    }

    fn exit0_hook(&self, _lock: CpuLockTokenRefMut<'_, Traits>) {}

    fn exit1_hook(&self, lock: CpuLockTokenRefMut<'_, Traits>) {
        self.common.post_join_semaphore(lock);
    }

    fn as_thread(&self) -> &dyn Thread<Traits> {
        self
    }
}

// ---------------------------------------------------------------------------
// Dynamic threads

/// Construction parameters of a [`DynamicThread`].
pub struct DynamicThreadParameters<Traits: PortThreading> {
    /// Requested usable stack size, in bytes.
    pub stack_size: usize,
    pub priority: u8,
    pub scheduling_policy: SchedulingPolicy,
    /// The group to join; the creator's group if `None`.
    pub thread_group: Option<&'static ThreadGroup<Traits>>,
    /// Equip the thread with a signals receiver.
    #[cfg(feature = "signals")]
    pub receive_signals: bool,
}

impl<Traits: PortThreading> Default for DynamicThreadParameters<Traits> {
    fn default() -> Self {
        Self {
            stack_size: 4096,
            priority: 127,
            scheduling_policy: SchedulingPolicy::RoundRobin,
            thread_group: None,
            #[cfg(feature = "signals")]
            receive_signals: false,
        }
    }
}

struct DynamicInner<Traits: KernelTraits, F: FnOnce() + Send + 'static> {
    common: ThreadCommon<Traits>,
    function: CpuLockCell<Traits, Option<F>>,
    #[cfg(feature = "signals")]
    receiver: Option<SignalsReceiverControlBlock<Traits>>,
    #[cfg(feature = "thread-detach")]
    detached: CpuLockCell<Traits, bool>,
    #[cfg(feature = "thread-detach")]
    next_reclaim: CpuLockCell<Traits, Option<NonNull<dyn Reclaim<Traits>>>>,
}

impl<Traits: KernelTraits, F: FnOnce() + Send + 'static> DynamicInner<Traits, F> {
    fn take_function(&self) -> Option<F> {
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            return None;
        };
        self.function.replace(&mut *guard, None)
    }
}

impl_thread_via_common!(
    [Traits: KernelTraits, F: FnOnce() + Send + 'static] DynamicInner<Traits, F>
);

impl<Traits: KernelTraits, F: FnOnce() + Send + 'static> RunnableThread<Traits>
    for DynamicInner<Traits, F>
{
    fn run(&self) {
        if let Some(function) = self.take_function() {
            function();
        }
    }

    fn exit0_hook(&self, _lock: CpuLockTokenRefMut<'_, Traits>) {}

    fn exit1_hook(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        self.common.post_join_semaphore(lock.borrow_mut());

        #[cfg(feature = "thread-detach")]
        if self.detached.get(&*lock) {
            // Ownership was surrendered to the kernel; schedule the leaked
            // storage for reclamation on the idle thread.
            let this = ThreadRef::new(self.common.tcb());
            sched::discard_terminated(lock.borrow_mut(), this);
            let item: NonNull<dyn Reclaim<Traits>> = NonNull::from(self as &dyn Reclaim<Traits>);
            sched::enqueue_reclaim(lock, item);
        }
    }

    fn as_thread(&self) -> &dyn Thread<Traits> {
        self
    }
}

#[cfg(feature = "thread-detach")]
impl<Traits: KernelTraits, F: FnOnce() + Send + 'static> Reclaim<Traits>
    for DynamicInner<Traits, F>
{
    fn next_reclaim(&self) -> &CpuLockCell<Traits, Option<NonNull<dyn Reclaim<Traits>>>> {
        &self.next_reclaim
    }
}

/// The object-safe face of [`DynamicInner`], erasing the body's type.
trait DynamicInnerApi<Traits: KernelTraits>: Send + Sync {
    fn common(&self) -> &ThreadCommon<Traits>;
    fn start_dynamic(
        &self,
        group: Option<&ThreadGroupControlBlock<Traits>>,
    ) -> Result<(), StartError>;
    #[cfg(feature = "thread-detach")]
    fn mark_detached(&self, lock: CpuLockTokenRefMut<'_, Traits>);
    fn as_thread(&self) -> &dyn Thread<Traits>;
}

impl<Traits: KernelTraits, F: FnOnce() + Send + 'static> DynamicInnerApi<Traits>
    for DynamicInner<Traits, F>
{
    fn common(&self) -> &ThreadCommon<Traits> {
        &self.common
    }

    fn start_dynamic(
        &self,
        group: Option<&ThreadGroupControlBlock<Traits>>,
    ) -> Result<(), StartError> {
        let runnable: &dyn RunnableThread<Traits> = self;
        #[cfg(feature = "signals")]
        return self.common.start_internal(
            NonNull::from(runnable),
            group,
            self.receiver.as_ref().map(NonNull::from),
        );
        #[cfg(not(feature = "signals"))]
        self.common.start_internal(NonNull::from(runnable), group)
    }

    #[cfg(feature = "thread-detach")]
    fn mark_detached(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        self.detached.replace(&mut *lock, true);
    }

    fn as_thread(&self) -> &dyn Thread<Traits> {
        self
    }
}

/// A thread with heap-allocated stack and storage.
///
/// The handle owns the thread object. Dropping the handle of a thread that
/// is still running is a fatal error; [`Self::join`] or [`Self::detach`]
/// first.
pub struct DynamicThread<Traits: KernelTraits> {
    inner: Option<Box<dyn DynamicInnerApi<Traits>>>,
    group: Option<&'static ThreadGroup<Traits>>,
}

impl<Traits: KernelTraits> DynamicThread<Traits> {
    /// Construct a thread in the Created state.
    pub fn new<F: FnOnce() + Send + 'static>(
        parameters: DynamicThreadParameters<Traits>,
        function: F,
    ) -> Self {
        let storage = Box::new_uninit_slice(
            parameters.stack_size + Traits::STACK_GUARD_SIZE + Traits::STACK_ALIGNMENT,
        );
        let stack = Stack::with_storage(storage);
        let inner: Box<dyn DynamicInnerApi<Traits>> = Box::new(DynamicInner {
            common: ThreadCommon::new(stack, parameters.priority, parameters.scheduling_policy),
            function: CpuLockCell::new(Some(function)),
            #[cfg(feature = "signals")]
            receiver: parameters
                .receive_signals
                .then(SignalsReceiverControlBlock::new),
            #[cfg(feature = "thread-detach")]
            detached: CpuLockCell::new(false),
            #[cfg(feature = "thread-detach")]
            next_reclaim: CpuLockCell::new(None),
        });
        Self {
            inner: Some(inner),
            group: parameters.thread_group,
        }
    }

    /// Construct and immediately start a thread.
    pub fn spawn<F: FnOnce() + Send + 'static>(
        parameters: DynamicThreadParameters<Traits>,
        function: F,
    ) -> Result<Self, StartError> {
        let thread = Self::new(parameters, function);
        thread.start()?;
        Ok(thread)
    }

    /// Start the thread.
    pub fn start(&self) -> Result<(), StartError> {
        match &self.inner {
            Some(inner) => inner.start_dynamic(self.group.map(|group| group.control_block())),
            None => Err(StartError::InvalidArgument),
        }
    }

    /// Surrender ownership of the thread to the kernel: the thread
    /// reclaims its own storage after it exits, and this handle stops
    /// referring to it.
    #[cfg(feature = "thread-detach")]
    pub fn detach(&mut self) -> Result<(), DetachError> {
        sched::expect_waitable_context::<Traits>()?;
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("detach inside a kernel critical section")
        };
        let Some(inner) = &self.inner else {
            return Err(DetachError::InvalidArgument);
        };

        match inner.common().tcb().state(&*guard) {
            // Not yet started, or already terminated: nothing will
            // self-reclaim, so the handle's normal teardown applies.
            ThreadState::Created | ThreadState::Terminated => {
                drop(guard);
                self.drop_inner();
            }
            _ => {
                inner.mark_detached(guard.borrow_mut());
                drop(guard);
                // Leak the storage; the exit hook hands it to the reaper.
                let inner = self.inner.take().unwrap_or_else(|| unreachable!());
                let _ = Box::into_raw(inner);
            }
        }
        Ok(())
    }

    /// Wait for the thread to terminate.
    pub fn join(&self) -> Result<(), JoinError> {
        match &self.inner {
            Some(inner) => inner.common().join(),
            None => Err(JoinError::InvalidArgument),
        }
    }

    /// The public thread interface, or `None` for a detached handle.
    pub fn thread(&self) -> Option<&dyn Thread<Traits>> {
        self.inner.as_deref().map(|inner| inner.as_thread())
    }

    /// The thread's state; a detached handle reports
    /// [`ThreadState::Detached`].
    pub fn state(&self) -> ThreadState {
        match self.thread() {
            Some(thread) => thread.state(),
            None => ThreadState::Detached,
        }
    }

    pub fn identifier(&self) -> ThreadIdentifier<Traits> {
        match self.thread() {
            Some(thread) => thread.identifier(),
            None => ThreadIdentifier::invalid(),
        }
    }

    #[cfg(test)]
    pub(crate) fn control_block(&self) -> Option<&ThreadControlBlock<Traits>> {
        self.inner.as_deref().map(|inner| inner.common().tcb())
    }

    /// Tear down an owned, no-longer-running thread object.
    fn drop_inner(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        {
            let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
                unreachable!("thread teardown inside a kernel critical section")
            };
            let tcb = inner.common().tcb();
            match tcb.state(&*guard) {
                ThreadState::Created => {}
                ThreadState::Terminated => {
                    sched::discard_terminated(guard.borrow_mut(), ThreadRef::new(tcb));
                }
                _ => fatal_error!(Traits, "dynamic thread destroyed while alive"),
            }
        }
        drop(inner);
    }
}

impl<Traits: KernelTraits> Drop for DynamicThread<Traits> {
    fn drop(&mut self) {
        self.drop_inner();
    }
}

impl<Traits: KernelTraits> fmt::Debug for DynamicThread<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DynamicThread")
            .field("detached", &self.inner.is_none())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Static threads

/// Alignment of the embedded stack storage: generous enough for every
/// supported architecture.
const STATIC_STACK_ALIGNMENT: usize = 16;

struct StaticInner<Traits: KernelTraits, F: FnOnce() + Send + 'static> {
    common: ThreadCommon<Traits>,
    function: CpuLockCell<Traits, Option<F>>,
    #[cfg(feature = "signals")]
    receiver: Option<SignalsReceiverControlBlock<Traits>>,
}

impl_thread_via_common!(
    [Traits: KernelTraits, F: FnOnce() + Send + 'static] StaticInner<Traits, F>
);

impl<Traits: KernelTraits, F: FnOnce() + Send + 'static> RunnableThread<Traits>
    for StaticInner<Traits, F>
{
    fn run(&self) {
        let function = {
            let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
                return;
            };
            self.function.replace(&mut *guard, None)
        };
        if let Some(function) = function {
            function();
        }
    }

    fn exit0_hook(&self, _lock: CpuLockTokenRefMut<'_, Traits>) {}

    fn exit1_hook(&self, lock: CpuLockTokenRefMut<'_, Traits>) {
        self.common.post_join_semaphore(lock);
    }

    fn as_thread(&self) -> &dyn Thread<Traits> {
        self
    }
}

/// A thread whose stack storage is embedded in the object itself, suitable
/// for `static` placement.
///
/// The object must live for the whole execution of the thread; `start`
/// therefore requires a `'static` reference.
pub struct StaticThread<Traits: KernelTraits, F: FnOnce() + Send + 'static, const STACK_SIZE: usize>
{
    storage: UnsafeCell<AlignedStackStorage<STACK_SIZE, STATIC_STACK_ALIGNMENT>>,
    priority: u8,
    scheduling_policy: SchedulingPolicy,
    #[cfg(feature = "signals")]
    receive_signals: bool,
    function: UnsafeCell<Option<F>>,
    inner: UnsafeCell<Option<StaticInner<Traits, F>>>,
    started: AtomicBool,
}

// Safety: the `UnsafeCell`s are only touched by the first (successful)
// `start` call, guarded by the `started` flag.
unsafe impl<Traits: KernelTraits, F: FnOnce() + Send + 'static, const STACK_SIZE: usize> Sync
    for StaticThread<Traits, F, STACK_SIZE>
{
}

impl<Traits: KernelTraits, F: FnOnce() + Send + 'static, const STACK_SIZE: usize>
    StaticThread<Traits, F, STACK_SIZE>
{
    pub const fn new(priority: u8, scheduling_policy: SchedulingPolicy, function: F) -> Self {
        Self {
            storage: UnsafeCell::new(AlignedStackStorage::zeroed()),
            priority,
            scheduling_policy,
            #[cfg(feature = "signals")]
            receive_signals: false,
            function: UnsafeCell::new(Some(function)),
            inner: UnsafeCell::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// [`Self::new`] with a signals receiver.
    #[cfg(feature = "signals")]
    pub const fn with_signals(
        priority: u8,
        scheduling_policy: SchedulingPolicy,
        function: F,
    ) -> Self {
        let mut this = Self::new(priority, scheduling_policy, function);
        this.receive_signals = true;
        this
    }

    /// Start the thread. Fails with `InvalidArgument` on repeated starts.
    pub fn start(&'static self) -> Result<(), StartError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(StartError::InvalidArgument);
        }

        // Safety: the flag above makes this the only access to the cells
        let (stack, function) = unsafe {
            let storage = &mut *self.storage.get();
            let size = storage.len() & !(STATIC_STACK_ALIGNMENT - 1);
            let stack = Stack::borrowed(storage.bottom(), size);
            (stack, (*self.function.get()).take())
        };

        let inner = StaticInner {
            common: ThreadCommon::new(stack, self.priority, self.scheduling_policy),
            function: CpuLockCell::new(function),
            #[cfg(feature = "signals")]
            receiver: self.receive_signals.then(SignalsReceiverControlBlock::new),
        };
        // Safety: as above; the inner object never moves again
        let inner: &'static StaticInner<Traits, F> = unsafe {
            *self.inner.get() = Some(inner);
            (*self.inner.get())
                .as_ref()
                .unwrap_or_else(|| unreachable!())
        };

        let runnable: &dyn RunnableThread<Traits> = inner;
        #[cfg(feature = "signals")]
        return inner.common.start_internal(
            NonNull::from(runnable),
            None,
            inner.receiver.as_ref().map(NonNull::from),
        );
        #[cfg(not(feature = "signals"))]
        inner.common.start_internal(NonNull::from(runnable), None)
    }

    /// The public thread interface; `None` before `start`.
    pub fn thread(&self) -> Option<&dyn Thread<Traits>> {
        if self.started.load(Ordering::Acquire) {
            // Safety: after a successful start the inner object is
            // initialized and no longer mutated
            unsafe { (*self.inner.get()).as_ref() }.map(|inner| inner as &dyn Thread<Traits>)
        } else {
            None
        }
    }

    pub fn join(&self) -> Result<(), JoinError> {
        match self.thread() {
            Some(thread) => thread.join(),
            None => Err(JoinError::InvalidArgument),
        }
    }
}

// ---------------------------------------------------------------------------
// The idle thread

/// Start the idle thread: priority 0, never blocks; drains the deferred
/// reclamation list and naps until the next interrupt.
pub(crate) fn spawn_idle<Traits: KernelTraits>() {
    let parameters = DynamicThreadParameters {
        stack_size: Traits::IDLE_STACK_SIZE,
        priority: 0,
        scheduling_policy: SchedulingPolicy::Fifo,
        thread_group: None,
        #[cfg(feature = "signals")]
        receive_signals: false,
    };
    let idle = DynamicThread::<Traits>::new(parameters, || loop {
        #[cfg(feature = "thread-detach")]
        sched::reclaim_one::<Traits>();
        Traits::wait_for_interrupt();
    });
    if idle.start().is_err() {
        fatal_error!(Traits, "idle thread failed to start");
    }
    // The idle thread never exits; the handle is surrendered.
    core::mem::forget(idle);
}

// ---------------------------------------------------------------------------
// Operations on the current thread

/// Operations a thread applies to itself.
pub mod this_thread {
    use super::*;
    use crate::{
        error::SleepError,
        list::ThreadList,
        tcb::UnblockReason,
        tick::{self, TickDuration, TickPoint},
    };

    /// The current thread's object.
    pub fn get<Traits: KernelTraits>() -> &'static dyn Thread<Traits> {
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            unreachable!("current-thread query inside a kernel critical section")
        };
        let current = sched::current(&*lock);
        let Some(owner) = current.cb().owner(&*lock) else {
            fatal_error!(Traits, "current thread has no owner")
        };
        // Safety: the current thread's owner object is alive while it runs
        let runnable: &'static dyn RunnableThread<Traits> = unsafe { &*owner.as_ptr() };
        runnable.as_thread()
    }

    pub fn identifier<Traits: KernelTraits>() -> ThreadIdentifier<Traits> {
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            unreachable!("current-thread query inside a kernel critical section")
        };
        let current = sched::current(&*lock);
        ThreadIdentifier::new(current, current.cb().sequence_number(&*lock))
    }

    pub fn priority<Traits: KernelTraits>() -> u8 {
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            unreachable!("current-thread query inside a kernel critical section")
        };
        let current = sched::current(&*lock);
        current.cb().priority(&*lock)
    }

    pub fn effective_priority<Traits: KernelTraits>() -> u8 {
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            unreachable!("current-thread query inside a kernel critical section")
        };
        let current = sched::current(&*lock);
        current.cb().effective_priority(&*lock)
    }

    pub fn set_priority<Traits: KernelTraits>(priority: u8, always_behind: bool) {
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("priority change inside a kernel critical section")
        };
        let current = sched::current(&*guard);
        current
            .cb()
            .set_priority(guard.borrow_mut(), priority, always_behind);
    }

    pub fn scheduling_policy<Traits: KernelTraits>() -> SchedulingPolicy {
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            unreachable!("current-thread query inside a kernel critical section")
        };
        let current = sched::current(&*lock);
        current.cb().scheduling_policy(&*lock)
    }

    pub fn set_scheduling_policy<Traits: KernelTraits>(policy: SchedulingPolicy) {
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("policy change inside a kernel critical section")
        };
        let current = sched::current(&*guard);
        current
            .cb()
            .set_scheduling_policy(&mut guard.borrow_mut(), policy);
    }

    /// Step behind the equal-priority peers and let the scheduler pick
    /// again.
    pub fn yield_now<Traits: KernelTraits>() {
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("yield inside a kernel critical section")
        };
        sched::yield_current(guard.borrow_mut());
        // The pended context switch is taken when the guard drops.
    }

    /// Terminate the current thread.
    pub fn exit<Traits: KernelTraits>() -> ! {
        let owner = {
            let Ok(lock) = klock::lock_cpu::<Traits>() else {
                fatal_error!(Traits, "exit inside a kernel critical section")
            };
            let current = sched::current(&*lock);
            match current.cb().owner(&*lock) {
                Some(owner) => owner,
                None => fatal_error!(Traits, "current thread has no owner"),
            }
        };
        // Safety: the current thread's owner object is alive while it runs
        thread_exit::<Traits>(unsafe { &*owner.as_ptr() })
    }

    /// Sleep until the tick clock reaches `deadline`.
    pub fn sleep_until<Traits: KernelTraits>(deadline: TickPoint) -> Result<(), SleepError> {
        sched::expect_waitable_context::<Traits>()?;
        let Ok(guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("sleep inside a kernel critical section")
        };
        // The wait list lives in this very stack frame; it outlives the
        // wait because this thread is its only occupant.
        let sleep_list = ThreadList::<Traits>::new();
        let (_guard, reason) = sched::block_until(
            guard,
            &sleep_list,
            crate::tcb::ThreadState::Sleeping,
            deadline,
        );
        match reason {
            UnblockReason::Timeout | UnblockReason::Normal => Ok(()),
            UnblockReason::Signal => Err(SleepError::Interrupted),
        }
    }

    /// Sleep for `duration` ticks (rounded up by one partial tick).
    pub fn sleep_for<Traits: KernelTraits>(duration: TickDuration) -> Result<(), SleepError> {
        sched::expect_waitable_context::<Traits>()?;
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("sleep inside a kernel critical section")
        };
        let deadline =
            tick::now_locked(guard.borrow_mut()) + duration + TickDuration::from_ticks(1);
        let sleep_list = ThreadList::<Traits>::new();
        let (_guard, reason) = sched::block_until(
            guard,
            &sleep_list,
            crate::tcb::ThreadState::Sleeping,
            deadline,
        );
        match reason {
            UnblockReason::Timeout | UnblockReason::Normal => Ok(()),
            UnblockReason::Signal => Err(SleepError::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, define_test_traits};

    define_test_traits!(struct IdentifierTraits);

    #[test]
    fn identifiers_go_stale_when_the_sequence_moves() {
        test_utils::boot_kernel::<IdentifierTraits>();
        let thread = DynamicThread::<IdentifierTraits>::new(
            DynamicThreadParameters {
                stack_size: 256,
                priority: 5,
                ..Default::default()
            },
            || {},
        );

        let early = thread.identifier();
        thread.start().unwrap();
        let live = thread.identifier();

        // Starting bumps the sequence number, so the pre-start identifier
        // no longer resolves.
        assert!(early.thread().is_none());
        assert!(live.thread().is_some());
        assert_ne!(early, live);

        core::mem::forget(thread);
    }

    define_test_traits!(struct SelfJoinTraits);

    #[test]
    fn join_on_self_is_a_deadlock() {
        test_utils::boot_kernel::<SelfJoinTraits>();
        assert_eq!(
            this_thread::get::<SelfJoinTraits>().join(),
            Err(JoinError::Deadlock)
        );
    }

    define_test_traits!(struct MainTraits);

    #[test]
    fn the_boot_context_becomes_the_main_thread() {
        test_utils::boot_kernel::<MainTraits>();
        let me = this_thread::get::<MainTraits>();
        assert_eq!(me.state(), ThreadState::Runnable);
        assert_eq!(me.priority(), MainTraits::MAIN_THREAD_PRIORITY);
        assert_eq!(me.identifier(), this_thread::identifier::<MainTraits>());
        assert!(me.stack_high_water_mark() <= me.stack_size());
    }

    define_test_traits!(struct PriorityTraits);

    #[test]
    fn set_priority_round_trip() {
        test_utils::boot_kernel::<PriorityTraits>();
        this_thread::set_priority::<PriorityTraits>(42, false);
        assert_eq!(this_thread::priority::<PriorityTraits>(), 42);
        assert_eq!(this_thread::effective_priority::<PriorityTraits>(), 42);
    }
}
