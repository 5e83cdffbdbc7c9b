//! Per-thread signals.
//!
//! A signal is identified by a number in `0..=31`. *Generated* signals
//! coalesce into a pending bitmask; *queued* signals carry a payload and
//! accumulate in a bounded FIFO. A thread equipped with a signals receiver
//! can block waiting for a set of signals, and can associate handlers with
//! signals for asynchronous delivery: the kernel arranges for the delivery
//! routine to run in the target thread's context (via
//! [`PortThreading::request_function_execution`] when the target is not
//! the caller), which accepts pending unblocked signals one at a time and
//! calls their handlers.
//!
//! [`PortThreading::request_function_execution`]: crate::PortThreading::request_function_execution
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    error::{
        AssociationError, QueueSignalError, SetMaskError, SignalTryWaitError, SignalWaitError,
        SignalWaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockToken},
    list::{ThreadList, ThreadRef},
    sched,
    tcb::{ThreadState, UnblockReason},
    tick::{self, TickDuration, TickPoint},
    utils::Init,
    KernelTraits, PortThreading,
};

/// Capacity of the queued-signal FIFO of one receiver.
pub const SIGNAL_QUEUE_CAPACITY: usize = 8;

/// Number of association slots of one receiver (distinct handler/mask
/// pairs).
pub const SIGNAL_ASSOCIATION_CAPACITY: usize = 4;

/// A set of signal numbers, one bit per signal.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct SignalSet(u32);

impl SignalSet {
    pub const EMPTY: Self = Self(0);
    pub const FULL: Self = Self(u32::MAX);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, number: u8) -> bool {
        number < 32 && self.0 & (1 << number) != 0
    }

    #[inline]
    pub const fn with(self, number: u8) -> Self {
        Self(self.0 | (1 << number))
    }

    #[inline]
    pub const fn without(self, number: u8) -> Self {
        Self(self.0 & !(1 << number))
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The lowest signal number in the set.
    #[inline]
    pub const fn lowest(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SignalSet({:#010x})", self.0)
    }
}

impl Init for SignalSet {
    const INIT: Self = Self::EMPTY;
}

/// How an accepted signal came to be pending.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SignalCode {
    /// [`generate`]d; carries no payload.
    Generated,
    /// [`queue`]d with a payload.
    Queued,
}

/// An accepted signal: its number, origin, and payload.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct SignalInformation {
    number: u8,
    code: SignalCode,
    value: usize,
}

impl SignalInformation {
    pub const fn number(&self) -> u8 {
        self.number
    }

    pub const fn code(&self) -> SignalCode {
        self.code
    }

    pub const fn value(&self) -> usize {
        self.value
    }
}

/// A signal handler and the additional signals masked while it runs.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct SignalAction {
    handler: Option<fn(&SignalInformation)>,
    mask: SignalSet,
}

impl SignalAction {
    /// The default action: the signal is accepted and ignored.
    pub const fn default_action() -> Self {
        Self {
            handler: None,
            mask: SignalSet::EMPTY,
        }
    }

    pub const fn new(handler: fn(&SignalInformation), mask: SignalSet) -> Self {
        Self {
            handler: Some(handler),
            mask,
        }
    }

    pub const fn handler(&self) -> Option<fn(&SignalInformation)> {
        self.handler
    }

    pub const fn mask(&self) -> SignalSet {
        self.mask
    }
}

impl Default for SignalAction {
    fn default() -> Self {
        Self::default_action()
    }
}

/// Per-thread signal state: the pending set, the queued-signal FIFO, the
/// mask, the handler associations, and the delivery bookkeeping.
pub struct SignalsReceiverControlBlock<Traits: PortThreading> {
    pending: CpuLockCell<Traits, SignalSet>,
    queue: CpuLockCell<Traits, ArrayVec<(u8, usize), SIGNAL_QUEUE_CAPACITY>>,
    mask: CpuLockCell<Traits, SignalSet>,
    associations:
        CpuLockCell<Traits, ArrayVec<(SignalSet, SignalAction), SIGNAL_ASSOCIATION_CAPACITY>>,

    /// A delivery request is outstanding; cleared when the delivery
    /// routine picks it up. Prevents piling up function-execution
    /// requests.
    delivery_pending: CpuLockCell<Traits, bool>,

    /// The delivery routine is running; prevents reentrant delivery.
    delivery_in_progress: CpuLockCell<Traits, bool>,

    /// Set while the owning thread blocks in a signal wait.
    waiting_set: CpuLockCell<Traits, Option<SignalSet>>,
}

// Safety: all mutable state is behind `CpuLockCell`s, serialized by the
// CPU Lock on this single-core system.
unsafe impl<Traits: PortThreading> Send for SignalsReceiverControlBlock<Traits> {}
unsafe impl<Traits: PortThreading> Sync for SignalsReceiverControlBlock<Traits> {}

impl<Traits: PortThreading> SignalsReceiverControlBlock<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            pending: CpuLockCell::new(SignalSet::EMPTY),
            queue: CpuLockCell::new(ArrayVec::new_const()),
            mask: CpuLockCell::new(SignalSet::EMPTY),
            associations: CpuLockCell::new(ArrayVec::new_const()),
            delivery_pending: CpuLockCell::new(false),
            delivery_in_progress: CpuLockCell::new(false),
            waiting_set: CpuLockCell::new(None),
        }
    }

    /// Signal numbers with at least one queued instance.
    fn queued_bits(&self, token: &CpuLockToken<Traits>) -> u32 {
        self.queue
            .read(token)
            .iter()
            .fold(0u32, |bits, &(number, _)| bits | (1 << number))
    }

    /// Accept the lowest-numbered signal that is pending (generated or
    /// queued) and contained in `filter`. For a number that is both
    /// generated and queued, the generated instance goes first.
    fn accept(
        &self,
        token: &mut CpuLockToken<Traits>,
        filter: SignalSet,
    ) -> Option<SignalInformation> {
        let pending = self.pending.get(&*token);
        let candidates =
            SignalSet::from_bits((pending.bits() | self.queued_bits(&*token)) & filter.bits());
        let number = candidates.lowest()?;

        if pending.contains(number) {
            self.pending.replace(token, pending.without(number));
            return Some(SignalInformation {
                number,
                code: SignalCode::Generated,
                value: 0,
            });
        }

        let queue = self.queue.write(token);
        let index = queue
            .iter()
            .position(|&(n, _)| n == number)
            .expect("queued bit with no queue entry");
        let (_, value) = queue.remove(index);
        Some(SignalInformation {
            number,
            code: SignalCode::Queued,
            value,
        })
    }

    fn find_association(
        &self,
        token: &CpuLockToken<Traits>,
        number: u8,
    ) -> Option<SignalAction> {
        self.associations
            .read(token)
            .iter()
            .find(|(set, _)| set.contains(number))
            .map(|&(_, action)| action)
    }
}

/// How a signal is posted to a thread.
pub(crate) enum SignalPost {
    Generate,
    Queue(usize),
}

/// Post a signal to `target`: record it, wake the target if it is waiting
/// for it, and request delivery of any handler.
pub(crate) fn post_signal<Traits: KernelTraits>(
    target: ThreadRef<Traits>,
    number: u8,
    post: SignalPost,
) -> Result<(), QueueSignalError> {
    if number > 31 {
        return Err(QueueSignalError::InvalidArgument);
    }

    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal post inside a kernel critical section")
    };

    let Some(receiver) = target.cb().signals_receiver(&*guard) else {
        return Err(QueueSignalError::NotSupported);
    };
    // Safety: a thread's receiver outlives the thread
    let receiver = unsafe { &*receiver.as_ptr() };

    match post {
        SignalPost::Generate => {
            let pending = receiver.pending.get(&*guard);
            receiver.pending.replace(&mut *guard, pending.with(number));
        }
        SignalPost::Queue(value) => {
            if receiver
                .queue
                .write(&mut *guard)
                .try_push((number, value))
                .is_err()
            {
                return Err(QueueSignalError::Again);
            }
        }
    }

    // A thread blocked in a signal wait for this number completes its
    // wait.
    if let Some(waited) = receiver.waiting_set.get(&*guard) {
        if waited.contains(number) && target.cb().state(&*guard) == ThreadState::BlockedOnSignal {
            sched::unblock(guard.borrow_mut(), target, UnblockReason::Signal);
        }
    }

    let is_current = Traits::state().running_thread(&*guard) == Some(target)
        && !Traits::is_in_interrupt_context();

    if is_current {
        // The delivery can run right here, on the caller's own stack, once
        // the critical section ends.
        receiver.delivery_pending.replace(&mut *guard, true);
        drop(guard);
        deliver_signals::<Traits>();
        return Ok(());
    }

    if !receiver.delivery_pending.get(&*guard) {
        receiver.delivery_pending.replace(&mut *guard, true);
        // Safety: CPU Lock is active; `target` is a live control block
        match unsafe {
            Traits::request_function_execution(target.as_ptr(), deliver_trampoline::<Traits>)
        } {
            Ok(()) => {}
            Err(_) => {
                receiver.delivery_pending.replace(&mut *guard, false);
                return Err(QueueSignalError::NoSpace);
            }
        }
    }

    // A blocked target is woken (its blocking call reports
    // `Interrupted`) so the delivery happens promptly.
    sched::interrupt_thread(guard.borrow_mut(), target);

    Ok(())
}

/// The pending (generated) signal set of `target`.
pub(crate) fn pending_signal_set_of<Traits: KernelTraits>(target: ThreadRef<Traits>) -> SignalSet {
    let Ok(lock) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal query inside a kernel critical section")
    };
    match target.cb().signals_receiver(&*lock) {
        // Safety: a thread's receiver outlives the thread
        Some(receiver) => unsafe { &*receiver.as_ptr() }.pending.get(&*lock),
        None => SignalSet::EMPTY,
    }
}

fn deliver_trampoline<Traits: KernelTraits>() {
    deliver_signals::<Traits>();
}

/// The delivery routine. Runs in the context of the thread whose signals
/// are delivered: accepts pending unblocked signals one at a time, lowest
/// number first, and calls their handlers with the handler's mask (plus
/// the accepted signal) installed.
pub(crate) fn deliver_signals<Traits: KernelTraits>() {
    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        return;
    };
    let Some(current) = Traits::state().running_thread(&*guard) else {
        return;
    };
    let Some(receiver) = current.cb().signals_receiver(&*guard) else {
        return;
    };
    // Safety: the current thread's receiver is alive while it runs
    let receiver = unsafe { &*receiver.as_ptr() };

    if receiver.delivery_in_progress.get(&*guard) {
        // The interrupted delivery loop will pick up the new signals.
        return;
    }
    receiver.delivery_in_progress.replace(&mut *guard, true);
    receiver.delivery_pending.replace(&mut *guard, false);

    let base_mask = receiver.mask.get(&*guard);

    loop {
        let unblocked = SignalSet::from_bits(!base_mask.bits());
        let Some(information) = receiver.accept(&mut *guard, unblocked) else {
            break;
        };

        let Some(action) = receiver.find_association(&*guard, information.number()) else {
            // No association: the default action accepts and ignores.
            continue;
        };
        let Some(handler) = action.handler() else {
            continue;
        };

        // Handlers run with interrupts enabled and the handler's mask (plus
        // the delivered signal) on top of the thread's own.
        let handler_mask = base_mask
            .union(action.mask())
            .with(information.number());
        receiver.mask.replace(&mut *guard, handler_mask);
        drop(guard);

        handler(&information);

        let Ok(reacquired) = klock::lock_cpu::<Traits>() else {
            return;
        };
        guard = reacquired;
        receiver.mask.replace(&mut *guard, base_mask);
    }

    receiver.delivery_in_progress.replace(&mut *guard, false);
}

/// Replace the current thread's signal mask. If the new mask unblocks a
/// pending signal, delivery is requested immediately.
pub fn set_signal_mask<Traits: KernelTraits>(mask: SignalSet) -> Result<(), SetMaskError> {
    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal mask change inside a kernel critical section")
    };
    let current = sched::current(&*guard);
    let Some(receiver) = current.cb().signals_receiver(&*guard) else {
        return Err(SetMaskError::NotSupported);
    };
    // Safety: the current thread's receiver is alive while it runs
    let receiver = unsafe { &*receiver.as_ptr() };

    receiver.mask.replace(&mut *guard, mask);

    let now_unblocked = (receiver.pending.get(&*guard).bits()
        | receiver.queued_bits(&*guard))
        & !mask.bits();
    if now_unblocked != 0 {
        receiver.delivery_pending.replace(&mut *guard, true);
        drop(guard);
        deliver_signals::<Traits>();
    }
    Ok(())
}

/// The current thread's signal mask.
pub fn signal_mask<Traits: KernelTraits>() -> Result<SignalSet, SetMaskError> {
    let Ok(guard) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal mask query inside a kernel critical section")
    };
    let current = sched::current(&*guard);
    match current.cb().signals_receiver(&*guard) {
        // Safety: the current thread's receiver is alive while it runs
        Some(receiver) => Ok(unsafe { &*receiver.as_ptr() }.mask.get(&*guard)),
        None => Err(SetMaskError::NotSupported),
    }
}

/// Associate `action` with signal `number` for the current thread,
/// returning the previous action.
///
/// Equal actions share an association slot; setting the default action
/// releases the signal's slot once no signal refers to it.
pub fn set_signal_action<Traits: KernelTraits>(
    number: u8,
    action: SignalAction,
) -> Result<SignalAction, AssociationError> {
    if number > 31 {
        return Err(AssociationError::InvalidArgument);
    }
    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal action change inside a kernel critical section")
    };
    let current = sched::current(&*guard);
    let Some(receiver) = current.cb().signals_receiver(&*guard) else {
        return Err(AssociationError::NotSupported);
    };
    // Safety: the current thread's receiver is alive while it runs
    let receiver = unsafe { &*receiver.as_ptr() };

    let associations = receiver.associations.write(&mut *guard);

    if action.handler().is_none() {
        return Ok(clear_association(associations, number));
    }

    let number_slot = associations.iter().position(|(set, _)| set.contains(number));
    let action_slot = associations.iter().position(|&(_, a)| a == action);

    if let Some(action_slot) = action_slot {
        if Some(action_slot) == number_slot {
            return Ok(action);
        }
        associations[action_slot].0 = associations[action_slot].0.with(number);
        let previous = match number_slot {
            Some(_) => clear_association(associations, number),
            None => SignalAction::default_action(),
        };
        return Ok(previous);
    }

    // A new slot is needed unless the signal's current association covers
    // only this signal (in which case that slot is recycled).
    let sole = number_slot
        .map(|slot| associations[slot].0 == SignalSet::EMPTY.with(number))
        .unwrap_or(false);
    if associations.is_full() && !sole {
        return Err(AssociationError::Again);
    }

    let previous = match number_slot {
        Some(_) => clear_association(associations, number),
        None => SignalAction::default_action(),
    };
    associations.push((SignalSet::EMPTY.with(number), action));
    Ok(previous)
}

/// The action associated with signal `number` for the current thread.
pub fn signal_action<Traits: KernelTraits>(number: u8) -> Result<SignalAction, AssociationError> {
    if number > 31 {
        return Err(AssociationError::InvalidArgument);
    }
    let Ok(guard) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal action query inside a kernel critical section")
    };
    let current = sched::current(&*guard);
    let Some(receiver) = current.cb().signals_receiver(&*guard) else {
        return Err(AssociationError::NotSupported);
    };
    // Safety: the current thread's receiver is alive while it runs
    let receiver = unsafe { &*receiver.as_ptr() };
    Ok(receiver
        .find_association(&*guard, number)
        .unwrap_or_default())
}

fn clear_association(
    associations: &mut ArrayVec<(SignalSet, SignalAction), SIGNAL_ASSOCIATION_CAPACITY>,
    number: u8,
) -> SignalAction {
    let Some(slot) = associations.iter().position(|(set, _)| set.contains(number)) else {
        return SignalAction::default_action();
    };
    let previous = associations[slot].1;
    associations[slot].0 = associations[slot].0.without(number);
    if associations[slot].0.is_empty() {
        associations.swap_remove(slot);
    }
    previous
}

/// Wait until a signal in `set` is pending for the current thread, and
/// accept it.
///
/// The wait accepts signals regardless of the thread's mask. Callers
/// should keep the waited signals *masked* (as POSIX `sigwait` demands),
/// or the asynchronous delivery routine may accept them first — with no
/// association that means silently discarding them.
pub fn wait<Traits: KernelTraits>(set: SignalSet) -> Result<SignalInformation, SignalWaitError> {
    sched::expect_waitable_context::<Traits>()?;
    let Ok(guard) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal wait inside a kernel critical section")
    };
    match wait_inner(guard, set, None) {
        Ok(information) => Ok(information),
        Err(WaitEnd::Unsupported) => Err(SignalWaitError::NotSupported),
        Err(WaitEnd::Timeout) => unreachable!("timeout on an untimed wait"),
    }
}

/// Accept a signal in `set` if one is already pending.
pub fn try_wait<Traits: KernelTraits>(
    set: SignalSet,
) -> Result<SignalInformation, SignalTryWaitError> {
    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal wait inside a kernel critical section")
    };
    let current = sched::current(&*guard);
    let Some(receiver) = current.cb().signals_receiver(&*guard) else {
        return Err(SignalTryWaitError::NotSupported);
    };
    // Safety: the current thread's receiver is alive while it runs
    let receiver = unsafe { &*receiver.as_ptr() };
    receiver
        .accept(&mut *guard, set)
        .ok_or(SignalTryWaitError::Again)
}

/// [`wait`] with a timeout expressed as a duration.
pub fn wait_for<Traits: KernelTraits>(
    set: SignalSet,
    duration: TickDuration,
) -> Result<SignalInformation, SignalWaitTimeoutError> {
    sched::expect_waitable_context::<Traits>()?;
    let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal wait inside a kernel critical section")
    };
    let deadline = tick::now_locked(guard.borrow_mut()) + duration + TickDuration::from_ticks(1);
    match wait_inner(guard, set, Some(deadline)) {
        Ok(information) => Ok(information),
        Err(WaitEnd::Unsupported) => Err(SignalWaitTimeoutError::NotSupported),
        Err(WaitEnd::Timeout) => Err(SignalWaitTimeoutError::TimedOut),
    }
}

/// [`wait`] with a deadline on the tick clock.
pub fn wait_until<Traits: KernelTraits>(
    set: SignalSet,
    deadline: TickPoint,
) -> Result<SignalInformation, SignalWaitTimeoutError> {
    sched::expect_waitable_context::<Traits>()?;
    let Ok(guard) = klock::lock_cpu::<Traits>() else {
        unreachable!("signal wait inside a kernel critical section")
    };
    match wait_inner(guard, set, Some(deadline)) {
        Ok(information) => Ok(information),
        Err(WaitEnd::Unsupported) => Err(SignalWaitTimeoutError::NotSupported),
        Err(WaitEnd::Timeout) => Err(SignalWaitTimeoutError::TimedOut),
    }
}

enum WaitEnd {
    Unsupported,
    Timeout,
}

fn wait_inner<Traits: KernelTraits>(
    mut guard: klock::CpuLockGuard<Traits>,
    set: SignalSet,
    deadline: Option<TickPoint>,
) -> Result<SignalInformation, WaitEnd> {
    let current = sched::current(&*guard);
    let Some(receiver) = current.cb().signals_receiver(&*guard) else {
        return Err(WaitEnd::Unsupported);
    };
    // Safety: the current thread's receiver is alive while it runs
    let receiver = unsafe { &*receiver.as_ptr() };

    loop {
        if let Some(information) = receiver.accept(&mut *guard, set) {
            return Ok(information);
        }

        receiver.waiting_set.replace(&mut *guard, Some(set));
        let wait_list = ThreadList::<Traits>::new();
        let (reacquired, reason) = match deadline {
            Some(deadline) => sched::block_until(
                guard,
                &wait_list,
                ThreadState::BlockedOnSignal,
                deadline,
            ),
            None => sched::block(guard, &wait_list, ThreadState::BlockedOnSignal),
        };
        guard = reacquired;
        receiver.waiting_set.replace(&mut *guard, None);

        match reason {
            UnblockReason::Timeout => {
                // One last chance: a signal that arrived with the timeout.
                if let Some(information) = receiver.accept(&mut *guard, set) {
                    return Ok(information);
                }
                return Err(WaitEnd::Timeout);
            }
            UnblockReason::Normal | UnblockReason::Signal => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{self, define_test_traits},
        thread::{this_thread, Thread as _},
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    define_test_traits!(struct MaskTraits);

    #[test]
    fn masked_generation_stays_pending() {
        test_utils::boot_kernel::<MaskTraits>();
        set_signal_mask::<MaskTraits>(SignalSet::EMPTY.with(7)).unwrap();

        let me = this_thread::get::<MaskTraits>();
        me.generate_signal(7).unwrap();
        assert!(me.pending_signal_set().contains(7));
        // Redundant generations coalesce.
        me.generate_signal(7).unwrap();
        assert!(me.pending_signal_set().contains(7));

        // Unmasking delivers (and, with no association, discards) it.
        set_signal_mask::<MaskTraits>(SignalSet::EMPTY).unwrap();
        assert!(!me.pending_signal_set().contains(7));
    }

    define_test_traits!(struct HandlerTraits);

    static HANDLER_LOG: StdMutex<Vec<u8>> = StdMutex::new(Vec::new());

    fn logging_handler(information: &SignalInformation) {
        HANDLER_LOG.lock().unwrap().push(information.number());
        if information.number() == 7 {
            // Raised while the handler's mask blocks it: must stay pending
            // until this handler returns.
            let me = this_thread::get::<HandlerTraits>();
            me.generate_signal(8).unwrap();
            assert!(me.pending_signal_set().contains(8));
        }
    }

    /// Spec scenario: a handler for signal 7 whose mask includes signal 8
    /// runs exactly once for 7 while 8 stays masked; 8 is delivered only
    /// after the handler returns.
    #[test]
    fn handler_mask_defers_the_second_signal() {
        test_utils::boot_kernel::<HandlerTraits>();
        set_signal_action::<HandlerTraits>(
            7,
            SignalAction::new(logging_handler, SignalSet::EMPTY.with(8)),
        )
        .unwrap();
        set_signal_action::<HandlerTraits>(
            8,
            SignalAction::new(logging_handler, SignalSet::EMPTY),
        )
        .unwrap();

        this_thread::get::<HandlerTraits>().generate_signal(7).unwrap();

        assert_eq!(*HANDLER_LOG.lock().unwrap(), [7, 8]);
        assert!(!this_thread::get::<HandlerTraits>()
            .pending_signal_set()
            .contains(8));
    }

    define_test_traits!(struct QueueTraits);

    #[test]
    fn queued_signals_preserve_order_and_bound() {
        test_utils::boot_kernel::<QueueTraits>();
        // Block delivery so the queue actually fills.
        set_signal_mask::<QueueTraits>(SignalSet::EMPTY.with(5)).unwrap();

        let me = this_thread::get::<QueueTraits>();
        for value in 0..SIGNAL_QUEUE_CAPACITY {
            me.queue_signal(5, value).unwrap();
        }
        assert_eq!(me.queue_signal(5, 99), Err(QueueSignalError::Again));

        for value in 0..SIGNAL_QUEUE_CAPACITY {
            let information = try_wait::<QueueTraits>(SignalSet::EMPTY.with(5)).unwrap();
            assert_eq!(information.number(), 5);
            assert_eq!(information.code(), SignalCode::Queued);
            assert_eq!(information.value(), value);
        }
        assert_eq!(
            try_wait::<QueueTraits>(SignalSet::EMPTY.with(5)),
            Err(SignalTryWaitError::Again)
        );
    }

    define_test_traits!(struct AcceptTraits);

    #[test]
    fn generated_goes_before_queued_for_the_same_number() {
        test_utils::boot_kernel::<AcceptTraits>();
        set_signal_mask::<AcceptTraits>(SignalSet::EMPTY.with(3)).unwrap();

        let me = this_thread::get::<AcceptTraits>();
        me.queue_signal(3, 42).unwrap();
        me.generate_signal(3).unwrap();

        let first = try_wait::<AcceptTraits>(SignalSet::FULL).unwrap();
        assert_eq!(first.code(), SignalCode::Generated);
        let second = try_wait::<AcceptTraits>(SignalSet::FULL).unwrap();
        assert_eq!(second.code(), SignalCode::Queued);
        assert_eq!(second.value(), 42);
    }

    define_test_traits!(struct AssociationTraits);

    static TOUCH: [AtomicU32; 5] = [
        AtomicU32::new(0),
        AtomicU32::new(0),
        AtomicU32::new(0),
        AtomicU32::new(0),
        AtomicU32::new(0),
    ];
    fn handler_0(_: &SignalInformation) {
        TOUCH[0].fetch_add(1, Ordering::Relaxed);
    }
    fn handler_1(_: &SignalInformation) {
        TOUCH[1].fetch_add(1, Ordering::Relaxed);
    }
    fn handler_2(_: &SignalInformation) {
        TOUCH[2].fetch_add(1, Ordering::Relaxed);
    }
    fn handler_3(_: &SignalInformation) {
        TOUCH[3].fetch_add(1, Ordering::Relaxed);
    }
    fn handler_4(_: &SignalInformation) {
        TOUCH[4].fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn association_slots_are_bounded_and_shared() {
        test_utils::boot_kernel::<AssociationTraits>();
        let actions = [
            SignalAction::new(handler_0, SignalSet::EMPTY),
            SignalAction::new(handler_1, SignalSet::EMPTY),
            SignalAction::new(handler_2, SignalSet::EMPTY),
            SignalAction::new(handler_3, SignalSet::EMPTY),
        ];
        for (number, action) in actions.iter().enumerate() {
            set_signal_action::<AssociationTraits>(number as u8, *action).unwrap();
        }

        // All slots taken.
        let overflow = SignalAction::new(handler_4, SignalSet::EMPTY);
        assert_eq!(
            set_signal_action::<AssociationTraits>(9, overflow),
            Err(AssociationError::Again)
        );

        // An equal action shares its slot.
        set_signal_action::<AssociationTraits>(9, actions[0]).unwrap();
        assert_eq!(signal_action::<AssociationTraits>(9).unwrap(), actions[0]);

        // Resetting one signal of a shared slot keeps the slot alive.
        set_signal_action::<AssociationTraits>(0, SignalAction::default_action()).unwrap();
        assert_eq!(signal_action::<AssociationTraits>(9).unwrap(), actions[0]);
        assert_eq!(
            signal_action::<AssociationTraits>(0).unwrap(),
            SignalAction::default_action()
        );

        // Emptying the slot frees it for a new association.
        set_signal_action::<AssociationTraits>(9, SignalAction::default_action()).unwrap();
        set_signal_action::<AssociationTraits>(9, overflow).unwrap();
        assert_eq!(signal_action::<AssociationTraits>(9).unwrap(), overflow);
    }
}
