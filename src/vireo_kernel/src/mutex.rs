//! Mutexes.
//!
//! A mutex combines a *type* (plain, error-checking, or recursive) with a
//! *locking protocol* (none, priority inheritance, or priority protection).
//! Under priority inheritance the owner's effective priority is raised to
//! that of the highest-priority waiter, and the boost cascades down a chain
//! of owners blocked on further priority-inheritance mutexes. Under
//! priority protection the owner runs at the mutex's priority ceiling for
//! the duration of the hold.
use core::{fmt, ptr::NonNull};

use crate::{
    error::{LockError, LockTimeoutError, TryLockError, UnlockError},
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    list::{ThreadList, ThreadRef},
    sched,
    tcb::{ThreadControlBlock, ThreadState, UnblockReason},
    tick::{self, TickDuration, TickPoint},
    KernelTraits, PortThreading,
};

/// Behavior of a mutex on contended and repeated locking.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum MutexType {
    /// No owner tracking beyond the lock itself; relocking by the owner
    /// reports the mutex as busy.
    Normal,
    /// Relocking by the owner is detected and reported as a deadlock;
    /// unlocking requires ownership.
    ErrorChecking,
    /// The owner may lock repeatedly; the mutex is released when the
    /// recursion unwinds.
    Recursive,
}

/// Priority protocol of a mutex.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum MutexProtocol {
    /// No priority adjustment.
    None,
    /// The owner inherits the effective priority of its highest-priority
    /// waiter.
    PriorityInheritance,
    /// The owner runs at the mutex's priority ceiling while holding it.
    PriorityProtect,
}

/// The recursion counter saturates here; further recursive locks fail with
/// `Again`.
pub const MAX_RECURSIVE_LOCKS: u16 = u16::MAX - 1;

/// A mutual-exclusion primitive with configurable type and locking
/// protocol.
///
/// The mutex must not be moved while any thread is blocked on it; the
/// blocking operations borrow the mutex for the whole wait, so this can
/// only be violated through unsafe code.
pub struct Mutex<Traits: PortThreading> {
    mutex_type: MutexType,
    protocol: MutexProtocol,
    ceiling: u8,

    owner: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    recursion: CpuLockCell<Traits, u16>,

    /// Threads blocked on this mutex, ordered by effective priority.
    waiters: ThreadList<Traits>,

    /// The next link of the owner's held-mutex chain (headed by the
    /// owner's `last_mutex_held`).
    prev_held: CpuLockCell<Traits, Option<NonNull<Mutex<Traits>>>>,
}

// Safety: all mutable state is behind `CpuLockCell`s, serialized by the
// CPU Lock on this single-core system.
unsafe impl<Traits: PortThreading> Send for Mutex<Traits> {}
unsafe impl<Traits: PortThreading> Sync for Mutex<Traits> {}

impl<Traits: PortThreading> Mutex<Traits> {
    /// Construct a mutex with the given type and protocol. For
    /// [`MutexProtocol::PriorityProtect`] use [`Self::with_ceiling`].
    pub const fn new(mutex_type: MutexType, protocol: MutexProtocol) -> Self {
        Self {
            mutex_type,
            protocol,
            ceiling: 0,
            owner: CpuLockCell::new(None),
            recursion: CpuLockCell::new(0),
            waiters: ThreadList::new(),
            prev_held: CpuLockCell::new(None),
        }
    }

    /// Construct a priority-protect mutex with the given priority ceiling.
    pub const fn with_ceiling(mutex_type: MutexType, ceiling: u8) -> Self {
        Self {
            mutex_type,
            protocol: MutexProtocol::PriorityProtect,
            ceiling,
            owner: CpuLockCell::new(None),
            recursion: CpuLockCell::new(0),
            waiters: ThreadList::new(),
            prev_held: CpuLockCell::new(None),
        }
    }

    pub const fn mutex_type(&self) -> MutexType {
        self.mutex_type
    }

    pub const fn protocol(&self) -> MutexProtocol {
        self.protocol
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Lock the mutex, blocking until it is acquired.
    pub fn lock(&self) -> Result<(), LockError> {
        let mut guard = sched::expect_waitable_context::<Traits>().and(klock::lock_cpu::<Traits>())?;
        loop {
            match self.try_lock_internal(guard.borrow_mut()) {
                Ok(()) => return Ok(()),
                Err(TryLockError::Busy) => {
                    let (g, reason) = self.block_on(guard);
                    guard = g;
                    match reason {
                        // The unlocking thread transferred ownership to us.
                        UnblockReason::Normal => return Ok(()),
                        UnblockReason::Signal => continue,
                        UnblockReason::Timeout => {
                            unreachable!("timeout on an untimed wait")
                        }
                    }
                }
                Err(e) => return Err(map_try_lock_error(e)),
            }
        }
    }

    /// Lock the mutex without blocking.
    ///
    /// Unlike [`Self::lock`], relocking an error-checking mutex reports
    /// `Busy` rather than `Deadlock` — a failed probe is not a deadlock.
    pub fn try_lock(&self) -> Result<(), TryLockError> {
        let mut guard = sched::expect_waitable_context::<Traits>().and(klock::lock_cpu::<Traits>())?;
        match self.try_lock_internal(guard.borrow_mut()) {
            Err(TryLockError::Deadlock) => Err(TryLockError::Busy),
            other => other,
        }
    }

    /// Lock the mutex, giving up after `duration`.
    pub fn try_lock_for(&self, duration: TickDuration) -> Result<(), LockTimeoutError> {
        let mut guard = sched::expect_waitable_context::<Traits>().and(klock::lock_cpu::<Traits>())?;
        let deadline =
            tick::now_locked(guard.borrow_mut()) + duration + TickDuration::from_ticks(1);
        self.lock_until_inner(guard, deadline)
    }

    /// Lock the mutex, giving up once the tick clock reaches `deadline`.
    pub fn try_lock_until(&self, deadline: TickPoint) -> Result<(), LockTimeoutError> {
        let guard = sched::expect_waitable_context::<Traits>().and(klock::lock_cpu::<Traits>())?;
        self.lock_until_inner(guard, deadline)
    }

    fn lock_until_inner(
        &self,
        mut guard: CpuLockGuard<Traits>,
        deadline: TickPoint,
    ) -> Result<(), LockTimeoutError> {
        loop {
            match self.try_lock_internal(guard.borrow_mut()) {
                Ok(()) => return Ok(()),
                Err(TryLockError::Busy) => {
                    let (g, reason) = self.block_on_until(guard, deadline);
                    guard = g;
                    match reason {
                        UnblockReason::Normal => return Ok(()),
                        UnblockReason::Signal => continue,
                        UnblockReason::Timeout => return Err(LockTimeoutError::TimedOut),
                    }
                }
                Err(e) => return Err(map_try_lock_timeout_error(e)),
            }
        }
    }

    /// Unlock the mutex. Only the owner may unlock; a recursive mutex is
    /// released once its recursion count unwinds to zero. Ownership is
    /// transferred to the highest-priority waiter, if any.
    pub fn unlock(&self) -> Result<(), UnlockError> {
        let mut guard = sched::expect_waitable_context::<Traits>().and(klock::lock_cpu::<Traits>())?;
        let mut lock = guard.borrow_mut();

        let cur = sched::current(&*lock);
        if self.owner.get(&*lock) != Some(cur) {
            return Err(UnlockError::NotPermitted);
        }

        if self.mutex_type == MutexType::Recursive {
            let count = self.recursion.get(&*lock);
            if count != 0 {
                self.recursion.replace(&mut *lock, count - 1);
                return Ok(());
            }
        }

        self.unlock_or_transfer(lock.borrow_mut());
        sched::check_preemption(lock);
        Ok(())
    }

    /// Whether the mutex is currently locked.
    pub fn is_locked(&self) -> bool {
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            unreachable!("mutex query inside a kernel critical section")
        };
        self.owner.get(&*lock).is_some()
    }

    /// The non-blocking locking attempt, shared by every lock entry point.
    fn try_lock_internal(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<(), TryLockError> {
        let cur = sched::current(&*lock);

        if self.protocol == MutexProtocol::PriorityProtect
            && cur.cb().effective_priority(&*lock) > self.ceiling
        {
            return Err(TryLockError::InvalidArgument);
        }

        if self.owner.get(&*lock).is_none() {
            self.grant_to(lock.borrow_mut(), cur);
            return Ok(());
        }

        if self.mutex_type == MutexType::Normal {
            return Err(TryLockError::Busy);
        }

        if self.owner.get(&*lock) == Some(cur) {
            match self.mutex_type {
                MutexType::ErrorChecking => return Err(TryLockError::Deadlock),
                MutexType::Recursive => {
                    let count = self.recursion.get(&*lock);
                    if count == MAX_RECURSIVE_LOCKS {
                        return Err(TryLockError::Again);
                    }
                    self.recursion.replace(&mut *lock, count + 1);
                    return Ok(());
                }
                MutexType::Normal => unreachable!(),
            }
        }

        Err(TryLockError::Busy)
    }

    /// Give the ownership of the mutex to `thread` and push the mutex onto
    /// its held chain. The thread must be running or about to be woken.
    fn grant_to(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, thread: ThreadRef<Traits>) {
        let cb = thread.cb();
        self.owner.replace(&mut *lock, Some(thread));
        self.recursion.replace(&mut *lock, 0);

        let prev = cb.last_mutex_held(&*lock);
        cb.set_last_mutex_held(&mut lock.borrow_mut(), Some(NonNull::from(self)));
        self.prev_held.replace(&mut *lock, prev);

        // A priority-protect ceiling (or an inherited boost from a waiter
        // that arrived before a transfer) takes effect immediately.
        refresh_owner_priority(lock, self);
    }

    /// Block the current thread on the waiter list, boosting the owner
    /// first.
    fn block_on(&self, mut guard: CpuLockGuard<Traits>) -> (CpuLockGuard<Traits>, UnblockReason) {
        let thread = self.block_on_begin(guard.borrow_mut());
        sched::block_finish(guard, thread)
    }

    fn block_on_until(
        &self,
        mut guard: CpuLockGuard<Traits>,
        deadline: TickPoint,
    ) -> (CpuLockGuard<Traits>, UnblockReason) {
        if deadline <= tick::now_locked(guard.borrow_mut()) {
            return (guard, UnblockReason::Timeout);
        }
        let thread = self.block_on_begin(guard.borrow_mut());
        sched::set_wake_deadline(guard.borrow_mut(), thread, deadline);
        sched::block_finish(guard, thread)
    }

    fn block_on_begin(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> ThreadRef<Traits> {
        let thread = sched::block_begin(lock.borrow_mut(), &self.waiters, ThreadState::BlockedOnMutex);
        thread
            .cb()
            .set_blocked_on_mutex(&mut lock.borrow_mut(), Some(NonNull::from(self)));
        if self.protocol == MutexProtocol::PriorityInheritance {
            // The new waiter may outrank the owner.
            refresh_owner_priority(lock, self);
        }
        thread
    }

    /// Release the mutex: drop it from the owner's held chain, deflate the
    /// owner's priority, and either transfer ownership to the head waiter
    /// or leave the mutex unowned.
    fn unlock_or_transfer(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let owner = self.owner.get(&*lock).expect("unlock of an unowned mutex");
        self.unlink_from_held_chain(lock.borrow_mut(), owner.cb());

        // Dropping the hold may deflate the (current) owner's priority.
        let base = owner.cb().priority(&*lock);
        let new_effective = evaluate_effective_priority(lock.borrow_mut(), owner.cb(), base);
        let old_effective = owner.cb().effective_priority(&*lock);
        if new_effective != old_effective {
            owner
                .cb()
                .set_effective_priority(&mut lock.borrow_mut(), new_effective);
            owner
                .cb()
                .reposition_after_priority_change(lock.borrow_mut(), new_effective < old_effective);
        }

        if let Some(next) = self.waiters.first(lock.borrow_mut()) {
            self.grant_to(lock.borrow_mut(), next);
            sched::unblock(lock, next, UnblockReason::Normal);
        } else {
            self.owner.replace(&mut *lock, None);
        }
    }

    /// Remove this mutex from `owner`'s held chain, wherever it sits.
    fn unlink_from_held_chain(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        owner: &ThreadControlBlock<Traits>,
    ) {
        let this = NonNull::from(self);
        let mut cursor = owner.last_mutex_held(&*lock);
        let mut prev: Option<NonNull<Mutex<Traits>>> = None;
        while let Some(m) = cursor {
            // Safety: held mutexes outlive the hold
            let m_ref = unsafe { m.as_ref() };
            let next = m_ref.prev_held.get(&*lock);
            if m == this {
                match prev {
                    Some(p) => {
                        // Safety: as above
                        unsafe { p.as_ref() }.prev_held.replace(&mut *lock, next);
                    }
                    None => {
                        owner.set_last_mutex_held(&mut lock.borrow_mut(), next);
                    }
                }
                self.prev_held.replace(&mut *lock, None);
                return;
            }
            prev = cursor;
            cursor = next;
        }
        debug_assert!(false, "mutex not found in the owner's held chain");
    }

    /// A waiter left the waiter list for a reason other than acquiring the
    /// mutex; the owner's inherited boost may have to drop.
    pub(crate) fn on_waiter_removed(&self, lock: CpuLockTokenRefMut<'_, Traits>) {
        if self.protocol == MutexProtocol::PriorityInheritance {
            refresh_owner_priority(lock, self);
        }
    }

    /// A waiter's effective priority changed; re-derive the owner's boost.
    pub(crate) fn on_waiter_priority_changed(&self, lock: CpuLockTokenRefMut<'_, Traits>) {
        if self.protocol == MutexProtocol::PriorityInheritance {
            refresh_owner_priority(lock, self);
        }
    }
}

fn map_try_lock_error(e: TryLockError) -> LockError {
    match e {
        TryLockError::InvalidArgument => LockError::InvalidArgument,
        TryLockError::Deadlock => LockError::Deadlock,
        TryLockError::Again => LockError::Again,
        TryLockError::NotPermitted => LockError::NotPermitted,
        TryLockError::Busy => unreachable!("busy is handled by blocking"),
    }
}

fn map_try_lock_timeout_error(e: TryLockError) -> LockTimeoutError {
    match e {
        TryLockError::InvalidArgument => LockTimeoutError::InvalidArgument,
        TryLockError::Deadlock => LockTimeoutError::Deadlock,
        TryLockError::Again => LockTimeoutError::Again,
        TryLockError::NotPermitted => LockTimeoutError::NotPermitted,
        TryLockError::Busy => unreachable!("busy is handled by blocking"),
    }
}

/// Compute a thread's effective priority from `base_priority` and the
/// mutexes it holds: the ceiling of every held priority-protect mutex and
/// the top waiter of every held priority-inheritance mutex all push it up.
pub(crate) fn evaluate_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &ThreadControlBlock<Traits>,
    base_priority: u8,
) -> u8 {
    let mut effective = base_priority;
    let mut cursor = cb.last_mutex_held(&*lock);
    while let Some(m) = cursor {
        // Safety: held mutexes outlive the hold
        let m = unsafe { m.as_ref() };
        match m.protocol {
            MutexProtocol::PriorityProtect => effective = effective.max(m.ceiling),
            MutexProtocol::PriorityInheritance => {
                if let Some(waiter) = m.waiters.first(lock.borrow_mut()) {
                    effective = effective.max(waiter.cb().effective_priority(&*lock));
                }
            }
            MutexProtocol::None => {}
        }
        cursor = m.prev_held.get(&*lock);
    }
    effective
}

/// Re-derive the owner's effective priority of `mutex` and cascade the
/// change down the chain of priority-inheritance mutexes its owners are
/// blocked on. The cascade reaches a fixed point because the boost is a
/// monotonic maximum.
fn refresh_owner_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: &Mutex<Traits>,
) {
    let mut mutex = NonNull::from(mutex);
    loop {
        // Safety: reachable mutexes are alive (held or waited on)
        let m = unsafe { mutex.as_ref() };
        let Some(owner) = m.owner.get(&*lock) else {
            break;
        };
        let cb = owner.cb();
        let base = cb.priority(&*lock);
        let new_effective = evaluate_effective_priority(lock.borrow_mut(), cb, base);
        let old_effective = cb.effective_priority(&*lock);
        if new_effective == old_effective {
            break;
        }
        cb.set_effective_priority(&mut lock.borrow_mut(), new_effective);
        cb.reposition_after_priority_change(lock.borrow_mut(), new_effective < old_effective);

        match cb.blocked_on_mutex(&*lock) {
            // The inherited priority travels further only through
            // priority-inheritance mutexes.
            Some(next)
                if unsafe { next.as_ref() }.protocol == MutexProtocol::PriorityInheritance =>
            {
                mutex = next;
            }
            _ => break,
        }
    }
    sched::check_preemption(lock);
}

/// Hand every mutex still held by an exiting thread to its next waiter.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    let cb = thread.cb();
    while let Some(m) = cb.last_mutex_held(&*lock) {
        // Safety: held mutexes outlive the hold
        let m = unsafe { m.as_ref() };
        let next = m.prev_held.get(&*lock);
        cb.set_last_mutex_held(&mut lock.borrow_mut(), next);
        m.prev_held.replace(&mut *lock, None);

        if let Some(waiter) = m.waiters.first(lock.borrow_mut()) {
            m.grant_to(lock.borrow_mut(), waiter);
            sched::unblock(lock.borrow_mut(), waiter, UnblockReason::Normal);
        } else {
            m.owner.replace(&mut *lock, None);
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("type", &self.mutex_type)
            .field("protocol", &self.protocol)
            .field("ceiling", &self.ceiling)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{self, define_test_traits},
        thread::this_thread,
    };

    define_test_traits!(struct NormalTraits);

    #[test]
    fn normal_relock_reports_busy() {
        test_utils::boot_kernel::<NormalTraits>();
        let mutex = Mutex::<NormalTraits>::new(MutexType::Normal, MutexProtocol::None);

        mutex.lock().unwrap();
        assert!(mutex.is_locked());
        assert_eq!(mutex.try_lock(), Err(TryLockError::Busy));
        mutex.unlock().unwrap();
        assert!(!mutex.is_locked());
        assert_eq!(mutex.unlock(), Err(UnlockError::NotPermitted));
    }

    define_test_traits!(struct ErrorCheckingTraits);

    #[test]
    fn error_checking_detects_the_deadlock() {
        test_utils::boot_kernel::<ErrorCheckingTraits>();
        let mutex =
            Mutex::<ErrorCheckingTraits>::new(MutexType::ErrorChecking, MutexProtocol::None);

        mutex.lock().unwrap();
        assert_eq!(mutex.lock(), Err(LockError::Deadlock));
        // A probe is not a deadlock.
        assert_eq!(mutex.try_lock(), Err(TryLockError::Busy));
        mutex.unlock().unwrap();
    }

    define_test_traits!(struct RecursiveTraits);

    #[test]
    fn recursive_unlock_decrements() {
        test_utils::boot_kernel::<RecursiveTraits>();
        let mutex = Mutex::<RecursiveTraits>::new(MutexType::Recursive, MutexProtocol::None);

        mutex.lock().unwrap();
        mutex.lock().unwrap();
        mutex.lock().unwrap();

        mutex.unlock().unwrap();
        assert!(mutex.is_locked());
        mutex.unlock().unwrap();
        assert!(mutex.is_locked());
        mutex.unlock().unwrap();
        assert!(!mutex.is_locked());
    }

    define_test_traits!(struct CeilingTraits);

    #[test]
    fn priority_protect_boosts_and_rejects() {
        test_utils::boot_kernel::<CeilingTraits>();
        let base = this_thread::priority::<CeilingTraits>();

        // A ceiling below the caller's priority rejects the lock.
        let low = Mutex::<CeilingTraits>::with_ceiling(MutexType::Normal, base - 1);
        assert_eq!(low.try_lock(), Err(TryLockError::InvalidArgument));

        // A ceiling above it boosts the owner for the duration of the hold.
        let high = Mutex::<CeilingTraits>::with_ceiling(MutexType::Normal, base + 50);
        high.lock().unwrap();
        assert_eq!(this_thread::effective_priority::<CeilingTraits>(), base + 50);
        assert_eq!(this_thread::priority::<CeilingTraits>(), base);
        high.unlock().unwrap();
        assert_eq!(this_thread::effective_priority::<CeilingTraits>(), base);
    }
}
