//! Semaphores.
use core::fmt;

use crate::{
    error::{PostError, TryWaitError, WaitError, WaitTimeoutError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    list::ThreadList,
    sched,
    tcb::{ThreadState, UnblockReason},
    tick::{self, TickDuration, TickPoint},
    KernelTraits, PortThreading,
};

/// A counting semaphore with a fixed maximum value.
///
/// `post` may be called from interrupt context; the wait family may not.
/// A `post` that finds waiters hands its permit directly to the
/// highest-priority one instead of touching the counter.
pub struct Semaphore<Traits: PortThreading> {
    value: CpuLockCell<Traits, u32>,
    max_value: u32,

    /// Threads blocked on the semaphore, ordered by effective priority.
    waiters: ThreadList<Traits>,
}

// Safety: all mutable state is behind `CpuLockCell`s, serialized by the
// CPU Lock on this single-core system.
unsafe impl<Traits: PortThreading> Send for Semaphore<Traits> {}
unsafe impl<Traits: PortThreading> Sync for Semaphore<Traits> {}

impl<Traits: PortThreading> Semaphore<Traits> {
    /// Construct a semaphore with the given initial value and no practical
    /// maximum.
    pub const fn new(initial: u32) -> Self {
        Self::with_max(initial, u32::MAX)
    }

    /// Construct a semaphore whose value can never exceed `max_value`.
    pub const fn with_max(initial: u32, max_value: u32) -> Self {
        let initial = if initial > max_value {
            max_value
        } else {
            initial
        };
        Self {
            value: CpuLockCell::new(initial),
            max_value,
            waiters: ThreadList::new(),
        }
    }

    pub const fn max_value(&self) -> u32 {
        self.max_value
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Current value of the semaphore.
    pub fn value(&self) -> u32 {
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            unreachable!("semaphore query inside a kernel critical section")
        };
        self.value.get(&*lock)
    }

    /// Increment the semaphore, or wake its highest-priority waiter.
    pub fn post(&self) -> Result<(), PostError> {
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("post inside a kernel critical section")
        };
        self.post_locked(guard.borrow_mut())
    }

    /// [`Self::post`] for callers already inside a kernel critical
    /// section (the thread exiter posting the join semaphore).
    pub(crate) fn post_locked(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<(), PostError> {
        let value = self.value.get(&*lock);
        if value == self.max_value {
            return Err(PostError::Overflow);
        }

        if let Some(first) = self.waiters.first(lock.borrow_mut()) {
            // Hand the permit straight to the waiter; the counter stays
            // untouched.
            sched::unblock(lock, first, UnblockReason::Normal);
            return Ok(());
        }

        self.value.replace(&mut *lock, value + 1);
        Ok(())
    }

    /// Decrement the semaphore, blocking while its value is zero.
    ///
    /// Returns [`WaitError::Interrupted`] when the wait is cut short by a
    /// signal delivery request; callers that do not care retry (`join`
    /// does).
    pub fn wait(&self) -> Result<(), WaitError> {
        let mut guard = sched::expect_waitable_context::<Traits>().and(klock::lock_cpu::<Traits>())?;
        if self.try_wait_internal(guard.borrow_mut()) {
            return Ok(());
        }
        let (_guard, reason) = sched::block(guard, &self.waiters, ThreadState::BlockedOnSemaphore);
        match reason {
            UnblockReason::Normal => Ok(()),
            UnblockReason::Signal => Err(WaitError::Interrupted),
            UnblockReason::Timeout => unreachable!("timeout on an untimed wait"),
        }
    }

    /// Decrement the semaphore without blocking.
    pub fn try_wait(&self) -> Result<(), TryWaitError> {
        let Ok(mut guard) = klock::lock_cpu::<Traits>() else {
            unreachable!("try_wait inside a kernel critical section")
        };
        if self.try_wait_internal(guard.borrow_mut()) {
            Ok(())
        } else {
            Err(TryWaitError::Busy)
        }
    }

    /// Decrement the semaphore, giving up after `duration`.
    pub fn try_wait_for(&self, duration: TickDuration) -> Result<(), WaitTimeoutError> {
        let mut guard = sched::expect_waitable_context::<Traits>().and(klock::lock_cpu::<Traits>())?;
        let deadline =
            tick::now_locked(guard.borrow_mut()) + duration + TickDuration::from_ticks(1);
        self.wait_until_inner(guard, deadline)
    }

    /// Decrement the semaphore, giving up once the tick clock reaches
    /// `deadline`.
    pub fn try_wait_until(&self, deadline: TickPoint) -> Result<(), WaitTimeoutError> {
        let guard = sched::expect_waitable_context::<Traits>().and(klock::lock_cpu::<Traits>())?;
        self.wait_until_inner(guard, deadline)
    }

    fn wait_until_inner(
        &self,
        mut guard: klock::CpuLockGuard<Traits>,
        deadline: TickPoint,
    ) -> Result<(), WaitTimeoutError> {
        if self.try_wait_internal(guard.borrow_mut()) {
            return Ok(());
        }
        let (_guard, reason) = sched::block_until(
            guard,
            &self.waiters,
            ThreadState::BlockedOnSemaphore,
            deadline,
        );
        match reason {
            UnblockReason::Normal => Ok(()),
            UnblockReason::Signal => Err(WaitTimeoutError::Interrupted),
            UnblockReason::Timeout => Err(WaitTimeoutError::TimedOut),
        }
    }

    fn try_wait_internal(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let value = self.value.get(&*lock);
        if value == 0 {
            false
        } else {
            self.value.replace(&mut *lock, value - 1);
            true
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::test_utils::define_test_traits!(struct OverflowTraits);

    #[test]
    fn post_at_max_overflows() {
        let semaphore = Semaphore::<OverflowTraits>::with_max(0, 1);
        semaphore.post().unwrap();
        assert_eq!(semaphore.post(), Err(PostError::Overflow));
        assert_eq!(semaphore.value(), 1);
    }

    crate::test_utils::define_test_traits!(struct DrainTraits);

    #[test]
    fn try_wait_drains_to_busy() {
        let semaphore = Semaphore::<DrainTraits>::with_max(2, 2);
        semaphore.try_wait().unwrap();
        semaphore.try_wait().unwrap();
        assert_eq!(semaphore.try_wait(), Err(TryWaitError::Busy));
        assert_eq!(semaphore.value(), 0);
    }

    crate::test_utils::define_test_traits!(struct ClampTraits);

    #[test]
    fn initial_value_is_clamped_to_max() {
        let semaphore = Semaphore::<ClampTraits>::with_max(5, 2);
        assert_eq!(semaphore.value(), 2);
        assert_eq!(semaphore.max_value(), 2);
    }

    crate::test_utils::define_test_traits!(struct ConserveTraits);

    #[test]
    fn post_then_wait_is_conservative() {
        let semaphore = Semaphore::<ConserveTraits>::new(0);
        semaphore.post().unwrap();
        semaphore.try_wait().unwrap();
        assert_eq!(semaphore.value(), 0);
    }
}
