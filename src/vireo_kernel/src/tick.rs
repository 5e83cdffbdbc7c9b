//! The tick clock.
//!
//! A free-running 64-bit counter of fixed-duration ticks since boot,
//! advanced only by the tick interrupt (after the scheduler's tick handler
//! has run). The tick duration itself is a property of the port's timer
//! configuration; the kernel only counts.
//!
//! The counter is 64-bit and is assumed never to wrap within a system
//! lifetime, so time points compare and subtract as plain integers;
//! arithmetic saturates instead of wrapping.
use core::ops;

use crate::{klock, KernelTraits};

/// A point on the tick clock: the number of ticks elapsed since boot.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
pub struct TickPoint(u64);

/// A span of time expressed in ticks.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
pub struct TickDuration(u64);

impl TickPoint {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    #[inline]
    pub const fn as_ticks(self) -> u64 {
        self.0
    }
}

impl TickDuration {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    #[inline]
    pub const fn as_ticks(self) -> u64 {
        self.0
    }
}

impl ops::Add<TickDuration> for TickPoint {
    type Output = TickPoint;

    #[inline]
    fn add(self, rhs: TickDuration) -> TickPoint {
        TickPoint(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub<TickPoint> for TickPoint {
    type Output = TickDuration;

    #[inline]
    fn sub(self, rhs: TickPoint) -> TickDuration {
        TickDuration(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Add for TickDuration {
    type Output = TickDuration;

    #[inline]
    fn add(self, rhs: TickDuration) -> TickDuration {
        TickDuration(self.0.saturating_add(rhs.0))
    }
}

/// Read the tick clock.
///
/// Usable from thread and interrupt context alike, but not from within a
/// kernel critical section (kernel code holding CPU Lock reads the counter
/// through its lock token instead).
pub fn now<Traits: KernelTraits>() -> TickPoint {
    let lock = klock::lock_cpu::<Traits>()
        .unwrap_or_else(|_| unreachable!("tick clock read inside a kernel critical section"));
    TickPoint(Traits::state().tick.get(&*lock))
}

/// Read the tick clock from within a kernel critical section.
#[inline]
pub(crate) fn now_locked<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> TickPoint {
    TickPoint(Traits::state().tick.get(&*lock))
}

/// Advance the tick clock by one tick. Called by the tick interrupt only.
pub(crate) fn advance<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> TickPoint {
    let next = Traits::state().tick.get(&*lock).saturating_add(1);
    Traits::state().tick.replace(&mut *lock, next);
    TickPoint(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_duration_arithmetic() {
        let t0 = TickPoint::from_ticks(100);
        let t1 = t0 + TickDuration::from_ticks(50);
        assert_eq!(t1.as_ticks(), 150);
        assert_eq!((t1 - t0).as_ticks(), 50);
        // Saturating in both directions
        assert_eq!((t0 - t1).as_ticks(), 0);
        assert_eq!(
            (TickPoint::from_ticks(u64::MAX) + TickDuration::from_ticks(1)).as_ticks(),
            u64::MAX
        );
    }
}
