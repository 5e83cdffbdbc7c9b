//! Kernel state locking.
//!
//! Every kernel structure is protected by a single global critical section:
//! *CPU Lock* (interrupts masked to the kernel level). On a single-core
//! target this gives exclusive access to all kernel state. The exclusivity
//! is encoded in the type system as a singleton token: a
//! [`CpuLockCell`]`<Traits, T>` can only be read or written while holding a
//! [`CpuLockToken`], which can only exist while CPU Lock is active.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{error::ContextError, utils::Init, PortThreading};

pub(crate) struct CpuLockTag<Traits>(Traits);

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Cell type accessible while CPU Lock is active (see [`lock_cpu`]).
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

// Safety: the contents are only accessible while holding the singleton
// CPU Lock token, which serializes all accesses on this single-core system.
// The cells routinely hold raw pointers into other kernel structures, so no
// `T: Send` bound is imposed; the CPU Lock discipline is what makes the
// sharing sound.
unsafe impl<Traits, T: ?Sized> Sync for CpuLockCell<Traits, T> {}
unsafe impl<Traits, T: ?Sized> Send for CpuLockCell<Traits, T> {}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = lock_cpu::<Traits>() {
            f.write_str("CpuLockCell(")?;
            self.0.read(&*lock).fmt(f)?;
            f.write_str(")")
        } else {
            f.write_str("CpuLockCell(< locked >)")
        }
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self(Init::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Attempt to enter a CPU Lock state and get an RAII guard. Fails with
/// `NotPermitted` if CPU Lock is already active.
pub(crate) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, ContextError> {
    // Safety: `try_enter_cpu_lock` is only meant to be called by the kernel
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: we just entered a CPU Lock state, so no other instance of
        //         `CpuLockGuard` can exist at this point
        Ok(unsafe { assume_cpu_lock() })
    } else {
        Err(ContextError::NotPermitted)
    }
}

/// Assume a CPU Lock state and get `CpuLockGuard`.
///
/// # Safety
///
/// The system must really be in a CPU Lock state, and there must be no other
/// instance of `CpuLockGuard` at the point of the call.
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: there are no other instances of `CpuLockToken`; this is
        //         upheld by the caller
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for a CPU Lock state. [`CpuLockToken`] can be borrowed from
/// this type.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is active, and it's the kernel that activated it
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`CpuLockGuard`]. Equivalent to `&'a mut
/// CpuLockGuard` but does not consume memory.
///
/// Unlike `&'a mut _`, this is not automatically reborrowed at call sites;
/// call [`borrow_mut`](tokenlock::UnsyncSingletonTokenRefMut::borrow_mut)
/// explicitly to keep the original accessible after passing it on.
pub(crate) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;
