//! Thread groups.
//!
//! A thread group is nothing more than an enumerable set of threads; it
//! plays no role in scheduling. A thread created without an explicit group
//! joins the group of the thread that created it.
use core::fmt;

use crate::{
    klock::{self, CpuLockTokenRefMut},
    list::{GroupListTag, ThreadList, ThreadRef},
    thread::ThreadIdentifier,
    utils::Init,
    KernelTraits, PortThreading,
};

pub(crate) struct ThreadGroupControlBlock<Traits: PortThreading> {
    members: ThreadList<Traits, GroupListTag>,
}

impl<Traits: PortThreading> Init for ThreadGroupControlBlock<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        members: ThreadList::INIT,
    };
}

impl<Traits: PortThreading> ThreadGroupControlBlock<Traits> {
    pub(crate) fn add(&self, lock: CpuLockTokenRefMut<'_, Traits>, thread: ThreadRef<Traits>) {
        self.members.push_back(lock, thread);
    }

    pub(crate) fn remove(&self, lock: CpuLockTokenRefMut<'_, Traits>, thread: ThreadRef<Traits>) {
        self.members.remove(lock, thread);
    }
}

/// An enumerable set of threads.
///
/// The group must outlive its member threads; members deregister themselves
/// on exit.
pub struct ThreadGroup<Traits: PortThreading> {
    control_block: ThreadGroupControlBlock<Traits>,
}

impl<Traits: PortThreading> ThreadGroup<Traits> {
    pub const fn new() -> Self {
        Self {
            control_block: ThreadGroupControlBlock::INIT,
        }
    }

    pub(crate) fn control_block(&self) -> &ThreadGroupControlBlock<Traits> {
        &self.control_block
    }
}

impl<Traits: PortThreading> Default for ThreadGroup<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> ThreadGroup<Traits> {
    /// Call `f` with the identifier of every member thread.
    pub fn for_each(&self, mut f: impl FnMut(ThreadIdentifier<Traits>)) {
        let mut lock = klock::lock_cpu::<Traits>()
            .unwrap_or_else(|_| unreachable!("group enumeration inside a kernel critical section"));
        let mut cursor = self.control_block.members.first(lock.borrow_mut());
        while let Some(thread) = cursor {
            f(ThreadIdentifier::new(
                thread,
                thread.cb().sequence_number(&*lock),
            ));
            cursor = self.control_block.members.next(lock.borrow_mut(), thread);
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for ThreadGroup<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ThreadGroup")
    }
}
