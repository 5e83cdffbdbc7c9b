//! Intrusive lists of thread control blocks.
//!
//! Every thread control block carries two link nodes: one for the list
//! that *owns* the thread in its current state (ready, a waiter queue, the
//! terminated list), and one for the sleeping list, which a thread can be
//! a member of *in addition* to a waiter queue during a timed block.
//!
//! Links are `CpuLockCell`s, so all structural mutation happens inside a
//! kernel critical section; moving a thread between two lists (unlink +
//! link) is atomic with respect to every other kernel context.
use core::{fmt, marker::PhantomData, ptr::NonNull};

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    tcb::ThreadControlBlock,
    utils::Init,
    PortThreading,
};

/// A reference to a [`ThreadControlBlock`] registered with the kernel.
pub(crate) struct ThreadRef<Traits: PortThreading>(NonNull<ThreadControlBlock<Traits>>);

// Safety: `ThreadControlBlock` is `Send + Sync`; the reference is only
// dereferenced inside kernel critical sections.
unsafe impl<Traits: PortThreading> Send for ThreadRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for ThreadRef<Traits> {}

impl<Traits: PortThreading> Clone for ThreadRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for ThreadRef<Traits> {}

impl<Traits: PortThreading> PartialEq for ThreadRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: PortThreading> Eq for ThreadRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for ThreadRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ThreadRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> ThreadRef<Traits> {
    pub(crate) fn new(cb: &ThreadControlBlock<Traits>) -> Self {
        Self(NonNull::from(cb))
    }

    pub(crate) fn as_ptr(self) -> *const ThreadControlBlock<Traits> {
        self.0.as_ptr()
    }

    /// Dereference the thread control block.
    ///
    /// The returned lifetime is unbounded. A control block stays valid
    /// while it is reachable from any kernel structure — a thread is only
    /// reclaimed after it has left every list (enforced by the exit and
    /// detach protocols) — so dereferencing a `ThreadRef` obtained from a
    /// kernel list inside the same critical section is always sound.
    pub(crate) fn cb<'a>(self) -> &'a ThreadControlBlock<Traits> {
        unsafe { &*self.0.as_ptr() }
    }
}

/// A pair of neighbor links embedded in a [`ThreadControlBlock`].
pub(crate) struct Node<Traits: PortThreading> {
    prev: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    next: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
}

impl<Traits: PortThreading> Init for Node<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        prev: Init::INIT,
        next: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for Node<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Node")
    }
}

/// Selects which of the two link nodes of a control block a list threads
/// through.
pub(crate) trait ListTag<Traits: PortThreading>: 'static {
    fn node(cb: &ThreadControlBlock<Traits>) -> &Node<Traits>;
}

/// Tag of the state-owning lists (ready list, waiter queues, terminated
/// list).
pub(crate) struct StateListTag;

/// Tag of the sleeping list.
pub(crate) struct SleepListTag;

/// Tag of thread group membership lists.
pub(crate) struct GroupListTag;

impl<Traits: PortThreading> ListTag<Traits> for GroupListTag {
    #[inline]
    fn node(cb: &ThreadControlBlock<Traits>) -> &Node<Traits> {
        cb.group_link()
    }
}

impl<Traits: PortThreading> ListTag<Traits> for StateListTag {
    #[inline]
    fn node(cb: &ThreadControlBlock<Traits>) -> &Node<Traits> {
        cb.link()
    }
}

impl<Traits: PortThreading> ListTag<Traits> for SleepListTag {
    #[inline]
    fn node(cb: &ThreadControlBlock<Traits>) -> &Node<Traits> {
        cb.sleep_link()
    }
}

/// An intrusive doubly-linked list of thread control blocks.
pub(crate) struct ThreadList<Traits: PortThreading, Tag = StateListTag> {
    head: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    tail: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    _tag: PhantomData<Tag>,
}

impl<Traits: PortThreading, Tag> Init for ThreadList<Traits, Tag> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        head: Init::INIT,
        tail: Init::INIT,
        _tag: PhantomData,
    };
}

impl<Traits: PortThreading, Tag> ThreadList<Traits, Tag> {
    pub(crate) const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: PortThreading, Tag: ListTag<Traits>> ThreadList<Traits, Tag> {
    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.head.get(&*lock).is_none()
    }

    pub(crate) fn first(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<ThreadRef<Traits>> {
        self.head.get(&*lock)
    }

    pub(crate) fn next(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) -> Option<ThreadRef<Traits>> {
        Tag::node(thread.cb()).next.get(&*lock)
    }

    /// Link `thread` between `prev` and `next` (either may be `None`,
    /// meaning the corresponding end of the list).
    fn link(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
        prev: Option<ThreadRef<Traits>>,
        next: Option<ThreadRef<Traits>>,
    ) {
        let node = Tag::node(thread.cb());
        node.prev.replace(&mut *lock, prev);
        node.next.replace(&mut *lock, next);
        match prev {
            Some(p) => {
                Tag::node(p.cb()).next.replace(&mut *lock, Some(thread));
            }
            None => {
                self.head.replace(&mut *lock, Some(thread));
            }
        }
        match next {
            Some(n) => {
                Tag::node(n.cb()).prev.replace(&mut *lock, Some(thread));
            }
            None => {
                self.tail.replace(&mut *lock, Some(thread));
            }
        }
    }

    /// Append `thread` without regard to ordering. Used by the unordered
    /// lists (terminated threads).
    pub(crate) fn push_back(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) {
        let tail = self.tail.get(&*lock);
        self.link(lock.borrow_mut(), thread, tail, None);
    }

    /// Unlink `thread` from this list.
    pub(crate) fn remove(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) {
        let node = Tag::node(thread.cb());
        let prev = node.prev.replace(&mut *lock, None);
        let next = node.next.replace(&mut *lock, None);
        match prev {
            Some(p) => {
                Tag::node(p.cb()).next.replace(&mut *lock, next);
            }
            None => {
                self.head.replace(&mut *lock, next);
            }
        }
        match next {
            Some(n) => {
                Tag::node(n.cb()).prev.replace(&mut *lock, prev);
            }
            None => {
                self.tail.replace(&mut *lock, prev);
            }
        }
    }

    pub(crate) fn pop_front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<ThreadRef<Traits>> {
        let first = self.head.get(&*lock)?;
        self.remove(lock.borrow_mut(), first);
        Some(first)
    }
}

impl<Traits: PortThreading> ThreadList<Traits, StateListTag> {
    /// Insert `thread` at the tail of its effective-priority group: after
    /// every thread whose effective priority is greater than or equal to
    /// `thread`'s.
    pub(crate) fn insert_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) {
        let priority = thread.cb().effective_priority(&*lock);

        // Scan from the back: threads near the tail have the lowest
        // priorities, so this is O(1) for the common add-lowest case.
        let mut next = None;
        let mut cursor = self.tail.get(&*lock);
        while let Some(cur) = cursor {
            if cur.cb().effective_priority(&*lock) >= priority {
                break;
            }
            next = Some(cur);
            cursor = StateListTag::node(cur.cb()).prev.get(&*lock);
        }
        self.link(lock.borrow_mut(), thread, cursor, next);
    }

    /// Insert `thread` at the head of its effective-priority group: before
    /// every thread whose effective priority is less than or equal to
    /// `thread`'s.
    pub(crate) fn insert_priority_front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) {
        let priority = thread.cb().effective_priority(&*lock);

        let mut prev = None;
        let mut cursor = self.head.get(&*lock);
        while let Some(cur) = cursor {
            if cur.cb().effective_priority(&*lock) <= priority {
                break;
            }
            prev = Some(cur);
            cursor = StateListTag::node(cur.cb()).next.get(&*lock);
        }
        self.link(lock.borrow_mut(), thread, prev, cursor);
    }

    /// Reposition `thread` after a change of its effective priority.
    pub(crate) fn reposition(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
        to_front_of_group: bool,
    ) {
        self.remove(lock.borrow_mut(), thread);
        if to_front_of_group {
            self.insert_priority_front(lock.borrow_mut(), thread);
        } else {
            self.insert_priority(lock.borrow_mut(), thread);
        }
    }
}

impl<Traits: PortThreading> ThreadList<Traits, SleepListTag> {
    /// Insert `thread` in ascending wake-deadline order; ties are broken by
    /// insertion order (the new thread goes behind existing equal
    /// deadlines).
    pub(crate) fn insert_deadline(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) {
        let deadline = thread.cb().wake_deadline(&*lock);

        let mut prev = None;
        let mut cursor = self.head.get(&*lock);
        while let Some(cur) = cursor {
            if cur.cb().wake_deadline(&*lock) > deadline {
                break;
            }
            prev = Some(cur);
            cursor = SleepListTag::node(cur.cb()).next.get(&*lock);
        }
        self.link(lock.borrow_mut(), thread, prev, cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        klock,
        stack::Stack,
        tcb::{SchedulingPolicy, ThreadControlBlock},
        test_utils::define_test_traits,
    };
    use alloc::{boxed::Box, vec::Vec};
    use quickcheck_macros::quickcheck;

    fn make_threads<Traits: crate::KernelTraits>(
        priorities: &[u8],
    ) -> Vec<Box<ThreadControlBlock<Traits>>> {
        priorities
            .iter()
            .map(|&priority| {
                Box::new(ThreadControlBlock::new(
                    Stack::with_storage(Box::new_uninit_slice(128)),
                    priority,
                    SchedulingPolicy::Fifo,
                ))
            })
            .collect()
    }

    /// The drain order must equal a stable descending sort of the insert
    /// order: priority first, FIFO within a priority.
    define_test_traits!(struct InsertTraits);

    #[quickcheck]
    fn insertion_keeps_priority_order(priorities: Vec<u8>) -> bool {
        let threads = make_threads::<InsertTraits>(&priorities);
        let list = ThreadList::<InsertTraits>::new();
        let mut guard = klock::lock_cpu::<InsertTraits>().unwrap();

        for thread in &threads {
            list.insert_priority(guard.borrow_mut(), ThreadRef::new(thread));
        }

        let mut expected: Vec<usize> = (0..priorities.len()).collect();
        expected.sort_by(|&a, &b| priorities[b].cmp(&priorities[a]));

        let mut ok = true;
        for index in expected {
            match list.pop_front(guard.borrow_mut()) {
                Some(popped) => ok &= core::ptr::eq(popped.as_ptr(), &*threads[index]),
                None => ok = false,
            }
        }
        ok && list.is_empty(guard.borrow_mut())
    }

    define_test_traits!(struct RemoveTraits);

    #[quickcheck]
    fn removal_keeps_the_rest_ordered(priorities: Vec<u8>, victim: usize) -> bool {
        if priorities.is_empty() {
            return true;
        }
        let victim = victim % priorities.len();
        let threads = make_threads::<RemoveTraits>(&priorities);
        let list = ThreadList::<RemoveTraits>::new();
        let mut guard = klock::lock_cpu::<RemoveTraits>().unwrap();

        for thread in &threads {
            list.insert_priority(guard.borrow_mut(), ThreadRef::new(thread));
        }
        list.remove(guard.borrow_mut(), ThreadRef::new(&threads[victim]));

        let mut expected: Vec<usize> = (0..priorities.len()).filter(|&i| i != victim).collect();
        expected.sort_by(|&a, &b| priorities[b].cmp(&priorities[a]));

        let mut ok = true;
        for index in expected {
            match list.pop_front(guard.borrow_mut()) {
                Some(popped) => ok &= core::ptr::eq(popped.as_ptr(), &*threads[index]),
                None => ok = false,
            }
        }
        ok && list.is_empty(guard.borrow_mut())
    }

    define_test_traits!(struct FrontTraits);

    #[test]
    fn front_of_group_insertion() {
        let threads = make_threads::<FrontTraits>(&[5, 5, 3, 5]);
        let list = ThreadList::<FrontTraits>::new();
        let mut guard = klock::lock_cpu::<FrontTraits>().unwrap();

        for thread in &threads[..3] {
            list.insert_priority(guard.borrow_mut(), ThreadRef::new(thread));
        }
        // The latecomer overtakes its equal-priority peers but not the
        // higher ones.
        list.insert_priority_front(guard.borrow_mut(), ThreadRef::new(&threads[3]));

        let order: [usize; 4] = [3, 0, 1, 2];
        for index in order {
            let popped = list.pop_front(guard.borrow_mut()).unwrap();
            assert!(core::ptr::eq(popped.as_ptr(), &*threads[index]));
        }
    }

    define_test_traits!(struct DeadlineTraits);

    #[test]
    fn deadline_order_with_fifo_ties() {
        let threads = make_threads::<DeadlineTraits>(&[1, 1, 1, 1]);
        let list = ThreadList::<DeadlineTraits, SleepListTag>::new();
        let mut guard = klock::lock_cpu::<DeadlineTraits>().unwrap();

        for (thread, deadline) in threads.iter().zip([50u64, 20, 50, 10]) {
            thread.set_wake_deadline(&mut guard.borrow_mut(), deadline);
            list.insert_deadline(guard.borrow_mut(), ThreadRef::new(thread));
        }

        let order: [usize; 4] = [3, 1, 0, 2];
        for index in order {
            let popped = list.pop_front(guard.borrow_mut()).unwrap();
            assert!(core::ptr::eq(popped.as_ptr(), &*threads[index]));
        }
    }
}
