//! Vireo kernel core — a strict-priority preemptive multitasking kernel for
//! microcontroller-class targets (32-bit, single-core, no MMU).
//!
//! The crate implements the machine-independent part of the kernel: the
//! scheduler, thread lifecycle and stacks, synchronization primitives
//! (mutexes, semaphores), per-thread signals, and the fatal-error path. The
//! machine-dependent part — building the initial stack frame, pending the
//! context-switch interrupt, masking interrupts — is abstracted behind
//! [`PortThreading`], implemented once per build target by a *port* crate
//! (e.g. `vireo_port_std`, the hosted simulation port used for testing).
//!
//! # Contexts
//!
//! Kernel code runs in one of two contexts:
//!
//!  - **Thread context** — the normal execution context of a kernel thread.
//!    All operations are allowed here, including the blocking ones (mutex
//!    lock, semaphore wait, sleep, join, signal wait).
//!  - **Interrupt context** — interrupt service routines. Only bounded-time
//!    operations are allowed; blocking operations fail with
//!    [`ResultCode::NotPermitted`](crate::error::ResultCode::NotPermitted).
//!
//! All kernel state is mutated inside *CPU Lock* sections (interrupts
//! masked). There is no parallelism on a single-core target, so a CPU Lock
//! section has exclusive access to every kernel structure; the [`klock`]
//! module encodes this as a zero-sized token.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::fmt;

#[macro_use]
pub mod utils;
pub mod error;
mod klock;
pub mod fatal;
pub mod tick;
pub mod stack;
mod list;
pub mod tcb;
pub mod sched;
pub mod mutex;
pub mod semaphore;
#[cfg(feature = "signals")]
pub mod signals;
pub mod group;
pub mod thread;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::{
    sched::KernelState,
    tcb::{SchedulingPolicy, ThreadControlBlock, ThreadState},
    thread::{DynamicThread, StaticThread, Thread, ThreadIdentifier},
    tick::{TickDuration, TickPoint},
};

/// The word written into every free stack location and into the stack guard
/// region. Chosen to be unlikely to occur as legitimate stack data.
pub const STACK_SENTINEL: u32 = 0xed41_9f25;

/// The interface the kernel consumes from the architecture port.
///
/// One port per build target; the binding is a static, build-time choice
/// made by implementing this trait (usually through the port crate's
/// `use_port!`-style macro) on the application's kernel trait type.
///
/// # Safety
///
/// Implementing this trait is a promise that the implementation upholds each
/// method's contract. The kernel trusts the port completely; a misbehaving
/// port breaks memory safety of every thread.
pub unsafe trait PortThreading: Sized + 'static {
    /// Port-private per-thread state, embedded in every
    /// [`ThreadControlBlock`]. A bare-metal port typically uses `()`.
    type PortThreadState: Send + Sync + utils::Init + fmt::Debug + 'static;

    /// Required alignment of a stack region, in bytes. Must be a power of
    /// two and at least `align_of::<u32>()`.
    const STACK_ALIGNMENT: usize;

    /// Size of the stack guard region, in bytes. Must be a multiple of four.
    const STACK_GUARD_SIZE: usize;

    /// Write an initial stack frame into `[bottom, bottom + size)` such
    /// that, when the context-switch restore sequence runs against the
    /// returned stack pointer, the thread enters
    /// [`thread::thread_entry`]`::<Self>(tcb)`.
    ///
    /// Returns the initial stack pointer, or [`error::NoSpaceError`] if the
    /// region is too small for the frame.
    ///
    /// # Safety
    ///
    /// `bottom..bottom + size` must be a writable region satisfying
    /// `STACK_ALIGNMENT`; `tcb` must point to a fully constructed thread
    /// control block that outlives the thread's execution.
    unsafe fn initialize_stack(
        bottom: *mut u8,
        size: usize,
        tcb: *const ThreadControlBlock<Self>,
    ) -> Result<*mut u8, error::NoSpaceError>;

    /// Pend the deferred, lowest-priority context-switch interrupt. Safe
    /// from any context; the switch is taken once interrupts are unmasked.
    fn request_context_switch();

    /// Arrange for `func` to run in `target`'s context as soon as the
    /// kernel resumes it, ahead of whatever the thread was doing.
    ///
    /// The port must cover two scenarios: a thread that is not the current
    /// one (a synthesized software frame on its stack), and an interrupt
    /// targeting the thread it interrupted (a synthesized hardware frame
    /// above the pending one). A thread targeting *itself* outside of
    /// interrupt context is a contract violation and must raise
    /// [`fatal::fatal_error`].
    ///
    /// Returns [`error::NoSpaceError`] if the target stack lacks room for
    /// the synthesized frame.
    ///
    /// # Safety
    ///
    /// Must be called with CPU Lock active. `target` must be a live thread
    /// control block.
    unsafe fn request_function_execution(
        target: *const ThreadControlBlock<Self>,
        func: fn(),
    ) -> Result<(), error::NoSpaceError>;

    /// Whether the calling context is an interrupt service routine.
    fn is_in_interrupt_context() -> bool;

    /// Whether the calling context is a thread context with the scheduler
    /// started.
    fn is_task_context() -> bool;

    /// Mask the interrupts that are allowed to call into the kernel.
    ///
    /// # Safety
    ///
    /// CPU Lock must be inactive.
    unsafe fn enter_cpu_lock();

    /// Undo [`Self::enter_cpu_lock`].
    ///
    /// # Safety
    ///
    /// CPU Lock must be active, and it must be the kernel that activated it.
    unsafe fn leave_cpu_lock();

    /// Activate CPU Lock, returning `false` (and doing nothing) if it is
    /// already active.
    ///
    /// # Safety
    ///
    /// Same as [`Self::enter_cpu_lock`], except that an active CPU Lock is
    /// tolerated.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Whether CPU Lock is currently active.
    fn is_cpu_lock_active() -> bool;

    /// Discard the calling thread's execution context and dispatch the next
    /// thread. Called by the thread exiter after the thread was removed
    /// from the scheduler.
    ///
    /// # Safety
    ///
    /// Must be called with CPU Lock active, from the thread `tcb` itself.
    /// Everything on the thread's stack is invalidated.
    unsafe fn exit_and_dispatch(tcb: *const ThreadControlBlock<Self>) -> !;

    /// Hint that the idle thread has nothing to do. A bare-metal port would
    /// execute a wait-for-interrupt instruction here.
    fn wait_for_interrupt() {}
}

/// The kernel trait type: binds a port to the kernel-global state and the
/// compile-time configuration.
///
/// # Safety
///
/// `state` must return the same instance every time, and that instance must
/// not be shared with another kernel trait type.
pub unsafe trait KernelTraits: PortThreading {
    /// Ticks in a round-robin time slice.
    const ROUND_ROBIN_QUANTUM: u32 = 10;

    /// Base priority of the main thread constructed by [`PortToKernel::boot`].
    const MAIN_THREAD_PRIORITY: u8 = 127;

    /// Stack size of the idle thread, in bytes.
    const IDLE_STACK_SIZE: usize = 1024;

    /// The kernel-global state instance.
    fn state() -> &'static KernelState<Self>;
}

/// The interface the kernel exposes to the architecture port. Implemented
/// automatically for every [`KernelTraits`] type.
pub trait PortToKernel: KernelTraits {
    /// Initialize the scheduler: adopt the calling context as the *main
    /// thread* (with `main_stack` as its stack region, in the borrowing
    /// form) and start the idle thread.
    ///
    /// Returns control to the caller, which keeps running as the main
    /// thread.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, before any other kernel operation, with
    /// CPU Lock inactive. `main_stack_bottom..+main_stack_size` must cover
    /// the calling context's stack (or, for a simulation port, a dedicated
    /// region that stands in for it).
    unsafe fn boot(main_stack_bottom: *mut u8, main_stack_size: usize);

    /// The context-switch interrupt entry point. Saves `current_sp` into
    /// the outgoing thread's stack, elects the new current thread, and
    /// returns its saved stack pointer.
    ///
    /// # Safety
    ///
    /// Must be called from the context-switch handler with CPU Lock active
    /// (or interrupts otherwise masked to the kernel level).
    unsafe fn switch_context(current_sp: *mut u8) -> *mut u8;

    /// The tick interrupt entry point. Advances the tick clock, runs the
    /// round-robin and timeout machinery, and returns `true` iff a context
    /// switch is needed (the port then pends one).
    ///
    /// # Safety
    ///
    /// Must be called from the tick interrupt handler with CPU Lock
    /// inactive.
    unsafe fn tick_interrupt() -> bool;

    /// Pointer to the current thread's control block, or null before boot
    /// or while the current thread is exiting.
    ///
    /// # Safety
    ///
    /// Must be called with CPU Lock active.
    unsafe fn running_thread() -> *const ThreadControlBlock<Self>;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot(main_stack_bottom: *mut u8, main_stack_size: usize) {
        // Safety: forwarded to the callee
        unsafe { sched::boot::<Traits>(main_stack_bottom, main_stack_size) }
    }

    unsafe fn switch_context(current_sp: *mut u8) -> *mut u8 {
        // Safety: forwarded to the callee
        unsafe { sched::switch_context::<Traits>(current_sp) }
    }

    unsafe fn tick_interrupt() -> bool {
        // Safety: forwarded to the callee
        unsafe { sched::tick_interrupt::<Traits>() }
    }

    unsafe fn running_thread() -> *const ThreadControlBlock<Self> {
        // Safety: the caller guarantees CPU Lock is active
        let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let ptr = match Traits::state().running_thread(&*lock) {
            Some(thread) => thread.as_ptr(),
            None => core::ptr::null(),
        };
        // The lock guard merely borrows the CPU Lock owned by the caller;
        // dropping it would deactivate CPU Lock behind the caller's back.
        core::mem::forget(lock);
        ptr
    }
}
