//! Simulation environment for running the Vireo kernel on a hosted (unix)
//! target.
//!
//! Every kernel thread is backed by a host thread, but at most one of them
//! runs at a time: a user-mode scheduler built on park/unpark keeps the
//! single-core illusion, and *remote park* (see [`threading`]) lets a
//! simulated interrupt stop the running thread at an arbitrary point, so
//! preemption is as real as it is on hardware.
//!
//! The simulated interrupt controller knows two interrupts, matching the
//! kernel's needs: the tick and the context switch. Both are latched while
//! CPU Lock is active and taken when it is released, mirroring a masked
//! interrupt becoming pending.
//!
//! ```no_run
//! vireo_port_std::use_port!(unsafe pub struct SystemTraits);
//!
//! fn main() {
//!     vireo_port_std::run::<SystemTraits>(|| {
//!         // runs as the kernel's main thread
//!     });
//! }
//! ```
#![cfg(unix)]

use std::{
    any::Any,
    cell::Cell,
    fmt,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        mpsc,
    },
    time::Duration,
};

use once_cell::sync::{Lazy, OnceCell};
use slab::Slab;
use spin::Mutex as SpinMutex;

use vireo_kernel::{
    error::NoSpaceError, utils::Init, KernelTraits, PortThreading, PortToKernel,
    ThreadControlBlock,
};

#[doc(hidden)]
pub use vireo_kernel;

pub mod threading;

/// Size of the synthesized frame [`initialize_stack`] builds, and the
/// space [`request_function_execution`] demands on the target stack.
pub const FRAME_SIZE: usize = 128;

/// The execution role of the calling host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Not a thread managed by the port (the controller, the timer).
    External,
    /// Backs a kernel thread.
    Task,
    /// The simulated interrupt context.
    Interrupt,
}

thread_local! {
    static ROLE: Cell<Role> = const { Cell::new(Role::External) };
    /// The kernel thread this host thread is backing, as a control block
    /// address. Zero for non-task threads.
    static CURRENT_TCB: Cell<usize> = const { Cell::new(0) };
}

/// Port-private per-thread state embedded in every kernel control block.
pub struct HostThreadState {
    /// The simulated stack pointer handed to and received from
    /// `switch_context`.
    sp: AtomicPtr<u8>,

    /// Slab key of the backing host thread, plus one; zero while the
    /// kernel thread has never been dispatched.
    worker: AtomicUsize,

    /// Pending function-execution requests, drained in the thread's
    /// context right after it resumes.
    pending: SpinMutex<Vec<fn()>>,
}

impl Init for HostThreadState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sp: AtomicPtr::new(std::ptr::null_mut()),
        worker: AtomicUsize::new(0),
        pending: SpinMutex::new(Vec::new()),
    };
}

impl fmt::Debug for HostThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostThreadState")
            .field("sp", &self.sp)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// The simulated interrupt controller and the host-thread registry.
struct SchedState {
    cpu_lock: bool,
    tick_pended: bool,
    dispatch_pended: bool,
    /// The interrupt worker is executing a handler.
    in_interrupt: bool,
    shutdown: bool,
    /// The host thread currently owning the simulated CPU.
    running: Option<usize>,
    workers: Slab<threading::Thread>,
}

fn new_sched_state() -> SpinMutex<SchedState> {
    SpinMutex::new(SchedState {
        cpu_lock: false,
        tick_pended: false,
        dispatch_pended: false,
        in_interrupt: false,
        shutdown: false,
        running: None,
        workers: Slab::new(),
    })
}

/// The internal state of the port; one instance per kernel trait type,
/// created by [`use_port!`].
#[doc(hidden)]
pub struct State {
    sched: Lazy<SpinMutex<SchedState>>,
    interrupt_worker: OnceCell<threading::Thread>,
    done: SpinMutex<Option<mpsc::Sender<()>>>,
    panic: SpinMutex<Option<Box<dyn Any + Send>>>,
}

impl State {
    pub const fn new() -> Self {
        Self {
            sched: Lazy::new(new_sched_state),
            interrupt_worker: OnceCell::new(),
            done: SpinMutex::new(None),
            panic: SpinMutex::new(None),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits<PortThreadState = HostThreadState> + PortToKernel
{
    fn port_state() -> &'static State;
}

// ---------------------------------------------------------------------------
// CPU Lock and the simulated interrupt controller

impl State {
    #[doc(hidden)]
    pub fn enter_cpu_lock(&self) {
        let mut sched = self.sched.lock();
        assert!(!sched.cpu_lock, "CPU Lock already active");
        sched.cpu_lock = true;
    }

    #[doc(hidden)]
    pub fn try_enter_cpu_lock(&self) -> bool {
        let mut sched = self.sched.lock();
        if sched.cpu_lock {
            false
        } else {
            sched.cpu_lock = true;
            true
        }
    }

    #[doc(hidden)]
    pub fn is_cpu_lock_active(&self) -> bool {
        self.sched.lock().cpu_lock
    }

    #[doc(hidden)]
    pub fn request_context_switch(&self) {
        self.sched.lock().dispatch_pended = true;
    }

    /// Release CPU Lock. A task thread additionally takes any interrupt
    /// that was latched while the lock was active: it hands the CPU to the
    /// interrupt worker and parks until it is scheduled again.
    #[doc(hidden)]
    pub fn leave_cpu_lock<Traits: PortInstance>(&'static self) {
        let mut sched = self.sched.lock();
        assert!(sched.cpu_lock, "CPU Lock released while inactive");
        sched.cpu_lock = false;

        let take_pending = ROLE.with(|role| role.get()) == Role::Task
            && (sched.tick_pended || sched.dispatch_pended)
            && !sched.shutdown;
        if take_pending {
            sched.running = None;
            let interrupt_worker = self
                .interrupt_worker
                .get()
                .expect("interrupts pended before run()")
                .clone();
            drop(sched);
            interrupt_worker.unpark();
            threading::park();
        }
    }
}

/// Pend a tick interrupt. Latched while CPU Lock is active or an interrupt
/// handler runs; otherwise the running thread is preempted on the spot.
///
/// Callable from any host thread (the timer thread, a test driver).
pub fn pend_tick<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut sched = state.sched.lock();
    if sched.shutdown {
        return;
    }
    sched.tick_pended = true;
    if sched.cpu_lock || sched.in_interrupt {
        return;
    }

    if let Some(key) = sched.running.take() {
        if let Some(worker) = sched.workers.get(key) {
            // The sched lock is held, so the target cannot be inside a
            // kernel critical section; it parks wherever it happens to be.
            worker.clone().remote_park();
        }
    }
    let interrupt_worker = state
        .interrupt_worker
        .get()
        .expect("tick pended before run()")
        .clone();
    drop(sched);
    interrupt_worker.unpark();
}

/// The interrupt worker: sleeps until an interrupt is pended, runs the
/// handlers, and hands the CPU back to whichever kernel thread is current
/// afterwards.
fn interrupt_worker_body<Traits: PortInstance>() {
    ROLE.with(|role| role.set(Role::Interrupt));
    let state = Traits::port_state();

    loop {
        threading::park();

        loop {
            let mut sched = state.sched.lock();
            if sched.shutdown {
                return;
            }
            if sched.tick_pended {
                sched.tick_pended = false;
                sched.in_interrupt = true;
                drop(sched);

                log::trace!("tick interrupt");
                // Safety: tick interrupt context, CPU Lock inactive
                let switch_needed = unsafe { Traits::tick_interrupt() };

                let mut sched = state.sched.lock();
                sched.in_interrupt = false;
                if switch_needed {
                    sched.dispatch_pended = true;
                }
                continue;
            }
            if sched.dispatch_pended {
                sched.dispatch_pended = false;
                sched.in_interrupt = true;
                drop(sched);

                dispatch::<Traits>();

                state.sched.lock().in_interrupt = false;
                continue;
            }
            break;
        }

        resume_current::<Traits>(state);
    }
}

/// The simulated context-switch handler.
fn dispatch<Traits: PortInstance>() {
    // Safety: standing in for the context-switch interrupt; CPU Lock is
    // held across the kernel call as the contract demands
    unsafe { Traits::enter_cpu_lock() };
    let outgoing = unsafe { Traits::running_thread() };
    let current_sp = if outgoing.is_null() {
        std::ptr::null_mut()
    } else {
        unsafe { &(*outgoing).port_state }.sp.load(Ordering::SeqCst)
    };
    let new_sp = unsafe { Traits::switch_context(current_sp) };
    let incoming = unsafe { Traits::running_thread() };
    assert!(!incoming.is_null(), "switch_context elected no thread");
    log::trace!("context switch {:p} -> {:p}", outgoing, incoming);
    unsafe { &(*incoming).port_state }
        .sp
        .store(new_sp, Ordering::SeqCst);
    unsafe { Traits::leave_cpu_lock() };
}

/// Wake the host thread backing the kernel's current thread, spawning it
/// on first dispatch.
fn resume_current<Traits: PortInstance>(state: &'static State) {
    // Safety: reading `running_thread` requires CPU Lock
    unsafe { Traits::enter_cpu_lock() };
    let current = unsafe { Traits::running_thread() };
    unsafe { Traits::leave_cpu_lock() };
    assert!(
        !current.is_null(),
        "no current thread and no pending dispatch"
    );

    let port = unsafe { &(*current).port_state };
    let mut sched = state.sched.lock();
    let key = port.worker.load(Ordering::SeqCst);
    if key == 0 {
        // First dispatch of this kernel thread: spawn its host thread.
        log::debug!("spawning a host thread for {:p}", current);
        let tcb_address = current as usize;
        let worker = threading::spawn(move || {
            ROLE.with(|role| role.set(Role::Task));
            CURRENT_TCB.with(|cell| cell.set(tcb_address));
            threading::park();
            let result = std::panic::catch_unwind(|| {
                // Safety: called once, on behalf of the frame the port
                // built for this control block
                unsafe {
                    vireo_kernel::thread::thread_entry::<Traits>(
                        tcb_address as *const ThreadControlBlock<Traits>,
                    )
                };
            });
            handle_worker_end::<Traits>(result);
        });
        let key = sched.workers.insert(worker);
        port.worker.store(key + 1, Ordering::SeqCst);
        sched.running = Some(key);
        sched.workers[key].unpark();
    } else {
        let key = key - 1;
        sched.running = Some(key);
        if let Some(worker) = sched.workers.get(key) {
            worker.unpark();
        }
    }
}

/// A panic payload that means "this host thread's kernel thread exited".
struct ExitToken;

fn handle_worker_end<Traits: PortInstance>(result: Result<(), Box<dyn Any + Send>>) {
    match result {
        Ok(()) => {}
        Err(payload) if payload.is::<ExitToken>() => {}
        Err(payload) => {
            // A kernel thread panicked (a failed test assertion, usually).
            // Record the payload and end the simulation so `run` can
            // re-raise it.
            *Traits::port_state().panic.lock() = Some(payload);
            shutdown::<Traits>();
        }
    }
}

// ---------------------------------------------------------------------------
// PortThreading entry points (called through `use_port!`)

/// Build the initial frame of a thread: the control block pointer at the
/// stack pointer, zeros above.
///
/// # Safety
///
/// See [`vireo_kernel::PortThreading::initialize_stack`].
#[doc(hidden)]
pub unsafe fn initialize_stack<Traits: PortInstance>(
    bottom: *mut u8,
    size: usize,
    tcb: *const ThreadControlBlock<Traits>,
) -> Result<*mut u8, NoSpaceError> {
    if size < FRAME_SIZE {
        return Err(NoSpaceError::NoSpace);
    }
    // Safety: the kernel hands us a writable region of at least `size`
    let sp = unsafe { bottom.add(size - FRAME_SIZE) };
    unsafe {
        (sp as *mut usize).write(tcb as usize);
        std::ptr::write_bytes(
            sp.add(std::mem::size_of::<usize>()),
            0,
            FRAME_SIZE - std::mem::size_of::<usize>(),
        );
    }
    Ok(sp)
}

/// Arrange for `func` to run in `target`'s context when it next resumes.
///
/// # Safety
///
/// See [`vireo_kernel::PortThreading::request_function_execution`].
#[doc(hidden)]
pub unsafe fn request_function_execution<Traits: PortInstance>(
    target: *const ThreadControlBlock<Traits>,
    func: fn(),
) -> Result<(), NoSpaceError> {
    let is_self = CURRENT_TCB.with(|cell| cell.get()) == target as usize;
    if is_self && ROLE.with(|role| role.get()) == Role::Task {
        vireo_kernel::fatal_error!(Traits, "function-execution request to self");
    }

    // Safety: the kernel guarantees `target` is a live control block
    let tcb = unsafe { &*target };

    // The synthesized frame must fit on the target stack.
    let sp = tcb.port_state.sp.load(Ordering::SeqCst);
    if !sp.is_null() {
        let frame_sp = (sp as usize).saturating_sub(FRAME_SIZE) as *mut u8;
        if !tcb.stack().check_stack_pointer(frame_sp) {
            return Err(NoSpaceError::NoSpace);
        }
    }

    tcb.port_state.pending.lock().push(func);
    Ok(())
}

/// Run `target`'s pending function-execution requests. Installed as the
/// after-park hook: it runs on a task thread right after it resumes, which
/// is exactly when hardware would execute a synthesized frame.
fn after_park_hook<Traits: PortInstance>() {
    if ROLE.with(|role| role.get()) != Role::Task {
        return;
    }
    let tcb_address = CURRENT_TCB.with(|cell| cell.get());
    if tcb_address == 0 {
        return;
    }
    let tcb = tcb_address as *const ThreadControlBlock<Traits>;
    loop {
        // Serialized against `request_function_execution`, which runs with
        // CPU Lock active.
        // Safety: CPU Lock is inactive right after a park returns
        unsafe { Traits::enter_cpu_lock() };
        let func = {
            // Safety: this host thread backs a live control block
            let pending = &unsafe { &*tcb }.port_state.pending;
            let mut pending = pending.lock();
            if pending.is_empty() {
                None
            } else {
                Some(pending.remove(0))
            }
        };
        unsafe { Traits::leave_cpu_lock() };
        match func {
            Some(func) => func(),
            None => break,
        }
    }
}

/// Discard the calling host thread's kernel context and dispatch the next
/// thread.
///
/// # Safety
///
/// See [`vireo_kernel::PortThreading::exit_and_dispatch`].
#[doc(hidden)]
pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
    tcb: *const ThreadControlBlock<Traits>,
) -> ! {
    log::trace!("exit_and_dispatch({:p})", tcb);
    let state = Traits::port_state();
    // Safety: the kernel passes the calling thread's own control block
    let port = unsafe { &(*tcb).port_state };
    {
        let mut sched = state.sched.lock();
        assert!(sched.cpu_lock);
        // The dying thread's critical section ends here; the next thread
        // is elected by the pended context switch.
        sched.cpu_lock = false;
        sched.dispatch_pended = true;

        let key = port.worker.swap(0, Ordering::SeqCst);
        if key != 0 {
            let key = key - 1;
            if sched.running == Some(key) {
                sched.running = None;
            }
            sched.workers.remove(key);
        }
        state
            .interrupt_worker
            .get()
            .expect("exit before run()")
            .unpark();
    }
    // Unwind to the host-thread wrapper, releasing everything on the way.
    std::panic::panic_any(ExitToken)
}

#[doc(hidden)]
pub fn is_interrupt_context() -> bool {
    ROLE.with(|role| role.get()) == Role::Interrupt
}

#[doc(hidden)]
pub fn is_task_context() -> bool {
    ROLE.with(|role| role.get()) == Role::Task
}

/// The idle thread's nap: back off so an idle simulation doesn't burn a
/// host core.
#[doc(hidden)]
pub fn wait_for_interrupt() {
    std::thread::sleep(Duration::from_micros(50));
}

// ---------------------------------------------------------------------------
// Bootstrap

/// Options of [`run_with`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Period of the simulated tick interrupt; `None` leaves ticking to
    /// manual [`pend_tick`] calls.
    pub tick_period: Option<Duration>,
    /// Size of the region standing in for the main thread's stack.
    pub main_stack_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tick_period: Some(Duration::from_millis(1)),
            main_stack_size: 32 * 1024,
        }
    }
}

/// Boot the kernel and run `entry` as its main thread, with the default
/// options. Returns after [`shutdown`] (`entry` returning counts).
pub fn run<Traits: PortInstance>(entry: fn()) {
    run_with::<Traits>(RunOptions::default(), entry)
}

/// Boot the kernel and run `entry` as its main thread.
///
/// May be called at most once per kernel trait type. Panics raised by
/// kernel threads (failed test assertions) are re-raised here.
pub fn run_with<Traits: PortInstance>(options: RunOptions, entry: fn()) {
    let _ = env_logger::builder().is_test(true).try_init();
    threading::set_after_park_hook(after_park_hook::<Traits>);

    let state = Traits::port_state();
    let (done_send, done_recv) = mpsc::channel();
    *state.done.lock() = Some(done_send);

    let interrupt_worker = threading::spawn(interrupt_worker_body::<Traits>);
    state
        .interrupt_worker
        .set(interrupt_worker)
        .ok()
        .expect("run() called twice for the same kernel");

    // The main worker boots the kernel and becomes its main thread.
    let (booted_send, booted_recv) = mpsc::channel();
    let main_stack_size = options.main_stack_size;
    threading::spawn(move || {
        ROLE.with(|role| role.set(Role::Task));
        let state = Traits::port_state();

        // A dedicated region stands in for the boot stack, so guard
        // checking and stack-pointer verification work on real memory.
        let words = main_stack_size / 8;
        let region: &'static mut [u64] = Box::leak(vec![0u64; words].into_boxed_slice());
        let bottom = region.as_mut_ptr() as *mut u8;
        // Safety: first kernel call, CPU Lock inactive
        unsafe { Traits::boot(bottom, words * 8) };

        // Bind the kernel's main thread to this host thread.
        // Safety: reading `running_thread` requires CPU Lock
        unsafe { Traits::enter_cpu_lock() };
        let main_tcb = unsafe { Traits::running_thread() };
        unsafe { Traits::leave_cpu_lock() };
        assert!(!main_tcb.is_null());
        let port = unsafe { &(*main_tcb).port_state };
        port.sp
            .store(unsafe { bottom.add(words * 8) }, Ordering::SeqCst);
        {
            let mut sched = state.sched.lock();
            let key = sched.workers.insert(threading::register_current());
            port.worker.store(key + 1, Ordering::SeqCst);
            sched.running = Some(key);
        }
        CURRENT_TCB.with(|cell| cell.set(main_tcb as usize));
        booted_send.send(()).ok();

        let result = std::panic::catch_unwind(entry);
        handle_worker_end::<Traits>(result);
        shutdown::<Traits>();
    });
    booted_recv.recv().expect("kernel boot failed");

    if let Some(period) = options.tick_period {
        std::thread::spawn(move || loop {
            std::thread::sleep(period);
            if Traits::port_state().sched.lock().shutdown {
                break;
            }
            pend_tick::<Traits>();
        });
    }

    done_recv
        .recv()
        .expect("the simulation ended without a shutdown");

    if let Some(payload) = state.panic.lock().take() {
        std::panic::resume_unwind(payload);
    }
}

/// End the simulation: [`run`] returns, remaining host threads are
/// abandoned in their parked state.
pub fn shutdown<Traits: PortInstance>() {
    let state = Traits::port_state();
    {
        let mut sched = state.sched.lock();
        if sched.shutdown {
            return;
        }
        log::debug!("shutting the simulation down");
        sched.shutdown = true;
        if let Some(interrupt_worker) = state.interrupt_worker.get() {
            interrupt_worker.unpark();
        }
    }
    if let Some(done) = state.done.lock().take() {
        done.send(()).ok();
    }
}

/// Bind a kernel trait type to this port: implements
/// [`vireo_kernel::PortThreading`] and [`vireo_kernel::KernelTraits`] on
/// it and instantiates the per-kernel state.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::vireo_kernel::{
                error::NoSpaceError, KernelState, KernelTraits, PortThreading,
                ThreadControlBlock,
            };
            use $crate::{HostThreadState, PortInstance, State};

            static PORT_STATE: State = State::new();
            static KERNEL_STATE: KernelState<$SystemTraits> = KernelState::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type PortThreadState = HostThreadState;
                const STACK_ALIGNMENT: usize = 8;
                const STACK_GUARD_SIZE: usize = 64;

                unsafe fn initialize_stack(
                    bottom: *mut u8,
                    size: usize,
                    tcb: *const ThreadControlBlock<Self>,
                ) -> Result<*mut u8, NoSpaceError> {
                    unsafe { $crate::initialize_stack::<Self>(bottom, size, tcb) }
                }

                fn request_context_switch() {
                    PORT_STATE.request_context_switch()
                }

                unsafe fn request_function_execution(
                    target: *const ThreadControlBlock<Self>,
                    func: fn(),
                ) -> Result<(), NoSpaceError> {
                    unsafe { $crate::request_function_execution::<Self>(target, func) }
                }

                fn is_in_interrupt_context() -> bool {
                    $crate::is_interrupt_context()
                }

                fn is_task_context() -> bool {
                    $crate::is_task_context()
                }

                unsafe fn enter_cpu_lock() {
                    PORT_STATE.enter_cpu_lock()
                }

                unsafe fn leave_cpu_lock() {
                    PORT_STATE.leave_cpu_lock::<Self>()
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    PORT_STATE.try_enter_cpu_lock()
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                unsafe fn exit_and_dispatch(tcb: *const ThreadControlBlock<Self>) -> ! {
                    unsafe { $crate::exit_and_dispatch::<Self>(tcb) }
                }

                fn wait_for_interrupt() {
                    $crate::wait_for_interrupt()
                }
            }

            unsafe impl KernelTraits for $SystemTraits {
                fn state() -> &'static KernelState<Self> {
                    &KERNEL_STATE
                }
            }
        }
    };
}
