//! A loopback port for unit tests: CPU Lock is a flag, a requested context
//! switch is recorded but never taken, and no thread other than the
//! adopted test thread ever actually runs. Suitable for exercising every
//! non-blocking kernel path.
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct PortFlags {
    pub cpu_lock: AtomicBool,
    pub switch_requested: AtomicBool,
    pub in_interrupt: AtomicBool,
}

impl PortFlags {
    pub const fn new() -> Self {
        Self {
            cpu_lock: AtomicBool::new(false),
            switch_requested: AtomicBool::new(false),
            in_interrupt: AtomicBool::new(false),
        }
    }
}

/// Define a fresh kernel trait type backed by the loopback port. Each test
/// should use its own type so that kernel states don't interfere.
macro_rules! define_test_traits {
    ($vis:vis struct $Name:ident) => {
        $vis struct $Name;

        impl $Name {
            pub(crate) fn port_flags() -> &'static $crate::test_utils::PortFlags {
                static FLAGS: $crate::test_utils::PortFlags =
                    $crate::test_utils::PortFlags::new();
                &FLAGS
            }
        }

        unsafe impl $crate::PortThreading for $Name {
            type PortThreadState = ();
            const STACK_ALIGNMENT: usize = 8;
            const STACK_GUARD_SIZE: usize = 32;

            unsafe fn initialize_stack(
                bottom: *mut u8,
                size: usize,
                _tcb: *const $crate::tcb::ThreadControlBlock<Self>,
            ) -> Result<*mut u8, $crate::error::NoSpaceError> {
                const FRAME: usize = 64;
                if size < FRAME {
                    return Err($crate::error::NoSpaceError::NoSpace);
                }
                // A recognizable dummy frame below the top of the stack.
                let sp = unsafe { bottom.add(size - FRAME) };
                unsafe { core::ptr::write_bytes(sp, 0, FRAME) };
                Ok(sp)
            }

            fn request_context_switch() {
                Self::port_flags()
                    .switch_requested
                    .store(true, core::sync::atomic::Ordering::SeqCst);
            }

            unsafe fn request_function_execution(
                _target: *const $crate::tcb::ThreadControlBlock<Self>,
                _func: fn(),
            ) -> Result<(), $crate::error::NoSpaceError> {
                Ok(())
            }

            fn is_in_interrupt_context() -> bool {
                Self::port_flags()
                    .in_interrupt
                    .load(core::sync::atomic::Ordering::SeqCst)
            }

            fn is_task_context() -> bool {
                !Self::is_in_interrupt_context()
            }

            unsafe fn enter_cpu_lock() {
                let was = Self::port_flags()
                    .cpu_lock
                    .swap(true, core::sync::atomic::Ordering::SeqCst);
                assert!(!was, "nested CPU Lock");
            }

            unsafe fn leave_cpu_lock() {
                let was = Self::port_flags()
                    .cpu_lock
                    .swap(false, core::sync::atomic::Ordering::SeqCst);
                assert!(was, "CPU Lock released while inactive");
            }

            unsafe fn try_enter_cpu_lock() -> bool {
                Self::port_flags()
                    .cpu_lock
                    .compare_exchange(
                        false,
                        true,
                        core::sync::atomic::Ordering::SeqCst,
                        core::sync::atomic::Ordering::SeqCst,
                    )
                    .is_ok()
            }

            fn is_cpu_lock_active() -> bool {
                Self::port_flags()
                    .cpu_lock
                    .load(core::sync::atomic::Ordering::SeqCst)
            }

            unsafe fn exit_and_dispatch(
                _tcb: *const $crate::tcb::ThreadControlBlock<Self>,
            ) -> ! {
                unreachable!("no thread exits under the loopback port")
            }
        }

        unsafe impl $crate::KernelTraits for $Name {
            fn state() -> &'static $crate::KernelState<Self> {
                static STATE: $crate::KernelState<$Name> = $crate::KernelState::new();
                &STATE
            }
        }
    };
}
pub(crate) use define_test_traits;

/// Boot the kernel on the calling (test) thread, with a leaked buffer
/// standing in for the boot stack. Returns the buffer for tests that need
/// to poke at the main thread's stack.
pub(crate) fn boot_kernel<Traits: crate::KernelTraits>() -> *mut u8 {
    let storage: &'static mut [u64] = Box::leak(vec![0u64; 512].into_boxed_slice());
    let bottom = storage.as_mut_ptr() as *mut u8;
    // Safety: the leaked buffer satisfies the alignment and lifetime
    // requirements of a stand-in boot stack
    unsafe { crate::sched::boot::<Traits>(bottom, 512 * 8) };
    bottom
}

/// Whether a context switch was requested since the last call.
pub(crate) fn take_switch_request(flags: &PortFlags) -> bool {
    flags.switch_requested.swap(false, Ordering::SeqCst)
}
