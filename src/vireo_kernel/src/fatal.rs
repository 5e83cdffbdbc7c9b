//! The fatal-error path.
//!
//! Detected invariant violations — stack overflow, a corrupted kernel
//! structure, a self-targeted function-execution request — cannot be
//! reported through the `Result` channel, because the kernel can no longer
//! trust its own state. They funnel into [`fatal_error`], which runs the
//! optional application hook and then halts with interrupts masked.
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::PortThreading;

/// Location and cause of a fatal error.
///
/// With the `lightweight-fatal-error` feature enabled, all strings are
/// empty and the line number is zero.
#[derive(Debug, Clone, Copy)]
pub struct FatalErrorInfo {
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
    pub message: &'static str,
}

/// Hook called on the way into the halt. May inspect the error, flush
/// diagnostics, or reset the system; if it returns, the kernel halts.
pub type FatalErrorHook = fn(&FatalErrorInfo);

static HOOK: AtomicUsize = AtomicUsize::new(0);

/// Install the fatal-error hook. The hook may be invoked from any context,
/// with interrupts masked.
pub fn set_fatal_error_hook(hook: FatalErrorHook) {
    HOOK.store(hook as usize, Ordering::Release);
}

/// Handle a fatal error: mask interrupts, run the hook, halt.
pub fn fatal_error<Traits: PortThreading>(info: FatalErrorInfo) -> ! {
    // Safety: masking interrupts is always allowed on the way into a halt;
    // `try_enter_cpu_lock` tolerates an already-active CPU Lock
    unsafe {
        Traits::try_enter_cpu_lock();
    }

    log::error!(
        "fatal error: {} [{}:{} in {}]",
        info.message,
        info.file,
        info.line,
        info.function
    );

    let hook = HOOK.load(Ordering::Acquire);
    if hook != 0 {
        // Safety: the value was stored from a `FatalErrorHook` in
        // `set_fatal_error_hook`
        let hook: FatalErrorHook = unsafe { core::mem::transmute(hook) };
        hook(&info);
    }

    loop {
        core::hint::spin_loop();
    }
}

/// Raise a fatal error, capturing the call site.
#[cfg(not(feature = "lightweight-fatal-error"))]
#[macro_export]
macro_rules! fatal_error {
    ($Traits:ty, $message:expr) => {
        $crate::fatal::fatal_error::<$Traits>($crate::fatal::FatalErrorInfo {
            file: file!(),
            line: line!(),
            function: module_path!(),
            message: $message,
        })
    };
}

/// Raise a fatal error. The lightweight build drops the strings.
#[cfg(feature = "lightweight-fatal-error")]
#[macro_export]
macro_rules! fatal_error {
    ($Traits:ty, $message:expr) => {
        $crate::fatal::fatal_error::<$Traits>($crate::fatal::FatalErrorInfo {
            file: "",
            line: 0,
            function: "",
            message: "",
        })
    };
}
