//! Error taxonomy of the kernel.
//!
//! Every fallible operation returns a dedicated enum listing exactly the
//! error kinds it can produce; all of them funnel into [`ResultCode`].
//! Invariant violations (stack overflow, a detected corruption) do not use
//! this module — they go through [`crate::fatal`].
use core::fmt;

/// All error kinds known to the kernel, with stable numeric codes.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// A parameter was outside the domain of the operation.
    InvalidArgument = -1,
    /// The object is in use and the operation would have to wait.
    Busy = -2,
    /// A timed wait expired before the operation could complete.
    TimedOut = -3,
    /// The operation would deadlock the calling thread.
    Deadlock = -4,
    /// A bounded resource inside the object is exhausted; retrying later
    /// may succeed.
    Again = -5,
    /// A counter is already at its maximum value.
    Overflow = -6,
    /// The calling context is not allowed to perform the operation.
    NotPermitted = -7,
    /// The object was created without the capability the operation needs.
    NotSupported = -8,
    /// A stack region is too small for the frame that must be built on it.
    NoSpace = -9,
    /// A blocking operation was cut short by a signal delivery request.
    Interrupted = -10,
}

/// Define an error enum whose variants are a subset of [`ResultCode`]'s,
/// deriving the conversions into `ResultCode` and into each enum named in
/// an `#[into(...)]` attribute.
macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        #[into( $( $Into:ident ),* )]
        pub enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        define_error! {
            $( #[doc $( $doc )*] )*
            pub enum $Name {
                $( $Variant, )*
            }
        }

        define_error_into! { $Name [ $( $Variant ),* ] ; $( $Into ),* }
    };
    (
        $( #[doc $( $doc:tt )*] )*
        pub enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        pub enum $Name {
            $( $Variant = ResultCode::$Variant as i8 ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }
    };
}

/// Helper for [`define_error!`]: emits `impl From<$Name> for $Into` for each
/// `$Into` in the list, munching the list one identifier at a time so that
/// the (unrelated) `$Variant` repetition can be matched fresh on each
/// recursive call.
macro_rules! define_error_into {
    ( $Name:ident [ $( $Variant:ident ),* ] ; ) => {};
    ( $Name:ident [ $( $Variant:ident ),* ] ; $Into:ident $( , $Rest:ident )* ) => {
        impl From<$Name> for $Into {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error_into! { $Name [ $( $Variant ),* ] ; $( $Rest ),* }
    };
}

define_error! {
    /// Returned by [`PortThreading::initialize_stack`] and
    /// [`PortThreading::request_function_execution`] when the target stack
    /// cannot hold the frame.
    ///
    /// [`PortThreading::initialize_stack`]: crate::PortThreading::initialize_stack
    /// [`PortThreading::request_function_execution`]: crate::PortThreading::request_function_execution
    #[into(StartError, GenerateSignalError, QueueSignalError)]
    pub enum NoSpaceError {
        NoSpace,
    }
}

define_error! {
    /// A blocking operation was attempted outside of a waitable (thread)
    /// context.
    #[into(
        StartError,
        JoinError,
        DetachError,
        SleepError,
        LockError,
        TryLockError,
        LockTimeoutError,
        UnlockError,
        WaitError,
        WaitTimeoutError,
        SignalWaitError,
        SignalTryWaitError,
        SignalWaitTimeoutError
    )]
    pub enum ContextError {
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of [`Thread::start`](crate::thread::Thread).
    pub enum StartError {
        InvalidArgument,
        NoSpace,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of `join`.
    pub enum JoinError {
        InvalidArgument,
        Deadlock,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of [`DynamicThread::detach`](crate::thread::DynamicThread::detach).
    pub enum DetachError {
        InvalidArgument,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of `sleep_for` / `sleep_until`.
    pub enum SleepError {
        Interrupted,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of [`Mutex::lock`](crate::mutex::Mutex::lock).
    pub enum LockError {
        InvalidArgument,
        Deadlock,
        Again,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of [`Mutex::try_lock`](crate::mutex::Mutex::try_lock).
    pub enum TryLockError {
        InvalidArgument,
        Busy,
        Deadlock,
        Again,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of the timed mutex lock operations.
    pub enum LockTimeoutError {
        InvalidArgument,
        TimedOut,
        Deadlock,
        Again,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of [`Mutex::unlock`](crate::mutex::Mutex::unlock).
    pub enum UnlockError {
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of [`Semaphore::post`](crate::semaphore::Semaphore::post).
    pub enum PostError {
        Overflow,
    }
}

define_error! {
    /// Error kinds of [`Semaphore::wait`](crate::semaphore::Semaphore::wait).
    pub enum WaitError {
        Interrupted,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of [`Semaphore::try_wait`](crate::semaphore::Semaphore::try_wait).
    pub enum TryWaitError {
        Busy,
    }
}

define_error! {
    /// Error kinds of the timed semaphore wait operations.
    pub enum WaitTimeoutError {
        TimedOut,
        Interrupted,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of `generate_signal`.
    pub enum GenerateSignalError {
        InvalidArgument,
        NotSupported,
        NoSpace,
    }
}

define_error! {
    /// Error kinds of `queue_signal`.
    pub enum QueueSignalError {
        InvalidArgument,
        NotSupported,
        Again,
        NoSpace,
    }
}

define_error! {
    /// Error kinds of signal association management.
    pub enum AssociationError {
        InvalidArgument,
        NotSupported,
        Again,
    }
}

define_error! {
    /// Error kinds of `set_signal_mask`.
    pub enum SetMaskError {
        NotSupported,
    }
}

define_error! {
    /// Error kinds of the blocking signal wait.
    pub enum SignalWaitError {
        InvalidArgument,
        NotSupported,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of the non-blocking signal wait.
    pub enum SignalTryWaitError {
        InvalidArgument,
        Again,
        NotSupported,
        NotPermitted,
    }
}

define_error! {
    /// Error kinds of the timed signal wait.
    pub enum SignalWaitTimeoutError {
        InvalidArgument,
        TimedOut,
        NotSupported,
        NotPermitted,
    }
}
