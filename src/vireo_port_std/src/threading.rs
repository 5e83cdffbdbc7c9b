//! Threading primitives similar to `std::thread`, extended with the
//! *remote park* operation: stopping another thread at an arbitrary
//! instruction boundary. Remote park is what lets a simulated interrupt
//! preempt a busy-looping kernel thread.
//!
//! A park token queue is kept in a socketpair: `unpark` writes a token,
//! `park` blocks reading one. Remote park raises `SIGUSR1` on the target,
//! whose handler consumes park requests by parking inside the handler —
//! exactly where a hardware interrupt would have suspended the thread.
use std::{
    cell::Cell,
    mem::MaybeUninit,
    os::raw::c_int,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Once,
    },
    thread,
};

/// Hook invoked on a thread right after it returns from any park,
/// including a remote park taken inside the signal handler. The port uses
/// it to run pending function-execution requests in the resumed thread's
/// context, the software analogue of a synthesized stack frame.
static AFTER_PARK_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Install the after-park hook. May only be called once per process (all
/// kernels in a process share the signal handler).
pub fn set_after_park_hook(hook: fn()) {
    let previous = AFTER_PARK_HOOK.swap(hook as usize, Ordering::SeqCst);
    assert!(
        previous == 0 || previous == hook as usize,
        "conflicting after-park hooks"
    );
}

fn run_after_park_hook() {
    let hook = AFTER_PARK_HOOK.load(Ordering::SeqCst);
    if hook != 0 {
        // Safety: the value was stored from a `fn()` in `set_after_park_hook`
        let hook: fn() = unsafe { std::mem::transmute(hook) };
        hook();
    }
}

struct ThreadData {
    /// `[0]` is the token source (read by `park`), `[1]` the sink
    /// (written by `unpark`).
    park_sock: [c_int; 2],

    /// Outstanding remote park requests, consumed by the signal handler.
    park_count: AtomicUsize,

    /// The target for `pthread_kill`, assigned by the thread itself before
    /// it becomes visible to parkers.
    pthread_id: AtomicUsize,
}

impl ThreadData {
    fn new() -> Self {
        let park_sock = unsafe {
            let mut park_sock = MaybeUninit::<[c_int; 2]>::uninit();
            let ret = libc::socketpair(
                libc::PF_LOCAL,
                libc::SOCK_STREAM,
                0,
                park_sock.as_mut_ptr() as *mut c_int,
            );
            assert!(ret >= 0, "socketpair failed: {}", errno::errno());
            park_sock.assume_init()
        };
        Self {
            park_sock,
            park_count: AtomicUsize::new(0),
            pthread_id: AtomicUsize::new(0),
        }
    }

    fn set_self(&self) {
        self.pthread_id
            .store(unsafe { libc::pthread_self() } as usize, Ordering::SeqCst);
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.park_sock[0]);
            libc::close(self.park_sock[1]);
        }
    }
}

thread_local! {
    /// Keeps the current thread's `ThreadData` alive and reachable from
    /// the signal handler. Assigned once, eagerly, at thread start.
    static CURRENT_DATA: Cell<*const ThreadData> = const { Cell::new(std::ptr::null()) };
}

/// A handle to a worker thread, supporting `unpark` and remote `park`.
#[derive(Clone)]
pub struct Thread {
    data: Arc<ThreadData>,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("pthread_id", &self.data.pthread_id)
            .finish()
    }
}

/// Spawn a worker thread. Returns once the thread has registered itself,
/// so remote park is immediately usable. The new thread starts running
/// right away; callers that want it dormant make `f` park first.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> Thread {
    let data = Arc::new(ThreadData::new());
    let data2 = Arc::clone(&data);
    let (ready_send, ready_recv) = mpsc::channel();

    thread::spawn(move || {
        data2.set_self();
        CURRENT_DATA.with(|cell| cell.set(Arc::as_ptr(&data2)));
        ready_send.send(()).ok();

        f();

        CURRENT_DATA.with(|cell| cell.set(std::ptr::null()));
        // `data2` dropped here keeps the FDs alive for the whole run.
    });

    ready_recv.recv().expect("worker thread died during startup");
    Thread { data }
}

/// Register the calling (non-`spawn`ed) thread so it can be parked and
/// unparked. Used for the controller.
pub fn register_current() -> Thread {
    let existing = CURRENT_DATA.with(|cell| cell.get());
    if !existing.is_null() {
        // Safety: the pointer was minted from a live Arc for this thread
        let data = unsafe {
            Arc::increment_strong_count(existing);
            Arc::from_raw(existing)
        };
        return Thread { data };
    }
    let data = Arc::new(ThreadData::new());
    data.set_self();
    CURRENT_DATA.with(|cell| cell.set(Arc::into_raw(Arc::clone(&data))));
    Thread { data }
}

/// Block the calling thread until a park token is available.
pub fn park() {
    let data = CURRENT_DATA.with(|cell| cell.get());
    assert!(!data.is_null(), "park on an unregistered thread");
    // Safety: `CURRENT_DATA` points to this thread's live `ThreadData`
    park_inner(unsafe { &*data });
    run_after_park_hook();
}

fn park_inner(data: &ThreadData) {
    loop {
        let mut token = 0u8;
        let ret = unsafe {
            libc::recv(
                data.park_sock[0],
                (&mut token) as *mut u8 as *mut libc::c_void,
                1,
                0,
            )
        };
        match ret {
            1 => break,
            // Interrupted (a nested remote park was taken inside the
            // handler) or spurious: try again.
            _ if ret < 0 && errno::errno() == errno::Errno(libc::EINTR) => continue,
            0 => continue,
            _ => panic!("failed to take a park token: {}", errno::errno()),
        }
    }
}

impl Thread {
    /// Make a park token available. Unlike `std::thread::Thread::unpark`,
    /// tokens accumulate; each `park` consumes one.
    pub fn unpark(&self) {
        loop {
            let ret = unsafe {
                libc::send(
                    self.data.park_sock[1],
                    &0u8 as *const u8 as *const libc::c_void,
                    1,
                    0,
                )
            };
            if ret == 1 {
                break;
            }
            // The sender itself can be hit by a remote park mid-call.
            if ret < 0 && errno::errno() == errno::Errno(libc::EINTR) {
                continue;
            }
            panic!("failed to post a park token: {}", errno::errno());
        }
    }

    /// Force the target thread to park, as if it had called [`park`]
    /// itself at its current instruction. Returns once the park has taken
    /// effect.
    ///
    /// The caller must hold whatever lock protects the target from
    /// entering a critical section, or the park may land inside one.
    pub fn remote_park(&self) {
        static HANDLER_ONCE: Once = Once::new();
        HANDLER_ONCE.call_once(register_remote_park_handler);

        let pthread_id = self.data.pthread_id.load(Ordering::SeqCst);
        assert!(pthread_id != 0, "remote park of an unregistered thread");

        self.data.park_count.fetch_add(1, Ordering::SeqCst);
        let ret = unsafe { libc::pthread_kill(pthread_id as libc::pthread_t, SIGNAL_REMOTE_PARK) };
        assert_eq!(ret, 0, "pthread_kill failed");

        // The park has taken effect once the handler has consumed the
        // request.
        while self.data.park_count.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
    }
}

const SIGNAL_REMOTE_PARK: c_int = libc::SIGUSR1;

#[cold]
fn register_remote_park_handler() {
    extern "C" fn remote_park_handler(
        _signo: c_int,
        _info: *mut libc::siginfo_t,
        _context: *mut libc::c_void,
    ) {
        let data = CURRENT_DATA.with(|cell| cell.get());
        assert!(!data.is_null());
        // Safety: the signal targets a registered worker thread
        let data = unsafe { &*data };

        while data.park_count.load(Ordering::SeqCst) != 0 {
            data.park_count.fetch_sub(1, Ordering::SeqCst);
            // Park right here, inside the handler: the thread resumes at
            // the interrupted instruction once it is scheduled again, the
            // same way an interrupt return would resume it.
            park_inner(data);
            run_after_park_hook();
        }
    }

    let ret = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = remote_park_handler as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigaction(SIGNAL_REMOTE_PARK, &action, std::ptr::null_mut())
    };
    assert_eq!(ret, 0, "sigaction failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn unpark_tokens_accumulate() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let thread = spawn(move || {
            park();
            park();
            ran2.store(true, Ordering::SeqCst);
        });
        thread.unpark();
        thread.unpark();
        std::thread::sleep(Duration::from_millis(200));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn remote_park_stops_a_spinning_thread() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let thread = spawn(|| loop {
            COUNTER.fetch_add(1, Ordering::SeqCst);
        });

        // Let it spin, stop it, and check that the counter freezes.
        std::thread::sleep(Duration::from_millis(50));
        thread.remote_park();
        let frozen = COUNTER.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(COUNTER.load(Ordering::SeqCst), frozen);

        // And that it thaws on unpark.
        thread.unpark();
        std::thread::sleep(Duration::from_millis(100));
        assert!(COUNTER.load(Ordering::SeqCst) > frozen);
    }
}
