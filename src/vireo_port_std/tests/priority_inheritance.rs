//! Priority inheritance: while a high-priority thread is blocked on a
//! mutex held by a low-priority thread, the holder inherits the waiter's
//! effective priority and outruns a middle-priority busy thread.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use vireo_kernel::{
    mutex::{Mutex, MutexProtocol, MutexType},
    thread::{this_thread, DynamicThread, DynamicThreadParameters},
    tick, TickDuration,
};
use vireo_port_std::use_port;

use_port!(unsafe struct SystemTraits);

static MUTEX: Mutex<SystemTraits> = Mutex::new(MutexType::Normal, MutexProtocol::PriorityInheritance);

static LOW_HOLDS: AtomicBool = AtomicBool::new(false);
static HIGH_ACQUIRED: AtomicBool = AtomicBool::new(false);
static MIDDLE_COUNT: AtomicU64 = AtomicU64::new(0);
static STOP: AtomicBool = AtomicBool::new(false);

fn parameters(priority: u8) -> DynamicThreadParameters<SystemTraits> {
    DynamicThreadParameters {
        stack_size: 16 * 1024,
        priority,
        ..Default::default()
    }
}

fn sleep_ticks(ticks: u64) {
    this_thread::sleep_for::<SystemTraits>(TickDuration::from_ticks(ticks)).unwrap();
}

#[test]
fn priority_inheritance() {
    vireo_port_std::run::<SystemTraits>(|| {
        let low = DynamicThread::spawn(parameters(1), || {
            MUTEX.lock().unwrap();
            LOW_HOLDS.store(true, Ordering::SeqCst);

            // Starved by the middle thread until the high one blocks on
            // the mutex and donates its priority.
            while this_thread::effective_priority::<SystemTraits>() < 3 {
                core::hint::spin_loop();
            }
            assert_eq!(this_thread::priority::<SystemTraits>(), 1);
            assert_eq!(this_thread::effective_priority::<SystemTraits>(), 3);

            // Boosted above the middle thread: it must not run while the
            // lock is still held.
            let middle_before = MIDDLE_COUNT.load(Ordering::SeqCst);
            let start = tick::now::<SystemTraits>();
            while (tick::now::<SystemTraits>() - start).as_ticks() < 10 {
                core::hint::spin_loop();
            }
            assert_eq!(MIDDLE_COUNT.load(Ordering::SeqCst), middle_before);

            MUTEX.unlock().unwrap();
            // The boost is gone with the lock.
            assert_eq!(this_thread::effective_priority::<SystemTraits>(), 1);
        })
        .unwrap();

        // Wait for the lock to be taken before raising contention.
        while !LOW_HOLDS.load(Ordering::SeqCst) {
            sleep_ticks(1);
        }

        let middle = DynamicThread::spawn(parameters(2), || {
            while !STOP.load(Ordering::SeqCst) {
                MIDDLE_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        let high = DynamicThread::spawn(parameters(3), || {
            MUTEX.lock().unwrap();
            HIGH_ACQUIRED.store(true, Ordering::SeqCst);
            MUTEX.unlock().unwrap();
        })
        .unwrap();

        high.join().unwrap();
        assert!(HIGH_ACQUIRED.load(Ordering::SeqCst));

        STOP.store(true, Ordering::SeqCst);
        middle.join().unwrap();
        low.join().unwrap();
    });
}
