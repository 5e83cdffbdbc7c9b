//! A higher-priority thread waking from a sleep preempts a busy
//! lower-priority thread immediately and starves it while it runs.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use vireo_kernel::{
    thread::{DynamicThread, DynamicThreadParameters},
    tick, TickDuration,
};
use vireo_port_std::use_port;

use_port!(unsafe struct SystemTraits);

static LOW_COUNT: AtomicU64 = AtomicU64::new(0);
static HIGH_RAN: AtomicBool = AtomicBool::new(false);
static STOP: AtomicBool = AtomicBool::new(false);

fn parameters(priority: u8) -> DynamicThreadParameters<SystemTraits> {
    DynamicThreadParameters {
        stack_size: 16 * 1024,
        priority,
        ..Default::default()
    }
}

fn spin_ticks(ticks: u64) {
    let start = tick::now::<SystemTraits>();
    while (tick::now::<SystemTraits>() - start).as_ticks() < ticks {
        core::hint::spin_loop();
    }
}

#[test]
fn priority_preemption() {
    vireo_port_std::run::<SystemTraits>(|| {
        let low = DynamicThread::spawn(parameters(5), || {
            while !STOP.load(Ordering::SeqCst) {
                LOW_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        let high = DynamicThread::spawn(parameters(6), || {
            vireo_kernel::thread::this_thread::sleep_for::<SystemTraits>(
                TickDuration::from_ticks(50),
            )
            .unwrap();
            HIGH_RAN.store(true, Ordering::SeqCst);

            // While this thread runs, the lower-priority spinner must be
            // starved.
            let before = LOW_COUNT.load(Ordering::SeqCst);
            spin_ticks(20);
            assert_eq!(LOW_COUNT.load(Ordering::SeqCst), before);
        })
        .unwrap();

        high.join().unwrap();
        assert!(HIGH_RAN.load(Ordering::SeqCst));

        STOP.store(true, Ordering::SeqCst);
        low.join().unwrap();
        assert!(LOW_COUNT.load(Ordering::SeqCst) > 0);
    });
}
