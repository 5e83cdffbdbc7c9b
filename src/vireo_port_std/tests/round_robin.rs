//! Round-robin threads share their priority level in time slices; a FIFO
//! thread at the same priority runs uninterrupted by its peers until it
//! yields.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use vireo_kernel::{
    thread::{this_thread, DynamicThread, DynamicThreadParameters},
    SchedulingPolicy, TickDuration,
};
use vireo_port_std::use_port;

use_port!(unsafe struct SystemTraits);

static COUNTS: [AtomicU64; 3] = [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)];
static FIFO_SAW_PEERS_RUN: AtomicBool = AtomicBool::new(false);
static STOP: AtomicBool = AtomicBool::new(false);

fn parameters(policy: SchedulingPolicy) -> DynamicThreadParameters<SystemTraits> {
    DynamicThreadParameters {
        stack_size: 16 * 1024,
        priority: 3,
        scheduling_policy: policy,
        ..Default::default()
    }
}

fn spin_counting(index: usize) {
    while !STOP.load(Ordering::SeqCst) {
        COUNTS[index].fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn round_robin_against_fifo() {
    vireo_port_std::run::<SystemTraits>(|| {
        // The FIFO thread starts first: it runs undisturbed by its
        // equal-priority peers until it yields voluntarily.
        let fifo = DynamicThread::spawn(parameters(SchedulingPolicy::Fifo), || {
            let others_before = COUNTS[1].load(Ordering::SeqCst) + COUNTS[2].load(Ordering::SeqCst);
            for _ in 0..200_000 {
                COUNTS[0].fetch_add(1, Ordering::SeqCst);
            }
            let others_after = COUNTS[1].load(Ordering::SeqCst) + COUNTS[2].load(Ordering::SeqCst);
            assert_eq!(others_before, others_after, "a peer ran before the yield");

            this_thread::yield_now::<SystemTraits>();
            FIFO_SAW_PEERS_RUN.store(true, Ordering::SeqCst);
            spin_counting(0);
        })
        .unwrap();
        let rr_a = DynamicThread::spawn(parameters(SchedulingPolicy::RoundRobin), || {
            spin_counting(1)
        })
        .unwrap();
        let rr_b = DynamicThread::spawn(parameters(SchedulingPolicy::RoundRobin), || {
            spin_counting(2)
        })
        .unwrap();

        // Let the trio run for a while.
        this_thread::sleep_for::<SystemTraits>(TickDuration::from_ticks(150)).unwrap();
        STOP.store(true, Ordering::SeqCst);

        fifo.join().unwrap();
        rr_a.join().unwrap();
        rr_b.join().unwrap();

        // After the yield, the slice rotation must have given every thread
        // processor time.
        assert!(FIFO_SAW_PEERS_RUN.load(Ordering::SeqCst));
        assert!(COUNTS[1].load(Ordering::SeqCst) > 0);
        assert!(COUNTS[2].load(Ordering::SeqCst) > 0);
    });
}
