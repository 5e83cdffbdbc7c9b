//! Thread lifecycle: join, detach with self-reclamation, identifier
//! staleness, and the self-join deadlock.
use std::sync::atomic::{AtomicBool, Ordering};

use vireo_kernel::{
    error::JoinError,
    thread::{this_thread, DynamicThread, DynamicThreadParameters, Thread},
    ThreadState, TickDuration,
};
use vireo_port_std::use_port;

use_port!(unsafe struct SystemTraits);

static DETACHED_RAN: AtomicBool = AtomicBool::new(false);

fn parameters() -> DynamicThreadParameters<SystemTraits> {
    DynamicThreadParameters {
        stack_size: 16 * 1024,
        priority: 50,
        ..Default::default()
    }
}

fn sleep_ticks(ticks: u64) {
    this_thread::sleep_for::<SystemTraits>(TickDuration::from_ticks(ticks)).unwrap();
}

#[test]
fn join_and_detach() {
    vireo_port_std::run::<SystemTraits>(|| {
        // Joining observes termination; the identifier goes stale once the
        // thread object is torn down.
        let thread = DynamicThread::spawn(parameters(), || sleep_ticks(5)).unwrap();
        let identifier = thread.identifier();
        assert!(identifier.thread().is_some());
        thread.join().unwrap();
        assert_eq!(thread.state(), ThreadState::Terminated);
        drop(thread);
        assert!(identifier.thread().is_none());

        // A detached thread runs to completion and reclaims itself; the
        // handle stops referring to it.
        let mut detached = DynamicThread::spawn(parameters(), || {
            sleep_ticks(10);
            DETACHED_RAN.store(true, Ordering::SeqCst);
        })
        .unwrap();
        detached.detach().unwrap();
        assert_eq!(detached.state(), ThreadState::Detached);
        assert_eq!(detached.join(), Err(JoinError::InvalidArgument));

        // Give it time to exit and the idle thread time to reclaim it.
        sleep_ticks(40);
        assert!(DETACHED_RAN.load(Ordering::SeqCst));

        // Joining yourself cannot work.
        assert_eq!(
            this_thread::get::<SystemTraits>().join(),
            Err(JoinError::Deadlock)
        );
    });
}
