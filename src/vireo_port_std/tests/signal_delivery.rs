//! Asynchronous signal delivery across threads: the handler for signal 7
//! carries a mask containing signal 8, so a signal 8 generated while the
//! handler runs is held back until the handler returns.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use vireo_kernel::{
    signals::{self, SignalAction, SignalInformation, SignalSet},
    thread::{this_thread, DynamicThread, DynamicThreadParameters, Thread},
    tick, TickDuration,
};
use vireo_port_std::use_port;

use_port!(unsafe struct SystemTraits);

static DELIVERED: StdMutex<Vec<u8>> = StdMutex::new(Vec::new());
static TARGET_READY: AtomicBool = AtomicBool::new(false);

fn spin_ticks(ticks: u64) {
    let start = tick::now::<SystemTraits>();
    while (tick::now::<SystemTraits>() - start).as_ticks() < ticks {
        core::hint::spin_loop();
    }
}

fn handler(information: &SignalInformation) {
    DELIVERED.lock().unwrap().push(information.number());
    if information.number() == 7 {
        // Stall long enough for signal 8 to arrive while this handler is
        // still running; the handler's mask must keep it pending.
        spin_ticks(8);
        let me = this_thread::get::<SystemTraits>();
        assert!(me.pending_signal_set().contains(8));
    }
}

#[test]
fn signal_delivery_masks_handler() {
    vireo_port_std::run::<SystemTraits>(|| {
        let target = DynamicThread::spawn(
            DynamicThreadParameters {
                stack_size: 16 * 1024,
                priority: 50,
                receive_signals: true,
                ..Default::default()
            },
            || {
                signals::set_signal_action::<SystemTraits>(
                    7,
                    SignalAction::new(handler, SignalSet::EMPTY.with(8)),
                )
                .unwrap();
                signals::set_signal_action::<SystemTraits>(
                    8,
                    SignalAction::new(handler, SignalSet::EMPTY),
                )
                .unwrap();
                TARGET_READY.store(true, Ordering::SeqCst);

                // Stay alive, letting deliveries interrupt the sleeps,
                // until both signals have been handled.
                while DELIVERED.lock().unwrap().len() < 2 {
                    let _ = this_thread::sleep_for::<SystemTraits>(TickDuration::from_ticks(1));
                }
            },
        )
        .unwrap();

        while !TARGET_READY.load(Ordering::SeqCst) {
            this_thread::sleep_for::<SystemTraits>(TickDuration::from_ticks(1)).unwrap();
        }

        let thread: &dyn Thread<SystemTraits> = target.thread().unwrap();
        thread.generate_signal(7).unwrap();
        // Let the target enter the handler for 7, then hit it with 8.
        this_thread::sleep_for::<SystemTraits>(TickDuration::from_ticks(3)).unwrap();
        thread.generate_signal(8).unwrap();

        target.join().unwrap();
        assert_eq!(*DELIVERED.lock().unwrap(), [7, 8]);
    });
}
