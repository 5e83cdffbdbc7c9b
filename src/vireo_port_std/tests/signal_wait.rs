//! Blocking signal waits: completion by a generated signal, payload
//! delivery through queued signals, and timeout.
use vireo_kernel::{
    error::SignalWaitTimeoutError,
    signals::{self, SignalCode, SignalSet},
    thread::{this_thread, DynamicThread, DynamicThreadParameters, Thread},
    TickDuration,
};
use vireo_port_std::use_port;

use_port!(unsafe struct SystemTraits);

fn sleep_ticks(ticks: u64) {
    this_thread::sleep_for::<SystemTraits>(TickDuration::from_ticks(ticks)).unwrap();
}

#[test]
fn signal_wait() {
    vireo_port_std::run::<SystemTraits>(|| {
        let waiter = DynamicThread::spawn(
            DynamicThreadParameters {
                stack_size: 16 * 1024,
                priority: 50,
                receive_signals: true,
                ..Default::default()
            },
            || {
                // Waited-for signals stay masked so the asynchronous
                // delivery path cannot accept them first.
                signals::set_signal_mask::<SystemTraits>(
                    SignalSet::EMPTY.with(3).with(4),
                )
                .unwrap();

                // Nothing pending yet: the timed wait expires.
                assert_eq!(
                    signals::wait_for::<SystemTraits>(
                        SignalSet::EMPTY.with(3),
                        TickDuration::from_ticks(5),
                    ),
                    Err(SignalWaitTimeoutError::TimedOut)
                );

                // The generated signal completes the untimed wait.
                let information = signals::wait::<SystemTraits>(SignalSet::EMPTY.with(3)).unwrap();
                assert_eq!(information.number(), 3);
                assert_eq!(information.code(), SignalCode::Generated);

                // And the queued one carries its payload.
                let information =
                    signals::wait::<SystemTraits>(SignalSet::EMPTY.with(4)).unwrap();
                assert_eq!(information.number(), 4);
                assert_eq!(information.code(), SignalCode::Queued);
                assert_eq!(information.value(), 0xbeef);
            },
        )
        .unwrap();

        sleep_ticks(10);
        let thread: &dyn Thread<SystemTraits> = waiter.thread().unwrap();
        thread.generate_signal(3).unwrap();
        sleep_ticks(5);
        thread.queue_signal(4, 0xbeef).unwrap();

        waiter.join().unwrap();
    });
}
