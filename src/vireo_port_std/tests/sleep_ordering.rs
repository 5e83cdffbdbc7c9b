//! Sleepers wake in deadline order regardless of the order they went to
//! sleep in.
use std::sync::Mutex as StdMutex;

use vireo_kernel::{
    thread::{this_thread, DynamicThread, DynamicThreadParameters},
    tick, TickDuration,
};
use vireo_port_std::use_port;

use_port!(unsafe struct SystemTraits);

static WAKE_ORDER: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

#[test]
fn sleep_ordering() {
    vireo_port_std::run::<SystemTraits>(|| {
        let base = tick::now::<SystemTraits>() + TickDuration::from_ticks(10);
        let offsets = [100u64, 50, 200, 75, 150];

        let threads: Vec<DynamicThread<SystemTraits>> = offsets
            .iter()
            .enumerate()
            .map(|(index, &offset)| {
                DynamicThread::spawn(
                    DynamicThreadParameters {
                        stack_size: 16 * 1024,
                        priority: 50,
                        ..Default::default()
                    },
                    move || {
                        this_thread::sleep_until::<SystemTraits>(
                            base + TickDuration::from_ticks(offset),
                        )
                        .unwrap();
                        WAKE_ORDER.lock().unwrap().push(index);
                    },
                )
                .unwrap()
            })
            .collect();

        for thread in &threads {
            thread.join().unwrap();
        }
        assert_eq!(*WAKE_ORDER.lock().unwrap(), [1, 3, 0, 4, 2]);
    });
}
