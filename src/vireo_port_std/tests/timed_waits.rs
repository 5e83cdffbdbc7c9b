//! Timed waits: expiry, completion ahead of the deadline, and immediate
//! return for deadlines already in the past.
use vireo_kernel::{
    error::{LockTimeoutError, WaitTimeoutError},
    mutex::{Mutex, MutexProtocol, MutexType},
    semaphore::Semaphore,
    thread::{this_thread, DynamicThread, DynamicThreadParameters},
    tick, TickDuration, TickPoint,
};
use vireo_port_std::use_port;

use_port!(unsafe struct SystemTraits);

static SEMAPHORE: Semaphore<SystemTraits> = Semaphore::new(0);
static MUTEX: Mutex<SystemTraits> = Mutex::new(MutexType::Normal, MutexProtocol::None);

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
fn timed_waits() {
    vireo_port_std::run::<SystemTraits>(|| {
        // Expiry carries the elapsed time.
        let start = tick::now::<SystemTraits>();
        assert_eq!(
            SEMAPHORE.try_wait_for(TickDuration::from_ticks(10)),
            Err(WaitTimeoutError::TimedOut)
        );
        assert!((tick::now::<SystemTraits>() - start).as_ticks() >= 10);

        // A post before the deadline completes the wait.
        let poster = DynamicThread::spawn(parameters(), || {
            sleep_ticks(5);
            SEMAPHORE.post().unwrap();
        })
        .unwrap();
        assert_eq!(SEMAPHORE.try_wait_for(TickDuration::from_ticks(100)), Ok(()));
        poster.join().unwrap();

        // A held mutex times the locker out, and hands over once released.
        let holder = DynamicThread::spawn(parameters(), || {
            MUTEX.lock().unwrap();
            sleep_ticks(20);
            MUTEX.unlock().unwrap();
        })
        .unwrap();
        sleep_ticks(2);
        assert_eq!(
            MUTEX.try_lock_for(TickDuration::from_ticks(5)),
            Err(LockTimeoutError::TimedOut)
        );
        MUTEX.try_lock_for(TickDuration::from_ticks(100)).unwrap();
        MUTEX.unlock().unwrap();
        holder.join().unwrap();

        // A deadline in the past returns immediately.
        assert_eq!(
            this_thread::sleep_until::<SystemTraits>(TickPoint::ZERO),
            Ok(())
        );
    });
}
