use kernel_sync::{Clock, Deadline, SpinLock, WaitCondition, WaitTimedOut};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct StdClock(Instant);

impl StdClock {
    fn new() -> Self {
        Self(Instant::now())
    }
}

impl Clock for StdClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.0.elapsed().as_nanos()).unwrap()
    }
}

struct ManualClock(std::sync::atomic::AtomicU64);

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[test]
fn never_deadline_does_not_expire() {
    let d = Deadline::never();
    assert!(d.is_never());
    assert!(!d.has_expired());
}

#[test]
fn deadline_follows_the_clock() {
    let clock = ManualClock(std::sync::atomic::AtomicU64::new(100));
    let d = Deadline::at(&clock, 150);
    assert!(!d.has_expired());
    clock.0.store(150, std::sync::atomic::Ordering::SeqCst);
    assert!(d.has_expired());

    let d = Deadline::after_ms(&clock, 1);
    assert!(!d.has_expired());
    clock.0.store(150 + 1_000_000, std::sync::atomic::Ordering::SeqCst);
    assert!(d.has_expired());
}

#[test]
fn wait_returns_immediately_when_condition_is_false() {
    let lock = SpinLock::new(0u32);
    let cond = WaitCondition::new();
    let mut g = lock.lock();
    assert_eq!(cond.wait_while(&mut g, &Deadline::never(), |v| *v != 0), Ok(()));
    assert!(lock.is_locked());
}

#[test]
fn wait_times_out_with_lock_held() {
    let clock = StdClock::new();
    let lock = SpinLock::new(true);
    let cond = WaitCondition::new();
    let mut g = lock.lock();
    let deadline = Deadline::after(&clock, Duration::from_millis(20));
    assert_eq!(cond.wait_while(&mut g, &deadline, |busy| *busy), Err(WaitTimedOut));
    assert!(lock.is_locked());
    assert!(*g);
}

#[test]
fn notify_wakes_waiter() {
    let shared = Arc::new((SpinLock::new(0u32), WaitCondition::new()));

    let producer = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            for _ in 0..3 {
                thread::sleep(Duration::from_millis(5));
                let (lock, cond) = &*shared;
                let mut g = lock.lock();
                *g += 1;
                cond.notify_all();
            }
        })
    };

    let (lock, cond) = &*shared;
    let mut g = lock.lock();
    cond.wait_while(&mut g, &Deadline::never(), |v| *v < 3).unwrap();
    assert_eq!(*g, 3);
    drop(g);
    producer.join().unwrap();
}
