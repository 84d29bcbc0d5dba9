use crate::spinlock::MutexGuard;
use core::hint;
use core::sync::atomic::{AtomicU64, Ordering};

// A condition variable paired with a SpinMutex. sleep() releases the
// mutex while waiting and reacquires it before returning; wakeup()
// must be called while holding that mutex, which is what closes the
// missed-wakeup window (the sequence number is sampled before the
// mutex is released, and wakers cannot advance it until then).
// Wakeups are broadcasts; sleepers re-check their predicate in a loop.
#[derive(Debug)]
pub struct Condvar {
    seq: AtomicU64,
    name: &'static str,
}

impl Condvar {
    pub const fn new(name: &'static str) -> Condvar {
        Condvar {
            seq: AtomicU64::new(0),
            name,
        }
    }

    pub fn sleep<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex;
        let seq = self.seq.load(Ordering::SeqCst);
        drop(guard);
        while self.seq.load(Ordering::SeqCst) == seq {
            hint::spin_loop();
            #[cfg(test)]
            std::thread::yield_now();
        }
        mutex.lock()
    }

    pub fn wakeup(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod condvar_tests {
    use super::Condvar;
    use crate::spinlock::SpinMutex;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn sleep_wakes_on_wakeup() {
        static READY: AtomicBool = AtomicBool::new(false);
        let m = SpinMutex::new("test", ());
        let cv = Condvar::new("test");
        std::thread::scope(|s| {
            s.spawn(|| {
                let mut g = m.lock();
                while !READY.load(Ordering::SeqCst) {
                    g = cv.sleep(g);
                }
                drop(g);
            });
            std::thread::sleep(std::time::Duration::from_millis(10));
            let g = m.lock();
            READY.store(true, Ordering::SeqCst);
            cv.wakeup();
            drop(g);
        });
        assert!(READY.load(Ordering::SeqCst));
    }
}
