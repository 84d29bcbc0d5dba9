use crate::condvar::Condvar;
use crate::spinlock::SpinMutex;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Busy: u32 {
        const BUSYR = 1 << 0; // at least one holder
        const BUSYW = 1 << 1; // the holder is exclusive
    }
}

// A reader/writer lock that may be held across disk I/O, for slow
// resources (buffers, inodes). The busy flags are the lock; the
// spinlock only covers their transitions, so the spinlock is never
// held while a holder sleeps in the driver. readbusy counts holders:
// each reader contributes one, an exclusive holder contributes one
// with both busy bits set.
//
// There is no fairness: readers and writers compete on wakeup.
#[derive(Debug)]
pub struct RwSleeplock {
    lock: SpinMutex<()>,
    cv: Condvar,
    flags: AtomicU32,
    readbusy: AtomicU32,
    name: &'static str,
}

impl RwSleeplock {
    pub const fn new(name: &'static str) -> RwSleeplock {
        RwSleeplock {
            lock: SpinMutex::new(name, ()),
            cv: Condvar::new(name),
            flags: AtomicU32::new(0),
            readbusy: AtomicU32::new(0),
            name,
        }
    }

    pub fn flags(&self) -> Busy {
        Busy::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn acquire(&self, writer: bool) {
        let block = if writer {
            Busy::BUSYR | Busy::BUSYW
        } else {
            Busy::BUSYW
        };
        let mut set = Busy::BUSYR;
        if writer {
            set |= Busy::BUSYW;
        }
        let mut guard = self.lock.lock();
        while self.flags().intersects(block) {
            guard = self.cv.sleep(guard);
        }
        self.flags.fetch_or(set.bits(), Ordering::SeqCst);
        self.readbusy.fetch_add(1, Ordering::SeqCst);
        drop(guard);
    }

    pub fn release(&self) {
        assert!(
            self.flags().intersects(Busy::BUSYR | Busy::BUSYW),
            "releasing unheld lock {}",
            self.name
        );
        let guard = self.lock.lock();
        let lastholder = self.readbusy.fetch_sub(1, Ordering::SeqCst) == 1;
        let mut clear = Busy::BUSYW;
        if lastholder {
            clear |= Busy::BUSYR;
        }
        self.flags.fetch_and(!clear.bits(), Ordering::SeqCst);
        self.cv.wakeup();
        drop(guard);
    }

    pub fn holding_any(&self) -> bool {
        self.flags().intersects(Busy::BUSYR | Busy::BUSYW)
    }

    pub fn holding_excl(&self) -> bool {
        self.flags().contains(Busy::BUSYW)
    }

    // Sleep until cond() holds. The predicate is evaluated under the
    // lock's spinlock, so it pairs with state published by holders
    // before they release.
    pub fn wait_until<F: Fn() -> bool>(&self, cond: F) {
        let mut guard = self.lock.lock();
        while !cond() {
            guard = self.cv.sleep(guard);
        }
        drop(guard);
    }

    // Teardown acquisition: evaluate pred under the spinlock and, when
    // it holds, take the lock exclusively without waiting. The caller
    // uses pred to prove no holder can exist; a busy lock at that
    // point is a broken invariant.
    pub fn seize_if<F: FnOnce() -> bool>(&self, pred: F) -> bool {
        let guard = self.lock.lock();
        if !pred() {
            return false;
        }
        assert!(!self.holding_any(), "seizing busy lock {}", self.name);
        self.flags
            .fetch_or((Busy::BUSYR | Busy::BUSYW).bits(), Ordering::SeqCst);
        self.readbusy.fetch_add(1, Ordering::SeqCst);
        drop(guard);
        true
    }

    pub(crate) fn spin(&self) -> &SpinMutex<()> {
        &self.lock
    }
}

#[cfg(test)]
mod rwsleeplock_tests {
    use super::{Busy, RwSleeplock};
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn readers_share() {
        let l = RwSleeplock::new("test");
        l.acquire(false);
        l.acquire(false);
        assert_eq!(l.flags(), Busy::BUSYR);
        assert_eq!(l.readbusy.load(Ordering::SeqCst), 2);
        l.release();
        assert!(l.holding_any());
        l.release();
        assert!(!l.holding_any());
    }

    #[test]
    fn writer_is_exclusive() {
        let l = RwSleeplock::new("test");
        l.acquire(true);
        assert!(l.holding_excl());
        assert_eq!(l.readbusy.load(Ordering::SeqCst), 1);
        l.release();
        assert!(!l.holding_any());
    }

    #[test]
    fn writer_waits_for_reader() {
        static ACQUIRED: AtomicBool = AtomicBool::new(false);
        let l = RwSleeplock::new("test");
        l.acquire(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                l.acquire(true);
                ACQUIRED.store(true, Ordering::SeqCst);
                l.release();
            });
            std::thread::sleep(Duration::from_millis(20));
            assert!(!ACQUIRED.load(Ordering::SeqCst));
            l.release();
        });
        assert!(ACQUIRED.load(Ordering::SeqCst));
    }

    #[test]
    fn seize_if_false_leaves_lock_free() {
        let l = RwSleeplock::new("test");
        assert!(!l.seize_if(|| false));
        assert!(!l.holding_any());
        assert!(l.seize_if(|| true));
        assert!(l.holding_excl());
        l.release();
    }

    #[test]
    #[should_panic(expected = "seizing busy lock")]
    fn seize_of_held_lock_panics() {
        let l = RwSleeplock::new("test");
        l.acquire(false);
        l.seize_if(|| true);
    }
}
