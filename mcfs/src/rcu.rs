use crate::spinlock::SpinMutex;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// Scoped-read reclamation. Readers bracket index walks with read();
// writers that unlink something hand it to defer() instead of freeing
// it, and reclaim() hands it back once no reader that could still
// observe it remains.
//
// Two-epoch scheme: a reader pins the parity of the epoch it enters
// under; the epoch advances only once the parity it is leaving behind
// has drained. An item deferred at epoch e is therefore unobservable
// by the time the epoch reaches e + 2. All operations are SeqCst so a
// reader admitted after an unlink's defer cannot walk onto the
// unlinked item through a stale pointer load.
pub struct Domain<T> {
    epoch: AtomicU64,
    active: [AtomicUsize; 2],
    garbage: SpinMutex<Vec<(u64, T)>>,
}

pub struct ReadGuard<'a, T> {
    domain: &'a Domain<T>,
    epoch: u64,
}

impl<T> Domain<T> {
    pub const fn new() -> Domain<T> {
        Domain {
            epoch: AtomicU64::new(0),
            active: [AtomicUsize::new(0), AtomicUsize::new(0)],
            garbage: SpinMutex::new("rcu", Vec::new()),
        }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            self.active[(epoch & 1) as usize].fetch_add(1, Ordering::SeqCst);
            // The epoch may have advanced between the load and the
            // increment; the count must land on the live parity.
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return ReadGuard {
                    domain: self,
                    epoch,
                };
            }
            self.active[(epoch & 1) as usize].fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn defer(&self, item: T) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.garbage.with_lock(|g| g.push((epoch, item)));
    }

    pub fn pending(&self) -> usize {
        self.garbage.with_lock(|g| g.len())
    }

    // Advance the epoch if its trailing parity has drained, then hand
    // every item that has aged out to f. Callers must not hold any
    // lock that f's work might need.
    pub fn reclaim<F: FnMut(T)>(&self, mut f: F) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.active[((epoch + 1) & 1) as usize].load(Ordering::SeqCst) == 0 {
            let _ = self.epoch.compare_exchange(
                epoch,
                epoch + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mut ready = Vec::new();
        self.garbage.with_lock(|g| {
            let mut i = 0;
            while i < g.len() {
                if g[i].0 + 2 <= epoch {
                    ready.push(g.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        });
        for (_, item) in ready {
            f(item);
        }
    }

    // Hand back everything regardless of age. Exclusive access proves
    // no reader exists, so nothing can still observe the items.
    pub fn drain_all<F: FnMut(T)>(&mut self, mut f: F) {
        for (_, item) in self.garbage.get_mut().drain(..) {
            f(item);
        }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.domain.active[(self.epoch & 1) as usize].fetch_sub(1, Ordering::SeqCst);
    }
}
