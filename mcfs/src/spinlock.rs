use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

// A test-and-set spinlock. No interrupt context ever enters the file
// system, so there is no interrupt fencing here; holders must not
// sleep and must not perform disk I/O (that is what the sleepable
// locks layered above are for).
#[derive(Debug)]
pub struct Spinlock {
    locked: AtomicBool,
    name: &'static str,
}

impl Spinlock {
    pub const fn new(name: &'static str) -> Spinlock {
        Spinlock {
            locked: AtomicBool::new(false),
            name,
        }
    }

    pub fn acquire(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
                #[cfg(test)]
                std::thread::yield_now();
            }
        }
    }

    pub fn release(&self) {
        assert!(
            self.locked.load(Ordering::Relaxed),
            "unlocking unheld lock {}",
            self.name
        );
        self.locked.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct SpinMutex<T: ?Sized> {
    lock: Spinlock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized> Send for SpinMutex<T> {}
unsafe impl<T: ?Sized> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(name: &'static str, data: T) -> SpinMutex<T> {
        SpinMutex {
            lock: Spinlock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn acquire(&self) {
        self.lock.acquire();
    }

    pub fn release(&self) {
        self.lock.release();
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.acquire();
        MutexGuard { mutex: self }
    }

    pub fn with_lock<U, F: FnOnce(&mut T) -> U>(&self, thunk: F) -> U {
        self.acquire();
        let r = thunk(unsafe { &mut *self.data.get() });
        self.release();
        r
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    pub(crate) mutex: &'a SpinMutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}
