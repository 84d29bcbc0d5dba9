use crate::rcu::ReadGuard;
use crate::spinlock::SpinMutex;
use alloc::boxed::Box;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

const NHASH: usize = 64;

// A concurrent hash index. Mutations take the bucket spinlock; reads
// walk the chain locklessly and must be bracketed by a read section
// on the reclamation domain that owns the unlinked nodes, which is
// what keeps a node memory-valid while a reader may still step onto
// it. Pointer loads and stores are SeqCst to pair with the domain's
// epoch protocol.
pub struct Node<V> {
    key: u32,
    val: V,
    next: AtomicPtr<Node<V>>,
}

struct Bucket<V> {
    lock: SpinMutex<()>,
    head: AtomicPtr<Node<V>>,
}

pub struct Ns<V> {
    buckets: [Bucket<V>; NHASH],
}

impl<V: Copy> Ns<V> {
    pub fn new() -> Ns<V> {
        Ns {
            buckets: core::array::from_fn(|_| Bucket {
                lock: SpinMutex::new("ns", ()),
                head: AtomicPtr::new(ptr::null_mut()),
            }),
        }
    }

    fn bucket(&self, key: u32) -> &Bucket<V> {
        &self.buckets[key as usize % NHASH]
    }

    pub fn lookup<T>(&self, key: u32, _section: &ReadGuard<'_, T>) -> Option<V> {
        let mut p = self.bucket(key).head.load(Ordering::SeqCst);
        while let Some(n) = unsafe { p.as_ref() } {
            if n.key == key {
                return Some(n.val);
            }
            p = n.next.load(Ordering::SeqCst);
        }
        None
    }

    // Fails, returning the value, if the key is already present.
    pub fn insert(&self, key: u32, val: V) -> Result<(), V> {
        let b = self.bucket(key);
        let _guard = b.lock.lock();
        let mut p = b.head.load(Ordering::SeqCst);
        while let Some(n) = unsafe { p.as_ref() } {
            if n.key == key {
                return Err(val);
            }
            p = n.next.load(Ordering::SeqCst);
        }
        let node = Box::into_raw(Box::new(Node {
            key,
            val,
            next: AtomicPtr::new(b.head.load(Ordering::SeqCst)),
        }));
        b.head.store(node, Ordering::SeqCst);
        Ok(())
    }

    // Unlink the entry and hand its node back for deferred
    // destruction; concurrent readers may still be traversing it.
    pub fn remove(&self, key: u32) -> Option<NonNull<Node<V>>> {
        let b = self.bucket(key);
        let _guard = b.lock.lock();
        let mut prev = &b.head;
        loop {
            let p = prev.load(Ordering::SeqCst);
            let n = unsafe { p.as_ref() }?;
            if n.key == key {
                prev.store(n.next.load(Ordering::SeqCst), Ordering::SeqCst);
                return NonNull::new(p);
            }
            prev = &n.next;
        }
    }

    // Visit entries in arbitrary order until the visitor claims one.
    pub fn enumerate<T, F: FnMut(V) -> bool>(
        &self,
        _section: &ReadGuard<'_, T>,
        mut f: F,
    ) -> Option<V> {
        for b in &self.buckets {
            let mut p = b.head.load(Ordering::SeqCst);
            while let Some(n) = unsafe { p.as_ref() } {
                if f(n.val) {
                    return Some(n.val);
                }
                p = n.next.load(Ordering::SeqCst);
            }
        }
        None
    }

    // Tear the index down, handing each value to the caller.
    // Exclusive access proves no reader or writer remains.
    pub fn drain<F: FnMut(V)>(&mut self, mut f: F) {
        for b in &mut self.buckets {
            let mut p = core::mem::replace(b.head.get_mut(), ptr::null_mut());
            while !p.is_null() {
                let n = unsafe { Box::from_raw(p) };
                p = n.next.load(Ordering::SeqCst);
                f(n.val);
            }
        }
    }
}

impl<V> Drop for Ns<V> {
    fn drop(&mut self) {
        for b in &mut self.buckets {
            let mut p = core::mem::replace(b.head.get_mut(), ptr::null_mut());
            while !p.is_null() {
                let n = unsafe { Box::from_raw(p) };
                p = n.next.load(Ordering::SeqCst);
            }
        }
    }
}
