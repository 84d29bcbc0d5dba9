use crate::dev::BlockDev;
use crate::fs::BSIZE;
use crate::param;
use crate::sleeplock::RwSleeplock;
use crate::spinlock::SpinMutex as Mutex;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::cell::{Cell, UnsafeCell};

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct BufFlags: u32 {
        const VALID = 1 << 1; // buffer has been read from the device
    }
}

const LIST_NONE: usize = usize::MAX;

// LRU bookkeeping for one buffer. Protected by the cache lock.
#[derive(Debug)]
struct BufMeta {
    ref_cnt: u32,
    prev: usize,
    next: usize,
}

struct Lru {
    head: usize,
    tail: usize,
    meta: [BufMeta; param::NBUF],
}

// A buffer: one cached copy of a disk block. The identity fields and
// flags are written only under the cache lock or by the holder of the
// buffer lock; the data only under the buffer lock (exclusively for
// writes). The buffer lock is a reader/writer lock, so bread with
// write intent excludes all other holders while plain reads share.
pub struct Buf {
    idx: usize,
    lock: RwSleeplock,
    flags: Cell<BufFlags>,
    dev: Cell<u32>,
    blockno: Cell<u32>,
    data: UnsafeCell<[u8; BSIZE]>,
}

// The cells and the data array are guarded by the cache lock and the
// buffer lock as described above.
unsafe impl Send for Buf {}
unsafe impl Sync for Buf {}

impl Buf {
    fn new(idx: usize) -> Buf {
        Buf {
            idx,
            lock: RwSleeplock::new("buffer"),
            flags: Cell::new(BufFlags::empty()),
            dev: Cell::new(0),
            blockno: Cell::new(0),
            data: UnsafeCell::new([0; BSIZE]),
        }
    }

    pub fn blockno(&self) -> u32 {
        self.blockno.get()
    }

    fn flags(&self) -> BufFlags {
        self.flags.get()
    }

    fn set_flags(&self, flags: BufFlags) {
        self.flags.set(flags);
    }

    pub fn data_ref(&self) -> &[u8] {
        debug_assert!(self.lock.holding_any(), "buffer data read while unlocked");
        unsafe { &*self.data.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut [u8] {
        debug_assert!(self.lock.holding_excl(), "buffer data written while shared");
        unsafe { &mut *self.data.get() }
    }
}

// A fixed pool of buffers recycled in LRU order: the list head is the
// most recently released buffer, so recycling scans from the tail.
pub struct Bcache {
    driver: Arc<dyn BlockDev>,
    dev: u32,
    lru: Mutex<Lru>,
    bufs: [Buf; param::NBUF],
}

impl Bcache {
    pub fn new(driver: Arc<dyn BlockDev>, dev: u32) -> Bcache {
        assert!(param::NBUF > 1, "insufficient number of buffers");
        let mut meta: [BufMeta; param::NBUF] = core::array::from_fn(|_| BufMeta {
            ref_cnt: 0,
            prev: LIST_NONE,
            next: LIST_NONE,
        });
        for (k, m) in meta.iter_mut().enumerate() {
            if k > 0 {
                m.prev = k - 1;
            }
            if k + 1 < param::NBUF {
                m.next = k + 1;
            }
        }
        Bcache {
            driver,
            dev,
            lru: Mutex::new(
                "bcache",
                Lru {
                    head: 0,
                    tail: param::NBUF - 1,
                    meta,
                },
            ),
            bufs: core::array::from_fn(Buf::new),
        }
    }

    fn bget(&self, dev: u32, blockno: u32) -> &Buf {
        let idx = self.lru.with_lock(|lru| {
            // Is the block already cached?
            let mut p = lru.head;
            while p != LIST_NONE {
                let b = &self.bufs[p];
                if b.dev.get() == dev && b.blockno.get() == blockno {
                    lru.meta[p].ref_cnt += 1;
                    return p;
                }
                p = lru.meta[p].next;
            }
            // Not cached; recycle the least recently used free buffer.
            let mut p = lru.tail;
            while p != LIST_NONE {
                if lru.meta[p].ref_cnt == 0 {
                    let b = &self.bufs[p];
                    b.dev.set(dev);
                    b.blockno.set(blockno);
                    b.set_flags(BufFlags::empty());
                    lru.meta[p].ref_cnt = 1;
                    return p;
                }
                p = lru.meta[p].prev;
            }
            panic!("bget: no buffers");
        });
        &self.bufs[idx]
    }

    // Return a locked buffer holding the named block: shared when the
    // caller only reads it, exclusive when it intends to write.
    pub fn bread(&self, dev: u32, blockno: u32, writeintent: bool) -> &Buf {
        assert_eq!(dev, self.dev, "bread: dev mismatch");
        let b = self.bget(dev, blockno);
        b.lock.acquire(writeintent);
        if !b.flags().contains(BufFlags::VALID) {
            // The first access loads the block; that needs the lock
            // exclusively even on a read path.
            if !writeintent {
                b.lock.release();
                b.lock.acquire(true);
            }
            if !b.flags().contains(BufFlags::VALID) {
                self.driver.read_block(b.blockno.get(), b.data_mut());
                b.set_flags(b.flags() | BufFlags::VALID);
            }
            if !writeintent {
                b.lock.release();
                b.lock.acquire(false);
            }
        }
        b
    }

    // Write the buffer's contents through to the device. The cache is
    // write-through; callers hold the buffer exclusively.
    pub fn bwrite(&self, b: &Buf) {
        assert!(b.lock.holding_excl(), "bwrite: buffer not held for write");
        self.driver.write_block(b.blockno.get(), b.data_ref());
    }

    // Release the buffer and move it to the front of the recycling
    // order once the last reference is gone.
    pub fn brelse(&self, b: &Buf) {
        b.lock.release();
        let i = b.idx;
        self.lru.with_lock(|lru| {
            lru.meta[i].ref_cnt -= 1;
            if lru.meta[i].ref_cnt == 0 && lru.head != i {
                let prev = lru.meta[i].prev;
                let next = lru.meta[i].next;
                if lru.tail == i {
                    lru.tail = prev;
                }
                if next != LIST_NONE {
                    lru.meta[next].prev = prev;
                }
                if prev != LIST_NONE {
                    lru.meta[prev].next = next;
                }
                let head = lru.head;
                lru.meta[i].prev = LIST_NONE;
                lru.meta[i].next = head;
                lru.meta[head].prev = i;
                lru.head = i;
            }
        });
    }

    pub fn with_block<U, F: FnMut(&Buf) -> U>(
        &self,
        dev: u32,
        blockno: u32,
        writeintent: bool,
        mut thunk: F,
    ) -> U {
        let bp = self.bread(dev, blockno, writeintent);
        let r = thunk(bp);
        self.brelse(bp);
        r
    }
}
