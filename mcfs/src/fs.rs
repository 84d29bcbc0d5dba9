use crate::bio::Bcache;
use crate::dev::{BlockDev, DevSw};
use crate::kprintln;
use crate::ncache::NameCache;
use crate::ns::{self, Ns};
use crate::param;
use crate::rcu::Domain;
use crate::sleeplock::RwSleeplock;
use crate::Result;
use alloc::boxed::Box;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::cmp;
use core::mem;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use static_assertions::{const_assert, const_assert_eq};
use syslib::stat::{FileType, Stat};
use zerocopy::{AsBytes, FromBytes};

// File system implementation. Four layers:
//   - Blocks: allocator for raw disk blocks.
//   - Files: inode allocator, reading, writing, metadata.
//   - Directories: inode with special contents (list of other inodes!)
//   - Names: paths like /usr/rtm/mcfs/fs.rs for convenient naming.
//
// This file contains the low-level file system manipulation
// routines. The (higher-level) system call implementations sit in
// the kernel above this crate.

pub const ROOTINO: u32 = 1; // root i-number
pub const BSIZE: usize = 512; // block size

// Disk layout:
// [ boot block | super block | inode blocks | free bit map | data blocks ]
//
// mkfs computes the super block and builds an initial file system. The
// super block describes the disk layout:
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
pub struct Superblock {
    pub size: u32,    // Size of file system image (blocks)
    pub nblocks: u32, // Number of data blocks
    pub ninodes: u32, // Number of inodes
}

const SUPERBLOCK_SIZE: usize = mem::size_of::<Superblock>();
const_assert!(SUPERBLOCK_SIZE <= BSIZE);

impl Superblock {
    // Block containing inode i
    pub const fn iblock(&self, inum: u32) -> u32 {
        2 + inum / IPB as u32
    }

    // Block of free map containing bit for block b
    pub const fn bblock(&self, b: u32) -> u32 {
        2 + self.ninodeblocks() + b / BPB as u32
    }

    pub const fn ninodeblocks(&self) -> u32 {
        self.ninodes / IPB as u32 + 1
    }

    pub const fn nbitmapblocks(&self) -> u32 {
        self.size / BPB as u32 + 1
    }

    // First block not claimed by the boot block, the superblock, the
    // inode table, or the bitmap.
    pub const fn datastart(&self) -> u32 {
        2 + self.ninodeblocks() + self.nbitmapblocks()
    }

    fn read(bcache: &Bcache, dev: u32) -> Result<Superblock> {
        let mut sb = Superblock::default();
        bcache.with_block(dev, 1, false, |bp| {
            sb.as_bytes_mut()
                .copy_from_slice(&bp.data_ref()[..SUPERBLOCK_SIZE]);
        });
        if sb.size == 0 || sb.ninodes == 0 {
            return Err("no file system");
        }
        Ok(sb)
    }
}

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

// On-disk inode structure. type 0 marks a free slot; gen counts
// allocations and frees of the slot so stale references to a reused
// inum are detectable.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
struct DInode {
    typ: u16,                  // File type
    major: u16,                // Major device number (T_DEV only)
    minor: u16,                // Minor device number (T_DEV only)
    nlink: u16,                // Number of links to inode in file system
    size: u32,                 // Size of data (bytes)
    gen: u32,                  // Generation number
    addrs: [u32; NDIRECT + 1], // Data block addresses
}

const DINODE_SIZE: usize = mem::size_of::<DInode>();
const_assert_eq!(DINODE_SIZE, 68);

// Inodes per block
pub const IPB: usize = BSIZE / DINODE_SIZE;

// Bitmap bits per block
pub const BPB: usize = BSIZE * 8;

// Directory is a file containing a sequence of dirent structures.
pub const DIRSIZ: usize = 14;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
pub struct Dirent {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();
const_assert_eq!(DIRENT_SIZE, 16);

impl Dirent {
    // The stored name, NUL-terminated or exactly DIRSIZ bytes long.
    pub fn name(&self) -> &[u8] {
        if let Some(nul) = self.name.iter().position(|b| *b == b'\0') {
            &self.name[..nul]
        } else {
            &self.name[..]
        }
    }
}

// Bounded comparison in the manner of strncmp(s, t, DIRSIZ): only the
// first DIRSIZ bytes of the candidate participate.
fn namecmp(de: &Dirent, name: &[u8]) -> bool {
    de.name() == &name[..cmp::min(name.len(), DIRSIZ)]
}

fn get_u32(data: &[u8], i: usize) -> u32 {
    let o = i * 4;
    u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]])
}

fn put_u32(data: &mut [u8], i: usize, v: u32) {
    let o = i * 4;
    data[o..o + 4].copy_from_slice(&v.to_le_bytes());
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct IFlags: u32 {
        const VALID = 1 << 0; // the disk copy has been loaded
        const FREE = 1 << 1;  // mid-eviction; lookups must back off
    }
}

// In-memory copy of an inode.
//
// An inode describes a single unnamed file. The disk structure holds
// the metadata: type, device numbers, link count, size, and the list
// of data blocks. The kernel keeps a bounded cache of in-memory
// copies, indexed by inum through a concurrent hash table, to give
// processes sharing an inode one place to synchronize.
//
// An entry moves through these states:
//
// * Allocated on disk: type is non-zero. Fs::ialloc allocates,
//   and the last Iref drop frees the disk inode when the link count
//   has also fallen to zero.
//
// * Referenced: refcnt counts the outstanding Iref handles (open
//   files, working directories). Entries with refcnt zero stay cached
//   and are the eviction candidates when a miss needs a slot; FREE
//   marks an entry an evictor has claimed, and lookups that catch it
//   mid-teardown retry. The index itself is read locklessly under a
//   reclamation read section, so an unlinked entry stays
//   memory-valid until every section that could observe it has ended.
//
// * Valid: type, size, &c are only meaningful once VALID is set. The
//   miss path of Fs::iget admits the entry exclusively locked and not
//   yet valid, loads it from disk, then publishes VALID and unlocks;
//   hits that arrive in between sleep until the broadcast.
//
// * Locked: the flag-based reader/writer lock serializes access to
//   the metadata and contents. It is a flag lock, not a spinlock,
//   because it is held across disk I/O.
//
// Thus a typical sequence is:
//   let ip = fs.iget(dev, inum);
//   ip.ilock(false);
//   ... examine ip ...
//   ip.iunlock();
//   // drop(ip) puts the reference
//
// Locking is separate from referencing so that system calls can hold
// long-term references (as for open files) and only lock for short
// stretches, and so that callers can compose multi-step atomic
// operations. All routines here that hand out inodes hand them out
// unlocked.
//
// The per-entry spinlock (inside the lock) protects the busy flags
// and, during the final put, the refcnt re-check. The stable identity
// fields dev, inum, and gen may be read without any lock by a holder
// of a reference.
pub struct Inode {
    dev: u32,
    inum: u32,
    refcnt: AtomicU32,
    flags: AtomicU32,
    gen: AtomicU32,
    lock: RwSleeplock,
    meta: UnsafeCell<Imeta>,
}

// Metadata mirrored from the disk inode; guarded by the entry's
// reader/writer lock.
#[derive(Debug, Default)]
struct Imeta {
    typ: u16,
    major: u16,
    minor: u16,
    nlink: u16,
    size: u32,
    addrs: [u32; NDIRECT + 1],
}

// Imeta is published only through the lock protocol above.
unsafe impl Send for Inode {}
unsafe impl Sync for Inode {}

impl Inode {
    fn new(dev: u32, inum: u32) -> Inode {
        Inode {
            dev,
            inum,
            refcnt: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            gen: AtomicU32::new(0),
            lock: RwSleeplock::new("inode"),
            meta: UnsafeCell::new(Imeta::default()),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    pub fn gen(&self) -> u32 {
        self.gen.load(Ordering::SeqCst)
    }

    fn iflags(&self) -> IFlags {
        IFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    fn set_iflags(&self, f: IFlags) {
        self.flags.fetch_or(f.bits(), Ordering::SeqCst);
    }

    fn clear_iflags(&self, f: IFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    fn meta(&self) -> &Imeta {
        debug_assert!(self.lock.holding_any(), "inode read while unlocked");
        unsafe { &*self.meta.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn meta_mut(&self) -> &mut Imeta {
        debug_assert!(self.lock.holding_excl(), "inode written while shared");
        unsafe { &mut *self.meta.get() }
    }

    pub fn typ(&self) -> FileType {
        match self.meta().typ {
            0 => FileType::Unused,
            1 => FileType::Dir,
            2 => FileType::File,
            3 => FileType::Dev,
            t => panic!("bad inode file type: {}", t),
        }
    }

    pub fn nlink(&self) -> u16 {
        self.meta().nlink
    }

    pub fn nlink_inc(&self) {
        self.meta_mut().nlink += 1;
    }

    pub fn nlink_dec(&self) {
        self.meta_mut().nlink -= 1;
    }

    pub fn size(&self) -> u32 {
        self.meta().size
    }

    pub fn major(&self) -> u16 {
        self.meta().major
    }

    pub fn minor(&self) -> u16 {
        self.meta().minor
    }

    // Lock the inode, shared (writer = false) or exclusive.
    pub fn ilock(&self, writer: bool) {
        assert!(self.refcnt.load(Ordering::SeqCst) >= 1, "ilock");
        self.lock.acquire(writer);
        assert!(self.iflags().contains(IFlags::VALID), "ilock");
    }

    pub fn iunlock(&self) {
        assert!(
            self.lock.holding_any() && self.refcnt.load(Ordering::SeqCst) >= 1,
            "iunlock"
        );
        self.lock.release();
    }

    pub fn with_rlock<U, F: FnOnce(&Inode) -> U>(&self, thunk: F) -> U {
        self.ilock(false);
        let r = thunk(self);
        self.iunlock();
        r
    }

    pub fn with_wlock<U, F: FnOnce(&Inode) -> U>(&self, thunk: F) -> U {
        self.ilock(true);
        let r = thunk(self);
        self.iunlock();
        r
    }
}

// Raw handles that cross the deferral queue.
#[derive(Clone, Copy)]
struct Ip(NonNull<Inode>);

unsafe impl Send for Ip {}
unsafe impl Sync for Ip {}

#[derive(Clone, Copy)]
struct NodePtr(NonNull<ns::Node<Ip>>);

unsafe impl Send for NodePtr {}
unsafe impl Sync for NodePtr {}

enum Garbage {
    Entry(Ip),
    Node(NodePtr),
    Block(u32),
}

// A counted reference to a cached inode. Dropping it is the put: the
// last drop of an unlinked inode truncates and frees it on disk, so
// drops may block on the disk.
pub struct Iref<'fs> {
    fs: &'fs Fs,
    ip: NonNull<Inode>,
}

unsafe impl Send for Iref<'_> {}
unsafe impl Sync for Iref<'_> {}

impl<'fs> Iref<'fs> {
    // Take another counted reference; `let ip = ip1.dup()` mirrors
    // the classic idup idiom.
    pub fn dup(&self) -> Iref<'fs> {
        let ip = unsafe { self.ip.as_ref() };
        ip.refcnt.fetch_add(1, Ordering::SeqCst);
        Iref {
            fs: self.fs,
            ip: self.ip,
        }
    }
}

impl Deref for Iref<'_> {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        unsafe { self.ip.as_ref() }
    }
}

impl Drop for Iref<'_> {
    fn drop(&mut self) {
        let ip = unsafe { self.ip.as_ref() };
        self.fs.iput(ip);
    }
}

struct Icache {
    ns: Ns<Ip>,
    domain: Domain<Garbage>,
}

impl Icache {
    fn new(dev: u32) -> Icache {
        let icache = Icache {
            ns: Ns::new(),
            domain: Domain::new(),
        };
        // Pre-populate with blank entries under synthetic out-of-range
        // inums so eviction always finds a victim and the steady-state
        // miss path runs from the first lookup.
        for i in 0..param::NINODE {
            let inum = (-(i as i64) - 1) as u32;
            let entry = NonNull::from(Box::leak(Box::new(Inode::new(dev, inum))));
            assert!(
                icache.ns.insert(inum, Ip(entry)).is_ok(),
                "icache: duplicate entry"
            );
        }
        icache
    }
}

// One mounted file system: the superblock, the buffer cache over the
// block device, the inode cache, the name cache, and the device
// switch. Constructed once at init and passed by reference; there is
// no ambient instance.
pub struct Fs {
    dev: u32,
    sb: Superblock,
    bcache: Bcache,
    icache: Icache,
    ncache: NameCache,
    devsw: DevSw,
}

impl Fs {
    pub fn new(driver: Arc<dyn BlockDev>) -> Result<Fs> {
        let dev = param::ROOTDEV;
        let bcache = Bcache::new(driver, dev);
        let sb = Superblock::read(&bcache, dev)?;
        Ok(Fs {
            dev,
            sb,
            bcache,
            icache: Icache::new(dev),
            ncache: NameCache::new(),
            devsw: DevSw::new(),
        })
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn devsw(&self) -> &DevSw {
        &self.devsw
    }

    // Apply deferred destruction that has aged out of every read
    // section: evicted cache entries, unlinked index nodes, and
    // truncated data blocks. Called from the lookup and put paths;
    // callers hold no buffer locks.
    fn reclaim(&self) {
        self.icache.domain.reclaim(|garbage| match garbage {
            Garbage::Entry(Ip(p)) => unsafe { drop(Box::from_raw(p.as_ptr())) },
            Garbage::Node(NodePtr(p)) => unsafe { drop(Box::from_raw(p.as_ptr())) },
            Garbage::Block(b) => self.bfree(self.dev, b),
        });
    }

    // Drive deferred reclamation to completion, for unmount and for
    // callers that need freed blocks back on the free list now.
    pub fn quiesce(&self) {
        while self.icache.domain.pending() > 0 {
            self.reclaim();
            #[cfg(test)]
            std::thread::yield_now();
        }
    }

    // Blocks.

    // Zero a block.
    fn bzero(&self, dev: u32, bno: u32) {
        let bp = self.bcache.bread(dev, bno, true);
        bp.data_mut().fill(0);
        self.bcache.bwrite(bp);
        self.bcache.brelse(bp);
    }

    // Allocate a disk block. The bitmap block's write lock serializes
    // allocators per chunk; allocators working disjoint chunks
    // proceed in parallel. Free blocks are kept zeroed (see bfree),
    // so the caller gets a zeroed block.
    pub(crate) fn balloc(&self, dev: u32) -> u32 {
        let mut b = 0;
        while b < self.sb.size {
            let found = self.bcache.with_block(dev, self.sb.bblock(b), true, |bp| {
                let mut hit = None;
                {
                    let data = bp.data_mut();
                    for bi in 0..BPB as u32 {
                        if b + bi >= self.sb.size {
                            break;
                        }
                        let m = 1u8 << (bi % 8);
                        if data[(bi / 8) as usize] & m == 0 {
                            // Is block free?
                            data[(bi / 8) as usize] |= m; // Mark block in use.
                            hit = Some(b + bi);
                            break;
                        }
                    }
                }
                if hit.is_some() {
                    self.bcache.bwrite(bp);
                }
                hit
            });
            if let Some(bno) = found {
                return bno;
            }
            b += BPB as u32;
        }
        panic!("balloc: out of blocks");
    }

    // Free a disk block. The zeroing comes first so that a racing
    // allocator that already sees the bit set keeps observing zeroed
    // contents until it writes its own.
    pub(crate) fn bfree(&self, dev: u32, b: u32) {
        self.bzero(dev, b);
        self.bcache.with_block(dev, self.sb.bblock(b), true, |bp| {
            let bi = b as usize % BPB;
            let m = 1u8 << (bi % 8);
            {
                let data = bp.data_mut();
                assert!(data[bi / 8] & m != 0, "freeing free block");
                data[bi / 8] &= !m; // Mark block free.
            }
            self.bcache.bwrite(bp);
        });
    }

    // Inodes.

    // Allocate a free on-disk inode with the given type. Returns a
    // referenced, exclusively locked inode. The unlocked scan only
    // nominates a candidate; the cache holds the authoritative copy,
    // so the slot is re-checked under the inode lock before it is
    // claimed.
    pub fn ialloc(&self, dev: u32, typ: FileType) -> Iref<'_> {
        assert_ne!(typ, FileType::Unused, "ialloc: bad type");
        for inum in 1..self.sb.ninodes {
            let seems_free = self.bcache.with_block(dev, self.sb.iblock(inum), false, |bp| {
                let off = (inum as usize % IPB) * DINODE_SIZE;
                let data = bp.data_ref();
                u16::from_le_bytes([data[off], data[off + 1]]) == 0
            });
            if !seems_free {
                continue;
            }
            let ip = self.iget(dev, inum);
            ip.ilock(true);
            if ip.typ() == FileType::Unused {
                {
                    let meta = ip.meta_mut();
                    assert!(
                        meta.nlink == 0 && meta.size == 0 && meta.addrs[0] == 0,
                        "ialloc: not zeroed"
                    );
                    meta.typ = typ as u16;
                }
                ip.gen.fetch_add(1, Ordering::SeqCst);
                self.iupdate(&ip);
                return ip;
            }
            // Another thread claimed it between the scan and the lock.
            ip.iunlock();
            kprintln!("ialloc: lost inode {} to a racing allocator", inum);
        }
        panic!("ialloc: no inodes");
    }

    // Copy a modified in-memory inode to disk. Must be called after
    // every change to a field that lives on disk. Caller holds the
    // inode exclusively.
    pub fn iupdate(&self, ip: &Inode) {
        self.bcache
            .with_block(ip.dev(), self.sb.iblock(ip.inum()), true, |bp| {
                let meta = ip.meta();
                let di = DInode {
                    typ: meta.typ,
                    major: meta.major,
                    minor: meta.minor,
                    nlink: meta.nlink,
                    size: meta.size,
                    gen: ip.gen(),
                    addrs: meta.addrs,
                };
                let off = (ip.inum() as usize % IPB) * DINODE_SIZE;
                bp.data_mut()[off..off + DINODE_SIZE].copy_from_slice(di.as_bytes());
                self.bcache.bwrite(bp);
            });
    }

    // Find the inode numbered inum and return a referenced, unlocked
    // handle to the in-memory copy. The handle keeps the entry cached;
    // the stable fields (inum, gen) may be read without locking it.
    pub fn iget(&self, dev: u32, inum: u32) -> Iref<'_> {
        assert_eq!(dev, self.dev, "iget: dev mismatch");
        assert!(inum >= 1 && inum < self.sb.ninodes, "iget: inum out of range");
        self.reclaim();
        loop {
            // Try for a cached inode.
            let section = self.icache.domain.read();
            if let Some(Ip(p)) = self.icache.ns.lookup(inum, &section) {
                let ip = unsafe { p.as_ref() };
                // Tricky: bump the count first, then look at FREE. The
                // evictor publishes FREE before inspecting the count,
                // so one of the two is guaranteed to notice the other.
                ip.refcnt.fetch_add(1, Ordering::SeqCst);
                if ip.iflags().contains(IFlags::FREE) {
                    ip.refcnt.fetch_sub(1, Ordering::SeqCst);
                    drop(section);
                    continue;
                }
                drop(section);
                if !ip.iflags().contains(IFlags::VALID) {
                    // Another caller is mid-load; wait for the
                    // broadcast that publishes VALID.
                    ip.lock.wait_until(|| ip.iflags().contains(IFlags::VALID));
                }
                return Iref { fs: self, ip: p };
            }
            drop(section);

            // Miss. Free up a slot: any entry with no references and
            // no holder can be evicted.
            loop {
                let section = self.icache.domain.read();
                let victim = self.icache.ns.enumerate(&section, |Ip(p)| {
                    let v = unsafe { p.as_ref() };
                    v.lock.spin().acquire();
                    if v.refcnt.load(Ordering::SeqCst) == 0 && !v.lock.holding_any() {
                        true // keep the spinlock held
                    } else {
                        v.lock.spin().release();
                        false
                    }
                });
                let Some(Ip(vp)) = victim else {
                    panic!("iget: out of space");
                };
                let victim = unsafe { vp.as_ref() };
                // Tricky: publish FREE first, then re-check the count;
                // a lookup that slipped in bumped the count before
                // reading FREE and will back off.
                victim.set_iflags(IFlags::FREE);
                if victim.refcnt.load(Ordering::SeqCst) > 0 {
                    victim.clear_iflags(IFlags::FREE);
                    victim.lock.spin().release();
                    drop(section);
                    continue;
                }
                victim.lock.spin().release();
                let node = self.icache.ns.remove(victim.inum);
                drop(section);
                if let Some(node) = node {
                    self.icache.domain.defer(Garbage::Node(NodePtr(node)));
                }
                self.icache.domain.defer(Garbage::Entry(Ip(vp)));
                break;
            }

            // Admit the replacement entry exclusively held and not yet
            // valid: racing hits sleep until the load is published.
            let entry = Box::new(Inode::new(dev, inum));
            entry.refcnt.store(1, Ordering::SeqCst);
            entry.lock.acquire(true);
            let p = NonNull::from(Box::leak(entry));
            if self.icache.ns.insert(inum, Ip(p)).is_err() {
                // Lost the admission race; use the winner's entry.
                let entry = unsafe { p.as_ref() };
                entry.lock.release();
                self.icache.domain.defer(Garbage::Entry(Ip(p)));
                continue;
            }
            let ip = unsafe { p.as_ref() };
            {
                let meta = ip.meta_mut();
                self.bcache
                    .with_block(dev, self.sb.iblock(inum), false, |bp| {
                        let mut di = DInode::default();
                        let off = (inum as usize % IPB) * DINODE_SIZE;
                        di.as_bytes_mut()
                            .copy_from_slice(&bp.data_ref()[off..off + DINODE_SIZE]);
                        meta.typ = di.typ;
                        meta.major = di.major;
                        meta.minor = di.minor;
                        meta.nlink = di.nlink;
                        meta.size = di.size;
                        meta.addrs = di.addrs;
                        ip.gen.store(di.gen, Ordering::SeqCst);
                    });
            }
            ip.set_iflags(IFlags::VALID);
            ip.lock.release();
            return Iref { fs: self, ip: p };
        }
    }

    // Drop a reference. On the last drop of an inode with no on-disk
    // links, truncate and free the disk inode. The refcnt re-check
    // and the busy acquisition happen under the entry spinlock as one
    // step; a lookup racing this teardown bumps the count first and
    // then waits on the busy bits like any other locker, observing
    // the freed (type 0, bumped gen) inode afterwards.
    fn iput(&self, ip: &Inode) {
        if ip.refcnt.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let teardown = ip.lock.seize_if(|| {
            if ip.refcnt.load(Ordering::SeqCst) != 0 {
                return false;
            }
            // Busy with the count at zero means another put's teardown
            // owns the free already; stand down.
            if ip.lock.holding_any() {
                return false;
            }
            // No holder can exist with the count at zero, so the raw
            // read of nlink is stable.
            let meta = unsafe { &*ip.meta.get() };
            if meta.nlink != 0 {
                return false;
            }
            assert!(ip.iflags().contains(IFlags::VALID), "iput not valid");
            true
        });
        if teardown {
            self.itrunc(ip);
            {
                let meta = ip.meta_mut();
                meta.typ = 0;
                meta.major = 0;
                meta.minor = 0;
            }
            ip.gen.fetch_add(1, Ordering::SeqCst);
            self.iupdate(ip);
            ip.lock.release();
        }
        self.reclaim();
    }

    // Copy stat information from an inode.
    pub fn stati(&self, ip: &Inode) -> Stat {
        ip.with_rlock(|i| Stat {
            typ: i.typ(),
            dev: i.dev(),
            ino: i.inum(),
            nlink: i.nlink(),
            size: i.size(),
        })
    }

    // Inode contents.
    //
    // The data associated with an inode is a sequence of blocks. The
    // first NDIRECT are listed in addrs[]; the next NINDIRECT in the
    // block addrs[NDIRECT].

    // Return the disk block address of the nth block of ip,
    // allocating it if there is none. Callers hold ip exclusively
    // whenever allocation is possible.
    fn bmap(&self, ip: &Inode, bn: u32) -> u32 {
        let bn = bn as usize;
        if bn < NDIRECT {
            let addr = ip.meta().addrs[bn];
            if addr != 0 {
                return addr;
            }
            let addr = self.balloc(ip.dev());
            ip.meta_mut().addrs[bn] = addr;
            return addr;
        }
        let bn = bn - NDIRECT;
        if bn < NINDIRECT {
            // Load the indirect block, allocating it if necessary.
            let mut iblk = ip.meta().addrs[NDIRECT];
            if iblk == 0 {
                iblk = self.balloc(ip.dev());
                ip.meta_mut().addrs[NDIRECT] = iblk;
            }
            return self.bcache.with_block(ip.dev(), iblk, true, |bp| {
                let mut addr = get_u32(bp.data_ref(), bn);
                if addr == 0 {
                    addr = self.balloc(ip.dev());
                    put_u32(bp.data_mut(), bn, addr);
                    self.bcache.bwrite(bp);
                }
                addr
            });
        }
        panic!("bmap: out of range");
    }

    // Truncate an inode (discard its contents). Caller holds ip
    // exclusively. The block frees ride the reclamation domain so a
    // reader still holding a stale block pointer from an earlier lock
    // scope observes valid zeros until its section ends.
    pub fn itrunc(&self, ip: &Inode) {
        let dev = ip.dev();
        {
            let meta = ip.meta_mut();
            for addr in meta.addrs.iter_mut().take(NDIRECT) {
                if *addr != 0 {
                    self.icache.domain.defer(Garbage::Block(*addr));
                    *addr = 0;
                }
            }
            if meta.addrs[NDIRECT] != 0 {
                self.bcache.with_block(dev, meta.addrs[NDIRECT], false, |bp| {
                    for j in 0..NINDIRECT {
                        let addr = get_u32(bp.data_ref(), j);
                        if addr != 0 {
                            self.icache.domain.defer(Garbage::Block(addr));
                        }
                    }
                });
                self.icache.domain.defer(Garbage::Block(meta.addrs[NDIRECT]));
                meta.addrs[NDIRECT] = 0;
            }
            meta.size = 0;
        }
        self.iupdate(ip);
    }

    // Read data from an inode. Caller holds at least a shared lock.
    pub fn readi(&self, ip: &Inode, dst: &mut [u8], off: u32) -> Result<usize> {
        if ip.typ() == FileType::Dev {
            let Some(d) = self.devsw.get(ip.major()) else {
                return Err("readi: no device driver");
            };
            return d.read(dst);
        }
        let size = ip.size();
        if off > size {
            return Err("readi: offset beyond end of file");
        }
        if off as u64 + dst.len() as u64 > u32::MAX as u64 {
            return Err("readi: offset and length wrap");
        }
        let n = cmp::min(dst.len(), (size - off) as usize);
        let mut tot = 0;
        let mut off = off as usize;
        while tot < n {
            let addr = self.bmap(ip, (off / BSIZE) as u32);
            self.bcache.with_block(ip.dev(), addr, false, |bp| {
                let boff = off % BSIZE;
                let m = cmp::min(n - tot, BSIZE - boff);
                dst[tot..tot + m].copy_from_slice(&bp.data_ref()[boff..boff + m]);
                tot += m;
                off += m;
            });
        }
        Ok(n)
    }

    // Write data to an inode. Caller holds the inode exclusively.
    // Writes are clamped at the maximum file size; the returned count
    // may be short. Writing may only begin at or before the current
    // end of file (there are no holes).
    pub fn writei(&self, ip: &Inode, src: &[u8], off: u32) -> Result<usize> {
        if ip.typ() == FileType::Dev {
            let Some(d) = self.devsw.get(ip.major()) else {
                return Err("writei: no device driver");
            };
            return d.write(src);
        }
        let size = ip.size();
        if off > size {
            return Err("writei: offset beyond end of file");
        }
        if off as u64 + src.len() as u64 > u32::MAX as u64 {
            return Err("writei: offset and length wrap");
        }
        let n = cmp::min(src.len(), MAXFILE * BSIZE - off as usize);
        let mut tot = 0;
        let mut off = off as usize;
        while tot < n {
            let addr = self.bmap(ip, (off / BSIZE) as u32);
            self.bcache.with_block(ip.dev(), addr, true, |bp| {
                let boff = off % BSIZE;
                let m = cmp::min(n - tot, BSIZE - boff);
                bp.data_mut()[boff..boff + m].copy_from_slice(&src[tot..tot + m]);
                self.bcache.bwrite(bp);
                tot += m;
                off += m;
            });
        }
        if n > 0 && off > size as usize {
            ip.meta_mut().size = off as u32;
            self.iupdate(ip);
        }
        Ok(n)
    }

    // Directories.

    // Look for a directory entry in a directory. Caller holds dp
    // locked (shared is sufficient). If found, optionally report the
    // byte offset of the entry.
    pub fn dirlookup(&self, dp: &Inode, name: &[u8], poff: Option<&mut u32>) -> Option<Iref<'_>> {
        assert_eq!(dp.typ(), FileType::Dir, "dirlookup not DIR");
        let mut de = Dirent::default();
        for off in (0..dp.size()).step_by(DIRENT_SIZE) {
            let n = self.readi(dp, de.as_bytes_mut(), off).expect("dirlookup read");
            assert_eq!(n, DIRENT_SIZE, "dirlookup read");
            if de.inum == 0 {
                continue;
            }
            if namecmp(&de, name) {
                // Entry matches the path element.
                if let Some(poff) = poff {
                    *poff = off;
                }
                return Some(self.iget(dp.dev(), de.inum as u32));
            }
        }
        None
    }

    // Write a new directory entry (name, inum) into the directory dp.
    // Caller holds dp exclusively.
    pub fn dirlink(&self, dp: &Inode, name: &[u8], inum: u32) -> Result<()> {
        assert!(inum <= u16::MAX as u32, "dirlink: inum too large");
        // The name must not already be present.
        if let Some(ip) = self.dirlookup(dp, name, None) {
            drop(ip);
            return Err("dirlink: name already exists");
        }
        // Look for an empty slot, appending when there is none.
        let mut de = Dirent::default();
        let mut off = dp.size();
        for o in (0..dp.size()).step_by(DIRENT_SIZE) {
            let n = self.readi(dp, de.as_bytes_mut(), o).expect("dirlink read");
            assert_eq!(n, DIRENT_SIZE, "dirlink read");
            if de.inum == 0 {
                off = o;
                break;
            }
        }
        de = Dirent::default();
        let len = cmp::min(DIRSIZ, name.len());
        de.name[..len].copy_from_slice(&name[..len]);
        de.inum = inum as u16;
        let n = self.writei(dp, de.as_bytes(), off).expect("dirlink write");
        assert_eq!(n, DIRENT_SIZE, "dirlink write");
        Ok(())
    }

    // Is the directory dp empty except for "." and ".."?
    fn dir_is_empty(&self, dp: &Inode) -> bool {
        let mut de = Dirent::default();
        for off in ((2 * DIRENT_SIZE as u32)..dp.size()).step_by(DIRENT_SIZE) {
            let n = self.readi(dp, de.as_bytes_mut(), off).expect("dir_is_empty read");
            assert_eq!(n, DIRENT_SIZE, "dir_is_empty read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }

    // Name cache consultation. A hit resolves a path element without
    // touching the directory; generation mismatches mean the memo
    // outlived a free/reuse of either inode and are treated as
    // misses.
    fn nc_lookup(&self, dp: &Inode, name: &[u8]) -> Option<Iref<'_>> {
        let (child_inum, child_gen) = self.ncache.lookup(dp.inum(), dp.gen(), name)?;
        let ip = self.iget(dp.dev(), child_inum);
        if ip.gen() != child_gen {
            return None;
        }
        Some(ip)
    }

    fn nc_insert(&self, dp: &Inode, name: &[u8], child: &Iref<'_>) {
        self.ncache
            .insert(dp.inum(), dp.gen(), name, child.inum(), child.gen());
    }

    // Paths.

    // Look up and return the inode for a path name. In parent mode,
    // stop one level early and also return the final path element.
    fn namex<'s, 'p>(
        &'s self,
        path: &'p [u8],
        wantparent: bool,
        cwd: Option<&Iref<'s>>,
    ) -> Result<(Iref<'s>, &'p [u8])> {
        let mut ip = if path.first() == Some(&b'/') {
            self.iget(self.dev, ROOTINO)
        } else {
            match cwd {
                Some(cwd) => cwd.dup(),
                None => return Err("namex: no working directory"),
            }
        };
        let mut path = path;
        while let Some((name, rest)) = skipelem(path) {
            path = rest;
            let cached = if wantparent {
                None
            } else {
                self.nc_lookup(&ip, name)
            };
            let next = match cached {
                Some(next) => next,
                None => {
                    ip.ilock(false);
                    if ip.typ() == FileType::Unused {
                        // A held reference forbids freeing the slot.
                        panic!("namex");
                    }
                    if ip.typ() != FileType::Dir {
                        ip.iunlock();
                        return Err("namex: not a directory");
                    }
                    if wantparent && path.is_empty() {
                        // Stop one level early.
                        ip.iunlock();
                        return Ok((ip, name));
                    }
                    let child = match self.dirlookup(&ip, name, None) {
                        Some(child) => child,
                        None => {
                            ip.iunlock();
                            return Err("namex: no such file");
                        }
                    };
                    self.nc_insert(&ip, name, &child);
                    ip.iunlock();
                    child
                }
            };
            ip = next;
        }
        if wantparent {
            return Err("namex: no final element");
        }
        Ok((ip, path))
    }

    pub fn namei<'s>(&'s self, path: &[u8], cwd: Option<&Iref<'s>>) -> Result<Iref<'s>> {
        self.namex(path, false, cwd).map(|(ip, _)| ip)
    }

    pub fn namei_parent<'s, 'p>(
        &'s self,
        path: &'p [u8],
        cwd: Option<&Iref<'s>>,
    ) -> Result<(Iref<'s>, &'p [u8])> {
        self.namex(path, true, cwd)
    }

    // Directory-level compositions.

    // Create path as a new inode of the given kind, or hand back the
    // existing file when an open-style caller asks for a plain file
    // that already exists. Returns an unlocked, referenced inode.
    pub fn create<'s>(
        &'s self,
        path: &[u8],
        cwd: Option<&Iref<'s>>,
        typ: CreateType,
    ) -> Result<Iref<'s>> {
        let (dp, name) = self.namei_parent(path, cwd)?;
        dp.ilock(true);
        if let Some(ip) = self.dirlookup(&dp, name, None) {
            dp.iunlock();
            drop(dp);
            let compatible = ip.with_rlock(|i| {
                typ == CreateType::File
                    && (i.typ() == FileType::File || i.typ() == FileType::Dev)
            });
            if compatible {
                return Ok(ip);
            }
            return Err("create: path exists");
        }
        let ip = self.ialloc(dp.dev(), typ.filetype());
        {
            let meta = ip.meta_mut();
            if let CreateType::Dev(major, minor) = typ {
                meta.major = major;
                meta.minor = minor;
            }
            meta.nlink = 1;
        }
        self.iupdate(&ip);
        if typ == CreateType::Dir {
            // Create . and .. entries. No nlink bump for "." to avoid
            // a cyclic count; the parent gains one for "..".
            dp.nlink_inc();
            self.iupdate(&dp);
            self.dirlink(&ip, b".", ip.inum()).expect("create dot");
            self.dirlink(&ip, b"..", dp.inum()).expect("create dotdot");
        }
        self.dirlink(&dp, name, ip.inum()).expect("create link");
        dp.iunlock();
        ip.iunlock();
        Ok(ip)
    }

    // Create new as a link to the same inode as old.
    pub fn link(&self, old: &[u8], new: &[u8], cwd: Option<&Iref<'_>>) -> Result<()> {
        let ip = self.namei(old, cwd)?;
        if ip.with_rlock(|i| i.typ() == FileType::Dir) {
            return Err("link: directories cannot be linked");
        }
        // Publish the extra link count before the extra name.
        ip.with_wlock(|i| {
            i.nlink_inc();
            self.iupdate(i);
        });
        let linked = self.link_dir_entry(new, cwd, &ip);
        if linked.is_err() {
            ip.with_wlock(|i| {
                i.nlink_dec();
                self.iupdate(i);
            });
        }
        linked
    }

    fn link_dir_entry(&self, new: &[u8], cwd: Option<&Iref<'_>>, ip: &Iref<'_>) -> Result<()> {
        let (dp, name) = self.namei_parent(new, cwd)?;
        dp.ilock(true);
        let r = if dp.dev() != ip.dev() {
            Err("link: cross-device link")
        } else {
            self.dirlink(&dp, name, ip.inum())
        };
        dp.iunlock();
        r
    }

    // Remove a directory entry. The on-disk inode is freed later, by
    // the last reference drop, once its link count is zero.
    pub fn unlink(&self, path: &[u8], cwd: Option<&Iref<'_>>) -> Result<()> {
        let (dp, name) = self.namei_parent(path, cwd)?;
        if matches!(name, b"." | b"..") {
            return Err("unlink: cannot unlink . or ..");
        }
        dp.ilock(true);
        let mut off = 0;
        let Some(ip) = self.dirlookup(&dp, name, Some(&mut off)) else {
            dp.iunlock();
            return Err("unlink: no such file");
        };
        ip.ilock(true);
        assert!(ip.nlink() >= 1, "unlink: nlink < 1");
        if ip.typ() == FileType::Dir && !self.dir_is_empty(&ip) {
            ip.iunlock();
            dp.iunlock();
            return Err("unlink: directory not empty");
        }
        let de = Dirent::default();
        let n = self.writei(&dp, de.as_bytes(), off).expect("unlink write");
        assert_eq!(n, DIRENT_SIZE, "unlink write");
        self.ncache.remove(dp.inum(), name);
        if ip.typ() == FileType::Dir {
            // The child's ".." no longer pins the parent.
            dp.nlink_dec();
            self.iupdate(&dp);
        }
        dp.iunlock();
        drop(dp);
        ip.nlink_dec();
        self.iupdate(&ip);
        ip.iunlock();
        Ok(())
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        // Handles borrow the context, so none remain: everything
        // deferred or still cached can be destroyed directly, after
        // giving deferred block frees back to the bitmap.
        let mut blocks: alloc::vec::Vec<u32> = alloc::vec::Vec::new();
        self.icache.domain.drain_all(|garbage| match garbage {
            Garbage::Entry(Ip(p)) => unsafe { drop(Box::from_raw(p.as_ptr())) },
            Garbage::Node(NodePtr(p)) => unsafe { drop(Box::from_raw(p.as_ptr())) },
            Garbage::Block(b) => blocks.push(b),
        });
        for b in blocks {
            self.bfree(self.dev, b);
        }
        self.icache.ns.drain(|Ip(p)| unsafe { drop(Box::from_raw(p.as_ptr())) });
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreateType {
    File,
    Dir,
    Dev(u16, u16),
}

impl CreateType {
    fn filetype(self) -> FileType {
        match self {
            CreateType::File => FileType::File,
            CreateType::Dir => FileType::Dir,
            CreateType::Dev(..) => FileType::Dev,
        }
    }
}

// Get the next path element and the remainder of the path, which has
// no leading slashes, so the caller can check rest.is_empty() to see
// whether the name is the last element. An element of DIRSIZ or more
// bytes is truncated to exactly DIRSIZ, to be compared bounded.
//
// Examples:
//   skipelem(b"a/bb/c") = Some((b"a", b"bb/c"))
//   skipelem(b"///a//bb") = Some((b"a", b"bb"))
//   skipelem(b"a") = Some((b"a", b""))
//   skipelem(b"") = skipelem(b"////") = None
#[allow(clippy::or_fun_call)]
fn skipelem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|b| *b != b'/')?;
    let path = &path[start..];
    let end = path.iter().position(|b| *b == b'/').unwrap_or(path.len());
    let name = &path[..cmp::min(end, DIRSIZ)];
    let path = &path[end..];
    let next = path.iter().position(|b| *b != b'/').unwrap_or(path.len());
    Some((name, &path[next..]))
}

#[cfg(test)]
mod fs_tests {
    use super::*;
    use crate::mkfs;
    use crate::ramdisk::RamDisk;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    const NINODES: u32 = 150;

    fn fresh() -> (Arc<RamDisk>, Fs) {
        let disk = Arc::new(RamDisk::new(param::FSSIZE as u32));
        mkfs::mkfs(disk.clone(), param::FSSIZE as u32, NINODES).expect("mkfs");
        let fs = Fs::new(disk.clone()).expect("mount");
        (disk, fs)
    }

    fn bare(ninodes: u32) -> (Arc<RamDisk>, Fs) {
        let disk = Arc::new(RamDisk::new(param::FSSIZE as u32));
        mkfs::format(&*disk, param::FSSIZE as u32, ninodes);
        let fs = Fs::new(disk.clone()).expect("mount");
        (disk, fs)
    }

    fn raw_dinode(disk: &RamDisk, sb: &Superblock, inum: u32) -> DInode {
        let mut blk = [0u8; BSIZE];
        disk.read_block(sb.iblock(inum), &mut blk);
        let mut di = DInode::default();
        let off = (inum as usize % IPB) * DINODE_SIZE;
        di.as_bytes_mut().copy_from_slice(&blk[off..off + DINODE_SIZE]);
        di
    }

    #[test]
    fn superblock_geometry() {
        let (_disk, fs) = fresh();
        let sb = fs.superblock();
        assert_eq!(sb.size, param::FSSIZE as u32);
        assert_eq!(sb.ninodes, NINODES);
        assert_eq!(sb.nblocks, sb.size - sb.datastart());
        assert!(sb.datastart() > 2 + sb.ninodeblocks());
    }

    #[test]
    fn block_allocation_round_trips_the_bitmap() {
        let (disk, fs) = fresh();
        let b1 = fs.balloc(fs.dev());
        let b2 = fs.balloc(fs.dev());
        assert!(b2 > b1);
        // Dirty the block, then free it: freeing zeroes the contents
        // before it clears the bit.
        fs.bcache.with_block(fs.dev(), b1, true, |bp| {
            bp.data_mut().fill(0xff);
            fs.bcache.bwrite(bp);
        });
        fs.bfree(fs.dev(), b1);
        let mut blk = [0u8; BSIZE];
        disk.read_block(b1, &mut blk);
        assert_eq!(blk, [0u8; BSIZE]);
        // First fit hands the freed block right back.
        assert_eq!(fs.balloc(fs.dev()), b1);
    }

    #[test]
    #[should_panic(expected = "freeing free block")]
    fn double_free_is_fatal() {
        let (_disk, fs) = fresh();
        let b = fs.balloc(fs.dev());
        fs.bfree(fs.dev(), b);
        fs.bfree(fs.dev(), b);
    }

    #[test]
    fn every_on_disk_inode_is_allocatable() {
        let (_disk, fs) = bare(200);
        for want in 1..200u32 {
            let ip = fs.ialloc(fs.dev(), FileType::File);
            assert_eq!(ip.inum(), want);
            ip.nlink_inc();
            fs.iupdate(&ip);
            ip.iunlock();
        }
    }

    #[test]
    #[should_panic(expected = "ialloc: no inodes")]
    fn allocating_past_the_inode_table_is_fatal() {
        let (_disk, fs) = bare(200);
        for _ in 1..200u32 {
            let ip = fs.ialloc(fs.dev(), FileType::File);
            ip.nlink_inc();
            fs.iupdate(&ip);
            ip.iunlock();
        }
        let _ = fs.ialloc(fs.dev(), FileType::File);
    }

    #[test]
    fn metadata_reaches_the_disk_and_reloads() {
        let (disk, fs) = fresh();
        let ip = fs.ialloc(fs.dev(), FileType::File);
        let inum = ip.inum();
        ip.nlink_inc();
        fs.iupdate(&ip);
        assert_eq!(fs.writei(&ip, &[7u8; 1000], 0), Ok(1000));
        let gen0 = ip.gen();
        let addrs0 = ip.meta().addrs;
        ip.iunlock();
        drop(ip);

        let di = raw_dinode(&disk, fs.superblock(), inum);
        assert_eq!(di.typ, FileType::File as u16);
        assert_eq!(di.nlink, 1);
        assert_eq!(di.size, 1000);
        assert_eq!(di.gen, gen0);
        assert_eq!(di.addrs, addrs0);
        assert_ne!(di.addrs[0], 0);
        assert_ne!(di.addrs[1], 0);
        assert_eq!(di.addrs[2], 0);

        let again = fs.iget(fs.dev(), inum);
        again.with_rlock(|i| {
            assert_eq!(i.typ(), FileType::File);
            assert_eq!(i.nlink(), 1);
            assert_eq!(i.size(), 1000);
            assert_eq!(i.gen(), gen0);
            assert_eq!(i.meta().addrs, addrs0);
        });
    }

    #[test]
    fn file_contents_round_trip_through_the_indirect_block() {
        let (_disk, fs) = fresh();
        let ip = fs.ialloc(fs.dev(), FileType::File);
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.writei(&ip, &data, 0), Ok(8192));
        assert_eq!(ip.size(), 8192);
        {
            let meta = ip.meta();
            for k in 0..NDIRECT {
                assert_ne!(meta.addrs[k], 0);
            }
            assert_ne!(meta.addrs[NDIRECT], 0);
        }
        let mut back = vec![0u8; 8192];
        assert_eq!(fs.readi(&ip, &mut back, 0), Ok(8192));
        assert_eq!(back, data);

        // Unaligned span crossing block boundaries.
        let mut mid = [0u8; 600];
        assert_eq!(fs.readi(&ip, &mut mid, 300), Ok(600));
        assert_eq!(mid[..], data[300..900]);

        // Reads clamp at the end of the file; offsets beyond it are
        // rejected.
        let mut tail = [0u8; 100];
        assert_eq!(fs.readi(&ip, &mut tail, 8150), Ok(42));
        assert!(fs.readi(&ip, &mut tail, 9000).is_err());
        ip.iunlock();
    }

    #[test]
    fn writes_clamp_at_the_maximum_file_size() {
        let (_disk, fs) = fresh();
        let ip = fs.ialloc(fs.dev(), FileType::File);
        let data = vec![3u8; MAXFILE * BSIZE];
        assert_eq!(fs.writei(&ip, &data, 0), Ok(MAXFILE * BSIZE));
        assert_eq!(fs.writei(&ip, &[4u8; 16], (MAXFILE * BSIZE) as u32), Ok(0));
        ip.iunlock();
    }

    #[test]
    fn directory_links_are_unique() {
        let (_disk, fs) = fresh();
        let root = fs.namei(b"/", None).expect("root");
        root.ilock(true);
        assert!(fs.dirlink(&root, b"a", 3).is_ok());
        assert!(fs.dirlink(&root, b"a", 4).is_err());
        let mut off = 0;
        let found = fs.dirlookup(&root, b"a", Some(&mut off)).expect("lookup");
        assert_eq!(found.inum(), 3);
        // After "." and "..".
        assert_eq!(off, 2 * DIRENT_SIZE as u32);
        assert!(fs.dirlookup(&root, b"b", None).is_none());
        root.iunlock();
    }

    #[test]
    fn unlinked_inode_is_freed_on_last_drop() {
        let (disk, fs) = fresh();
        let ip = fs.ialloc(fs.dev(), FileType::File); // nlink stays 0
        let inum = ip.inum();
        let gen0 = ip.gen();
        assert_eq!(fs.writei(&ip, &[0x42u8; 1000], 0), Ok(1000));
        let first = ip.meta().addrs[0];
        assert_ne!(first, 0);
        ip.iunlock();
        drop(ip);
        fs.quiesce();

        let di = raw_dinode(&disk, fs.superblock(), inum);
        assert_eq!(di.typ, 0);
        assert_eq!(di.size, 0);
        assert_eq!(di.gen, gen0 + 1);
        assert_eq!(di.addrs, [0u32; NDIRECT + 1]);
        // The data blocks went back to the allocator.
        assert_eq!(fs.balloc(fs.dev()), first);
        // A fresh lookup observes the bumped generation.
        let again = fs.iget(fs.dev(), inum);
        assert_eq!(again.gen(), gen0 + 1);
    }

    #[test]
    fn concurrent_iget_shares_the_entry() {
        let (_disk, fs) = fresh();
        let (a, b) = std::thread::scope(|s| {
            let t1 = s.spawn(|| fs.iget(fs.dev(), 7));
            let t2 = s.spawn(|| fs.iget(fs.dev(), 7));
            (t1.join().unwrap(), t2.join().unwrap())
        });
        assert!(core::ptr::eq(&*a, &*b));
        assert_eq!(a.inum(), 7);
        assert_eq!(a.refcnt.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exclusive_lock_waits_for_shared() {
        let (_disk, fs) = fresh();
        let got = AtomicBool::new(false);
        let ip = fs.iget(fs.dev(), 5);
        ip.ilock(false);
        std::thread::scope(|s| {
            let ip2 = ip.dup();
            let got = &got;
            s.spawn(move || {
                ip2.ilock(true);
                got.store(true, Ordering::SeqCst);
                ip2.iunlock();
            });
            std::thread::sleep(Duration::from_millis(20));
            assert!(!got.load(Ordering::SeqCst));
            ip.iunlock();
        });
        assert!(got.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "iget: out of space")]
    fn cache_saturation_is_fatal() {
        let (_disk, fs) = fresh();
        let mut held = Vec::new();
        for inum in 1..=(param::NINODE as u32 + 1) {
            held.push(fs.iget(fs.dev(), inum));
        }
    }

    #[test]
    fn lookup_and_eviction_churn() {
        let (_disk, fs) = fresh();
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let fs = &fs;
                s.spawn(move || {
                    for i in 0..300u32 {
                        let inum = 2 + (i * 7 + t * 13) % 120;
                        let ip = fs.iget(fs.dev(), inum);
                        assert_eq!(ip.inum(), inum);
                        assert!(ip.iflags().contains(IFlags::VALID));
                    }
                });
            }
        });
        fs.quiesce();
    }

    #[test]
    fn paths_resolve_through_directories() {
        let (_disk, fs) = fresh();
        let d = fs.create(b"/d", None, CreateType::Dir).expect("mkdir");
        let f = fs.create(b"/d/f", None, CreateType::File).expect("mkfile");
        f.with_wlock(|i| fs.writei(i, b"hello", 0)).expect("write");

        let g = fs.namei(b"/d/f", None).expect("lookup");
        assert_eq!(g.inum(), f.inum());
        let mut buf = [0u8; 5];
        g.with_rlock(|i| fs.readi(i, &mut buf, 0)).expect("read");
        assert_eq!(&buf, b"hello");

        // Relative resolution against a working directory.
        let cwd = fs.namei(b"/d", None).expect("cwd");
        assert_eq!(cwd.inum(), d.inum());
        let rel = fs.namei(b"f", Some(&cwd)).expect("relative");
        assert_eq!(rel.inum(), f.inum());
        assert!(fs.namei(b"f", None).is_err());

        // Parent mode returns the directory and the final element.
        let (dp, last) = fs.namei_parent(b"/d/f", None).expect("parent");
        assert_eq!(dp.inum(), d.inum());
        assert_eq!(last, b"f");

        // Walking through a non-directory fails softly.
        assert!(fs.namei(b"/d/f/x", None).is_err());
        assert!(fs.namei(b"/missing", None).is_err());

        let st = fs.stati(&f);
        assert_eq!(st.typ, FileType::File);
        assert_eq!(st.nlink, 1);
        assert_eq!(st.size, 5);
        assert_eq!(st.ino, f.inum());
    }

    #[test]
    fn parent_mode_needs_a_final_element() {
        let (_disk, fs) = fresh();
        assert!(fs.namei_parent(b"/", None).is_err());
        assert!(fs.namei_parent(b"////", None).is_err());
        assert!(fs.namei(b"/", None).is_ok());
    }

    #[test]
    fn links_share_the_inode_until_the_last_name_goes() {
        let (disk, fs) = fresh();
        let f = fs.create(b"/f1", None, CreateType::File).expect("create");
        let inum = f.inum();
        f.with_wlock(|i| fs.writei(i, b"payload", 0)).expect("write");
        fs.link(b"/f1", b"/f2", None).expect("link");
        assert_eq!(fs.stati(&f).nlink, 2);
        // Directories may not be linked; duplicate names are refused.
        fs.create(b"/d", None, CreateType::Dir).expect("mkdir");
        assert!(fs.link(b"/d", b"/d2", None).is_err());
        assert!(fs.link(b"/f1", b"/f2", None).is_err());
        assert_eq!(fs.stati(&f).nlink, 2);

        fs.unlink(b"/f1", None).expect("unlink");
        assert!(fs.namei(b"/f1", None).is_err());
        let via2 = fs.namei(b"/f2", None).expect("second name");
        assert_eq!(via2.inum(), inum);
        assert_eq!(fs.stati(&via2).nlink, 1);

        drop(via2);
        drop(f);
        fs.unlink(b"/f2", None).expect("unlink last");
        fs.quiesce();
        let di = raw_dinode(&disk, fs.superblock(), inum);
        assert_eq!(di.typ, 0);
    }

    #[test]
    fn unlink_refuses_dot_and_nonempty_directories() {
        let (_disk, fs) = fresh();
        fs.create(b"/d", None, CreateType::Dir).expect("mkdir");
        fs.create(b"/d/f", None, CreateType::File).expect("mkfile");
        assert!(fs.unlink(b"/d/.", None).is_err());
        assert!(fs.unlink(b"/d/..", None).is_err());
        assert!(fs.unlink(b"/d", None).is_err());
        fs.unlink(b"/d/f", None).expect("unlink file");
        fs.unlink(b"/d", None).expect("unlink dir");
        assert!(fs.namei(b"/d", None).is_err());
    }

    #[test]
    fn overlong_path_elements_resolve_bounded() {
        let (_disk, fs) = fresh();
        let f = fs
            .create(b"/abcdefghijklmnopqrst", None, CreateType::File)
            .expect("create");
        // Only the first DIRSIZ bytes of an element participate.
        let g = fs.namei(b"/abcdefghijklmnWXYZ", None).expect("lookup");
        assert_eq!(g.inum(), f.inum());
    }

    struct SeqDev;

    impl crate::dev::DevIo for SeqDev {
        fn read(&self, dst: &mut [u8]) -> Result<usize> {
            for (i, b) in dst.iter_mut().enumerate() {
                *b = i as u8;
            }
            Ok(dst.len())
        }

        fn write(&self, src: &[u8]) -> Result<usize> {
            Ok(src.len())
        }
    }

    #[test]
    fn device_inodes_dispatch_to_the_driver() {
        let (_disk, fs) = fresh();
        let ip = fs
            .create(b"/dev0", None, CreateType::Dev(3, 1))
            .expect("mknod");
        let mut buf = [0u8; 8];
        // An unregistered major is a soft failure.
        assert!(ip.with_rlock(|i| fs.readi(i, &mut buf, 0)).is_err());
        fs.devsw().register(3, Arc::new(SeqDev));
        let n = ip.with_rlock(|i| fs.readi(i, &mut buf, 0)).expect("read");
        assert_eq!(n, 8);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(ip.with_rlock(|i| i.major()), 3);
        assert_eq!(ip.with_rlock(|i| i.minor()), 1);
    }
}
