use crate::fs::DIRSIZ;
use crate::param;
use crate::spinlock::SpinMutex;

// The name cache memoises (directory, name) -> child lookups so the
// path walker can skip a directory scan, and often the directory
// lock, on hot paths. Entries carry the generation numbers of both
// inodes; a memo whose generations no longer match is stale (the
// on-disk slot was freed and reused) and is simply ignored. Negative
// results are not cached. Direct-mapped: an insert overwrites
// whatever hashed to its slot.
#[derive(Clone, Copy)]
struct NcEntry {
    valid: bool,
    dir_inum: u32,
    dir_gen: u32,
    name: [u8; DIRSIZ],
    namelen: u8,
    child_inum: u32,
    child_gen: u32,
}

impl NcEntry {
    const EMPTY: NcEntry = NcEntry {
        valid: false,
        dir_inum: 0,
        dir_gen: 0,
        name: [0; DIRSIZ],
        namelen: 0,
        child_inum: 0,
        child_gen: 0,
    };
}

pub struct NameCache {
    entries: SpinMutex<[NcEntry; param::NNC]>,
}

fn slot(dir_inum: u32, name: &[u8]) -> usize {
    let mut h = dir_inum as usize;
    for &b in name {
        h = h.wrapping_mul(31).wrapping_add(b as usize);
    }
    h % param::NNC
}

fn clamp(name: &[u8]) -> &[u8] {
    &name[..core::cmp::min(name.len(), DIRSIZ)]
}

impl NameCache {
    pub fn new() -> NameCache {
        NameCache {
            entries: SpinMutex::new("ncache", [NcEntry::EMPTY; param::NNC]),
        }
    }

    pub fn lookup(&self, dir_inum: u32, dir_gen: u32, name: &[u8]) -> Option<(u32, u32)> {
        let name = clamp(name);
        self.entries.with_lock(|entries| {
            let e = &entries[slot(dir_inum, name)];
            if e.valid
                && e.dir_inum == dir_inum
                && e.dir_gen == dir_gen
                && &e.name[..e.namelen as usize] == name
            {
                Some((e.child_inum, e.child_gen))
            } else {
                None
            }
        })
    }

    // Drop a memo when its directory entry goes away; generations
    // alone cannot catch an unlink that frees neither inode.
    pub fn remove(&self, dir_inum: u32, name: &[u8]) {
        let name = clamp(name);
        self.entries.with_lock(|entries| {
            let e = &mut entries[slot(dir_inum, name)];
            if e.valid && e.dir_inum == dir_inum && &e.name[..e.namelen as usize] == name {
                e.valid = false;
            }
        });
    }

    pub fn insert(
        &self,
        dir_inum: u32,
        dir_gen: u32,
        name: &[u8],
        child_inum: u32,
        child_gen: u32,
    ) {
        let name = clamp(name);
        let mut e = NcEntry {
            valid: true,
            dir_inum,
            dir_gen,
            name: [0; DIRSIZ],
            namelen: name.len() as u8,
            child_inum,
            child_gen,
        };
        e.name[..name.len()].copy_from_slice(name);
        self.entries
            .with_lock(|entries| entries[slot(dir_inum, name)] = e);
    }
}

impl Default for NameCache {
    fn default() -> NameCache {
        NameCache::new()
    }
}
