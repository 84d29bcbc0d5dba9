use crate::dev::BlockDev;
use crate::fs::{Fs, Superblock, BPB, BSIZE, ROOTINO};
use crate::Result;
use alloc::sync::Arc;
use core::mem;
use syslib::stat::FileType;
use zerocopy::AsBytes;

// Lay down an empty file system: superblock, zeroed inode table and
// data area, and a bitmap with the metadata blocks marked in use.
// Leaves every on-disk inode free; mkfs adds the root directory.
pub fn format(dev: &dyn BlockDev, size: u32, ninodes: u32) {
    assert!(
        ninodes > 0 && ninodes <= u16::MAX as u32,
        "format: bad inode count"
    );
    let mut sb = Superblock {
        size,
        nblocks: 0,
        ninodes,
    };
    let meta = sb.datastart();
    assert!(meta < size, "format: device too small");
    sb.nblocks = size - meta;

    let zero = [0u8; BSIZE];
    for b in 0..size {
        dev.write_block(b, &zero);
    }

    let mut block = [0u8; BSIZE];
    block[..mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
    dev.write_block(1, &block);

    // The boot block, superblock, inode table, and the bitmap itself
    // are permanently in use.
    for bb in 0..sb.nbitmapblocks() {
        let mut bits = [0u8; BSIZE];
        let base = bb * BPB as u32;
        let mut bi = 0u32;
        while bi < BPB as u32 && base + bi < meta {
            bits[(bi / 8) as usize] |= 1 << (bi % 8);
            bi += 1;
        }
        dev.write_block(sb.bblock(base), &bits);
    }
}

// Format the device and build the root directory.
pub fn mkfs(driver: Arc<dyn BlockDev>, size: u32, ninodes: u32) -> Result<()> {
    format(&*driver, size, ninodes);
    let fs = Fs::new(driver)?;
    let root = fs.ialloc(fs.dev(), FileType::Dir);
    assert_eq!(root.inum(), ROOTINO, "mkfs: root is not the first inode");
    root.nlink_inc();
    fs.iupdate(&root);
    fs.dirlink(&root, b".", root.inum()).expect("mkfs: dot");
    fs.dirlink(&root, b"..", root.inum()).expect("mkfs: dotdot");
    root.iunlock();
    drop(root);
    fs.quiesce();
    Ok(())
}

#[cfg(test)]
mod mkfs_tests {
    use super::{format, mkfs};
    use crate::fs::{Fs, ROOTINO};
    use crate::ramdisk::RamDisk;
    use std::sync::Arc;
    use syslib::stat::FileType;

    #[test]
    fn format_marks_metadata_in_use() {
        let disk = Arc::new(RamDisk::new(512));
        format(&*disk, 512, 30);
        let fs = Fs::new(disk).expect("mount");
        // The first allocatable block is the first data block.
        assert_eq!(fs.balloc(fs.dev()), fs.superblock().datastart());
    }

    #[test]
    fn mkfs_builds_a_mountable_root() {
        let disk = Arc::new(RamDisk::new(2048));
        mkfs(disk.clone(), 2048, 100).expect("mkfs");
        let fs = Fs::new(disk).expect("mount");
        let root = fs.namei(b"/", None).expect("root");
        assert_eq!(root.inum(), ROOTINO);
        root.with_rlock(|r| {
            assert_eq!(r.typ(), FileType::Dir);
            assert_eq!(r.nlink(), 1);
            let dot = fs.dirlookup(r, b".", None).expect("dot");
            assert_eq!(dot.inum(), ROOTINO);
            let dotdot = fs.dirlookup(r, b"..", None).expect("dotdot");
            assert_eq!(dotdot.inum(), ROOTINO);
        });
    }

    #[test]
    #[should_panic(expected = "format: device too small")]
    fn tiny_devices_are_rejected() {
        let disk = RamDisk::new(4);
        format(&disk, 4, 30);
    }
}
