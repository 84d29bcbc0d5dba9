use crate::dev::BlockDev;
use crate::fs::BSIZE;
use crate::spinlock::SpinMutex;
use alloc::vec;
use alloc::vec::Vec;

// A memory-backed block store, for kernels booted without a disk and
// for exercising the file system against in-memory state.
pub struct RamDisk {
    data: SpinMutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(nblocks: u32) -> RamDisk {
        RamDisk {
            data: SpinMutex::new("ramdisk", vec![0u8; nblocks as usize * BSIZE]),
        }
    }
}

impl BlockDev for RamDisk {
    fn read_block(&self, blockno: u32, data: &mut [u8]) {
        assert_eq!(data.len(), BSIZE, "ramdisk: short read buffer");
        let off = blockno as usize * BSIZE;
        self.data.with_lock(|blocks| {
            assert!(off + BSIZE <= blocks.len(), "ramdisk: read past end");
            data.copy_from_slice(&blocks[off..off + BSIZE]);
        });
    }

    fn write_block(&self, blockno: u32, data: &[u8]) {
        assert_eq!(data.len(), BSIZE, "ramdisk: short write buffer");
        let off = blockno as usize * BSIZE;
        self.data.with_lock(|blocks| {
            assert!(off + BSIZE <= blocks.len(), "ramdisk: write past end");
            blocks[off..off + BSIZE].copy_from_slice(data);
        });
    }
}
