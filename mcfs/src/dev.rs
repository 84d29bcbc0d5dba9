use crate::param;
use crate::spinlock::SpinMutex;
use crate::Result;
use alloc::sync::Arc;

// A block-addressed backing store. The buffer cache is the only
// caller; everything above it works in cached blocks. Out-of-range
// accesses are corruption and panic in the implementation.
pub trait BlockDev: Send + Sync {
    fn read_block(&self, blockno: u32, data: &mut [u8]);
    fn write_block(&self, blockno: u32, data: &[u8]);
}

// Capability record for a device file. readi/writei on a T_DEV inode
// dispatch here by major number.
pub trait DevIo: Send + Sync {
    fn read(&self, dst: &mut [u8]) -> Result<usize>;
    fn write(&self, src: &[u8]) -> Result<usize>;
}

// The device switch: an indexed table of DevIo records. Drivers
// register at init; lookup is the only dispatch.
pub struct DevSw {
    devs: SpinMutex<[Option<Arc<dyn DevIo>>; param::NDEV]>,
}

impl DevSw {
    pub fn new() -> DevSw {
        DevSw {
            devs: SpinMutex::new("devsw", [const { None }; param::NDEV]),
        }
    }

    pub fn register(&self, major: u16, dev: Arc<dyn DevIo>) {
        assert!((major as usize) < param::NDEV, "devsw: bad major");
        self.devs.with_lock(|devs| devs[major as usize] = Some(dev.clone()));
    }

    pub fn get(&self, major: u16) -> Option<Arc<dyn DevIo>> {
        if major as usize >= param::NDEV {
            return None;
        }
        self.devs.with_lock(|devs| devs[major as usize].clone())
    }
}

impl Default for DevSw {
    fn default() -> DevSw {
        DevSw::new()
    }
}
