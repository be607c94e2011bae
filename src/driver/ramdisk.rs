//! 内存盘：以内存模拟的块设备
//!
//! 每个设备号对应一段按扇区寻址的内存映像，首次访问时按需分配并清零。
//! 读写计数用来验证缓存命中时没有发生磁盘 I/O。

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::fs::{BSIZE, SECTORS_PER_BLOCK};
use crate::fs::BufData;
use crate::process::relax;
use crate::spinlock::SpinLock;
use super::BlockDevice;

const SECTOR_SIZE: usize = 512;

pub struct RamDisk {
    /// 每个设备的块数上限
    nblocks: u32,
    /// 设备号到磁盘映像的映射
    images: SpinLock<BTreeMap<u32, Vec<u8>>>,
    /// 每次传输前让出处理器的次数，用于模拟磁盘延迟
    latency: usize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    /// 创建每个设备含 `nblocks` 个块的内存盘。
    pub fn new(nblocks: u32) -> Self {
        Self {
            nblocks,
            images: SpinLock::new(BTreeMap::new(), "ramdisk"),
            latency: 0,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 每次传输前额外让出处理器 `latency` 次，用于放大并发测试中的竞争窗口。
    pub fn with_latency(mut self, latency: usize) -> Self {
        self.latency = latency;
        self
    }

    /// 已完成的读操作次数。
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 已完成的写操作次数。
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓存直接复制磁盘上的一个块，不计入读次数。
    pub fn copy_block(&self, dev: u32, blockno: u32, dst: &mut [u8]) {
        let offset = self.offset(blockno);
        let images = self.images.lock();
        match images.get(&dev) {
            Some(image) => dst.copy_from_slice(&image[offset..offset + BSIZE]),
            None => dst.fill(0),
        }
    }

    /// 块号对应的字节偏移，按扇区换算，与 virtio 磁盘的寻址方式一致。
    fn offset(&self, blockno: u32) -> usize {
        if blockno >= self.nblocks {
            panic!("ramdisk: blockno {} out of range", blockno);
        }
        let sector = blockno as usize * SECTORS_PER_BLOCK;
        sector * SECTOR_SIZE
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, data: &mut BufData, dev: u32, blockno: u32, writing: bool) {
        let offset = self.offset(blockno);

        // 模拟等待磁盘完成，期间不持有任何锁
        for _ in 0..self.latency {
            relax();
        }

        let mut images = self.images.lock();
        let image = images
            .entry(dev)
            .or_insert_with(|| vec![0; self.nblocks as usize * BSIZE]);
        let block = &mut image[offset..offset + BSIZE];
        if writing {
            block.copy_from_slice(&data[..]);
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            data.copy_from_slice(block);
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        drop(images);
    }
}
