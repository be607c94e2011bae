//! xv6 风格的块缓冲区缓存
//!
//! 缓冲区缓存以多个哈希桶分片，命中只锁一个桶，未命中时在全局分配锁下跨桶淘汰。
//! 本 crate 不依赖宿主操作系统：硬件线程编号与让出处理器的方式由
//! [`process::cpu::install`] 注入，日志输出由 [`printf::set_console`] 注入。

#![no_std]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
pub mod printf;

pub mod clock;
pub mod consts;
pub mod driver;
pub mod fs;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

pub use clock::{Clock, LogicalClock, Ticks};
pub use driver::BlockDevice;
pub use driver::ramdisk::RamDisk;
pub use fs::{Bcache, BcacheStat, BioError, Buf, BufData, BufFlags};
