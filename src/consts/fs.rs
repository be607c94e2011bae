//! 文件系统与缓冲区缓存相关常量

/// 单次文件系统操作最多写入的块数
pub const MAXOPBLOCKS: usize = 10;

/// 缓冲区缓存中的缓冲块数量
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// 缓冲区缓存哈希桶的数量，取素数使 `(dev + blockno)` 分布均匀
pub const NBUCKET: usize = 13;

/// 磁盘块大小（字节）
pub const BSIZE: usize = 1024;

/// 每块包含的扇区数，磁盘驱动按 512 字节扇区寻址
pub const SECTORS_PER_BLOCK: usize = BSIZE / 512;
