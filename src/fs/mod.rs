//! 文件系统模块：缓冲区缓存层
//!
//! 上层（inode、日志）通过 [`Bcache::bread`]、[`Buf::bwrite`]、释放 [`Buf`]
//! 以及 [`Buf::pin`] / [`Buf::unpin`] 访问磁盘块。

use thiserror::Error;

mod bio;
mod bucket;

pub use bio::{Bcache, BcacheStat, Buf, BufData, BufFlags};

/// 缓冲区缓存的错误。
///
/// 除 `try_bread` 返回的 `CapacityExhausted` 外，这些错误都表示内部约束被破坏，
/// 在本层直接 panic，不会转换成用户可见的错误码。
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BioError {
    /// 分配时没有引用计数为 0 的缓冲块。
    #[error("no usable buffer")]
    CapacityExhausted,
    /// 调用者没有持有操作要求的锁或钉住（pin）。
    #[error("{0}")]
    LockMisuse(&'static str),
    /// 哈希桶链表的结构被破坏。
    #[error("bucket {bucket}: corrupted structure")]
    CorruptIndex { bucket: usize },
    /// 缓冲块不在任何一个桶中，或同时出现在多个桶中。
    #[error("buffer {index}: not in exactly one bucket")]
    LostBuffer { index: usize },
}
