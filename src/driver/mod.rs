//! 设备驱动模块：缓冲区缓存所依赖的块设备接口

use crate::fs::BufData;

pub mod ramdisk;

/// 同步块设备。
///
/// 缓冲区缓存只在持有缓冲块睡眠锁、且不持有任何自旋锁时调用 `rw`；
/// 接口只接受 [`BufData`]，不接受任何自旋锁守卫。
pub trait BlockDevice: Sync {
    /// 执行一次块读写。
    ///
    /// # 参数
    /// - `data`: 块内容，读取时被覆盖，写入时作为源数据
    /// - `dev`: 设备号
    /// - `blockno`: 设备内的逻辑块号
    /// - `writing`: 操作类型（true=写，false=读）
    ///
    /// # 处理流程
    /// - 可能阻塞当前线程直到操作完成
    fn rw(&self, data: &mut BufData, dev: u32, blockno: u32, writing: bool);
}
