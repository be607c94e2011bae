//! 时钟：为缓冲块提供近似 LRU 所需的时间戳

use core::num::Wrapping;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::spinlock::SpinLock;

/// 单调递增的时间来源。
///
/// 缓冲区缓存只把读数当作淘汰提示：两次读数相等或轻微乱序都是允许的，
/// 正确性只依赖“从不淘汰引用计数大于零的缓冲块”。
pub trait Clock: Sync {
    fn now(&self) -> u64;
}

/// 全局时钟计数器（自旋锁保护）
///
/// 持有自旋锁期间本硬件线程的中断是关闭的，时钟中断不会在读取者持锁时
/// 于同一硬件线程上再次获取它。
static TICKS: SpinLock<Wrapping<u64>> = SpinLock::new(Wrapping(0), "time");

/// 处理时钟中断（更新全局计数器）
///
/// 由时钟中断处理程序调用。缓冲区缓存在持有桶锁时读取时钟，
/// 此时中断已由桶锁关闭，处理程序只会在桶锁释放之后运行。
pub fn clock_intr() {
    let mut guard = TICKS.lock();
    *guard += Wrapping(1);
    drop(guard);
}

/// 读取当前时钟计数值
///
/// # 返回值
/// 系统启动以来的时钟周期数
pub fn clock_read() -> u64 {
    TICKS.lock().0
}

/// 以时钟中断计数作为时间戳，即内核默认的时间来源。
///
/// 同一个时钟周期内的多次访问得到相同的时间戳。
#[derive(Debug, Default, Clone, Copy)]
pub struct Ticks;

impl Clock for Ticks {
    fn now(&self) -> u64 {
        clock_read()
    }
}

/// 每次读取都加一的逻辑时钟，读数严格递增。
///
/// 没有时钟中断的环境（宿主机、测试）使用它，淘汰顺序因此是确定的。
#[derive(Debug, Default)]
pub struct LogicalClock(AtomicU64);

impl LogicalClock {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
