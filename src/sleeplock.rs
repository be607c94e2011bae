//! 睡眠锁模块
//! 提供可能长时间持有的互斥锁，缓冲区的数据内容与磁盘 I/O 由它保护。
//!
//! 当锁被占用时，尝试获取锁的线程释放内部自旋锁并让出处理器，
//! 因此持有睡眠锁期间可以安全地进行阻塞的磁盘读写。

use core::ops::{Deref, DerefMut, Drop};
use core::cell::{Cell, UnsafeCell};

use crate::process::{cpu_id, relax};
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，等待者不会在持有任何自旋锁的情况下忙等，
/// 而是每次检查失败后释放内部自旋锁并通过 [`relax`] 让出处理器。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`holder`状态
/// - `locked`: 表示锁是否已被占用
/// - `holder`: 持有者的硬件线程编号，供 [`SleepLock::holding`] 使用
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    holder: Cell<Option<usize>>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据
    /// - `name`: 锁的标识名称
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            holder: Cell::new(None),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞当前线程）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁
    /// 2. 检查锁状态：
    ///   - 如果已锁定：释放内部自旋锁，让出处理器后重新检查
    ///   - 如果未锁定：设置`locked=true`并记录持有者
    /// 3. 释放内部自旋锁（因已设置locked状态）
    ///
    /// # 返回值
    /// `SleepLockGuard<T>`守卫对象，提供对内部数据的访问
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            drop(guard);
            relax();
            guard = self.lock.lock();
        }

        self.locked.set(true);
        self.holder.set(cpu_id());
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() }
        }
    }

    /// 锁的名称。
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 当前线程是否持有该睡眠锁。
    ///
    /// 未安装处理器钩子时持有者无法识别，只要锁被占用就返回 `true`。
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let holding = self.locked.get() && match cpu_id() {
            Some(id) => self.holder.get() == Some(id),
            None => true,
        };
        drop(guard);
        holding
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        self.holder.set(None);
        drop(guard);
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 当前线程是否持有守卫对应的睡眠锁。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
