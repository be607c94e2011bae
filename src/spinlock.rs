//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。
//!
//! 缓冲区缓存的全局分配锁和每个哈希桶的锁都是自旋锁：持有时间极短，
//! 并且持有期间绝不能进行磁盘 I/O 或等待睡眠锁。
//!
//! 持有自旋锁期间本硬件线程的中断是关闭的（[`push_off`] / [`pop_off`]），
//! 时钟中断处理程序因此不会在同一硬件线程上抢占一个已持有的锁。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crate::process::{cpu_id, pop_off, push_off};

/// 没有任何硬件线程持有锁时 `holder` 的取值。
const NO_HOLDER: usize = usize::MAX;

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的硬件线程将在循环中等待，直到锁被释放。
/// 该锁还跟踪持有锁的硬件线程编号，用于检测同一线程的重入（重入必然死锁）。
///
/// # 类型参数
/// - `T`: 被保护的数据类型，可以是任意大小（`?Sized`）。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `holder`: 当前持有锁的硬件线程编号（`NO_HOLDER` 表示无人持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    holder: AtomicUsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            holder: AtomicUsize::new(NO_HOLDER),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 示例
    /// ```ignore
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// ```
    ///
    /// # Panics
    /// 当前硬件线程已经持有此锁时 panic。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 检查当前硬件线程是否持有此锁。
    ///
    /// # 返回值
    /// 未安装处理器钩子时无法区分硬件线程，只要锁被占用就返回 `true`。
    pub fn holding(&self) -> bool {
        if !self.lock.load(Ordering::Relaxed) {
            return false;
        }
        match cpu_id() {
            Some(id) => self.holder.load(Ordering::Relaxed) == id,
            None => true,
        }
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`关闭中断；
    /// 2. 能识别当前硬件线程时，检查是否已持有锁（重入必然死锁）；
    /// 3. 使用原子比较交换（CAS）忙等待获取锁；
    /// 4. 获取成功后设置内存屏障；
    /// 5. 记录当前硬件线程编号。
    fn acquire(&self) {
        push_off();
        let id = cpu_id();
        if id.is_some() && self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Relaxed).is_err() {
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.holder.store(id.unwrap_or(NO_HOLDER), Ordering::Relaxed);
    }

    /// 释放锁的核心实现（内部方法）。
    ///
    /// 此方法不直接对外暴露，通过守卫的`Drop`实现自动调用。
    /// 锁释放之后才调用`pop_off()`恢复中断状态。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 检查当前硬件线程是否持有守卫对应的锁，用于调试验证。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}
