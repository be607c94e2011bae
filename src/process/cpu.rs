//! 硬件线程（hart）标识、中断嵌套与让出原语

use core::hint;

/// 由宿主内核在启动阶段安装的处理器钩子。
///
/// 自旋锁用 `cpu_id` 记录持有者以检测重入，并在持有期间通过
/// `push_off`/`pop_off` 关闭本硬件线程的中断；睡眠锁在等待时调用 `relax`
/// 让出处理器。内核中 `cpu_id` 通常读取 `tp` 寄存器，`push_off`/`pop_off`
/// 维护每个 CPU 的关中断嵌套计数，`relax` 可以是一次 `yield`。
#[derive(Clone, Copy)]
pub struct CpuHooks {
    /// 返回当前硬件线程的编号，不同线程必须互不相同。
    pub cpu_id: fn() -> usize,
    /// 等待锁时调用一次。
    pub relax: fn(),
    /// 关闭本硬件线程的中断，可以嵌套。
    pub push_off: fn(),
    /// 撤销一次 `push_off`，嵌套全部撤销后才恢复中断。
    pub pop_off: fn(),
}

static mut HOOKS: Option<CpuHooks> = None;

/// 安装处理器钩子。
///
/// # 安全性
/// 必须在启动阶段、其他硬件线程开始使用任何锁之前调用，且只调用一次。
pub unsafe fn install(hooks: CpuHooks) {
    HOOKS = Some(hooks);
}

/// 当前生效的钩子。
///
/// 未安装时，测试构建使用宿主线程模拟的钩子；其他构建返回 `None`，
/// 此时硬件线程无法区分，也没有可以屏蔽的中断。
fn hooks() -> Option<CpuHooks> {
    // 只在启动阶段写入一次，此后只读
    match unsafe { HOOKS } {
        Some(hooks) => Some(hooks),
        None => DEFAULT_HOOKS,
    }
}

/// 返回当前硬件线程的编号。
///
/// # 返回值
/// 未安装钩子时返回 `None`：锁无法识别持有者，重入检查因此被跳过。
#[inline]
pub fn cpu_id() -> Option<usize> {
    hooks().map(|h| (h.cpu_id)())
}

/// 在等待锁的循环中让出处理器。
#[inline]
pub fn relax() {
    match hooks() {
        Some(h) => (h.relax)(),
        None => hint::spin_loop(),
    }
}

/// 关闭中断（可嵌套），由自旋锁在获取前调用。
#[inline]
pub fn push_off() {
    if let Some(h) = hooks() {
        (h.push_off)();
    }
}

/// 撤销一次 [`push_off`]，由自旋锁在释放后调用。
#[inline]
pub fn pop_off() {
    if let Some(h) = hooks() {
        (h.pop_off)();
    }
}

#[cfg(not(test))]
const DEFAULT_HOOKS: Option<CpuHooks> = None;

// 测试构建运行在宿主机上：每个宿主线程视为一个硬件线程
#[cfg(test)]
const DEFAULT_HOOKS: Option<CpuHooks> = Some(CpuHooks {
    cpu_id: host::cpu_id,
    relax: host::relax,
    push_off: host::push_off,
    pop_off: host::pop_off,
});
