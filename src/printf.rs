//! 定义内核的输出方法
//!
//! 缓冲区缓存本身不拥有串口，输出经由启动阶段注册的控制台函数完成。
//! 未注册控制台时输出被丢弃；测试构建下回退到宿主机的标准输出。

use core::fmt;

use crate::spinlock::SpinLock;

/// 控制台写函数，由宿主内核在启动阶段注册。
static CONSOLE: SpinLock<Option<fn(&str)>> = SpinLock::new(None, "console");

/// 注册控制台写函数，之后的 `print!` / `println!` 都写到这里。
pub fn set_console(write: fn(&str)) {
    *CONSOLE.lock() = Some(write);
}

/// 打印结构体，持有 `PRINT` 锁时使用。
struct Print(Option<fn(&str)>);

impl fmt::Write for Print {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match self.0 {
            Some(write) => write(s),
            None => fallback(s),
        }
        Ok(())
    }
}

#[cfg(not(test))]
fn fallback(_s: &str) {}

#[cfg(test)]
fn fallback(s: &str) {
    std::print!("{}", s);
}

/// 核心打印函数（被宏调用）
///
/// 使用自旋锁保证多核输出时一行不会被其他核打断。
///
/// # 注意
/// 此函数被声明为pub，因为需要在宏中调用
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    let console = *CONSOLE.lock();
    let guard = PRINT.lock();
    // Print 自身从不返回错误
    let _ = Print(console).write_fmt(args);
    drop(guard);
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}
