//! 处理器相关的运行环境
//!
//! 缓冲区缓存不依赖进程表与调度器，只需要知道“当前是哪个硬件线程”、
//! 如何屏蔽中断以及等待时如何让出处理器，这些由 [`cpu`] 提供。

pub mod cpu;

pub use cpu::{CpuHooks, cpu_id, pop_off, push_off, relax};
