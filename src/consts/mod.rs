//! 内核常量

pub mod fs;
