//! 铁路 OT 实验台：core（纯逻辑）/ adapters（IO 与协议）/ usecase（周期任务编排）。

pub mod adapters;
pub mod core;
pub mod error;
pub mod usecase;
