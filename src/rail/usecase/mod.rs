//! 用例层（usecase）：把 core 与 adapters 组装成周期运行的任务。

pub mod injector;
pub mod plc_runtime;
pub mod simulator;
