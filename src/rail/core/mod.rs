//! 核心层（core）：寄存器存储、协议编解码、联锁逻辑与模式仲裁状态机，不做任何 IO。

pub mod automaton;
pub mod codec;
pub mod frame;
pub mod interlocking;
pub mod link;
pub mod model;
pub mod rewrite;
pub mod store;
