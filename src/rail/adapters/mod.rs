//! 适配器层（adapters）：TCP server/proxy、远端 link、遥测与配置文件。

pub mod link;
pub mod proxy;
pub mod server;
pub mod storage;
pub mod telemetry;
