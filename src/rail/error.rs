//! 顶层错误：usecase 入口把各层错误汇总成一个类型，二进制再包进 `anyhow`。

use thiserror::Error;

use crate::rail::adapters::proxy::GatewayError;
use crate::rail::adapters::storage::StorageError;
use crate::rail::core::link::LinkError;
use crate::rail::core::store::StoreError;

#[derive(Debug, Error)]
pub enum LabError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
