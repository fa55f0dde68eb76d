//! 实验台配置文件（`LabConfigV1`）的读写。
//!
//! - 文件不存在：返回 `Ok(None)`，由调用方决定使用默认值
//! - 写入走 tmp 文件 + rename，避免半写文件
//! - `schemaVersion` 不是 1 时拒绝读写

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::rail::core::model::{LabConfigV1, SCHEMA_VERSION_V1};

pub const CONFIG_FILE_NAME: &str = "lab.v1.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported schemaVersion: {0}")]
    UnsupportedSchemaVersion(u32),
}

pub fn save_config(path: &Path, payload: &LabConfigV1) -> Result<(), StorageError> {
    if payload.schema_version != SCHEMA_VERSION_V1 {
        return Err(StorageError::UnsupportedSchemaVersion(
            payload.schema_version,
        ));
    }
    write_json_atomic(path, payload)
}

pub fn load_config(path: &Path) -> Result<Option<LabConfigV1>, StorageError> {
    read_json_optional::<LabConfigV1>(path).and_then(|opt| {
        if let Some(v) = &opt {
            if v.schema_version != SCHEMA_VERSION_V1 {
                return Err(StorageError::UnsupportedSchemaVersion(v.schema_version));
            }
        }
        Ok(opt)
    })
}

/// `None` path or missing file both fall back to defaults.
pub fn load_config_or_default(path: Option<&Path>) -> Result<LabConfigV1, StorageError> {
    match path {
        Some(path) => Ok(load_config(path)?.unwrap_or_default()),
        None => Ok(LabConfigV1::default()),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}
