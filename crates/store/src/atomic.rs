// crates/store/src/atomic.rs
//! Write-to-temp-then-rename primitives.
//!
//! Every record mutation in this crate is a whole-file atomic replacement:
//! serialize next to the target, `fs::rename` into place. A crash mid-write
//! leaves either the old record or the new one, never a torn file.

use genedetect_core::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Atomically replace `path` with the JSON serialization of `value`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|e| StoreError::MalformedRecord {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    write_bytes(path, &data)
}

/// Atomically replace `path` with `data`.
pub fn write_bytes(path: &Path, data: &[u8]) -> StoreResult<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, data).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

/// Read and deserialize a JSON record. `Ok(None)` when the file is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| StoreError::MalformedRecord {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
