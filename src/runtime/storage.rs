//! Filesystem persistence helpers and atomic write operations
//!
//! Writes go through a temp file, fsync and rename so a crash never leaves a
//! half-written config or store image behind.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use super::RuntimeConfig;
use super::store::{MemoryStore, StoreImage};

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
    }

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

    file.write_all(data).context("Failed to write data")?;
    file.sync_all().context("Failed to sync file")?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;
            dir.sync_all().context("Failed to sync directory")?;
        }
    }

    Ok(())
}

/// Write runtime configuration as pretty JSON
pub fn write_config(path: &Path, config: &RuntimeConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    write_atomic(path, &json)
}

/// Load runtime configuration
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let data = fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))?;
    let config: RuntimeConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    Ok(config)
}

/// Persist every object of a [`MemoryStore`]
pub fn save_store(path: &Path, store: &MemoryStore) -> Result<()> {
    let json = serde_json::to_vec(&store.image()).context("Failed to serialize store image")?;
    write_atomic(path, &json)
}

/// Load a [`MemoryStore`] saved with [`save_store`]
pub fn load_store(path: &Path) -> Result<MemoryStore> {
    let data = fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))?;
    let image: StoreImage =
        serde_json::from_slice(&data).context("Failed to deserialize store image")?;
    Ok(MemoryStore::from_image(image))
}
