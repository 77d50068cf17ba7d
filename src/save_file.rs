//! Versioned queue save file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::queue::RenderQueue;

pub const SAVE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveFile {
    pub version: u32,
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(flatten)]
    pub queue: RenderQueue,
}

impl SaveFile {
    pub fn new(executable: Option<PathBuf>, queue: RenderQueue) -> Self {
        Self {
            version: SAVE_FILE_VERSION,
            executable,
            queue,
        }
    }
}

/// Backup location: the save file name with `1` appended.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push("1");
    path.with_file_name(name)
}

/// Writes `file` to `path`, first moving any existing save to the backup.
pub fn save(path: &Path, file: &SaveFile) -> QueueResult<()> {
    let serialized = serde_json::to_string_pretty(file)
        .map_err(|error| QueueError::save_load(format!("failed to serialize queue: {error}")))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| QueueError::io(parent, error))?;
    }
    if path.exists() {
        let backup = backup_path(path);
        if backup.exists() {
            fs::remove_file(&backup).map_err(|error| QueueError::io(&backup, error))?;
        }
        fs::rename(path, &backup).map_err(|error| QueueError::io(&backup, error))?;
    }
    fs::write(path, format!("{serialized}\n")).map_err(|error| QueueError::io(path, error))
}

/// Reads a save file. Any failure leaves the file untouched and reports
/// [`QueueError::SaveLoad`].
pub fn load(path: &Path) -> QueueResult<SaveFile> {
    let text = fs::read_to_string(path).map_err(|error| {
        QueueError::save_load(format!("failed to read {}: {error}", path.display()))
    })?;
    let value: serde_json::Value = serde_json::from_str(&text).map_err(|error| {
        QueueError::save_load(format!("failed to parse {}: {error}", path.display()))
    })?;
    let version = value.get("version").and_then(serde_json::Value::as_u64);
    if version != Some(u64::from(SAVE_FILE_VERSION)) {
        return Err(QueueError::save_load(format!(
            "{} has unsupported version {}",
            path.display(),
            version
                .map(|version| version.to_string())
                .unwrap_or_else(|| String::from("(missing)"))
        )));
    }
    serde_json::from_value(value).map_err(|error| {
        QueueError::save_load(format!("failed to decode {}: {error}", path.display()))
    })
}

/// Loads the queue at `path`, or an empty one when there is none yet.
pub fn load_if_present(path: &Path) -> QueueResult<SaveFile> {
    if !path.exists() {
        return Ok(SaveFile::new(None, RenderQueue::default()));
    }
    load(path)
}

const SET_ASIDE_ATTEMPTS: u32 = 1000;

/// Renames a save file that could not be loaded to the first free
/// `<name>.unreadable[-N]` next to it and returns the new path.
pub fn set_aside(path: &Path) -> QueueResult<PathBuf> {
    let mut base = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    base.push(".unreadable");
    for attempt in 0..SET_ASIDE_ATTEMPTS {
        let mut name = base.clone();
        if attempt > 0 {
            name.push(format!("-{attempt}"));
        }
        let target = path.with_file_name(name);
        if target.exists() {
            continue;
        }
        fs::rename(path, &target).map_err(|error| QueueError::io(&target, error))?;
        return Ok(target);
    }
    Err(QueueError::save_load(format!(
        "no free name to set {} aside",
        path.display()
    )))
}
