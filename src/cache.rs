use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Settings read out of a project file by the extraction script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub frame_start: i64,
    pub frame_end: i64,
    pub scene: String,
    #[serde(default)]
    pub scene_list: Vec<String>,
    #[serde(default)]
    pub camera: Option<String>,
    #[serde(default)]
    pub camera_list: Vec<String>,
    #[serde(default = "default_resolution_x")]
    pub resolution_x: u32,
    #[serde(default = "default_resolution_y")]
    pub resolution_y: u32,
    #[serde(default = "default_resolution_percentage")]
    pub resolution_percentage: u32,
    #[serde(default)]
    pub render_filepath: String,
    #[serde(default = "default_file_format")]
    pub file_format: String,
    #[serde(default)]
    pub use_persistent_data: bool,
    #[serde(default)]
    pub use_adaptive_sampling: bool,
    #[serde(default = "default_samples")]
    pub samples: u32,
    #[serde(default = "default_denoiser")]
    pub denoiser: String,
    #[serde(default)]
    pub denoising_use_gpu: bool,
    #[serde(default = "default_input_passes")]
    pub denoising_input_passes: String,
    #[serde(default = "default_prefilter")]
    pub denoising_prefilter: String,
    #[serde(default)]
    pub markers: Vec<i64>,
}

fn default_resolution_x() -> u32 {
    1920
}

fn default_resolution_y() -> u32 {
    1080
}

fn default_resolution_percentage() -> u32 {
    100
}

fn default_file_format() -> String {
    String::from("PNG")
}

fn default_samples() -> u32 {
    128
}

fn default_denoiser() -> String {
    String::from("OPENIMAGEDENOISE")
}

fn default_input_passes() -> String {
    String::from("RGB_ALBEDO_NORMAL")
}

fn default_prefilter() -> String {
    String::from("ACCURATE")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(flatten)]
    pub metadata: ProjectMetadata,
    pub mod_time: i64,
}

/// Extracted metadata keyed by absolute project path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataCache {
    entries: BTreeMap<String, CacheEntry>,
}

impl MetadataCache {
    /// Loads the cache file. A missing or blank file is an empty cache.
    pub fn try_load(path: &Path) -> QueueResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|error| {
            QueueError::cache_read(format!("failed to read {}: {error}", path.display()))
        })?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let entries = serde_json::from_str(&text).map_err(|error| {
            QueueError::cache_read(format!("failed to parse {}: {error}", path.display()))
        })?;
        Ok(Self { entries })
    }

    /// Moves an unreadable cache file to `<name>.bad`, replacing an older one.
    pub fn set_aside_unreadable(path: &Path) -> QueueResult<PathBuf> {
        let mut name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".bad");
        let target = path.with_file_name(name);
        if target.exists() {
            fs::remove_file(&target).map_err(|error| QueueError::io(&target, error))?;
        }
        fs::rename(path, &target).map_err(|error| QueueError::io(&target, error))?;
        Ok(target)
    }

    pub fn save(&self, path: &Path) -> QueueResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| QueueError::io(parent, error))?;
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|error| QueueError::cache_read(format!("failed to serialize cache: {error}")))?;
        fs::write(path, format!("{json}\n")).map_err(|error| QueueError::io(path, error))
    }

    pub fn entry(&self, file: &Path) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(file))
    }

    /// Returns the metadata only if it was recorded for `mod_time`.
    pub fn lookup(&self, file: &Path, mod_time: i64) -> Option<&ProjectMetadata> {
        self.entry(file)
            .filter(|entry| entry.mod_time == mod_time)
            .map(|entry| &entry.metadata)
    }

    pub fn insert(&mut self, file: &Path, metadata: ProjectMetadata, mod_time: i64) {
        self.entries
            .insert(cache_key(file), CacheEntry { metadata, mod_time });
    }

    pub fn remove(&mut self, file: &Path) -> Option<CacheEntry> {
        self.entries.remove(&cache_key(file))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when `file` is missing, uncached, or changed since it was cached.
    pub fn is_outdated(&self, file: &Path) -> bool {
        let Some(current) = file_mod_time(file) else {
            return true;
        };
        self.lookup(file, current).is_none()
    }
}

fn cache_key(file: &Path) -> String {
    file.to_string_lossy().replace('\\', "/")
}

/// Whole-second modification time, or `None` when the file cannot be read.
pub fn file_mod_time(file: &Path) -> Option<i64> {
    let modified = fs::metadata(file).ok()?.modified().ok()?;
    let seconds = match modified.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(error) => -(error.duration().as_secs() as i64),
    };
    Some(seconds)
}

/// Absolute form of `file` used as the project identity.
pub fn absolute_project_path(file: &Path) -> QueueResult<PathBuf> {
    if file.is_absolute() {
        return Ok(file.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|error| QueueError::io(Path::new("."), error))?;
    Ok(cwd.join(file))
}

#[cfg(test)]
pub(crate) fn sample_metadata() -> ProjectMetadata {
    ProjectMetadata {
        frame_start: 1,
        frame_end: 10,
        scene: String::from("Scene"),
        scene_list: vec![String::from("Scene"), String::from("Alt")],
        camera: Some(String::from("Camera")),
        camera_list: vec![String::from("Camera"), String::from("Camera.001")],
        resolution_x: 1920,
        resolution_y: 1080,
        resolution_percentage: 100,
        render_filepath: String::from("/tmp/render/out_####"),
        file_format: String::from("PNG"),
        use_persistent_data: false,
        use_adaptive_sampling: true,
        samples: 128,
        denoiser: String::from("OPENIMAGEDENOISE"),
        denoising_use_gpu: false,
        denoising_input_passes: String::from("RGB_ALBEDO_NORMAL"),
        denoising_prefilter: String::from("ACCURATE"),
        markers: vec![5, 1, 8],
    }
}
