use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::hooks::{default_shutdown_command, DEFAULT_SHUTDOWN_DELAY_SECS};
use crate::invocation::DEFAULT_ENGINE;
use crate::orchestrator::RunSettings;
use crate::protocol::{ProtocolParser, ProtocolPatterns};
use crate::run_state::DEFAULT_ETA_WINDOW;

const DEFAULT_CONFIG_DIR_NAME: &str = "renderq";
const DEFAULT_CONFIG_FILE_NAME: &str = "renderq.yaml";
const DEFAULT_QUEUE_FILE_NAME: &str = "queue.json";
const DEFAULT_EXECUTABLE: &str = "blender";
const DEFAULT_WORK_DIR: &str = "work";
const DEFAULT_CACHE_FILE: &str = "cache.json";
const DEFAULT_ETA_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnComplete {
    #[default]
    Nothing,
    Shutdown,
}

/// Progress-pattern overrides; unset entries keep the built-in pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_switch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_confirmed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_saved: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_start: Option<String>,
}

impl PatternOverrides {
    pub fn apply(&self, base: ProtocolPatterns) -> ProtocolPatterns {
        ProtocolPatterns {
            project_switch: self.project_switch.clone().unwrap_or(base.project_switch),
            settings_confirmed: self
                .settings_confirmed
                .clone()
                .unwrap_or(base.settings_confirmed),
            tile_progress: self.tile_progress.clone().unwrap_or(base.tile_progress),
            frame_saved: self.frame_saved.clone().unwrap_or(base.frame_saved),
            frame_start: self.frame_start.clone().unwrap_or(base.frame_start),
        }
    }
}

/// The configuration file as written by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<OnComplete>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_window: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<PatternOverrides>,
}

/// Configuration with defaults applied and paths made absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub config_path: PathBuf,
    pub executable: PathBuf,
    pub engine: String,
    pub work_dir: PathBuf,
    pub cache_file: PathBuf,
    pub on_complete: OnComplete,
    pub shutdown_delay_secs: u64,
    pub shutdown_command: Vec<String>,
    pub wake_command: Option<Vec<String>>,
    pub eta_window: usize,
    pub eta_interval: Duration,
    pub patterns: ProtocolPatterns,
}

impl QueueConfig {
    pub fn run_settings(&self) -> RunSettings {
        let mut settings = RunSettings::new(&self.executable, &self.work_dir);
        settings.engine = self.engine.clone();
        settings.patterns = self.patterns.clone();
        settings.eta_window = self.eta_window;
        settings.eta_interval = self.eta_interval;
        settings
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let base = user_config_dir()?;
    Ok(base
        .join(DEFAULT_CONFIG_DIR_NAME)
        .join(DEFAULT_CONFIG_FILE_NAME))
}

pub fn resolve_config_path(config_override: Option<&Path>, launch_cwd: &Path) -> Result<PathBuf> {
    let raw = if let Some(path) = config_override {
        path.to_path_buf()
    } else {
        default_config_path()?
    };
    resolve_against_base_path(&raw, launch_cwd)
}

/// Queue save file location: the override, or `queue.json` next to the config.
pub fn resolve_queue_path(
    queue_override: Option<&Path>,
    config_path: &Path,
    launch_cwd: &Path,
) -> Result<PathBuf> {
    match queue_override {
        Some(path) => resolve_against_base_path(path, launch_cwd),
        None => Ok(config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_QUEUE_FILE_NAME)),
    }
}

pub fn load_config(config_path: &Path, launch_cwd: &Path) -> Result<QueueConfig> {
    let file = load_config_file(config_path)?;
    resolve_config(file, config_path, launch_cwd)
}

/// Reads the raw file. A missing or blank file is the all-defaults file.
pub fn load_config_file(config_path: &Path) -> Result<ConfigFile> {
    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "no config file, using defaults");
        return Ok(ConfigFile::default());
    }
    let config_text = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config at {}", config_path.display()))?;
    if config_text.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    let parsed: ConfigFile = serde_yaml::from_str(&config_text)
        .with_context(|| format!("failed to parse config yaml at {}", config_path.display()))?;
    Ok(parsed)
}

pub fn save_config_file(config_path: &Path, file: &ConfigFile) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let yaml = serde_yaml::to_string(file).context("failed to serialize config yaml")?;
    fs::write(config_path, yaml)
        .with_context(|| format!("failed to write config {}", config_path.display()))?;
    Ok(())
}

pub fn resolve_config(file: ConfigFile, config_path: &Path, launch_cwd: &Path) -> Result<QueueConfig> {
    let config_path = resolve_against_base_path(config_path, launch_cwd)?;
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let executable = resolve_executable(
        file.executable.as_deref().unwrap_or(DEFAULT_EXECUTABLE),
        &config_dir,
    )?;
    let engine = file
        .engine
        .map(|engine| engine.trim().to_owned())
        .filter(|engine| !engine.is_empty())
        .unwrap_or_else(|| DEFAULT_ENGINE.to_owned());
    let work_dir = resolve_string_path(
        file.work_dir.as_deref().unwrap_or(DEFAULT_WORK_DIR),
        &config_dir,
    )?;
    let cache_file = resolve_string_path(
        file.cache_file.as_deref().unwrap_or(DEFAULT_CACHE_FILE),
        &config_dir,
    )?;

    let shutdown_command = file
        .shutdown_command
        .unwrap_or_else(default_shutdown_command);
    if shutdown_command.is_empty() {
        bail!("shutdown_command must not be empty");
    }
    let wake_command = file.wake_command.filter(|command| !command.is_empty());

    let eta_window = file.eta_window.unwrap_or(DEFAULT_ETA_WINDOW);
    if eta_window == 0 {
        bail!("eta_window must be at least 1");
    }
    let eta_interval_ms = file.eta_interval_ms.unwrap_or(DEFAULT_ETA_INTERVAL_MS);
    if eta_interval_ms == 0 {
        bail!("eta_interval_ms must be at least 1");
    }

    let patterns = file
        .patterns
        .unwrap_or_default()
        .apply(ProtocolPatterns::default());
    ProtocolParser::new(&patterns)
        .map_err(|error| anyhow!("{error}"))
        .with_context(|| format!("invalid patterns in {}", config_path.display()))?;

    Ok(QueueConfig {
        config_path,
        executable,
        engine,
        work_dir,
        cache_file,
        on_complete: file.on_complete.unwrap_or_default(),
        shutdown_delay_secs: file
            .shutdown_delay_secs
            .unwrap_or(DEFAULT_SHUTDOWN_DELAY_SECS),
        shutdown_command,
        wake_command,
        eta_window,
        eta_interval: Duration::from_millis(eta_interval_ms),
        patterns,
    })
}

pub fn starter_config_file() -> ConfigFile {
    ConfigFile {
        executable: Some(String::from(DEFAULT_EXECUTABLE)),
        engine: Some(DEFAULT_ENGINE.to_owned()),
        work_dir: Some(String::from(DEFAULT_WORK_DIR)),
        cache_file: Some(String::from(DEFAULT_CACHE_FILE)),
        on_complete: Some(OnComplete::Nothing),
        shutdown_delay_secs: Some(DEFAULT_SHUTDOWN_DELAY_SECS),
        shutdown_command: None,
        wake_command: None,
        eta_window: Some(DEFAULT_ETA_WINDOW),
        eta_interval_ms: Some(DEFAULT_ETA_INTERVAL_MS),
        patterns: None,
    }
}

pub fn write_starter_config(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
    }
    save_config_file(config_path, &starter_config_file())
}

/// Bare program names are looked up on `PATH` at launch; anything that looks
/// like a path is resolved against the config directory.
fn resolve_executable(value: &str, base_dir: &Path) -> Result<PathBuf> {
    let value = value.trim();
    if value.is_empty() {
        bail!("executable must not be empty");
    }
    let looks_like_path =
        value.contains('/') || value.contains('\\') || value.starts_with('~');
    if looks_like_path {
        resolve_string_path(value, base_dir)
    } else {
        Ok(PathBuf::from(value))
    }
}

fn resolve_string_path(value: &str, base_dir: &Path) -> Result<PathBuf> {
    let expanded = expand_home(value)?;
    resolve_against_base_path(&expanded, base_dir)
}

fn resolve_against_base_path(path: &Path, base_dir: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    };
    let absolute = if joined.is_absolute() {
        joined
    } else {
        env::current_dir()
            .context("failed to resolve current directory")?
            .join(joined)
    };
    Ok(normalize_path(absolute))
}

fn expand_home(value: &str) -> Result<PathBuf> {
    if !value.starts_with('~') {
        return Ok(PathBuf::from(value));
    }

    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
        .ok_or_else(|| anyhow!("cannot resolve home directory for path '{value}'"))?;

    if value == "~" {
        return Ok(home);
    }

    if value.starts_with("~/") || value.starts_with("~\\") {
        return Ok(home.join(&value[2..]));
    }

    bail!("unsupported home path syntax: {value}")
}

fn normalize_path(path: PathBuf) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}

fn user_config_dir() -> Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        if let Some(path) = env::var_os("APPDATA") {
            return Ok(PathBuf::from(path));
        }
        if let Some(home) = env::var_os("USERPROFILE") {
            return Ok(PathBuf::from(home).join("AppData").join("Roaming"));
        }
        bail!("unable to resolve user config directory on Windows");
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = env::var_os("HOME") {
            return Ok(PathBuf::from(home)
                .join("Library")
                .join("Application Support"));
        }
        bail!("unable to resolve HOME for macOS config directory");
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        if let Some(path) = env::var_os("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(path));
        }
        if let Some(home) = env::var_os("HOME") {
            return Ok(PathBuf::from(home).join(".config"));
        }
        bail!("unable to resolve user config directory on unix");
    }
}
