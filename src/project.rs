use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::{MetadataCache, ProjectMetadata};
use crate::error::{QueueError, QueueResult};
use crate::frame_spec::{self, Frame, FrameSet};
use crate::settings::{
    allowed_strings, FileFormat, Overridable, DENOISERS, DENOISING_INPUT_PASSES,
    DENOISING_PREFILTERS, FILE_FORMATS,
};

const DEFAULT_PAD_WIDTH: usize = 4;
/// Prefix marking a path as relative to the project file's directory.
const PROJECT_RELATIVE_PREFIX: &str = "//";

/// Queue-wide switches that change which frames a project renders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderModes {
    /// Skip frames whose output file already exists.
    #[serde(default)]
    pub selective: bool,
    /// Render the project's marker frames instead of its frame range.
    #[serde(default)]
    pub markers: bool,
}

/// Settings exposed for per-project overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    Frames,
    Scene,
    Camera,
    RenderFilepath,
    FileFormat,
    ResolutionX,
    ResolutionY,
    ResolutionPercentage,
    UsePersistentData,
    UseAdaptiveSampling,
    Samples,
    Denoiser,
    DenoisingUseGpu,
    DenoisingInputPasses,
    DenoisingPrefilter,
}

impl SettingField {
    pub const ALL: [SettingField; 15] = [
        SettingField::Frames,
        SettingField::Scene,
        SettingField::Camera,
        SettingField::RenderFilepath,
        SettingField::FileFormat,
        SettingField::ResolutionX,
        SettingField::ResolutionY,
        SettingField::ResolutionPercentage,
        SettingField::UsePersistentData,
        SettingField::UseAdaptiveSampling,
        SettingField::Samples,
        SettingField::Denoiser,
        SettingField::DenoisingUseGpu,
        SettingField::DenoisingInputPasses,
        SettingField::DenoisingPrefilter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Frames => "frames",
            Self::Scene => "scene",
            Self::Camera => "camera",
            Self::RenderFilepath => "render_filepath",
            Self::FileFormat => "file_format",
            Self::ResolutionX => "resolution_x",
            Self::ResolutionY => "resolution_y",
            Self::ResolutionPercentage => "resolution_percentage",
            Self::UsePersistentData => "use_persistent_data",
            Self::UseAdaptiveSampling => "use_adaptive_sampling",
            Self::Samples => "samples",
            Self::Denoiser => "denoiser",
            Self::DenoisingUseGpu => "denoising_use_gpu",
            Self::DenoisingInputPasses => "denoising_input_passes",
            Self::DenoisingPrefilter => "denoising_prefilter",
        }
    }
}

impl fmt::Display for SettingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingField {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        SettingField::ALL
            .into_iter()
            .find(|field| field.as_str() == normalized)
            .ok_or_else(|| {
                QueueError::validation(format!(
                    "unknown setting '{value}' (expected one of: {})",
                    SettingField::ALL
                        .iter()
                        .map(|field| field.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// One row of a project's settings table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingRow {
    pub field: SettingField,
    pub base: String,
    pub override_value: Option<String>,
    pub resolved: String,
}

/// Everything the renderer needs to know about one project, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub scene: String,
    pub camera: String,
    pub render_filepath: String,
    pub file_format: FileFormat,
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub resolution_percentage: u32,
    pub use_persistent_data: bool,
    pub use_adaptive_sampling: bool,
    pub samples: u32,
    pub denoiser: String,
    pub denoising_use_gpu: bool,
    pub denoising_input_passes: String,
    pub denoising_prefilter: String,
}

/// A project file queued for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub file: PathBuf,
    #[serde(default = "default_active")]
    pub active: bool,
    pub frames: Overridable<String>,
    pub scene: Overridable<String>,
    #[serde(default)]
    pub scene_list: Vec<String>,
    pub camera: Overridable<String>,
    #[serde(default)]
    pub camera_list: Vec<String>,
    pub render_filepath: Overridable<String>,
    pub file_format: Overridable<String>,
    pub resolution_x: Overridable<u32>,
    pub resolution_y: Overridable<u32>,
    pub resolution_percentage: Overridable<u32>,
    pub use_persistent_data: Overridable<bool>,
    pub use_adaptive_sampling: Overridable<bool>,
    pub samples: Overridable<u32>,
    pub denoiser: Overridable<String>,
    pub denoising_use_gpu: Overridable<bool>,
    pub denoising_input_passes: Overridable<String>,
    pub denoising_prefilter: Overridable<String>,
    #[serde(default)]
    pub markers: Vec<i64>,
    #[serde(default)]
    pub mod_time: i64,
}

fn default_active() -> bool {
    true
}

impl Project {
    pub fn from_metadata(file: PathBuf, metadata: &ProjectMetadata, mod_time: i64) -> Self {
        Self {
            file,
            active: true,
            frames: Overridable::new(format!(
                "{}-{}",
                metadata.frame_start, metadata.frame_end
            )),
            scene: Overridable::new(metadata.scene.clone()),
            scene_list: metadata.scene_list.clone(),
            camera: Overridable::from_option(metadata.camera.clone()),
            camera_list: metadata.camera_list.clone(),
            render_filepath: Overridable::new(metadata.render_filepath.clone()),
            file_format: Overridable::new(metadata.file_format.clone()),
            resolution_x: Overridable::new(metadata.resolution_x),
            resolution_y: Overridable::new(metadata.resolution_y),
            resolution_percentage: Overridable::new(metadata.resolution_percentage),
            use_persistent_data: Overridable::new(metadata.use_persistent_data),
            use_adaptive_sampling: Overridable::new(metadata.use_adaptive_sampling),
            samples: Overridable::new(metadata.samples),
            denoiser: Overridable::new(metadata.denoiser.clone()),
            denoising_use_gpu: Overridable::new(metadata.denoising_use_gpu),
            denoising_input_passes: Overridable::new(metadata.denoising_input_passes.clone()),
            denoising_prefilter: Overridable::new(metadata.denoising_prefilter.clone()),
            markers: metadata.markers.clone(),
            mod_time,
        }
    }

    /// Replaces every base value with freshly extracted metadata. Overrides
    /// and the active flag are kept.
    pub fn refresh(&mut self, metadata: &ProjectMetadata, mod_time: i64) {
        let fresh = Project::from_metadata(self.file.clone(), metadata, mod_time);
        self.frames.set_base(fresh.frames.base);
        self.scene.set_base(fresh.scene.base);
        self.scene_list = fresh.scene_list;
        self.camera.set_base(fresh.camera.base);
        self.camera_list = fresh.camera_list;
        self.render_filepath.set_base(fresh.render_filepath.base);
        self.file_format.set_base(fresh.file_format.base);
        self.resolution_x.set_base(fresh.resolution_x.base);
        self.resolution_y.set_base(fresh.resolution_y.base);
        self.resolution_percentage
            .set_base(fresh.resolution_percentage.base);
        self.use_persistent_data
            .set_base(fresh.use_persistent_data.base);
        self.use_adaptive_sampling
            .set_base(fresh.use_adaptive_sampling.base);
        self.samples.set_base(fresh.samples.base);
        self.denoiser.set_base(fresh.denoiser.base);
        self.denoising_use_gpu.set_base(fresh.denoising_use_gpu.base);
        self.denoising_input_passes
            .set_base(fresh.denoising_input_passes.base);
        self.denoising_prefilter
            .set_base(fresh.denoising_prefilter.base);
        self.markers = fresh.markers;
        self.mod_time = mod_time;
    }

    pub fn frames(&self) -> String {
        self.frames.resolved().unwrap_or_default()
    }

    pub fn scene(&self) -> Option<String> {
        self.scene.resolved_in(&self.scene_list)
    }

    pub fn camera(&self) -> Option<String> {
        self.camera.resolved_in(&self.camera_list)
    }

    pub fn render_filepath(&self) -> String {
        self.render_filepath.resolved().unwrap_or_default()
    }

    pub fn file_format_name(&self) -> String {
        self.file_format.resolved().unwrap_or_default()
    }

    pub fn file_format(&self) -> QueueResult<FileFormat> {
        let name = self.file_format_name();
        FileFormat::from_name(&name).ok_or(QueueError::UnknownFormat(name))
    }

    pub fn samples(&self) -> u32 {
        self.samples.resolved().unwrap_or(1).max(1)
    }

    pub fn denoiser(&self) -> String {
        self.denoiser
            .resolved_in(&allowed_strings(DENOISERS))
            .unwrap_or_default()
    }

    pub fn denoising_input_passes(&self) -> String {
        self.denoising_input_passes
            .resolved_in(&allowed_strings(DENOISING_INPUT_PASSES))
            .unwrap_or_default()
    }

    pub fn denoising_prefilter(&self) -> String {
        self.denoising_prefilter
            .resolved_in(&allowed_strings(DENOISING_PREFILTERS))
            .unwrap_or_default()
    }

    /// Markers as a frame spec, in their stored order.
    pub fn markers_spec(&self) -> String {
        self.markers
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Collects every value the renderer needs. Fails when the project has no
    /// camera or names an unknown output format.
    pub fn resolved_settings(&self) -> QueueResult<ResolvedSettings> {
        let camera = self.camera().ok_or_else(|| {
            QueueError::validation(format!("project {} has no camera", self.file.display()))
        })?;
        Ok(ResolvedSettings {
            scene: self.scene().unwrap_or_default(),
            camera,
            render_filepath: self.resolved_render_path(),
            file_format: self.file_format()?,
            resolution_x: self.resolution_x.resolved().unwrap_or(1920),
            resolution_y: self.resolution_y.resolved().unwrap_or(1080),
            resolution_percentage: self.resolution_percentage.resolved().unwrap_or(100),
            use_persistent_data: self.use_persistent_data.resolved().unwrap_or(false),
            use_adaptive_sampling: self.use_adaptive_sampling.resolved().unwrap_or(false),
            samples: self.samples(),
            denoiser: self.denoiser(),
            denoising_use_gpu: self.denoising_use_gpu.resolved().unwrap_or(false),
            denoising_input_passes: self.denoising_input_passes(),
            denoising_prefilter: self.denoising_prefilter(),
        })
    }

    /// The concrete frames this project renders under `modes`.
    pub fn frame_list(&self, modes: RenderModes) -> QueueResult<FrameSet> {
        let source = if modes.markers {
            self.markers_spec()
        } else {
            self.frames()
        };
        let candidates = frame_spec::expand(&source);
        if !modes.selective {
            return Ok(candidates);
        }

        let format = self.file_format()?;
        Ok(candidates.filter(|frame| !self.output_path_with(frame, format).exists()))
    }

    /// Output template with a leading `//` resolved against the project directory.
    pub fn resolved_render_path(&self) -> String {
        let template = self.render_filepath();
        match template.strip_prefix(PROJECT_RELATIVE_PREFIX) {
            Some(relative) => {
                let base = self.file.parent().unwrap_or_else(|| Path::new("."));
                base.join(relative).to_string_lossy().replace('\\', "/")
            }
            None => template,
        }
    }

    /// Path the renderer writes `frame` to.
    pub fn output_path(&self, frame: Frame) -> QueueResult<PathBuf> {
        Ok(self.output_path_with(frame, self.file_format()?))
    }

    fn output_path_with(&self, frame: Frame, format: FileFormat) -> PathBuf {
        PathBuf::from(compose_output_path(
            &self.resolved_render_path(),
            frame,
            format,
        ))
    }

    pub fn output_dir(&self) -> PathBuf {
        let template = self.resolved_render_path();
        let (dir, _) = split_file_name(&template);
        if dir.is_empty() {
            return PathBuf::from(".");
        }
        PathBuf::from(dir)
    }

    pub fn is_outdated(&self, cache: &MetadataCache) -> bool {
        cache.is_outdated(&self.file)
    }

    /// Active, has a camera, and both the file and output directory exist.
    pub fn is_renderable(&self) -> bool {
        self.active && self.camera().is_some() && self.file.exists() && self.output_dir().is_dir()
    }

    pub fn set_override(&mut self, field: SettingField, value: &str) -> QueueResult<()> {
        let value = value.trim();
        match field {
            SettingField::Frames => self.frames.set_override(value.to_owned()),
            SettingField::Scene => {
                ensure_member(field, value, &self.scene_list)?;
                self.scene.set_override(value.to_owned());
            }
            SettingField::Camera => {
                ensure_member(field, value, &self.camera_list)?;
                self.camera.set_override(value.to_owned());
            }
            SettingField::RenderFilepath => self.render_filepath.set_override(value.to_owned()),
            SettingField::FileFormat => {
                ensure_member(field, value, &allowed_strings(FILE_FORMATS))?;
                self.file_format.set_override(value.to_owned());
            }
            SettingField::ResolutionX => self.resolution_x.set_override(parse_positive(field, value)?),
            SettingField::ResolutionY => self.resolution_y.set_override(parse_positive(field, value)?),
            SettingField::ResolutionPercentage => self
                .resolution_percentage
                .set_override(parse_positive(field, value)?),
            SettingField::UsePersistentData => {
                self.use_persistent_data.set_override(parse_bool(field, value)?)
            }
            SettingField::UseAdaptiveSampling => {
                self.use_adaptive_sampling.set_override(parse_bool(field, value)?)
            }
            SettingField::Samples => self.samples.set_override(parse_positive(field, value)?),
            SettingField::Denoiser => {
                ensure_member(field, value, &allowed_strings(DENOISERS))?;
                self.denoiser.set_override(value.to_owned());
            }
            SettingField::DenoisingUseGpu => {
                self.denoising_use_gpu.set_override(parse_bool(field, value)?)
            }
            SettingField::DenoisingInputPasses => {
                ensure_member(field, value, &allowed_strings(DENOISING_INPUT_PASSES))?;
                self.denoising_input_passes.set_override(value.to_owned());
            }
            SettingField::DenoisingPrefilter => {
                ensure_member(field, value, &allowed_strings(DENOISING_PREFILTERS))?;
                self.denoising_prefilter.set_override(value.to_owned());
            }
        }
        Ok(())
    }

    pub fn clear_override(&mut self, field: SettingField) {
        match field {
            SettingField::Frames => self.frames.clear_override(),
            SettingField::Scene => self.scene.clear_override(),
            SettingField::Camera => self.camera.clear_override(),
            SettingField::RenderFilepath => self.render_filepath.clear_override(),
            SettingField::FileFormat => self.file_format.clear_override(),
            SettingField::ResolutionX => self.resolution_x.clear_override(),
            SettingField::ResolutionY => self.resolution_y.clear_override(),
            SettingField::ResolutionPercentage => self.resolution_percentage.clear_override(),
            SettingField::UsePersistentData => self.use_persistent_data.clear_override(),
            SettingField::UseAdaptiveSampling => self.use_adaptive_sampling.clear_override(),
            SettingField::Samples => self.samples.clear_override(),
            SettingField::Denoiser => self.denoiser.clear_override(),
            SettingField::DenoisingUseGpu => self.denoising_use_gpu.clear_override(),
            SettingField::DenoisingInputPasses => self.denoising_input_passes.clear_override(),
            SettingField::DenoisingPrefilter => self.denoising_prefilter.clear_override(),
        }
    }

    pub fn setting_rows(&self) -> Vec<SettingRow> {
        SettingField::ALL
            .into_iter()
            .map(|field| {
                let (base, override_value, resolved) = match field {
                    SettingField::Frames => describe(&self.frames, Some(self.frames())),
                    SettingField::Scene => describe(&self.scene, self.scene()),
                    SettingField::Camera => describe(&self.camera, self.camera()),
                    SettingField::RenderFilepath => {
                        describe(&self.render_filepath, Some(self.render_filepath()))
                    }
                    SettingField::FileFormat => {
                        describe(&self.file_format, Some(self.file_format_name()))
                    }
                    SettingField::ResolutionX => {
                        describe(&self.resolution_x, self.resolution_x.resolved())
                    }
                    SettingField::ResolutionY => {
                        describe(&self.resolution_y, self.resolution_y.resolved())
                    }
                    SettingField::ResolutionPercentage => describe(
                        &self.resolution_percentage,
                        self.resolution_percentage.resolved(),
                    ),
                    SettingField::UsePersistentData => describe(
                        &self.use_persistent_data,
                        self.use_persistent_data.resolved(),
                    ),
                    SettingField::UseAdaptiveSampling => describe(
                        &self.use_adaptive_sampling,
                        self.use_adaptive_sampling.resolved(),
                    ),
                    SettingField::Samples => describe(&self.samples, Some(self.samples())),
                    SettingField::Denoiser => describe(&self.denoiser, Some(self.denoiser())),
                    SettingField::DenoisingUseGpu => describe(
                        &self.denoising_use_gpu,
                        self.denoising_use_gpu.resolved(),
                    ),
                    SettingField::DenoisingInputPasses => describe(
                        &self.denoising_input_passes,
                        Some(self.denoising_input_passes()),
                    ),
                    SettingField::DenoisingPrefilter => describe(
                        &self.denoising_prefilter,
                        Some(self.denoising_prefilter()),
                    ),
                };
                SettingRow {
                    field,
                    base,
                    override_value,
                    resolved,
                }
            })
            .collect()
    }
}

fn describe<T: ToString>(
    value: &Overridable<T>,
    resolved: Option<T>,
) -> (String, Option<String>, String) {
    (
        value
            .base
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
        value.override_value.as_ref().map(ToString::to_string),
        resolved.map(|value| value.to_string()).unwrap_or_default(),
    )
}

fn ensure_member(field: SettingField, value: &str, allowed: &[String]) -> QueueResult<()> {
    if allowed.iter().any(|candidate| candidate == value) {
        return Ok(());
    }
    Err(QueueError::validation(format!(
        "{field} must be one of [{}], got '{value}'",
        allowed.join(", ")
    )))
}

fn parse_positive(field: SettingField, value: &str) -> QueueResult<u32> {
    match value.parse::<u32>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(QueueError::validation(format!(
            "{field} must be a positive integer, got '{value}'"
        ))),
    }
}

fn parse_bool(field: SettingField, value: &str) -> QueueResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(QueueError::validation(format!(
            "{field} must be true or false, got '{value}'"
        ))),
    }
}

fn split_file_name(path: &str) -> (&str, &str) {
    match path.rfind(['/', '\\']) {
        Some(index) => (&path[..index], &path[index + 1..]),
        None => ("", path),
    }
}

/// Builds the file name the renderer writes for `frame`.
///
/// The last run of `#` in the file name sets the zero-pad width and is
/// replaced by the frame number; without one the number is appended with a
/// width of four. The format's extension is appended unless the template
/// already ends with it.
pub fn compose_output_path(template: &str, frame: Frame, format: FileFormat) -> String {
    let (dir, name) = split_file_name(template);
    let extension = format.extension();
    let stem = if name.to_ascii_lowercase().ends_with(extension) {
        &name[..name.len() - extension.len()]
    } else {
        name
    };

    let file_name = match last_hash_run(stem) {
        Some((start, width)) => format!(
            "{}{}{}",
            &stem[..start],
            frame.zero_padded(width),
            &stem[start + width..]
        ),
        None => format!("{stem}{}", frame.zero_padded(DEFAULT_PAD_WIDTH)),
    };

    if dir.is_empty() && template.len() == name.len() {
        format!("{file_name}{extension}")
    } else {
        let separator = &template[dir.len()..dir.len() + 1];
        format!("{dir}{separator}{file_name}{extension}")
    }
}

fn last_hash_run(stem: &str) -> Option<(usize, usize)> {
    let end = stem.rfind('#')? + 1;
    let start = stem[..end].trim_end_matches('#').len();
    Some((start, end - start))
}
