//! Adding projects to the queue.
//!
//! Reading settings out of a project file means starting the renderer, so the
//! loader consults the metadata cache first and only extracts files that are
//! new or changed since they were last seen.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::cache::{absolute_project_path, file_mod_time, MetadataCache, ProjectMetadata};
use crate::error::{QueueError, QueueResult};
use crate::project::Project;
use crate::queue::RenderQueue;

pub const PROJECT_EXTENSION: &str = "blend";

const EXTRACT_SCRIPT_NAME: &str = "extract_metadata.py";
const BRIDGE_FILE_NAME: &str = "metadata.json";

const EXTRACT_SCRIPT: &str = r#"import json
import sys

import bpy

bridge = sys.argv[sys.argv.index("--") + 1]
scene = bpy.context.scene
render = scene.render
cycles = scene.cycles

data = {
    "frame_start": scene.frame_start,
    "frame_end": scene.frame_end,
    "scene": scene.name,
    "scene_list": [item.name for item in bpy.data.scenes],
    "camera": scene.camera.name if scene.camera else None,
    "camera_list": [item.name for item in scene.objects if item.type == "CAMERA"],
    "resolution_x": render.resolution_x,
    "resolution_y": render.resolution_y,
    "resolution_percentage": render.resolution_percentage,
    "render_filepath": render.filepath,
    "file_format": render.image_settings.file_format,
    "use_persistent_data": render.use_persistent_data,
    "use_adaptive_sampling": cycles.use_adaptive_sampling,
    "samples": cycles.samples,
    "denoiser": cycles.denoiser if cycles.use_denoising else "NONE",
    "denoising_use_gpu": getattr(cycles, "denoising_use_gpu", False),
    "denoising_input_passes": cycles.denoising_input_passes,
    "denoising_prefilter": cycles.denoising_prefilter,
    "markers": [marker.frame for marker in scene.timeline_markers],
}

with open(bridge, "w", encoding="utf-8") as handle:
    json.dump(data, handle)
"#;

/// Reads render settings out of a project file.
pub trait MetadataExtractor {
    fn extract(&self, file: &Path) -> QueueResult<ProjectMetadata>;
}

/// Runs the renderer headless with a script that dumps the settings as JSON.
#[derive(Debug, Clone)]
pub struct BlenderExtractor {
    pub executable: PathBuf,
    pub work_dir: PathBuf,
}

impl BlenderExtractor {
    pub fn new(executable: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            work_dir: work_dir.into(),
        }
    }
}

impl MetadataExtractor for BlenderExtractor {
    fn extract(&self, file: &Path) -> QueueResult<ProjectMetadata> {
        fs::create_dir_all(&self.work_dir).map_err(|error| QueueError::io(&self.work_dir, error))?;
        let script = self.work_dir.join(EXTRACT_SCRIPT_NAME);
        fs::write(&script, EXTRACT_SCRIPT).map_err(|error| QueueError::io(&script, error))?;
        let bridge = self.work_dir.join(BRIDGE_FILE_NAME);
        if bridge.exists() {
            fs::remove_file(&bridge).map_err(|error| QueueError::io(&bridge, error))?;
        }

        tracing::info!(project = %file.display(), "extracting project metadata");
        let output = Command::new(&self.executable)
            .arg(file)
            .args(["--factory-startup", "--background", "--python"])
            .arg(&script)
            .arg("--")
            .arg(&bridge)
            .stdin(Stdio::null())
            .output()
            .map_err(|error| {
                QueueError::process_launch(format!("{}: {error}", self.executable.display()))
            })?;
        if !output.status.success() {
            tracing::warn!(project = %file.display(), status = %output.status, "metadata extraction exited with failure");
        }

        if !bridge.exists() {
            return Err(QueueError::validation(format!(
                "renderer wrote no metadata for {}",
                file.display()
            )));
        }
        let text = fs::read_to_string(&bridge).map_err(|error| QueueError::io(&bridge, error))?;
        serde_json::from_str(&text).map_err(|error| {
            QueueError::validation(format!(
                "invalid metadata for {}: {error}",
                file.display()
            ))
        })
    }
}

/// Files that made it into the queue and files that did not, with reasons.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub added: Vec<PathBuf>,
    pub skipped: Vec<(PathBuf, String)>,
    pub cache_hits: usize,
}

pub struct ProjectLoader<'a> {
    extractor: &'a dyn MetadataExtractor,
    cache: &'a mut MetadataCache,
}

impl<'a> ProjectLoader<'a> {
    pub fn new(extractor: &'a dyn MetadataExtractor, cache: &'a mut MetadataCache) -> Self {
        Self { extractor, cache }
    }

    /// Metadata for `file`, from the cache when its modification time still
    /// matches, otherwise freshly extracted and cached.
    pub fn metadata_for(&mut self, file: &Path) -> QueueResult<(ProjectMetadata, i64, bool)> {
        let mod_time = file_mod_time(file).ok_or_else(|| {
            QueueError::validation(format!("{} does not exist", file.display()))
        })?;
        if let Some(metadata) = self.cache.lookup(file, mod_time) {
            tracing::debug!(project = %file.display(), "metadata cache hit");
            return Ok((metadata.clone(), mod_time, true));
        }
        let metadata = self.extractor.extract(file)?;
        self.cache.insert(file, metadata.clone(), mod_time);
        Ok((metadata, mod_time, false))
    }

    /// Queues every project file in `files` that is not queued yet.
    pub fn add_files(&mut self, queue: &mut RenderQueue, files: &[PathBuf]) -> LoadReport {
        let mut report = LoadReport::default();
        for file in files {
            let file = match absolute_project_path(file) {
                Ok(file) => file,
                Err(error) => {
                    report.skipped.push((file.clone(), error.to_string()));
                    continue;
                }
            };
            if !is_project_file(&file) {
                report
                    .skipped
                    .push((file, format!("not a .{PROJECT_EXTENSION} file")));
                continue;
            }
            if queue.contains(&file) {
                report.skipped.push((file, String::from("already queued")));
                continue;
            }
            match self.metadata_for(&file) {
                Ok((metadata, mod_time, cached)) => {
                    report.cache_hits += usize::from(cached);
                    let project = Project::from_metadata(file.clone(), &metadata, mod_time);
                    match queue.enqueue(project) {
                        Ok(_) => report.added.push(file),
                        Err(error) => report.skipped.push((file, error.to_string())),
                    }
                }
                Err(error) => {
                    tracing::warn!(project = %file.display(), %error, "cannot load project");
                    report.skipped.push((file, error.to_string()));
                }
            }
        }
        report
    }

    /// Re-reads every outdated project, keeping overrides and active flags.
    pub fn reload(&mut self, queue: &mut RenderQueue) -> LoadReport {
        let mut report = LoadReport::default();
        for index in outdated(queue, self.cache) {
            let Ok(project) = queue.get_mut(index) else {
                continue;
            };
            let file = project.file.clone();
            match self.metadata_for(&file) {
                Ok((metadata, mod_time, cached)) => {
                    report.cache_hits += usize::from(cached);
                    project.refresh(&metadata, mod_time);
                    report.added.push(file);
                }
                Err(error) => {
                    tracing::warn!(project = %file.display(), %error, "cannot reload project");
                    report.skipped.push((file, error.to_string()));
                }
            }
        }
        report
    }
}

/// Indices of queued projects whose cached metadata no longer matches.
pub fn outdated(queue: &RenderQueue, cache: &MetadataCache) -> Vec<usize> {
    queue
        .projects()
        .iter()
        .enumerate()
        .filter(|(_, project)| project.is_outdated(cache))
        .map(|(index, _)| index)
        .collect()
}

pub fn is_project_file(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case(PROJECT_EXTENSION))
}
