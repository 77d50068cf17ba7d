//! Generated settings scripts and renderer command lines.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{QueueError, QueueResult};
use crate::frame_spec::FrameSet;
use crate::project::ResolvedSettings;
use crate::protocol::SETTINGS_SENTINEL;

pub const DEFAULT_ENGINE: &str = "CYCLES";
const FLAGS: &[&str] = &["--background", "--scene", "-E", "--python", "-f"];

/// A fully-resolved renderer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub script_path: Option<PathBuf>,
}

impl CommandPlan {
    /// The command as a single line with every value double-quoted. This is
    /// also the line the progress listener sees as a project switch.
    pub fn display_command(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(quote(&self.program.to_string_lossy()));
        for arg in &self.args {
            if FLAGS.contains(&arg.as_str()) {
                parts.push(arg.clone());
            } else {
                parts.push(quote(arg));
            }
        }
        parts.join(" ")
    }
}

fn quote(value: &str) -> String {
    format!("\"{value}\"")
}

/// Everything needed to render one project.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub executable: &'a Path,
    pub engine: &'a str,
    pub project_file: &'a Path,
    pub scene: &'a str,
    pub script_path: &'a Path,
    pub frames: &'a FrameSet,
}

pub fn build_command_plan(request: RenderRequest<'_>) -> CommandPlan {
    CommandPlan {
        program: request.executable.to_path_buf(),
        args: vec![
            String::from("--background"),
            request.project_file.to_string_lossy().to_string(),
            String::from("--scene"),
            request.scene.to_owned(),
            String::from("-E"),
            request.engine.to_owned(),
            String::from("--python"),
            request.script_path.to_string_lossy().to_string(),
            String::from("-f"),
            request.frames.to_spec_string(),
        ],
        cwd: request.project_file.parent().map(Path::to_path_buf),
        script_path: Some(request.script_path.to_path_buf()),
    }
}

/// Python applying `settings` inside the renderer. Printing the sentinel is
/// the last statement, so it only appears when every assignment succeeded.
pub fn settings_script(settings: &ResolvedSettings) -> String {
    let mut lines = vec![
        String::from("import bpy"),
        String::from(""),
        String::from("scene = bpy.context.scene"),
        String::from("render = scene.render"),
        String::from("render.use_overwrite = True"),
        format!("scene.camera = bpy.data.objects[{}]", py_str(&settings.camera)),
        format!("render.filepath = {}", py_str(&settings.render_filepath)),
        format!(
            "render.image_settings.file_format = {}",
            py_str(settings.file_format.as_str())
        ),
        format!("render.resolution_x = {}", settings.resolution_x),
        format!("render.resolution_y = {}", settings.resolution_y),
        format!(
            "render.resolution_percentage = {}",
            settings.resolution_percentage
        ),
        format!(
            "render.use_persistent_data = {}",
            py_bool(settings.use_persistent_data)
        ),
        format!(
            "scene.cycles.use_adaptive_sampling = {}",
            py_bool(settings.use_adaptive_sampling)
        ),
        format!("scene.cycles.samples = {}", settings.samples),
    ];

    if settings.denoiser == "NONE" {
        lines.push(String::from("scene.cycles.use_denoising = False"));
    } else {
        lines.push(String::from("scene.cycles.use_denoising = True"));
        lines.push(format!(
            "scene.cycles.denoiser = {}",
            py_str(&settings.denoiser)
        ));
        lines.push(format!(
            "scene.cycles.denoising_use_gpu = {}",
            py_bool(settings.denoising_use_gpu)
        ));
        lines.push(format!(
            "scene.cycles.denoising_input_passes = {}",
            py_str(&settings.denoising_input_passes)
        ));
        lines.push(format!(
            "scene.cycles.denoising_prefilter = {}",
            py_str(&settings.denoising_prefilter)
        ));
    }

    lines.push(format!("print({}, flush=True)", py_str(SETTINGS_SENTINEL)));
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

/// Writes the settings script for the project at `index` into `work_dir`.
pub fn write_settings_script(
    work_dir: &Path,
    index: usize,
    settings: &ResolvedSettings,
) -> QueueResult<PathBuf> {
    fs::create_dir_all(work_dir).map_err(|error| QueueError::io(work_dir, error))?;
    let path = work_dir.join(format!("render_settings_{index:03}.py"));
    fs::write(&path, settings_script(settings)).map_err(|error| QueueError::io(&path, error))?;
    Ok(path)
}

/// A JSON string literal is also a valid Python string literal.
fn py_str(value: &str) -> String {
    serde_json::Value::String(value.to_owned()).to_string()
}

fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}
