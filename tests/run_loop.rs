#![cfg(unix)]

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::tempdir;

/// Stands in for the renderer. Extraction calls get a bridge document; render
/// calls print the progress protocol. `FAKE_MODE` picks the render behavior.
const FAKE_RENDERER: &str = r#"#!/bin/sh
if [ "$2" = "--factory-startup" ]; then
  cat > "$7" <<'JSON'
{"frame_start": 1, "frame_end": 3, "scene": "Scene", "scene_list": ["Scene"],
 "camera": "Camera", "camera_list": ["Camera"],
 "resolution_x": 64, "resolution_y": 64, "resolution_percentage": 100,
 "render_filepath": "//out/shot_####", "file_format": "PNG",
 "use_persistent_data": false, "use_adaptive_sampling": false, "samples": 4,
 "denoiser": "NONE", "denoising_use_gpu": false,
 "denoising_input_passes": "RGB", "denoising_prefilter": "NONE", "markers": [2]}
JSON
  exit 0
fi

frames="${10}"
mode="${FAKE_MODE:-good}"
echo "Blender 4.1.0 (fake)"
if [ "$mode" != "no-settings" ]; then
  echo "---RENDERQ-SETTINGS-APPLIED"
fi
if [ "$mode" = "hang" ]; then
  echo "Fra:1 Mem:10.00M | Syncing"
  : > "$(pwd)/out/shot_0001.png"
  : > "$(pwd)/started"
  sleep 30
  exit 0
fi

old_ifs="$IFS"
IFS=','
for frame in $frames; do
  IFS="$old_ifs"
  echo "Fra:$frame Mem:10.00M | Syncing"
  echo "Fra:$frame Mem:10.00M | Sample 2/4"
  echo "Fra:$frame Mem:10.00M | Sample 4/4"
  out="$(pwd)/out/shot_$(printf '%04d' "$frame").png"
  : > "$out"
  echo "Saved: '$out'"
done
"#;

struct Workspace {
    dir: tempfile::TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new(projects: &[&str]) -> Self {
        let dir = tempdir().expect("tempdir should create");
        let fake = dir.path().join("fake-blender.sh");
        fs::write(&fake, FAKE_RENDERER).expect("fake should write");
        fs::set_permissions(&fake, fs::Permissions::from_mode(0o755))
            .expect("fake should be executable");
        fs::create_dir_all(dir.path().join("out")).expect("output dir should create");
        let config = dir.path().join("renderq.yaml");
        fs::write(
            &config,
            format!(
                "executable: {}\nwork_dir: work\neta_interval_ms: 20\n",
                fake.display()
            ),
        )
        .expect("config should write");

        let ws = Self { dir, config };
        for name in projects {
            fs::write(ws.dir.path().join(name), b"BLENDER").expect("project should write");
        }
        if !projects.is_empty() {
            let mut args = vec!["add"];
            args.extend_from_slice(projects);
            let add = ws.command(&args).output().expect("add should run");
            assert!(
                add.status.success(),
                "add should succeed: {}",
                String::from_utf8_lossy(&add.stderr)
            );
        }
        ws
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_renderq"));
        command
            .current_dir(self.dir.path())
            .arg("--config")
            .arg(&self.config)
            .args(args);
        command
    }

    fn render(&self, mode: &str, args: &[&str]) -> std::process::Output {
        let mut full = vec!["render"];
        full.extend_from_slice(args);
        self.command(&full)
            .env("FAKE_MODE", mode)
            .output()
            .expect("render should run")
    }

    fn record(&self) -> Value {
        let text = fs::read_to_string(self.dir.path().join("queue.last_run.json"))
            .expect("run record should exist");
        serde_json::from_str(&text).expect("run record should be json")
    }

    fn out(&self, name: &str) -> PathBuf {
        self.dir.path().join("out").join(name)
    }
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn renders_every_frame_of_every_project() {
    let ws = Workspace::new(&["a.blend", "b.blend"]);
    let output = ws.render("good", &["--record"]);
    assert!(output.status.success(), "render failed: {}", stderr_of(&output));

    let record = ws.record();
    assert_eq!(record["outcome"], "finished");
    assert_eq!(record["projects_rendered"], 2);
    assert_eq!(record["global_frames"], 6);
    assert_eq!(record["frames_saved"], 6);
    assert_eq!(record["unsaved_frames"].as_array().map(Vec::len), Some(0));
    assert!(record.get("error").is_none());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Run record: "));
    let stderr = stderr_of(&output);
    assert!(stderr.contains("render finished"));
    assert!(stderr.contains("frame 6/6"));
    assert!(ws.out("shot_0003.png").exists());
    assert!(ws.dir.path().join("work/render_settings_000.py").exists());
    assert!(ws.dir.path().join("work/render_settings_001.py").exists());
}

#[test]
fn inactive_projects_and_marker_mode_limit_the_run() {
    let ws = Workspace::new(&["a.blend", "b.blend"]);
    let toggle = ws.command(&["toggle", "1"]).output().expect("toggle should run");
    assert!(toggle.status.success());

    let output = ws.render("good", &["--markers", "--record"]);
    assert!(output.status.success(), "render failed: {}", stderr_of(&output));
    let record = ws.record();
    assert_eq!(record["projects_rendered"], 1);
    assert_eq!(record["global_frames"], 1);
    assert_eq!(record["frames_saved"], 1);
    assert!(ws.out("shot_0002.png").exists());
    assert!(!ws.out("shot_0001.png").exists());
}

#[test]
fn render_flags_replace_the_saved_modes() {
    let ws = Workspace::new(&["a.blend"]);
    let list = |ws: &Workspace| {
        let output = ws.command(&["list"]).output().expect("list should run");
        String::from_utf8_lossy(&output.stdout).into_owned()
    };

    let output = ws.render("good", &["--selective"]);
    assert!(output.status.success(), "render failed: {}", stderr_of(&output));
    assert!(list(&ws).contains("selective=on markers=off"));

    let output = ws.render("good", &[]);
    assert!(output.status.success(), "render failed: {}", stderr_of(&output));
    assert!(list(&ws).contains("selective=off markers=off"));
}

#[test]
fn progress_before_settings_confirmation_aborts_with_error_exit() {
    let ws = Workspace::new(&["a.blend", "b.blend"]);
    let output = ws.render("no-settings", &["--record"]);
    assert!(!output.status.success(), "aborted run should fail");
    assert_eq!(output.status.code(), Some(2));

    let record = ws.record();
    assert_eq!(record["outcome"], "aborted");
    assert_eq!(record["error_kind"], "settings_not_applied");
    assert!(stderr_of(&output).contains("settings_not_applied"));
}

#[test]
fn missing_renderer_is_a_launch_failure() {
    let ws = Workspace::new(&["a.blend"]);
    fs::write(
        &ws.config,
        "executable: ./does-not-exist\nwork_dir: work\n",
    )
    .expect("config should rewrite");

    let output = ws.render("good", &["--record"]);
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(ws.record()["error_kind"], "process_launch_failure");
}

#[test]
fn q_on_stdin_stops_the_run_and_removes_the_partial_frame() {
    let ws = Workspace::new(&["a.blend", "b.blend"]);
    let mut child = ws
        .command(&["render", "--record"])
        .env("FAKE_MODE", "hang")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("render should spawn");

    wait_for(&ws.dir.path().join("started"));
    // Let the listener see the frame start before stopping.
    thread::sleep(Duration::from_millis(300));
    child
        .stdin
        .take()
        .expect("stdin should be piped")
        .write_all(b"q\n")
        .expect("stop request should write");

    let started = Instant::now();
    let output = child.wait_with_output().expect("render should exit");
    assert!(
        started.elapsed() < Duration::from_secs(20),
        "renderer should be terminated rather than waited for"
    );
    assert!(output.status.success(), "stopped run exits cleanly: {}", stderr_of(&output));

    let record = ws.record();
    assert_eq!(record["outcome"], "stopped");
    assert_eq!(record["projects_rendered"], 0);
    assert_eq!(record["unsaved_frames"], serde_json::json!([1]));
    assert!(!ws.out("shot_0001.png").exists(), "partial frame should be removed");
    assert!(stderr_of(&output).contains("render stopped"));
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        thread::sleep(Duration::from_millis(20));
    }
}
