//! Sequential render runs.
//!
//! A run owns three threads: the orchestrator loop launching one renderer at
//! a time, the progress listener reading the shared line channel, and a timer
//! publishing ETA text while the run is rendering.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::{QueueError, QueueResult};
use crate::hooks::CompletionHooks;
use crate::invocation::{build_command_plan, write_settings_script, RenderRequest, DEFAULT_ENGINE};
use crate::process::ProcessLauncher;
use crate::progress::{publish, ProgressListener, RunEvent};
use crate::project::{Project, RenderModes};
use crate::protocol::{ProtocolParser, ProtocolPatterns};
use crate::queue::RenderQueue;
use crate::run_state::{ProgressSnapshot, RunStatus, SharedRunState, Timing, DEFAULT_ETA_WINDOW};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_ETA_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed inputs of every run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub executable: PathBuf,
    pub engine: String,
    pub work_dir: PathBuf,
    pub patterns: ProtocolPatterns,
    pub eta_window: usize,
    pub eta_interval: Duration,
    pub poll_interval: Duration,
}

impl RunSettings {
    pub fn new(executable: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            engine: DEFAULT_ENGINE.to_owned(),
            work_dir: work_dir.into(),
            patterns: ProtocolPatterns::default(),
            eta_window: DEFAULT_ETA_WINDOW,
            eta_interval: DEFAULT_ETA_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub shutdown_on_finish: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Finished,
    Stopped,
    Aborted,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Finished => "finished",
            RunOutcome::Stopped => "stopped",
            RunOutcome::Aborted => "aborted",
        }
    }
}

/// What a run did, reported once it is over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub projects_rendered: usize,
    pub global_frames: usize,
    pub frames_saved: usize,
    pub saved_outputs: Vec<PathBuf>,
    pub unsaved_frames: Vec<i64>,
    pub elapsed_secs: f64,
    pub started_at: String,
    pub finished_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn write(&self, path: &Path) -> QueueResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| QueueError::io(parent, error))?;
        }
        let serialized = serde_json::to_string_pretty(self)
            .map_err(|error| QueueError::Other(anyhow!("failed to serialize run summary: {error}")))?;
        fs::write(path, format!("{serialized}\n")).map_err(|error| QueueError::io(path, error))
    }
}

pub struct Orchestrator {
    settings: RunSettings,
    launcher: Arc<dyn ProcessLauncher>,
    hooks: Arc<dyn CompletionHooks>,
    state: SharedRunState,
    worker: Option<JoinHandle<RunSummary>>,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        launcher: Arc<dyn ProcessLauncher>,
        hooks: Arc<dyn CompletionHooks>,
    ) -> Self {
        let state = SharedRunState::new(settings.eta_window);
        Self {
            settings,
            launcher,
            hooks,
            state,
            worker: None,
        }
    }

    pub fn state(&self) -> SharedRunState {
        self.state.clone()
    }

    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.snapshot()
    }

    pub fn timing(&self) -> Timing {
        self.state.lock().timing(Instant::now())
    }

    /// Starts a run over a snapshot of `queue`. Rejected, with no state
    /// change, when the queue is empty, nothing in it is renderable, or a run
    /// is already in progress.
    pub fn start(
        &mut self,
        queue: &RenderQueue,
        options: RunOptions,
    ) -> QueueResult<Receiver<RunEvent>> {
        if self.status() != RunStatus::ReadyToRender
            || self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
        {
            return Err(QueueError::invalid_state(format!(
                "a run is already {}",
                self.status()
            )));
        }
        if queue.is_empty() {
            return Err(QueueError::validation("the queue is empty"));
        }
        if !queue.has_renderable() {
            return Err(QueueError::validation(
                "no project in the queue is renderable",
            ));
        }
        let parser = ProtocolParser::new(&self.settings.patterns)?;
        // A finished worker from the previous run is reaped here.
        if let Some(previous) = self.worker.take() {
            let _ = previous.join();
        }

        let global_frames = queue.global_frames();
        self.state.lock().begin_run(global_frames, Instant::now())?;
        tracing::info!(
            projects = queue.len(),
            global_frames,
            selective = queue.modes.selective,
            markers = queue.modes.markers,
            "render run started"
        );

        let (events, receiver) = mpsc::channel();
        publish(&events, RunEvent::StatusChanged(RunStatus::Rendering));

        let run = RunLoop {
            settings: self.settings.clone(),
            launcher: Arc::clone(&self.launcher),
            hooks: Arc::clone(&self.hooks),
            state: self.state.clone(),
            projects: queue.projects().to_vec(),
            modes: queue.modes,
            options,
            events,
        };
        let worker = thread::Builder::new()
            .name(String::from("renderq-orchestrator"))
            .spawn(move || run.run(parser))
            .map_err(|error| {
                self.state.lock().reset_to_ready();
                QueueError::Other(anyhow!("failed to spawn orchestrator thread: {error}"))
            })?;
        self.worker = Some(worker);
        Ok(receiver)
    }

    /// Requests a stop. A no-op returning false unless a run is rendering.
    pub fn stop(&self) -> bool {
        let stopping = self.state.request_stop();
        if stopping {
            tracing::info!("stop requested");
        }
        stopping
    }

    /// Blocks until the current run is over.
    pub fn wait(&mut self) -> QueueResult<RunSummary> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| QueueError::invalid_state("no run has been started"))?;
        worker
            .join()
            .map_err(|_| QueueError::Other(anyhow!("orchestrator thread panicked")))
    }
}

struct RunLoop {
    settings: RunSettings,
    launcher: Arc<dyn ProcessLauncher>,
    hooks: Arc<dyn CompletionHooks>,
    state: SharedRunState,
    projects: Vec<Project>,
    modes: RenderModes,
    options: RunOptions,
    events: Sender<RunEvent>,
}

impl RunLoop {
    fn run(self, parser: ProtocolParser) -> RunSummary {
        let started = Instant::now();
        let (lines, line_receiver) = mpsc::channel();
        let listener = ProgressListener::new(
            parser,
            self.state.clone(),
            self.projects.clone(),
            self.events.clone(),
            Arc::clone(&self.hooks),
            self.options.shutdown_on_finish,
        );
        let listener = match thread::Builder::new()
            .name(String::from("renderq-progress"))
            .spawn(move || listener.run(line_receiver))
        {
            Ok(handle) => Some(handle),
            Err(error) => {
                self.fail(QueueError::Other(anyhow!(
                    "failed to spawn progress listener: {error}"
                )));
                None
            }
        };
        let timer = match self.spawn_eta_timer() {
            Ok(handle) => Some(handle),
            Err(error) => {
                tracing::warn!(%error, "eta timer unavailable");
                None
            }
        };

        let mut projects_rendered = 0usize;
        if listener.is_some() {
            for (index, project) in self.projects.iter().enumerate() {
                if self.state.status() != RunStatus::Rendering {
                    break;
                }
                if !project.is_renderable() {
                    tracing::info!(project = %project.file.display(), "skipping project that is not renderable");
                    continue;
                }
                match self.render_project(index, project, &lines) {
                    Ok(true) => projects_rendered += 1,
                    Ok(false) => {}
                    Err(error @ QueueError::ProcessLaunch(_)) => {
                        self.fail(error);
                        break;
                    }
                    Err(error) => {
                        tracing::error!(project = %project.file.display(), %error, "skipping project");
                        self.report(&error);
                    }
                }
            }
        }

        let status = self.state.lock().finish_loop();
        publish(&self.events, RunEvent::StatusChanged(status));
        drop(lines);

        match listener {
            Some(handle) => {
                if handle.join().is_err() {
                    tracing::error!("progress listener panicked");
                    self.state.lock().reset_to_ready();
                }
            }
            None => self.state.lock().reset_to_ready(),
        }
        if let Some(handle) = timer {
            let _ = handle.join();
        }

        self.summary(status, projects_rendered, started)
    }

    /// Renders one project and blocks until its process exits. Returns false
    /// when the project had nothing to render.
    fn render_project(
        &self,
        index: usize,
        project: &Project,
        lines: &Sender<String>,
    ) -> QueueResult<bool> {
        let frames = project.frame_list(self.modes)?;
        if frames.is_empty() {
            tracing::info!(project = %project.file.display(), "no frames left to render");
            return Ok(false);
        }
        let settings = project.resolved_settings()?;
        let script = write_settings_script(&self.settings.work_dir, index, &settings)?;
        let plan = build_command_plan(RenderRequest {
            executable: &self.settings.executable,
            engine: &self.settings.engine,
            project_file: &project.file,
            scene: &settings.scene,
            script_path: &script,
            frames: &frames,
        });

        let command_line = plan.display_command();
        tracing::info!(project = %project.file.display(), frames = frames.len(), "launching renderer");
        tracing::debug!(command = %command_line, "renderer command");
        let _ = lines.send(command_line);

        let mut process = self.launcher.launch(&plan, lines.clone())?;
        self.state.lock().set_process(Some(process.id()));

        let result = loop {
            match process.try_wait() {
                Ok(Some(exit)) => {
                    if !exit.success {
                        tracing::warn!(project = %project.file.display(), code = ?exit.code, "renderer exited with failure");
                    }
                    break Ok(true);
                }
                Ok(None) => {}
                Err(error) => {
                    let _ = process.terminate_tree();
                    break Err(error);
                }
            }
            if self.state.status() == RunStatus::RenderingStopping {
                tracing::info!(pid = process.id(), "terminating renderer");
                break process.terminate_tree().map(|()| false);
            }
            thread::sleep(self.settings.poll_interval);
        };

        self.state.lock().set_process(None);
        result
    }

    fn spawn_eta_timer(&self) -> std::io::Result<JoinHandle<()>> {
        let state = self.state.clone();
        let events = self.events.clone();
        let interval = self.settings.eta_interval;
        thread::Builder::new()
            .name(String::from("renderq-eta"))
            .spawn(move || loop {
                thread::sleep(interval);
                let state = state.lock();
                if state.status() != RunStatus::Rendering {
                    break;
                }
                // Published under the lock so no ETA trails the final events.
                publish(&events, RunEvent::Eta(state.timing(Instant::now()).text()));
            })
    }

    fn fail(&self, error: QueueError) {
        tracing::error!(%error, "aborting run");
        self.report(&error);
        if self.state.lock().abort(error) {
            publish(
                &self.events,
                RunEvent::StatusChanged(RunStatus::RenderingStopping),
            );
        }
    }

    fn report(&self, error: &QueueError) {
        publish(
            &self.events,
            RunEvent::Error {
                kind: error.kind(),
                message: error.to_string(),
            },
        );
    }

    fn summary(&self, status: RunStatus, projects_rendered: usize, started: Instant) -> RunSummary {
        let mut state = self.state.lock();
        let failure = state.take_failure();
        let outcome = match (status, &failure) {
            (_, Some(_)) => RunOutcome::Aborted,
            (RunStatus::RenderingFinished, None) => RunOutcome::Finished,
            _ => RunOutcome::Stopped,
        };
        let started_at: DateTime<Local> = state.started_at().unwrap_or_else(Local::now);
        RunSummary {
            outcome,
            projects_rendered,
            global_frames: state.global_frames,
            frames_saved: state.saved_outputs.len(),
            saved_outputs: state.saved_outputs.clone(),
            unsaved_frames: state.unsaved_frames.clone(),
            elapsed_secs: started.elapsed().as_secs_f64(),
            started_at: started_at.to_rfc3339(),
            finished_at: Local::now().to_rfc3339(),
            error_kind: failure.as_ref().map(QueueError::kind),
            error: failure.map(|error| error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::cache::sample_metadata;
    use crate::invocation::CommandPlan;
    use crate::process::{ProcessExit, RenderProcess};
    use crate::progress::tests::CountingHooks;
    use crate::protocol::SETTINGS_SENTINEL;

    #[derive(Clone)]
    enum Script {
        Lines(Vec<String>),
        Hang(Vec<String>),
        FailLaunch,
    }

    #[derive(Default)]
    struct FakeLauncher {
        scripts: Mutex<VecDeque<Script>>,
        launches: AtomicUsize,
        terminated: Arc<AtomicBool>,
    }

    impl FakeLauncher {
        fn with(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            })
        }
    }

    struct FakeProcess {
        hang: bool,
        terminated: Arc<AtomicBool>,
    }

    impl RenderProcess for FakeProcess {
        fn id(&self) -> u32 {
            4242
        }

        fn try_wait(&mut self) -> QueueResult<Option<ProcessExit>> {
            if self.hang && !self.terminated.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(ProcessExit {
                code: Some(0),
                success: true,
            }))
        }

        fn terminate_tree(&mut self) -> QueueResult<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(
            &self,
            plan: &CommandPlan,
            lines: Sender<String>,
        ) -> QueueResult<Box<dyn RenderProcess>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .expect("scripts lock")
                .pop_front()
                .unwrap_or(Script::Lines(Vec::new()));
            let (output, hang) = match script {
                Script::Lines(output) => (output, false),
                Script::Hang(output) => (output, true),
                Script::FailLaunch => {
                    return Err(QueueError::process_launch(plan.display_command()))
                }
            };
            for line in output {
                lines.send(line).expect("line channel open");
            }
            Ok(Box::new(FakeProcess {
                hang,
                terminated: Arc::clone(&self.terminated),
            }))
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        queue: RenderQueue,
    }

    fn fixture(names: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let render_dir = dir.path().join("render");
        fs::create_dir_all(&render_dir).expect("render dir");
        let mut queue = RenderQueue::default();
        for name in names {
            let file = dir.path().join(format!("{name}.blend"));
            fs::write(&file, b"blend").expect("write project");
            let mut metadata = sample_metadata();
            metadata.frame_end = 2;
            metadata.render_filepath = format!("{}/{name}_####", render_dir.display());
            queue
                .enqueue(Project::from_metadata(file, &metadata, 0))
                .expect("enqueue");
        }
        Fixture { dir, queue }
    }

    fn orchestrator(dir: &Path, launcher: Arc<FakeLauncher>, hooks: Arc<CountingHooks>) -> Orchestrator {
        let mut settings = RunSettings::new("blender", dir.join("work"));
        settings.poll_interval = Duration::from_millis(5);
        settings.eta_interval = Duration::from_millis(10);
        Orchestrator::new(settings, launcher, hooks)
    }

    fn good_output(name: &str) -> Vec<String> {
        vec![
            String::from("Blender 4.1"),
            String::from(SETTINGS_SENTINEL),
            String::from("Fra:1 Mem:1M | Syncing"),
            format!("Saved: '/r/{name}_0001.png'"),
            String::from("Fra:2 Mem:1M | Syncing"),
            String::from("Fra:2 Mem:1M | Sample 1/2"),
            format!("Saved: '/r/{name}_0002.png'"),
        ]
    }

    fn wait_for_process(orchestrator: &Orchestrator) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while orchestrator.state().lock().process_id().is_none() {
            assert!(Instant::now() < deadline, "renderer never launched");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn start_rejects_empty_and_inactive_queues() {
        let fx = fixture(&["a"]);
        let launcher = FakeLauncher::with(Vec::new());
        let mut orchestrator = orchestrator(fx.dir.path(), launcher, Arc::default());

        let empty = RenderQueue::default();
        assert!(orchestrator.start(&empty, RunOptions::default()).is_err());
        assert_eq!(orchestrator.status(), RunStatus::ReadyToRender);

        let mut inactive = fx.queue.clone();
        inactive.toggle(0).expect("toggle");
        assert!(orchestrator.start(&inactive, RunOptions::default()).is_err());
        assert_eq!(orchestrator.status(), RunStatus::ReadyToRender);
        assert!(orchestrator.wait().is_err(), "nothing was started");
    }

    #[test]
    fn stop_when_ready_is_a_no_op() {
        let fx = fixture(&["a"]);
        let orchestrator = orchestrator(fx.dir.path(), FakeLauncher::with(Vec::new()), Arc::default());
        assert!(!orchestrator.stop());
        assert_eq!(orchestrator.status(), RunStatus::ReadyToRender);
    }

    #[test]
    fn runs_every_project_to_completion() {
        let fx = fixture(&["a", "b"]);
        let launcher = FakeLauncher::with(vec![
            Script::Lines(good_output("a")),
            Script::Lines(good_output("b")),
        ]);
        let hooks = Arc::new(CountingHooks::default());
        let mut orchestrator = orchestrator(fx.dir.path(), launcher.clone(), hooks.clone());

        let events = orchestrator
            .start(&fx.queue, RunOptions::default())
            .expect("start");
        let summary = orchestrator.wait().expect("wait");
        let events = events.iter().collect::<Vec<_>>();

        assert_eq!(summary.outcome, RunOutcome::Finished);
        assert_eq!(summary.projects_rendered, 2);
        assert_eq!(summary.global_frames, 4);
        assert_eq!(summary.frames_saved, 4);
        assert!(summary.unsaved_frames.is_empty());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(orchestrator.status(), RunStatus::ReadyToRender);
        assert_eq!(hooks.wakes.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 0);

        assert!(events.contains(&RunEvent::StatusChanged(RunStatus::RenderingFinished)));
        assert!(events.contains(&RunEvent::Finished));
        assert_eq!(
            events.last(),
            Some(&RunEvent::StatusChanged(RunStatus::ReadyToRender))
        );
        let started = events
            .iter()
            .filter_map(|event| match event {
                RunEvent::ProjectStarted { index, .. } => *index,
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(started, vec![0, 1]);
        assert!(fx.dir.path().join("work/render_settings_001.py").exists());
    }

    #[test]
    fn shutdown_is_requested_only_on_finish() {
        let fx = fixture(&["a"]);
        let launcher = FakeLauncher::with(vec![Script::Lines(good_output("a"))]);
        let hooks = Arc::new(CountingHooks::default());
        let mut orchestrator = orchestrator(fx.dir.path(), launcher, hooks.clone());
        let _events = orchestrator
            .start(
                &fx.queue,
                RunOptions {
                    shutdown_on_finish: true,
                },
            )
            .expect("start");
        assert_eq!(orchestrator.wait().expect("wait").outcome, RunOutcome::Finished);
        assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_terminates_active_process_and_skips_the_rest() {
        let fx = fixture(&["a", "b"]);
        let launcher = FakeLauncher::with(vec![Script::Hang(vec![
            String::from(SETTINGS_SENTINEL),
            String::from("Rendering frame 1"),
        ])]);
        let hooks = Arc::new(CountingHooks::default());
        let mut orchestrator = orchestrator(fx.dir.path(), launcher.clone(), hooks.clone());

        let _events = orchestrator
            .start(
                &fx.queue,
                RunOptions {
                    shutdown_on_finish: true,
                },
            )
            .expect("start");
        wait_for_process(&orchestrator);
        assert!(orchestrator
            .start(&fx.queue, RunOptions::default())
            .is_err());
        assert!(orchestrator.stop());

        let summary = orchestrator.wait().expect("wait");
        assert_eq!(summary.outcome, RunOutcome::Stopped);
        assert!(launcher.terminated.load(Ordering::SeqCst));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(summary.unsaved_frames, vec![1]);
        assert_eq!(summary.projects_rendered, 0);
        assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.wakes.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.status(), RunStatus::ReadyToRender);
    }

    #[test]
    fn progress_without_settings_confirmation_aborts() {
        let fx = fixture(&["a", "b"]);
        let launcher = FakeLauncher::with(vec![Script::Hang(vec![String::from(
            "Rendering frame 1",
        )])]);
        let mut orchestrator = orchestrator(fx.dir.path(), launcher.clone(), Arc::default());

        let _events = orchestrator
            .start(&fx.queue, RunOptions::default())
            .expect("start");
        let summary = orchestrator.wait().expect("wait");
        assert_eq!(summary.outcome, RunOutcome::Aborted);
        assert_eq!(summary.error_kind, Some("settings_not_applied"));
        assert!(launcher.terminated.load(Ordering::SeqCst));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn launch_failure_aborts_before_any_frame() {
        let fx = fixture(&["a", "b"]);
        let launcher = FakeLauncher::with(vec![Script::FailLaunch]);
        let mut orchestrator = orchestrator(fx.dir.path(), launcher.clone(), Arc::default());

        let events = orchestrator
            .start(&fx.queue, RunOptions::default())
            .expect("start");
        let summary = orchestrator.wait().expect("wait");
        assert_eq!(summary.outcome, RunOutcome::Aborted);
        assert_eq!(summary.error_kind, Some("process_launch_failure"));
        assert_eq!(summary.frames_saved, 0);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(events.iter().any(|event| event == RunEvent::Stopped));
    }

    #[test]
    fn unknown_format_skips_only_that_project() {
        let mut fx = fixture(&["a", "b"]);
        fx.queue
            .get_mut(0)
            .expect("project a")
            .file_format
            .set_base(Some(String::from("OPEN_EXR")));
        let launcher = FakeLauncher::with(vec![Script::Lines(good_output("b"))]);
        let mut orchestrator = orchestrator(fx.dir.path(), launcher.clone(), Arc::default());

        let events = orchestrator
            .start(&fx.queue, RunOptions::default())
            .expect("start");
        let summary = orchestrator.wait().expect("wait");
        assert_eq!(summary.outcome, RunOutcome::Finished);
        assert_eq!(summary.projects_rendered, 1);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(events.iter().any(|event| matches!(
            event,
            RunEvent::Error {
                kind: "unknown_format",
                ..
            }
        )));
    }

    #[test]
    fn summary_is_written_as_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = RunSummary {
            outcome: RunOutcome::Stopped,
            projects_rendered: 1,
            global_frames: 10,
            frames_saved: 3,
            saved_outputs: vec![PathBuf::from("/r/a_0001.png")],
            unsaved_frames: vec![4],
            elapsed_secs: 12.5,
            started_at: String::from("2024-01-01T00:00:00+00:00"),
            finished_at: String::from("2024-01-01T00:00:12+00:00"),
            error_kind: None,
            error: None,
        };
        let path = dir.path().join("runs/last.json");
        summary.write(&path).expect("write summary");
        let text = fs::read_to_string(path).expect("read summary");
        assert!(text.contains("\"outcome\": \"stopped\""));
        assert!(text.contains("\"unsaved_frames\""));
        assert!(!text.contains("error_kind"));
        assert!(text.ends_with("}\n"));
    }
}
