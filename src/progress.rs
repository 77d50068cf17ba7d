//! The listener that turns renderer output into run progress.
//!
//! One listener spans a whole run. It reads every line the orchestrator and
//! the render processes push into the shared line channel, classifies it and
//! updates the run state. When the channel closes it performs the terminal
//! bookkeeping and returns the state to `READY_TO_RENDER`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::Instant;

use crate::error::QueueError;
use crate::frame_spec::{self, Frame};
use crate::hooks::CompletionHooks;
use crate::project::Project;
use crate::protocol::{ProtocolEvent, ProtocolParser};
use crate::run_state::{ProgressSnapshot, RunState, RunStatus, SharedRunState};

/// Messages published to observers of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    StatusChanged(RunStatus),
    ProjectStarted { index: Option<usize>, file: PathBuf },
    Progress(ProgressSnapshot),
    FrameSaved { path: PathBuf },
    UnsavedFrame { frame: i64, removed: Option<PathBuf> },
    Eta(String),
    Log(String),
    Error { kind: &'static str, message: String },
    Finished,
    Stopped,
}

pub(crate) fn publish(events: &Sender<RunEvent>, event: RunEvent) {
    // Observers may go away mid-run; the run itself continues.
    let _ = events.send(event);
}

pub struct ProgressListener {
    parser: ProtocolParser,
    state: SharedRunState,
    projects: Vec<Project>,
    events: Sender<RunEvent>,
    hooks: Arc<dyn CompletionHooks>,
    shutdown_on_finish: bool,
}

impl ProgressListener {
    pub fn new(
        parser: ProtocolParser,
        state: SharedRunState,
        projects: Vec<Project>,
        events: Sender<RunEvent>,
        hooks: Arc<dyn CompletionHooks>,
        shutdown_on_finish: bool,
    ) -> Self {
        Self {
            parser,
            state,
            projects,
            events,
            hooks,
            shutdown_on_finish,
        }
    }

    /// Consumes lines until every sender is dropped, then wraps the run up.
    pub fn run(self, lines: Receiver<String>) {
        for line in lines {
            self.handle_line(&line);
        }
        self.finish();
    }

    pub fn handle_line(&self, line: &str) {
        let event = self.parser.classify(line);
        if event == ProtocolEvent::Unrecognized {
            return;
        }
        self.apply(event, Instant::now());
    }

    pub fn apply(&self, event: ProtocolEvent, now: Instant) {
        let mut state = self.state.lock();
        if event.is_progress() && state.failure().is_some() {
            return;
        }

        if event.is_progress() && state.settings_pending {
            let message = format!(
                "renderer reported progress before confirming settings for {}",
                self.current_file(&state)
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| String::from("an unknown project"))
            );
            // Only the first violation of a run is reported.
            state.settings_pending = false;
            let error = QueueError::settings_not_applied(message);
            tracing::error!(%error, "aborting run");
            publish(
                &self.events,
                RunEvent::Error {
                    kind: error.kind(),
                    message: error.to_string(),
                },
            );
            if state.abort(error) {
                publish(&self.events, RunEvent::StatusChanged(state.status()));
            }
            return;
        }

        match event {
            ProtocolEvent::ProjectSwitch { file, frames } => {
                self.repair_unsaved(&mut state);
                let index = self.project_index(&file);
                let frame_count = frame_spec::expand(&frames).len();
                state.switch_project(index, frame_count);
                tracing::info!(project = %file, frames = frame_count, "project started");
                publish(
                    &self.events,
                    RunEvent::ProjectStarted {
                        index,
                        file: PathBuf::from(file),
                    },
                );
                publish(&self.events, RunEvent::Progress(state.snapshot()));
            }
            ProtocolEvent::SettingsConfirmed => {
                state.settings_pending = false;
                tracing::debug!("render settings confirmed");
            }
            ProtocolEvent::TileProgress { fraction } => {
                state.frame_progress = fraction;
                publish(&self.events, RunEvent::Progress(state.snapshot()));
            }
            ProtocolEvent::FrameSaved { path } => {
                let path = PathBuf::from(path);
                tracing::info!(path = %path.display(), "frame saved");
                state.record_saved(path.clone(), now);
                publish(&self.events, RunEvent::FrameSaved { path });
                publish(&self.events, RunEvent::Progress(state.snapshot()));
            }
            ProtocolEvent::FrameStart { frame } => {
                if state.last_frame_start == Some(frame) {
                    return;
                }
                self.repair_unsaved(&mut state);
                state.start_frame(frame);
                tracing::debug!(frame, "frame started");
                publish(&self.events, RunEvent::Progress(state.snapshot()));
            }
            ProtocolEvent::Unrecognized => {}
        }
    }

    /// Marks the in-flight frame unsaved and removes its partial output.
    fn repair_unsaved(&self, state: &mut RunState) {
        let Some(frame) = state.mark_in_flight_unsaved() else {
            return;
        };
        let removed = self
            .output_path(state, frame)
            .filter(|path| path.exists())
            .and_then(|path| match fs::remove_file(&path) {
                Ok(()) => Some(path),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "failed to remove partial frame");
                    None
                }
            });
        let error = QueueError::unsaved_frame(frame, "render started again before the frame was saved");
        tracing::warn!(frame, removed = ?removed, "{error}");
        publish(&self.events, RunEvent::UnsavedFrame { frame, removed });
    }

    fn output_path(&self, state: &RunState, frame: i64) -> Option<PathBuf> {
        let project = self.projects.get(state.current_project?)?;
        match project.output_path(Frame::Int(frame)) {
            Ok(path) => Some(path),
            Err(error) => {
                tracing::warn!(%error, frame, "cannot compose output path");
                None
            }
        }
    }

    fn project_index(&self, file: &str) -> Option<usize> {
        let file = Path::new(file);
        self.projects.iter().position(|project| project.file == file)
    }

    fn current_file<'a>(&'a self, state: &RunState) -> Option<&'a Path> {
        self.projects
            .get(state.current_project?)
            .map(|project| project.file.as_path())
    }

    fn finish(&self) {
        let (status, failed) = {
            let mut state = self.state.lock();
            self.repair_unsaved(&mut state);
            (state.status(), state.failure().is_some())
        };

        match status {
            // A failure can land after the loop already finished.
            RunStatus::RenderingFinished if !failed => {
                let snapshot = {
                    let mut state = self.state.lock();
                    state.complete_counters();
                    state.snapshot()
                };
                publish(&self.events, RunEvent::Progress(snapshot));
                publish(&self.events, RunEvent::Finished);
                tracing::info!("render run finished");
                if self.shutdown_on_finish {
                    publish(&self.events, RunEvent::Log(String::from("shutdown countdown started")));
                    self.hooks.shutdown();
                }
            }
            RunStatus::RenderingFinished | RunStatus::RenderingStopping => {
                publish(&self.events, RunEvent::Stopped);
                tracing::info!("render run stopped");
            }
            other => {
                tracing::warn!(status = %other, "render output ended in an unexpected state");
            }
        }

        self.hooks.wake_screen();
        self.state.lock().reset_to_ready();
        publish(&self.events, RunEvent::StatusChanged(RunStatus::ReadyToRender));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::cache::sample_metadata;
    use crate::protocol::{ProtocolPatterns, SETTINGS_SENTINEL};

    #[derive(Debug, Default)]
    pub(crate) struct CountingHooks {
        pub wakes: AtomicUsize,
        pub shutdowns: AtomicUsize,
    }

    impl CompletionHooks for CountingHooks {
        fn wake_screen(&self) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&self) -> bool {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        render_dir: PathBuf,
        file: PathBuf,
        listener: ProgressListener,
        state: SharedRunState,
        events: Receiver<RunEvent>,
        hooks: Arc<CountingHooks>,
    }

    fn fixture(shutdown_on_finish: bool) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let render_dir = dir.path().join("render");
        fs::create_dir_all(&render_dir).expect("render dir");
        let file = dir.path().join("shot.blend");
        fs::write(&file, b"blend").expect("write project");
        let mut metadata = sample_metadata();
        metadata.render_filepath = format!("{}/out_####", render_dir.display());
        let project = Project::from_metadata(file.clone(), &metadata, 0);

        let state = SharedRunState::default();
        state
            .lock()
            .begin_run(10, Instant::now())
            .expect("begin run");
        let (sender, events) = mpsc::channel();
        let hooks = Arc::new(CountingHooks::default());
        let listener = ProgressListener::new(
            ProtocolParser::new(&ProtocolPatterns::default()).expect("patterns"),
            state.clone(),
            vec![project],
            sender,
            hooks.clone(),
            shutdown_on_finish,
        );
        Fixture {
            _dir: dir,
            render_dir,
            file,
            listener,
            state,
            events,
            hooks,
        }
    }

    fn switch_line(file: &Path) -> String {
        format!(
            "\"blender\" --background \"{}\" --scene \"Scene\" -E \"CYCLES\" --python \"s.py\" -f \"1,2,3,4,5,6,7,8,9,10\"",
            file.display()
        )
    }

    #[test]
    fn counts_frames_and_saved_outputs() {
        let fx = fixture(false);
        fx.listener.handle_line(&switch_line(&fx.file));
        fx.listener.handle_line(SETTINGS_SENTINEL);
        fx.listener.handle_line("Fra:1 Mem:10M | Syncing");
        fx.listener.handle_line("Fra:1 Mem:10M | Sample 64/128");
        fx.listener.handle_line("Fra:1 Mem:12M | Updating");
        fx.listener.handle_line("Saved: '/r/out_0001.png'");
        fx.listener.handle_line("Fra:2 Mem:10M | Syncing");

        let state = fx.state.lock();
        assert_eq!(state.current_project, Some(0));
        assert_eq!(state.project_frames, 10);
        assert_eq!(state.global_frame, 2);
        assert_eq!(state.project_frame, 2);
        assert_eq!(state.saved_outputs, vec![PathBuf::from("/r/out_0001.png")]);
        assert!(state.unsaved_frames.is_empty());
        assert_eq!(state.durations().count(), 1);
    }

    #[test]
    fn progress_before_settings_aborts_run() {
        let fx = fixture(false);
        fx.listener.handle_line(&switch_line(&fx.file));
        fx.listener.handle_line("Rendering frame 1");

        let state = fx.state.lock();
        assert_eq!(state.status(), RunStatus::RenderingStopping);
        assert!(matches!(
            state.failure(),
            Some(QueueError::SettingsNotApplied(_))
        ));
        assert_eq!(state.global_frame, 0, "aborting line is not counted");
        drop(state);

        let events = fx.events.try_iter().collect::<Vec<_>>();
        assert!(events.iter().any(|event| matches!(
            event,
            RunEvent::Error { kind: "settings_not_applied", .. }
        )));
    }

    #[test]
    fn unsaved_frame_output_is_removed() {
        let fx = fixture(false);
        let partial = fx.render_dir.join("out_0003.png");
        fs::write(&partial, b"partial").expect("partial frame");

        fx.listener.handle_line(&switch_line(&fx.file));
        fx.listener.handle_line(SETTINGS_SENTINEL);
        fx.listener.handle_line("Rendering frame 3");
        fx.listener.handle_line("Rendering frame 4");

        assert!(!partial.exists());
        assert_eq!(fx.state.lock().unsaved_frames, vec![3]);
        let events = fx.events.try_iter().collect::<Vec<_>>();
        assert!(events.contains(&RunEvent::UnsavedFrame {
            frame: 3,
            removed: Some(partial),
        }));
    }

    #[test]
    fn finished_run_completes_counters_and_shuts_down() {
        let fx = fixture(true);
        let (lines, receiver) = mpsc::channel();
        lines.send(switch_line(&fx.file)).expect("send");
        lines.send(String::from(SETTINGS_SENTINEL)).expect("send");
        lines.send(String::from("Rendering frame 1")).expect("send");
        lines.send(String::from("Saved: '/r/out_0001.png'")).expect("send");
        drop(lines);
        fx.state.lock().finish_loop();

        let state = fx.state.clone();
        let hooks = fx.hooks.clone();
        fx.listener.run(receiver);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, RunStatus::ReadyToRender);
        assert_eq!(snapshot.global_frame, snapshot.global_frames);
        assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.wakes.load(Ordering::SeqCst), 1);

        let events = fx
            .events
            .recv_timeout(Duration::from_secs(1))
            .into_iter()
            .chain(fx.events.try_iter())
            .collect::<Vec<_>>();
        assert!(events.contains(&RunEvent::Finished));
    }

    #[test]
    fn stopped_run_skips_shutdown_but_wakes() {
        let fx = fixture(true);
        let (lines, receiver) = mpsc::channel::<String>();
        drop(lines);
        fx.state.lock().request_stop();

        let hooks = fx.hooks.clone();
        fx.listener.run(receiver);
        assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.wakes.load(Ordering::SeqCst), 1);
        assert!(fx.events.try_iter().any(|event| event == RunEvent::Stopped));
    }
}
