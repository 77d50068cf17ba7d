//! Shared state of a render run.
//!
//! The orchestrator owns the status transitions and the active process id;
//! the progress listener owns the counters, the timing window and the
//! saved/unsaved lists. Both reach the state through [`SharedRunState`].

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

pub const DEFAULT_ETA_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    ReadyToRender,
    Rendering,
    RenderingStopping,
    RenderingFinished,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::ReadyToRender => "READY_TO_RENDER",
            RunStatus::Rendering => "RENDERING",
            RunStatus::RenderingStopping => "RENDERING_STOPPING",
            RunStatus::RenderingFinished => "RENDERING_FINISHED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived timing values published by the ETA timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub elapsed: Duration,
    pub average: Option<Duration>,
    pub eta: Option<Duration>,
}

impl Timing {
    pub fn text(&self) -> String {
        format!(
            "Elapsed: {} | AVG: {} | ETA: {}",
            format_clock(Some(self.elapsed)),
            format_clock(self.average),
            format_clock(self.eta)
        )
    }
}

/// `HH:MM:SS`, or `--:--:--` when the value is unknown.
pub fn format_clock(value: Option<Duration>) -> String {
    let Some(value) = value else {
        return String::from("--:--:--");
    };
    let seconds = value.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

/// Read-only copy of the counters handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub status: RunStatus,
    pub current_project: Option<usize>,
    pub global_frame: usize,
    pub global_frames: usize,
    pub project_frame: usize,
    pub project_frames: usize,
    pub global_progress: f64,
    pub project_progress: f64,
    pub frame_progress: f64,
}

#[derive(Debug)]
pub struct RunState {
    status: RunStatus,
    pub global_frame: usize,
    pub global_frames: usize,
    pub project_frame: usize,
    pub project_frames: usize,
    pub frame_progress: f64,
    pub current_project: Option<usize>,
    pub settings_pending: bool,
    pub last_frame_start: Option<i64>,
    pub frame_in_flight: Option<i64>,
    pub saved_outputs: Vec<PathBuf>,
    pub unsaved_frames: Vec<i64>,
    durations: VecDeque<Duration>,
    window: usize,
    run_started: Option<Instant>,
    frame_started: Option<Instant>,
    started_at: Option<DateTime<Local>>,
    process_id: Option<u32>,
    failure: Option<QueueError>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new(DEFAULT_ETA_WINDOW)
    }
}

impl RunState {
    pub fn new(window: usize) -> Self {
        Self {
            status: RunStatus::ReadyToRender,
            global_frame: 0,
            global_frames: 0,
            project_frame: 0,
            project_frames: 0,
            frame_progress: 0.0,
            current_project: None,
            settings_pending: false,
            last_frame_start: None,
            frame_in_flight: None,
            saved_outputs: Vec::new(),
            unsaved_frames: Vec::new(),
            durations: VecDeque::with_capacity(window.max(1)),
            window: window.max(1),
            run_started: None,
            frame_started: None,
            started_at: None,
            process_id: None,
            failure: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    pub fn failure(&self) -> Option<&QueueError> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<QueueError> {
        self.failure.take()
    }

    /// Clears every counter and enters `RENDERING`. Only valid from
    /// `READY_TO_RENDER`.
    pub fn begin_run(&mut self, global_frames: usize, now: Instant) -> QueueResult<()> {
        if self.status != RunStatus::ReadyToRender {
            return Err(QueueError::invalid_state(format!(
                "cannot start a run while {}",
                self.status
            )));
        }
        let window = self.window;
        *self = Self::new(window);
        self.status = RunStatus::Rendering;
        self.global_frames = global_frames;
        self.run_started = Some(now);
        self.frame_started = Some(now);
        self.started_at = Some(Local::now());
        Ok(())
    }

    /// Moves `RENDERING` to `RENDERING_STOPPING`. Returns false, changing
    /// nothing, from any other status.
    pub fn request_stop(&mut self) -> bool {
        if self.status != RunStatus::Rendering {
            return false;
        }
        self.status = RunStatus::RenderingStopping;
        true
    }

    /// Records the first failure of the run and requests a stop.
    pub fn abort(&mut self, error: QueueError) -> bool {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
        self.request_stop()
    }

    /// Called when the project loop ends. Only a run that was never asked to
    /// stop becomes `RENDERING_FINISHED`.
    pub fn finish_loop(&mut self) -> RunStatus {
        if self.status == RunStatus::Rendering {
            self.status = RunStatus::RenderingFinished;
        }
        self.status
    }

    /// Returns to `READY_TO_RENDER` once the listener has wrapped up.
    pub fn reset_to_ready(&mut self) {
        self.status = RunStatus::ReadyToRender;
        self.process_id = None;
    }

    pub fn set_process(&mut self, process_id: Option<u32>) {
        self.process_id = process_id;
    }

    pub fn switch_project(&mut self, index: Option<usize>, frames: usize) {
        self.current_project = index;
        self.project_frame = 0;
        self.project_frames = frames;
        self.settings_pending = true;
        self.last_frame_start = None;
        self.frame_progress = 0.0;
    }

    /// Counts a new frame. Duplicate start lines for the same frame are
    /// ignored and return false.
    pub fn start_frame(&mut self, frame: i64) -> bool {
        if self.last_frame_start == Some(frame) {
            return false;
        }
        self.last_frame_start = Some(frame);
        self.frame_in_flight = Some(frame);
        self.global_frame += 1;
        self.project_frame += 1;
        self.frame_progress = 0.0;
        true
    }

    /// Takes the in-flight frame, if any, and records it as unsaved.
    pub fn mark_in_flight_unsaved(&mut self) -> Option<i64> {
        let frame = self.frame_in_flight.take()?;
        self.unsaved_frames.push(frame);
        Some(frame)
    }

    pub fn record_saved(&mut self, path: PathBuf, now: Instant) {
        self.saved_outputs.push(path);
        if let Some(started) = self.frame_started {
            self.push_duration(now.saturating_duration_since(started));
        }
        self.frame_started = Some(now);
        self.frame_in_flight = None;
        self.frame_progress = 1.0;
    }

    fn push_duration(&mut self, duration: Duration) {
        if self.durations.len() == self.window {
            self.durations.pop_front();
        }
        self.durations.push_back(duration);
    }

    pub fn durations(&self) -> impl Iterator<Item = &Duration> {
        self.durations.iter()
    }

    pub fn average_frame_time(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        let total = self.durations.iter().sum::<Duration>();
        Some(total / self.durations.len() as u32)
    }

    /// `avg × (global_frames + 1 − global_frame) − time in current frame`,
    /// floored at zero.
    pub fn timing(&self, now: Instant) -> Timing {
        let elapsed = self
            .run_started
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        let average = self.average_frame_time();
        let eta = average.map(|average| {
            let remaining = (self.global_frames + 1).saturating_sub(self.global_frame) as u32;
            let in_frame = self
                .frame_started
                .map(|started| now.saturating_duration_since(started))
                .unwrap_or_default();
            (average * remaining).saturating_sub(in_frame)
        });
        Timing {
            elapsed,
            average,
            eta,
        }
    }

    /// Pushes every counter to its final value.
    pub fn complete_counters(&mut self) {
        self.global_frame = self.global_frames;
        self.project_frame = self.project_frames;
        self.frame_progress = 1.0;
    }

    pub fn global_progress(&self) -> f64 {
        fraction(self.global_frame, self.global_frames)
    }

    pub fn project_progress(&self) -> f64 {
        fraction(self.project_frame, self.project_frames)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            status: self.status,
            current_project: self.current_project,
            global_frame: self.global_frame,
            global_frames: self.global_frames,
            project_frame: self.project_frame,
            project_frames: self.project_frames,
            global_progress: self.global_progress(),
            project_progress: self.project_progress(),
            frame_progress: self.frame_progress,
        }
    }
}

/// `(frame - 1) / frames`, the share of frames finished before `frame`.
fn fraction(frame: usize, frames: usize) -> f64 {
    if frames == 0 {
        return 0.0;
    }
    (frame.saturating_sub(1) as f64 / frames as f64).clamp(0.0, 1.0)
}

/// Cloneable handle to the run state of one orchestrator.
#[derive(Debug, Clone, Default)]
pub struct SharedRunState {
    inner: Arc<Mutex<RunState>>,
}

impl SharedRunState {
    pub fn new(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunState::new(window))),
        }
    }

    /// Locks the state, recovering it if another thread panicked while
    /// holding the lock.
    pub fn lock(&self) -> MutexGuard<'_, RunState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.lock().status()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot()
    }

    pub fn request_stop(&self) -> bool {
        self.lock().request_stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendering(global_frames: usize, now: Instant) -> RunState {
        let mut state = RunState::default();
        state.begin_run(global_frames, now).expect("begin run");
        state
    }

    #[test]
    fn begin_run_is_rejected_while_rendering() {
        let now = Instant::now();
        let mut state = rendering(10, now);
        let err = state.begin_run(10, now).expect_err("already rendering");
        assert!(matches!(err, QueueError::InvalidState(_)));
        assert_eq!(state.status(), RunStatus::Rendering);
    }

    #[test]
    fn stop_is_a_no_op_when_ready() {
        let mut state = RunState::default();
        assert!(!state.request_stop());
        assert_eq!(state.status(), RunStatus::ReadyToRender);
    }

    #[test]
    fn status_walks_through_the_run() {
        let mut state = rendering(2, Instant::now());
        assert_eq!(state.finish_loop(), RunStatus::RenderingFinished);
        assert!(!state.request_stop(), "finished runs cannot be stopped");
        state.reset_to_ready();
        assert_eq!(state.status(), RunStatus::ReadyToRender);

        let mut state = rendering(2, Instant::now());
        assert!(state.request_stop());
        assert_eq!(state.finish_loop(), RunStatus::RenderingStopping);
    }

    #[test]
    fn abort_keeps_first_failure() {
        let mut state = rendering(2, Instant::now());
        assert!(state.abort(QueueError::settings_not_applied("first")));
        assert!(!state.abort(QueueError::settings_not_applied("second")));
        assert!(state
            .failure()
            .is_some_and(|error| error.to_string().contains("first")));
    }

    #[test]
    fn duplicate_frame_starts_are_ignored() {
        let mut state = rendering(5, Instant::now());
        state.switch_project(Some(0), 5);
        assert!(state.start_frame(1));
        assert!(!state.start_frame(1));
        assert!(state.start_frame(2));
        assert_eq!(state.global_frame, 2);
        assert_eq!(state.project_frame, 2);
        assert!((state.global_progress() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn unsaved_in_flight_frame_is_recorded_once() {
        let mut state = rendering(5, Instant::now());
        state.start_frame(3);
        assert_eq!(state.mark_in_flight_unsaved(), Some(3));
        assert_eq!(state.mark_in_flight_unsaved(), None);
        assert_eq!(state.unsaved_frames, vec![3]);
    }

    #[test]
    fn timing_window_keeps_last_three() {
        let start = Instant::now();
        let mut state = rendering(10, start);
        let mut now = start;
        for seconds in [100, 10, 20, 30] {
            now += Duration::from_secs(seconds);
            state.record_saved(PathBuf::from("f.png"), now);
        }
        assert_eq!(state.durations().count(), 3);
        assert_eq!(state.average_frame_time(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn eta_subtracts_time_in_current_frame() {
        let start = Instant::now();
        let mut state = rendering(4, start);
        state.start_frame(1);
        let saved = start + Duration::from_secs(10);
        state.record_saved(PathBuf::from("f1.png"), saved);
        state.start_frame(2);

        let timing = state.timing(saved + Duration::from_secs(4));
        assert_eq!(timing.elapsed, Duration::from_secs(14));
        assert_eq!(timing.average, Some(Duration::from_secs(10)));
        // 10s * (4 + 1 - 2) - 4s
        assert_eq!(timing.eta, Some(Duration::from_secs(26)));
        assert_eq!(
            timing.text(),
            "Elapsed: 00:00:14 | AVG: 00:00:10 | ETA: 00:00:26"
        );
    }

    #[test]
    fn eta_is_clamped_and_unknown_without_samples() {
        let start = Instant::now();
        let mut state = rendering(1, start);
        assert_eq!(state.timing(start).eta, None);
        assert!(state.timing(start).text().ends_with("ETA: --:--:--"));

        state.start_frame(1);
        let saved = start + Duration::from_secs(1);
        state.record_saved(PathBuf::from("f.png"), saved);
        let late = state.timing(saved + Duration::from_secs(3600));
        assert_eq!(late.eta, Some(Duration::ZERO));
    }

    #[test]
    fn clock_format_rolls_over_hours() {
        assert_eq!(format_clock(Some(Duration::from_secs(3_725))), "01:02:05");
        assert_eq!(format_clock(None), "--:--:--");
    }
}
