//! Classification of the renderer's text output.
//!
//! Each line is tested against an ordered list of rules; the first rule that
//! matches decides the event. The patterns are plain regexes with named groups
//! so they can be replaced from the configuration file when the renderer's
//! output format drifts between versions.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Printed by the generated settings script once every setting is applied.
pub const SETTINGS_SENTINEL: &str = "---RENDERQ-SETTINGS-APPLIED";

pub const DEFAULT_PROJECT_SWITCH: &str =
    r#"--background\s+"(?P<file>[^"]+)".*?\s-f\s+"(?P<frames>[^"]*)""#;
pub const DEFAULT_SETTINGS_CONFIRMED: &str = r"^\s*---RENDERQ-SETTINGS-APPLIED\s*$";
pub const DEFAULT_TILE_PROGRESS: &str =
    r"(?:Rendered (?P<tile>\d+)/(?P<tiles>\d+) Tiles, )?Sample (?P<sample>\d+)/(?P<samples>\d+)";
pub const DEFAULT_FRAME_SAVED: &str = r#"Saved:\s*['"](?P<path>.+?)['"]"#;
pub const DEFAULT_FRAME_START: &str =
    r"(?:Rendering frame |Rendering single frame \(frame |Fra:)(?P<frame>-?\d+)";

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// The echoed invocation of the next project.
    ProjectSwitch { file: String, frames: String },
    SettingsConfirmed,
    /// Sub-frame progress in `0.0..=1.0`.
    TileProgress { fraction: f64 },
    FrameSaved { path: String },
    FrameStart { frame: i64 },
    Unrecognized,
}

impl ProtocolEvent {
    /// True for the events that must not arrive before the settings sentinel.
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            ProtocolEvent::TileProgress { .. }
                | ProtocolEvent::FrameSaved { .. }
                | ProtocolEvent::FrameStart { .. }
        )
    }
}

/// Regex sources for every rule, in the form they appear in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolPatterns {
    pub project_switch: String,
    pub settings_confirmed: String,
    pub tile_progress: String,
    pub frame_saved: String,
    pub frame_start: String,
}

impl Default for ProtocolPatterns {
    fn default() -> Self {
        Self {
            project_switch: DEFAULT_PROJECT_SWITCH.to_owned(),
            settings_confirmed: DEFAULT_SETTINGS_CONFIRMED.to_owned(),
            tile_progress: DEFAULT_TILE_PROGRESS.to_owned(),
            frame_saved: DEFAULT_FRAME_SAVED.to_owned(),
            frame_start: DEFAULT_FRAME_START.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    ProjectSwitch,
    SettingsConfirmed,
    TileProgress,
    FrameSaved,
    FrameStart,
}

impl RuleKind {
    fn name(self) -> &'static str {
        match self {
            RuleKind::ProjectSwitch => "project_switch",
            RuleKind::SettingsConfirmed => "settings_confirmed",
            RuleKind::TileProgress => "tile_progress",
            RuleKind::FrameSaved => "frame_saved",
            RuleKind::FrameStart => "frame_start",
        }
    }

    fn required_groups(self) -> &'static [&'static str] {
        match self {
            RuleKind::ProjectSwitch => &["file", "frames"],
            RuleKind::SettingsConfirmed => &[],
            RuleKind::TileProgress => &["sample", "samples"],
            RuleKind::FrameSaved => &["path"],
            RuleKind::FrameStart => &["frame"],
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    kind: RuleKind,
    regex: Regex,
}

#[derive(Debug, Clone)]
pub struct ProtocolParser {
    rules: Vec<Rule>,
}

impl ProtocolParser {
    pub fn new(patterns: &ProtocolPatterns) -> QueueResult<Self> {
        let sources = [
            (RuleKind::ProjectSwitch, &patterns.project_switch),
            (RuleKind::SettingsConfirmed, &patterns.settings_confirmed),
            (RuleKind::TileProgress, &patterns.tile_progress),
            (RuleKind::FrameSaved, &patterns.frame_saved),
            (RuleKind::FrameStart, &patterns.frame_start),
        ];

        let mut rules = Vec::with_capacity(sources.len());
        for (kind, source) in sources {
            let regex = Regex::new(source).map_err(|error| {
                QueueError::validation(format!("invalid {} pattern: {error}", kind.name()))
            })?;
            let names = regex.capture_names().flatten().collect::<Vec<_>>();
            for group in kind.required_groups() {
                if !names.contains(group) {
                    return Err(QueueError::validation(format!(
                        "{} pattern is missing the named group '{group}'",
                        kind.name()
                    )));
                }
            }
            rules.push(Rule { kind, regex });
        }
        Ok(Self { rules })
    }

    pub fn classify(&self, line: &str) -> ProtocolEvent {
        for rule in &self.rules {
            let Some(captures) = rule.regex.captures(line) else {
                continue;
            };
            if let Some(event) = event_from(rule.kind, &captures) {
                return event;
            }
        }
        ProtocolEvent::Unrecognized
    }
}

fn event_from(kind: RuleKind, captures: &Captures<'_>) -> Option<ProtocolEvent> {
    match kind {
        RuleKind::ProjectSwitch => Some(ProtocolEvent::ProjectSwitch {
            file: captures.name("file")?.as_str().to_owned(),
            frames: captures.name("frames")?.as_str().to_owned(),
        }),
        RuleKind::SettingsConfirmed => Some(ProtocolEvent::SettingsConfirmed),
        RuleKind::TileProgress => {
            let sample = number(captures, "sample")?;
            let samples = number(captures, "samples")?;
            let fraction = match (number(captures, "tile"), number(captures, "tiles")) {
                (Some(tile), Some(tiles)) => ratio(tile * samples + sample, tiles * samples),
                _ => ratio(sample, samples),
            };
            Some(ProtocolEvent::TileProgress { fraction })
        }
        RuleKind::FrameSaved => Some(ProtocolEvent::FrameSaved {
            path: captures.name("path")?.as_str().to_owned(),
        }),
        RuleKind::FrameStart => Some(ProtocolEvent::FrameStart {
            frame: captures.name("frame")?.as_str().parse().ok()?,
        }),
    }
}

fn number(captures: &Captures<'_>, group: &str) -> Option<f64> {
    captures.name(group)?.as_str().parse().ok()
}

fn ratio(done: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    (done / total).clamp(0.0, 1.0)
}
