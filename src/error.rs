use std::path::Path;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("frame spec parse error: {0}")]
    Parse(String),

    #[error("render settings were not applied: {0}")]
    SettingsNotApplied(String),

    #[error("unsaved frame {frame}: {message}")]
    UnsavedFrame { frame: i64, message: String },

    #[error("failed to launch renderer: {0}")]
    ProcessLaunch(String),

    #[error("cache read failure: {0}")]
    CacheRead(String),

    #[error("save/load failure: {0}")]
    SaveLoad(String),

    #[error("unknown output file format '{0}'")]
    UnknownFormat(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QueueError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn settings_not_applied(msg: impl Into<String>) -> Self {
        Self::SettingsNotApplied(msg.into())
    }

    pub fn unsaved_frame(frame: i64, msg: impl Into<String>) -> Self {
        Self::UnsavedFrame {
            frame,
            message: msg.into(),
        }
    }

    pub fn process_launch(msg: impl Into<String>) -> Self {
        Self::ProcessLaunch(msg.into())
    }

    pub fn cache_read(msg: impl Into<String>) -> Self {
        Self::CacheRead(msg.into())
    }

    pub fn save_load(msg: impl Into<String>) -> Self {
        Self::SaveLoad(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Short machine-readable tag used in run summaries and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse_error",
            Self::SettingsNotApplied(_) => "settings_not_applied",
            Self::UnsavedFrame { .. } => "unsaved_frame",
            Self::ProcessLaunch(_) => "process_launch_failure",
            Self::CacheRead(_) => "cache_read_failure",
            Self::SaveLoad(_) => "save_load_failure",
            Self::UnknownFormat(_) => "unknown_format",
            Self::InvalidState(_) => "invalid_state",
            Self::Validation(_) => "validation",
            Self::Io { .. } => "io",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(QueueError::parse("x")
            .to_string()
            .contains("frame spec parse error:"));
        assert!(QueueError::settings_not_applied("x")
            .to_string()
            .contains("render settings were not applied:"));
        assert!(QueueError::process_launch("x")
            .to_string()
            .contains("failed to launch renderer:"));
        assert_eq!(
            QueueError::unsaved_frame(12, "no save line").to_string(),
            "unsaved frame 12: no save line"
        );
    }

    #[test]
    fn kinds_match_variants() {
        assert_eq!(
            QueueError::settings_not_applied("x").kind(),
            "settings_not_applied"
        );
        assert_eq!(QueueError::save_load("x").kind(), "save_load_failure");
        assert_eq!(
            QueueError::UnknownFormat(String::from("EXR")).kind(),
            "unknown_format"
        );
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = QueueError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}
