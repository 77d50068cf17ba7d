//! Frame range mini-language.
//!
//! Accepts strings such as `1-250x2, ^100-110, 300` and expands them into an
//! ordered, de-duplicated set of frame numbers. Tokens are single numbers,
//! ranges `A-B`, or stepped ranges `A-BxS` / `A-B%S`. A `^` or `!` prefix
//! excludes the token's frames from the final set. Text that does not look
//! like a token is skipped.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::{QueueError, QueueResult};

/// Values are compared after rounding to this many decimal places.
const DECIMAL_PLACES: i32 = 5;
const SCALE: f64 = 100_000.0;
const STEP_EPSILON: f64 = 1e-9;
/// Upper bound on the frames a single range token may expand to.
pub const MAX_RANGE_FRAMES: usize = 1_000_000;

static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();

fn token_regex() -> &'static Regex {
    TOKEN_REGEX.get_or_init(|| {
        Regex::new(
            r"(?x)
            (?P<exclude>[\^!])?\s*
            (?P<start>[-+]?(?:\d*\.\d+|\d+\.?))
            (?:
                \s*-\s*
                (?P<end>[-+]?(?:\d*\.\d+|\d+\.?))
                (?:\s*[x%]\s*(?P<step>[-+]?(?:\d*\.\d+|\d+\.?)))?
            )?
            ",
        )
        .expect("frame token regex should compile")
    })
}

/// How bare tokens following an exclusion are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExclusionMode {
    /// Each token is excluded only when it carries its own `^`/`!` prefix.
    #[default]
    Individual,
    /// After the first excluded token every later token is excluded too.
    Sticky,
}

/// A single frame number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame {
    Int(i64),
    Decimal(f64),
}

impl Frame {
    /// Renders the frame left-padded with zeros to `width` characters.
    pub fn zero_padded(self, width: usize) -> String {
        match self {
            Frame::Int(value) => format!("{value:0width$}"),
            Frame::Decimal(value) => format!("{value:0width$}"),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Int(value) => write!(f, "{value}"),
            Frame::Decimal(value) => write!(f, "{value}"),
        }
    }
}

/// Sorted, de-duplicated frames. Integral unless some value had a fraction.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameSet {
    Integers(Vec<i64>),
    Decimals(Vec<f64>),
}

impl Default for FrameSet {
    fn default() -> Self {
        FrameSet::Integers(Vec::new())
    }
}

impl FrameSet {
    pub fn len(&self) -> usize {
        match self {
            FrameSet::Integers(values) => values.len(),
            FrameSet::Decimals(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frames(&self) -> Vec<Frame> {
        match self {
            FrameSet::Integers(values) => values.iter().copied().map(Frame::Int).collect(),
            FrameSet::Decimals(values) => values.iter().copied().map(Frame::Decimal).collect(),
        }
    }

    /// Keeps the frames for which `keep` returns true.
    pub fn filter(&self, mut keep: impl FnMut(Frame) -> bool) -> FrameSet {
        match self {
            FrameSet::Integers(values) => FrameSet::Integers(
                values
                    .iter()
                    .copied()
                    .filter(|value| keep(Frame::Int(*value)))
                    .collect(),
            ),
            FrameSet::Decimals(values) => FrameSet::Decimals(
                values
                    .iter()
                    .copied()
                    .filter(|value| keep(Frame::Decimal(*value)))
                    .collect(),
            ),
        }
    }

    /// Comma-joined form, as passed to the renderer's `-f` flag.
    /// Parsing this string again yields the same set.
    pub fn to_spec_string(&self) -> String {
        self.frames()
            .iter()
            .map(Frame::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for FrameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_spec_string())
    }
}

/// Expands `input`, absorbing parse errors into an empty set.
pub fn expand(input: &str) -> FrameSet {
    expand_with(input, ExclusionMode::default())
}

pub fn expand_with(input: &str, mode: ExclusionMode) -> FrameSet {
    match parse(input, mode) {
        Ok(frames) => frames,
        Err(error) => {
            tracing::debug!(spec = input, %error, "frame spec yielded no frames");
            FrameSet::default()
        }
    }
}

/// Parses `input` into a frame set.
///
/// Fails with [`QueueError::Parse`] only when no token could be recognized.
/// A spec whose frames are all excluded is not an error.
pub fn parse(input: &str, mode: ExclusionMode) -> QueueResult<FrameSet> {
    let mut included = BTreeSet::new();
    let mut excluded = BTreeSet::new();
    let mut recognized = 0usize;
    let mut excluding = false;

    for captures in token_regex().captures_iter(input) {
        let Some(token) = Token::from_captures(&captures) else {
            continue;
        };
        recognized += 1;

        let exclude = token.exclude || (mode == ExclusionMode::Sticky && excluding);
        if token.exclude {
            excluding = true;
        }

        let Some(keys) = token.expand() else {
            tracing::debug!(token = &captures[0], "skipping frame token");
            continue;
        };
        if exclude {
            excluded.extend(keys);
        } else {
            included.extend(keys);
        }
    }

    if recognized == 0 {
        return Err(QueueError::parse(format!(
            "no frame tokens found in '{}'",
            input.trim()
        )));
    }

    let keys = included.difference(&excluded).copied().collect::<Vec<_>>();
    Ok(frame_set_from_keys(keys))
}

struct Token {
    exclude: bool,
    start: f64,
    end: Option<f64>,
    step: Option<f64>,
}

impl Token {
    fn from_captures(captures: &Captures<'_>) -> Option<Self> {
        let start = captures.name("start")?.as_str().parse::<f64>().ok()?;
        let end = match captures.name("end") {
            Some(value) => Some(value.as_str().parse::<f64>().ok()?),
            None => None,
        };
        let step = match captures.name("step") {
            Some(value) => Some(value.as_str().parse::<f64>().ok()?),
            None => None,
        };
        Some(Self {
            exclude: captures.name("exclude").is_some(),
            start,
            end,
            step,
        })
    }

    /// Expands to scaled integer keys, or `None` for an unusable token.
    fn expand(&self) -> Option<Vec<i64>> {
        let Some(end) = self.end else {
            return Some(vec![to_key(self.start)]);
        };

        let (low, high) = if self.start <= end {
            (self.start, end)
        } else {
            (end, self.start)
        };
        let step = self.step.unwrap_or(1.0).abs();
        if step == 0.0 || !step.is_finite() {
            return None;
        }

        let span = (high - low) / step;
        let last_index = (span + STEP_EPSILON).floor();
        if !last_index.is_finite() || last_index as usize >= MAX_RANGE_FRAMES {
            tracing::warn!(low, high, step, "frame range too large, ignoring");
            return None;
        }

        let count = last_index as usize + 1;
        Some(
            (0..count)
                .map(|index| to_key(round_decimals(low + index as f64 * step)))
                .collect(),
        )
    }
}

fn round_decimals(value: f64) -> f64 {
    let factor = 10f64.powi(DECIMAL_PLACES);
    (value * factor).round() / factor
}

fn to_key(value: f64) -> i64 {
    (value * SCALE).round() as i64
}

fn frame_set_from_keys(keys: Vec<i64>) -> FrameSet {
    let scale = SCALE as i64;
    if keys.iter().all(|key| key % scale == 0) {
        FrameSet::Integers(keys.into_iter().map(|key| key / scale).collect())
    } else {
        FrameSet::Decimals(keys.into_iter().map(|key| key as f64 / SCALE).collect())
    }
}
