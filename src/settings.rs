//! Layered per-project settings: a base value discovered in the project file
//! and an optional user override on top of it.

use serde::{Deserialize, Serialize};

pub const FILE_FORMATS: &[&str] = &["PNG", "JPEG", "JPEG2000", "WEBP", "TIFF"];
pub const DENOISERS: &[&str] = &["NONE", "OPTIX", "OPENIMAGEDENOISE"];
pub const DENOISING_INPUT_PASSES: &[&str] = &["RGB", "RGB_ALBEDO", "RGB_ALBEDO_NORMAL"];
pub const DENOISING_PREFILTERS: &[&str] = &["NONE", "FAST", "ACCURATE"];

/// Literal some writers use to mean "no value".
const NULL_MARKER: &str = "None";

/// A value that can take part in override resolution.
pub trait SettingValue: Clone + PartialEq {
    /// True when the value stands in for "unset".
    fn is_null_marker(&self) -> bool {
        false
    }
}

impl SettingValue for String {
    fn is_null_marker(&self) -> bool {
        self == NULL_MARKER
    }
}

impl SettingValue for bool {}
impl SettingValue for u32 {}

/// Returns the override when set, otherwise the base. When `allowed` is given
/// and the result is not one of its members, the first allowed value wins.
pub fn resolve<T: SettingValue>(
    override_value: Option<&T>,
    base: Option<&T>,
    allowed: Option<&[T]>,
) -> Option<T> {
    let value = override_value
        .filter(|value| !value.is_null_marker())
        .or_else(|| base.filter(|value| !value.is_null_marker()))
        .cloned();

    match allowed {
        Some(allowed) => match value {
            Some(value) if allowed.contains(&value) => Some(value),
            _ => allowed.first().cloned(),
        },
        None => value,
    }
}

/// Owned list of allowed strings from one of the constant tables.
pub fn allowed_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

/// Base value plus optional override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overridable<T> {
    #[serde(default)]
    pub base: Option<T>,
    #[serde(default, rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_value: Option<T>,
}

impl<T> Default for Overridable<T> {
    fn default() -> Self {
        Self {
            base: None,
            override_value: None,
        }
    }
}

impl<T: SettingValue> Overridable<T> {
    pub fn new(base: T) -> Self {
        Self {
            base: Some(base),
            override_value: None,
        }
    }

    pub fn from_option(base: Option<T>) -> Self {
        Self {
            base,
            override_value: None,
        }
    }

    pub fn resolved(&self) -> Option<T> {
        resolve(self.override_value.as_ref(), self.base.as_ref(), None)
    }

    pub fn resolved_in(&self, allowed: &[T]) -> Option<T> {
        resolve(self.override_value.as_ref(), self.base.as_ref(), Some(allowed))
    }

    pub fn is_overridden(&self) -> bool {
        self.override_value
            .as_ref()
            .is_some_and(|value| !value.is_null_marker())
    }

    pub fn set_override(&mut self, value: T) {
        self.override_value = Some(value);
    }

    pub fn clear_override(&mut self) {
        self.override_value = None;
    }

    /// Replaces the base, keeping any override.
    pub fn set_base(&mut self, base: Option<T>) {
        self.base = base;
    }
}

/// Output image formats the renderer can be asked to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Png,
    Jpeg,
    Jpeg2000,
    Webp,
    Tiff,
}

impl FileFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "PNG" => Some(Self::Png),
            "JPEG" => Some(Self::Jpeg),
            "JPEG2000" => Some(Self::Jpeg2000),
            "WEBP" => Some(Self::Webp),
            "TIFF" => Some(Self::Tiff),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Png => "PNG",
            Self::Jpeg => "JPEG",
            Self::Jpeg2000 => "JPEG2000",
            Self::Webp => "WEBP",
            Self::Tiff => "TIFF",
        }
    }

    /// File extension the renderer appends for this format.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => ".png",
            Self::Jpeg => ".jpeg",
            Self::Jpeg2000 => ".jp2",
            Self::Webp => ".webp",
            Self::Tiff => ".tiff",
        }
    }
}
