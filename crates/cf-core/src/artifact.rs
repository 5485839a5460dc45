//! The unit of data flowing between pipeline steps.
//!
//! An [`Artifact`] is immutable once produced: every step emits a new one
//! rather than mutating its input. Enums serialize in snake_case and implement
//! `Display` manually for consistent string representation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ArtifactKind
// ---------------------------------------------------------------------------

/// Media kind carried by an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Text,
    Image,
    Video,
    Audio,
    StructuredData,
}

impl ArtifactKind {
    /// File extension used when persisting an artifact of this kind that does
    /// not carry its own.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Image => "png",
            Self::Video => "mp4",
            Self::Audio => "mp3",
            Self::StructuredData => "json",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::StructuredData => write!(f, "structured_data"),
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "structured_data" | "structured-data" | "data" => Ok(Self::StructuredData),
            other => Err(format!("unknown artifact kind '{other}'")),
        }
    }
}

/// Render a list of kinds as "a", "a or b", "a, b or c".
pub fn describe_kinds(kinds: &[ArtifactKind]) -> String {
    match kinds {
        [] => "nothing".to_string(),
        [only] => only.to_string(),
        [init @ .., last] => {
            let head: Vec<String> = init.iter().map(ToString::to_string).collect();
            format!("{} or {last}", head.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// MetaValue
// ---------------------------------------------------------------------------

/// Scalar metadata value (duration, resolution, cost, model name, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    /// Numeric view of the value, parsing text when it looks like a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(_) => None,
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for MetaValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<usize> for MetaValue {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Metadata mapping attached to an artifact.
pub type Metadata = BTreeMap<String, MetaValue>;

// ---------------------------------------------------------------------------
// ArtifactData
// ---------------------------------------------------------------------------

/// Where an artifact's content lives.
///
/// A location (path or URL) and inline content are mutually exclusive by
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArtifactData {
    /// A file on the local filesystem.
    Path(PathBuf),
    /// A remote resource.
    Url(String),
    /// Inline text (prompts, transcripts, captions).
    Text(String),
    /// Inline binary content.
    Inline(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Ordered outputs of a `collect_all` parallel group; `None` marks a
    /// member that did not succeed.
    Collection(Vec<Option<Artifact>>),
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Typed unit of data produced and consumed by pipeline steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub data: ArtifactData,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, data: ArtifactData) -> Self {
        Self {
            kind,
            data,
            metadata: Metadata::new(),
        }
    }

    /// A text artifact holding `text` inline.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Text, ArtifactData::Text(text.into()))
    }

    pub fn from_path(kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        Self::new(kind, ArtifactData::Path(path.into()))
    }

    pub fn from_url(kind: ArtifactKind, url: impl Into<String>) -> Self {
        Self::new(kind, ArtifactData::Url(url.into()))
    }

    pub fn inline(kind: ArtifactKind, bytes: Vec<u8>) -> Self {
        Self::new(kind, ArtifactData::Inline(bytes))
    }

    /// A structured-data artifact wrapping ordered group member outputs.
    pub fn collection(items: Vec<Option<Artifact>>) -> Self {
        Self::new(ArtifactKind::StructuredData, ArtifactData::Collection(items))
    }

    /// Builder: return a copy carrying one more metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builder: merge a whole metadata mapping, later keys winning.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    /// The inline text, if this artifact carries any.
    pub fn as_text(&self) -> Option<&str> {
        match &self.data {
            ArtifactData::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Local file backing this artifact, if any.
    pub fn local_path(&self) -> Option<&Path> {
        match &self.data {
            ArtifactData::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Extension to use when persisting this artifact.
    ///
    /// Local files keep their own extension; text and collections are always
    /// `txt` / `json`; URLs are stored as `.url` pointer files.
    pub fn file_extension(&self) -> String {
        match &self.data {
            ArtifactData::Path(p) => p
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_else(|| self.kind.default_extension().to_string()),
            ArtifactData::Url(_) => "url".to_string(),
            ArtifactData::Text(_) => "txt".to_string(),
            ArtifactData::Collection(_) => "json".to_string(),
            ArtifactData::Inline(_) => self
                .meta("extension")
                .and_then(MetaValue::as_str)
                .map(|s| s.trim_start_matches('.').to_string())
                .unwrap_or_else(|| self.kind.default_extension().to_string()),
        }
    }

    /// Numeric quality metric named `key`, used by `best_quality` merging.
    ///
    /// `resolution` is derived from `width` x `height` when not present
    /// directly, and a textual `"1920x1080"` resolution is multiplied out.
    pub fn metric(&self, key: &str) -> Option<f64> {
        if let Some(value) = self.meta(key) {
            if let Some(n) = value.as_f64() {
                return Some(n);
            }
            if let Some(s) = value.as_str() {
                if let Some((w, h)) = s.split_once(['x', 'X']) {
                    let w: f64 = w.trim().parse().ok()?;
                    let h: f64 = h.trim().parse().ok()?;
                    return Some(w * h);
                }
            }
            return None;
        }
        if key == "resolution" {
            let w = self.meta("width")?.as_f64()?;
            let h = self.meta("height")?.as_f64()?;
            return Some(w * h);
        }
        None
    }
}
