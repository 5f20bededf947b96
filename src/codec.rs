//! Target codec selection.
//!
//! Callers name codecs with loose strings ("h264", "HEVC", "mp3", ...). We map those onto a small,
//! closed set of canonical identifiers here, once, so every other module matches on an enum.
//!
//! Unknown or absent names fall back to the defaults (H.264 / AAC) rather than failing: that is
//! what bridge callers have always relied on.

use std::fmt;

/// Target video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

impl VideoCodec {
    /// Resolve a caller-supplied codec name. `h265` and `hevc` are synonyms.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            Some("h265") | Some("hevc") => Self::H265,
            Some("h264") => Self::H264,
            Some(other) => {
                tracing::debug!(codec = other, "unrecognized video codec, using h264");
                Self::H264
            }
            None => Self::H264,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::H264 => "video/avc",
            Self::H265 => "video/hevc",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
        })
    }
}

/// Target audio codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AudioCodec {
    #[default]
    Aac,
    Mp3,
    Alac,
}

impl AudioCodec {
    /// Resolve a caller-supplied codec name.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            Some("aac") => Self::Aac,
            Some("mp3") => Self::Mp3,
            Some("alac") => Self::Alac,
            Some(other) => {
                tracing::debug!(codec = other, "unrecognized audio codec, using aac");
                Self::Aac
            }
            None => Self::Aac,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Aac => "audio/mp4a-latm",
            Self::Mp3 => "audio/mpeg",
            Self::Alac => "audio/alac",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::Alac => "alac",
        })
    }
}
