//! Source track metadata and track selection.
//!
//! Responsibilities:
//! - Describe one source track (`TrackDescriptor`) in backend-neutral terms
//! - Normalize container rotation hints into a closed set of right angles
//! - Pick the tracks we actually process: the first video track and the first audio track
//!
//! Later tracks of an already-selected type are ignored. Audio is optional; video is not.

use std::fmt;

use crate::backend::SourceContainer;
use crate::error::{Error, Result};

/// What kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    /// Classify a MIME type such as `video/avc` or `audio/mp4a-latm`.
    ///
    /// Anything that is neither `video/*` nor `audio/*` (subtitles, timed metadata, ...) is
    /// not a track we can process.
    pub fn from_mime(mime: &str) -> Option<Self> {
        if mime.starts_with("video/") {
            Some(Self::Video)
        } else if mime.starts_with("audio/") {
            Some(Self::Audio)
        } else {
            None
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
        })
    }
}

/// Clockwise display rotation of a video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Fold an arbitrary angle in degrees into one of the four right angles.
    ///
    /// Containers report rotation in different conventions (`-90`, `270`, `450`, ...). Angles
    /// that are not a multiple of 90 cannot be represented by an orientation hint; we treat
    /// them as unrotated.
    pub fn from_degrees(degrees: i64) -> Self {
        match degrees.rem_euclid(360) {
            0 => Self::Deg0,
            90 => Self::Deg90,
            180 => Self::Deg180,
            270 => Self::Deg270,
            other => {
                tracing::warn!(degrees = other, "ignoring non right-angle rotation");
                Self::Deg0
            }
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether displaying the track swaps its width and height.
    pub fn is_quarter_turn(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// Immutable description of one source track.
///
/// Video-only fields are zero for audio tracks and vice versa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    /// Track index within the source container.
    pub index: usize,
    pub media_type: MediaType,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub duration_us: i64,
    /// Average source bitrate in bits/sec, when the container reports one.
    pub source_bitrate: Option<u64>,
    pub sample_rate: u32,
    pub channel_count: u32,
}

impl TrackDescriptor {
    /// A video track with the given natural (coded) dimensions.
    pub fn video(index: usize, mime_type: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            index,
            media_type: MediaType::Video,
            mime_type: mime_type.into(),
            width,
            height,
            rotation: Rotation::Deg0,
            duration_us: 0,
            source_bitrate: None,
            sample_rate: 0,
            channel_count: 0,
        }
    }

    /// An audio track with the given sample rate and channel count.
    pub fn audio(
        index: usize,
        mime_type: impl Into<String>,
        sample_rate: u32,
        channel_count: u32,
    ) -> Self {
        Self {
            index,
            media_type: MediaType::Audio,
            mime_type: mime_type.into(),
            width: 0,
            height: 0,
            rotation: Rotation::Deg0,
            duration_us: 0,
            source_bitrate: None,
            sample_rate,
            channel_count,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_duration_us(mut self, duration_us: i64) -> Self {
        self.duration_us = duration_us;
        self
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.source_bitrate = Some(bitrate);
        self
    }

    /// The source bitrate, or `fallback` when the container doesn't report one.
    pub fn bitrate_or(&self, fallback: u64) -> u64 {
        self.source_bitrate.unwrap_or(fallback)
    }
}

/// The tracks a compression processes: exactly one video track, at most one audio track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedTracks {
    pub video: TrackDescriptor,
    pub audio: Option<TrackDescriptor>,
}

impl SelectedTracks {
    /// Duration used for progress. Falls back to the audio track when video reports none.
    pub fn duration_us(&self) -> i64 {
        if self.video.duration_us > 0 {
            return self.video.duration_us;
        }
        self.audio.as_ref().map(|a| a.duration_us).unwrap_or(0)
    }
}

/// Enumerate the source's tracks and select the first video and first audio track.
///
/// Fails with [`Error::NoVideoTrack`] when the source has no video track. Inspection is
/// read-only.
pub fn inspect<S>(source: &S) -> Result<SelectedTracks>
where
    S: SourceContainer + ?Sized,
{
    select_tracks(source.tracks())
}

/// Apply the selection policy to an already-enumerated track list.
pub fn select_tracks(tracks: &[TrackDescriptor]) -> Result<SelectedTracks> {
    let mut video: Option<&TrackDescriptor> = None;
    let mut audio: Option<&TrackDescriptor> = None;

    for track in tracks {
        match track.media_type {
            MediaType::Video if video.is_none() => video = Some(track),
            MediaType::Audio if audio.is_none() => audio = Some(track),
            _ => {
                tracing::debug!(index = track.index, mime = %track.mime_type, "ignoring extra track");
            }
        }
    }

    let video = video.cloned().ok_or(Error::NoVideoTrack)?;
    Ok(SelectedTracks {
        video,
        audio: audio.cloned(),
    })
}
