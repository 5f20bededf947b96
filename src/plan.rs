//! Output resolution planning and the immutable encode plan.
//!
//! The plan is computed once, before any pipeline starts, and shared read-only by every pipeline.

use crate::codec::{AudioCodec, VideoCodec};
use crate::error::{Error, Result};
use crate::opts::{Opts, ScalePolicy};
use crate::track::{Rotation, SelectedTracks, TrackDescriptor};

/// Everything the pipelines need to know about the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodePlan {
    pub target_video_codec: VideoCodec,
    pub target_audio_codec: AudioCodec,
    /// Target video bitrate (bits/sec).
    pub target_bitrate: u32,
    pub final_width: u32,
    pub final_height: u32,
    pub audio_bitrate: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
    /// Orientation hint recorded in the output container (the source rotation, unchanged).
    pub rotation: Rotation,
}

impl EncodePlan {
    /// Derive the plan for a request over the selected source tracks.
    pub fn new(opts: &Opts, tracks: &SelectedTracks, policy: ScalePolicy) -> Result<Self> {
        let video = &tracks.video;
        let requested = opts.width.zip(opts.height);
        let (final_width, final_height) = plan_dimensions(video, requested, policy)?;

        if requested.is_none()
            && video
                .source_bitrate
                .is_some_and(|source| u64::from(opts.bitrate) < source)
        {
            tracing::warn!(
                target_bitrate = opts.bitrate,
                source_bitrate = video.source_bitrate,
                "resolution is unchanged and only the bitrate is lowered; compression gains may be limited (set width/height for a smaller file)"
            );
        }

        Ok(Self {
            target_video_codec: opts.video_codec,
            target_audio_codec: opts.audio_codec,
            target_bitrate: opts.bitrate,
            final_width,
            final_height,
            audio_bitrate: opts.audio_bitrate,
            audio_sample_rate: opts.audio_sample_rate,
            audio_channels: opts.audio_channels,
            rotation: video.rotation,
        })
    }

    /// Whether the video track can be copied into the output without re-encoding.
    ///
    /// Requires the same codec, the planned size equal to the source size and a source bitrate
    /// that is already at or below the target.
    pub fn video_is_passthrough(&self, video: &TrackDescriptor) -> bool {
        let (width, height) = (video.width, video.height);
        let (width, height) = if video.rotation.is_quarter_turn() {
            (height, width)
        } else {
            (width, height)
        };

        video.mime_type == self.target_video_codec.mime_type()
            && width == self.final_width
            && height == self.final_height
            && video
                .source_bitrate
                .is_some_and(|b| b <= u64::from(self.target_bitrate))
    }

    /// Whether the audio track can be copied into the output without re-encoding.
    pub fn audio_is_passthrough(&self, audio: &TrackDescriptor) -> bool {
        audio.mime_type == self.target_audio_codec.mime_type()
            && audio.sample_rate == self.audio_sample_rate
            && audio.channel_count == self.audio_channels
            && audio
                .source_bitrate
                .is_some_and(|b| b <= u64::from(self.audio_bitrate))
    }
}

/// Round to the nearest multiple of 16, ties rounding up.
///
/// Most hardware video encoders require macroblock-aligned dimensions.
pub fn round16(value: u32) -> u32 {
    (value.saturating_add(8) / 16) * 16
}

/// Compute the final output dimensions.
///
/// Rotation is applied first: a quarter-turned source has its width and height swapped to form the
/// "effective original". An explicit request replaces the effective original; otherwise the scale
/// policy decides. Each dimension is then aligned with [`round16`]; a zero result is rejected.
pub fn plan_dimensions(
    video: &TrackDescriptor,
    requested: Option<(u32, u32)>,
    policy: ScalePolicy,
) -> Result<(u32, u32)> {
    let effective = if video.rotation.is_quarter_turn() {
        (video.height, video.width)
    } else {
        (video.width, video.height)
    };

    let (width, height) = match requested {
        Some(size) => size,
        None => apply_policy(effective, policy),
    };

    let (width, height) = (round16(width), round16(height));
    if width == 0 || height == 0 {
        return Err(Error::invalid(format!(
            "output dimensions round to zero ({width}x{height})"
        )));
    }

    tracing::debug!(
        source_width = video.width,
        source_height = video.height,
        rotation = video.rotation.degrees(),
        width,
        height,
        "planned output resolution"
    );

    Ok((width, height))
}

fn apply_policy((width, height): (u32, u32), policy: ScalePolicy) -> (u32, u32) {
    match policy {
        ScalePolicy::PreserveOriginal => (width, height),
        ScalePolicy::FitWithin {
            max_width,
            max_height,
        } => {
            if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
                return (width, height);
            }

            let scale = f64::min(
                f64::from(max_width) / f64::from(width),
                f64::from(max_height) / f64::from(height),
            );
            (
                (f64::from(width) * scale).round() as u32,
                (f64::from(height) * scale).round() as u32,
            )
        }
    }
}
