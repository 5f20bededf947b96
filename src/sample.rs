//! Timestamped media units exchanged between readers, codecs and the muxer.
//!
//! A `Sample` has exactly one producer and one consumer per hop; it is moved, never shared.

/// Per-sample flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleFlags {
    /// Sync sample (keyframe). Audio samples are always sync samples.
    pub key_frame: bool,

    /// Codec configuration data (SPS/PPS, AudioSpecificConfig, ...), not rendered media.
    ///
    /// The muxer never writes these; the same information travels with the output format.
    pub codec_config: bool,

    /// No further samples follow on this stream.
    pub end_of_stream: bool,
}

/// One timestamped unit of compressed media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub pts_us: i64,
    /// Decode timestamp, when it differs from `pts_us`.
    pub dts_us: Option<i64>,
    pub payload: Vec<u8>,
    pub flags: SampleFlags,
}

impl Sample {
    pub fn new(pts_us: i64, payload: Vec<u8>) -> Self {
        Self {
            pts_us,
            dts_us: None,
            payload,
            flags: SampleFlags::default(),
        }
    }

    pub fn key_frame(mut self) -> Self {
        self.flags.key_frame = true;
        self
    }

    pub fn codec_config(mut self) -> Self {
        self.flags.codec_config = true;
        self
    }

    pub fn end_of_stream(mut self) -> Self {
        self.flags.end_of_stream = true;
        self
    }

    /// Whether this sample carries media the container should store.
    ///
    /// Codec-config payloads and empty buffers (typically a bare end-of-stream marker) are
    /// dropped before muxing.
    pub fn is_writable(&self) -> bool {
        !self.flags.codec_config && !self.payload.is_empty()
    }

    /// Timestamp the muxer orders samples by.
    pub fn decode_ts_us(&self) -> i64 {
        self.dts_us.unwrap_or(self.pts_us)
    }
}
