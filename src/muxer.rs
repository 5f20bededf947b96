//! Shared output container with deferred start.
//!
//! Both pipelines write into one `ContainerMuxer`. It owns the ordering rules so the pipelines
//! don't have to coordinate with each other:
//! - each expected track registers its output format once (`add_track`)
//! - the underlying writer is started exactly once, when the last expected track registers
//! - samples that arrive before the start are queued and flushed in arrival order
//! - per track, samples must arrive with non-decreasing decode timestamps
//!
//! All state sits behind one mutex, so registration and writes from the two pipeline threads
//! never interleave inside the writer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::backend::{ContainerWriter, reclassify};
use crate::error::{Error, Result};
use crate::sample::Sample;
use crate::track::MediaType;

/// Maps a logical track onto the index the container assigned to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputTrackBinding {
    pub media_type: MediaType,
    pub track_index: usize,
}

/// Summary of what was written, reported by [`ContainerMuxer::finish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub video_samples: u64,
    pub audio_samples: u64,
}

struct MuxState<W> {
    writer: W,
    expected: Vec<MediaType>,
    bindings: Vec<OutputTrackBinding>,
    started: bool,
    pending: VecDeque<(usize, Sample)>,
    last_ts: HashMap<usize, i64>,
    stats: MuxStats,
}

/// Thread-safe wrapper over a [`ContainerWriter`].
pub struct ContainerMuxer<W: ContainerWriter> {
    state: Mutex<MuxState<W>>,
}

impl<W: ContainerWriter> ContainerMuxer<W> {
    /// Wrap `writer`; `start()` fires once every media type in `expected` has registered.
    pub fn new(writer: W, expected: &[MediaType]) -> Self {
        Self {
            state: Mutex::new(MuxState {
                writer,
                expected: expected.to_vec(),
                bindings: Vec::with_capacity(expected.len()),
                started: false,
                pending: VecDeque::new(),
                last_ts: HashMap::new(),
                stats: MuxStats::default(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MuxState<W>>> {
        self.state
            .lock()
            .map_err(|_| Error::WriteFailed("muxer mutex poisoned".into()))
    }

    /// Register the output format of one logical track.
    ///
    /// Starts the container (and flushes queued samples) once the last expected track is in.
    pub fn add_track(&self, media_type: MediaType, format: &W::Format) -> Result<OutputTrackBinding> {
        let mut state = self.lock()?;

        if !state.expected.contains(&media_type) {
            return Err(Error::WriterInputError(format!(
                "unexpected {media_type} track"
            )));
        }
        if state.started || state.bindings.iter().any(|b| b.media_type == media_type) {
            return Err(Error::WriteFailed(format!(
                "{media_type} track registered twice"
            )));
        }

        let track_index = state
            .writer
            .add_track(media_type, format)
            .map_err(reclassify(Error::WriterInputError))?;
        let binding = OutputTrackBinding {
            media_type,
            track_index,
        };
        state.bindings.push(binding);
        tracing::debug!(%media_type, track_index, "output track registered");

        if state.bindings.len() == state.expected.len() {
            state.start()?;
        }

        Ok(binding)
    }

    /// Write one encoded sample under `binding`.
    ///
    /// Codec-config and empty samples are dropped. Before the container starts, samples are
    /// queued.
    pub fn write_sample(&self, binding: OutputTrackBinding, sample: Sample) -> Result<()> {
        if !sample.is_writable() {
            return Ok(());
        }

        let mut state = self.lock()?;
        let track = binding.track_index;
        let ts = sample.decode_ts_us();

        if let Some(&last) = state.last_ts.get(&track)
            && ts < last
        {
            return Err(Error::WriteFailed(format!(
                "{} timestamp went backwards ({ts}us after {last}us)",
                binding.media_type
            )));
        }
        state.last_ts.insert(track, ts);

        match binding.media_type {
            MediaType::Video => state.stats.video_samples += 1,
            MediaType::Audio => state.stats.audio_samples += 1,
        }

        if !state.started {
            state.pending.push_back((track, sample));
            return Ok(());
        }

        state
            .writer
            .write_sample(track, &sample)
            .map_err(reclassify(Error::WriteFailed))
    }

    pub fn is_started(&self) -> bool {
        self.lock().map(|s| s.started).unwrap_or(false)
    }

    /// Flush and close the container. Consumes the muxer, so it can only happen once.
    ///
    /// Fails if the container never started (some expected track never registered).
    pub fn finish(self) -> Result<MuxStats> {
        let mut state = self
            .state
            .into_inner()
            .map_err(|_| Error::WriteFailed("muxer mutex poisoned".into()))?;

        if !state.started {
            return Err(Error::WriteFailed(
                "container finished before every track registered".into(),
            ));
        }

        state
            .writer
            .finish()
            .map_err(reclassify(Error::WriteFailed))?;
        Ok(state.stats)
    }

    /// Drop the container without finalizing it. The caller removes the partial file.
    pub fn abandon(self) {
        if let Ok(state) = self.state.into_inner() {
            tracing::debug!(
                started = state.started,
                queued = state.pending.len(),
                "abandoning output container"
            );
        }
    }
}

impl<W: ContainerWriter> MuxState<W> {
    fn start(&mut self) -> Result<()> {
        self.writer.start().map_err(reclassify(Error::WriteFailed))?;
        self.started = true;
        tracing::debug!(queued = self.pending.len(), "output container started");

        while let Some((track, sample)) = self.pending.pop_front() {
            self.writer
                .write_sample(track, &sample)
                .map_err(reclassify(Error::WriteFailed))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingWriter {
        tracks: usize,
        events: Vec<String>,
    }

    impl ContainerWriter for RecordingWriter {
        type Format = &'static str;

        fn add_track(&mut self, media_type: MediaType, format: &Self::Format) -> Result<usize> {
            self.events.push(format!("add {media_type} {format}"));
            self.tracks += 1;
            Ok(self.tracks - 1)
        }

        fn start(&mut self) -> Result<()> {
            self.events.push("start".into());
            Ok(())
        }

        fn write_sample(&mut self, track: usize, sample: &Sample) -> Result<()> {
            self.events.push(format!("write {track} {}", sample.pts_us));
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.events.push("finish".into());
            Ok(())
        }
    }

    fn events(muxer: ContainerMuxer<RecordingWriter>) -> Vec<String> {
        muxer.state.into_inner().unwrap().writer.events
    }

    #[test]
    fn start_waits_for_every_expected_track_and_flushes_queue() -> anyhow::Result<()> {
        let muxer = ContainerMuxer::new(
            RecordingWriter::default(),
            &[MediaType::Video, MediaType::Audio],
        );

        let video = muxer.add_track(MediaType::Video, &"avc")?;
        muxer.write_sample(video, Sample::new(0, vec![1]).key_frame())?;
        muxer.write_sample(video, Sample::new(33_333, vec![2]))?;
        assert!(!muxer.is_started());

        let audio = muxer.add_track(MediaType::Audio, &"aac")?;
        assert!(muxer.is_started());
        muxer.write_sample(audio, Sample::new(0, vec![3]))?;

        assert_eq!(
            events(muxer),
            vec![
                "add video avc",
                "add audio aac",
                "start",
                "write 0 0",
                "write 0 33333",
                "write 1 0",
            ]
        );
        Ok(())
    }

    #[test]
    fn video_only_starts_on_first_registration() -> anyhow::Result<()> {
        let muxer = ContainerMuxer::new(RecordingWriter::default(), &[MediaType::Video]);
        muxer.add_track(MediaType::Video, &"avc")?;
        assert!(muxer.is_started());
        Ok(())
    }

    #[test]
    fn codec_config_samples_are_never_written() -> anyhow::Result<()> {
        let muxer = ContainerMuxer::new(RecordingWriter::default(), &[MediaType::Video]);
        let video = muxer.add_track(MediaType::Video, &"avc")?;
        muxer.write_sample(video, Sample::new(0, vec![0, 0, 1]).codec_config())?;
        muxer.write_sample(video, Sample::new(0, Vec::new()).end_of_stream())?;

        let stats = muxer.finish()?;
        assert_eq!(stats.video_samples, 0);
        Ok(())
    }

    #[test]
    fn backwards_timestamps_are_rejected() -> anyhow::Result<()> {
        let muxer = ContainerMuxer::new(RecordingWriter::default(), &[MediaType::Video]);
        let video = muxer.add_track(MediaType::Video, &"avc")?;
        muxer.write_sample(video, Sample::new(100, vec![1]))?;
        let err = muxer
            .write_sample(video, Sample::new(50, vec![1]))
            .unwrap_err();
        assert!(matches!(err, Error::WriteFailed(_)));
        Ok(())
    }

    #[test]
    fn duplicate_or_unexpected_tracks_are_rejected() -> anyhow::Result<()> {
        let muxer = ContainerMuxer::new(
            RecordingWriter::default(),
            &[MediaType::Video, MediaType::Audio],
        );
        muxer.add_track(MediaType::Video, &"avc")?;
        assert!(muxer.add_track(MediaType::Video, &"avc").is_err());

        let video_only = ContainerMuxer::new(RecordingWriter::default(), &[MediaType::Video]);
        assert!(matches!(
            video_only.add_track(MediaType::Audio, &"aac"),
            Err(Error::WriterInputError(_))
        ));
        Ok(())
    }

    #[test]
    fn finish_requires_a_started_container() -> anyhow::Result<()> {
        let muxer = ContainerMuxer::new(
            RecordingWriter::default(),
            &[MediaType::Video, MediaType::Audio],
        );
        muxer.add_track(MediaType::Video, &"avc")?;
        assert!(matches!(muxer.finish(), Err(Error::WriteFailed(_))));
        Ok(())
    }
}
