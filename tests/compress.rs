mod common;

use std::fs;
use std::sync::Arc;

use serde_json::json;

use squeeze::progress::Progress;
use squeeze::track::{MediaType, Rotation, TrackDescriptor};
use squeeze::{AudioCodec, CancelToken, Compressor, Error, Opts, VideoCodec};

use common::{FakeBackend, Faults, WriterEvent, aac_audio, fast, hd_video, request};

fn compressor(backend: &FakeBackend) -> Compressor<FakeBackend> {
    Compressor::new(backend.clone()).with_config(fast())
}

fn assert_progress_contract(seen: &[u8]) {
    assert_eq!(seen.last(), Some(&100), "progress must end with 100: {seen:?}");
    assert_eq!(seen.iter().filter(|&&p| p == 100).count(), 1);
    assert!(
        seen.windows(2).all(|w| w[0] < w[1]),
        "progress must increase: {seen:?}"
    );
}

#[test]
fn hd_source_with_audio_is_transcoded_at_planned_settings() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000_000, 2_000_000)?;
    let backend = FakeBackend::new(vec![hd_video(0), aac_audio(1)]);

    let mut seen = Vec::new();
    let mut sink = |p: Progress| seen.push(p.percent);
    let outcome = compressor(&backend).compress(&opts, &mut sink, &CancelToken::new())?;

    assert_eq!(outcome.output, opts.output);
    assert!(!outcome.kept_original);
    assert!(outcome.output_bytes < outcome.input_bytes);
    assert_eq!(fs::metadata(&opts.output)?.len(), outcome.output_bytes);
    assert_progress_contract(&seen);

    let record = backend.record();
    let video = record
        .formats
        .iter()
        .find(|f| f.media_type == MediaType::Video)
        .ok_or_else(|| anyhow::anyhow!("no video track registered"))?;
    assert_eq!((video.width, video.height), (1920, 1088));
    assert_eq!(video.mime_type, VideoCodec::H264.mime_type());
    assert_eq!(video.bitrate, 2_000_000);

    let audio = record
        .formats
        .iter()
        .find(|f| f.media_type == MediaType::Audio)
        .ok_or_else(|| anyhow::anyhow!("no audio track registered"))?;
    assert_eq!(audio.mime_type, AudioCodec::Aac.mime_type());
    assert_eq!(
        (audio.bitrate, audio.sample_rate, audio.channels),
        (128_000, 44_100, 2)
    );

    assert_eq!(record.decoders_created, 2);
    assert_eq!(record.decoders_released, 2);
    assert_eq!(record.encoders_released, 2);
    assert_eq!(record.sources_closed, record.sources_opened);
    Ok(())
}

#[test]
fn rotated_source_plans_against_the_displayed_size() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000_000, 2_000_000)?;
    let portrait = TrackDescriptor::video(0, "video/avc", 1080, 1920)
        .with_rotation(Rotation::Deg90)
        .with_duration_us(1_000_000)
        .with_bitrate(6_000_000);
    let backend = FakeBackend::new(vec![portrait]);

    compressor(&backend).compress(&opts, &mut |_: Progress| {}, &CancelToken::new())?;

    let record = backend.record();
    assert_eq!(record.rotation, Some(Rotation::Deg90));
    let video = &record.formats[0];
    assert_eq!((video.width, video.height), (1920, 1088));
    Ok(())
}

#[test]
fn missing_bitrate_is_rejected_before_touching_the_output() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("out.mp4");
    fs::write(&output, b"previous result")?;

    let err = Opts::from_json(&json!({
        "input": dir.path().join("in.mp4"),
        "output": output,
    }))
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArguments(_)));
    assert_eq!(err.code().as_str(), "INVALID_ARGUMENTS");

    // A request that fails validation inside `compress` leaves the output alone too.
    let mut opts = Opts::new(dir.path().join("in.mp4"), &output, 1_000_000);
    opts.width = Some(640);
    let backend = FakeBackend::new(vec![hd_video(0)]);
    let err = compressor(&backend)
        .compress(&opts, &mut |_: Progress| {}, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, Error::InvalidArguments(_)));
    assert_eq!(fs::read(&output)?, b"previous result");
    assert_eq!(backend.record().sources_opened, 0);
    Ok(())
}

#[test]
fn output_aliasing_the_source_is_rejected_and_the_source_survives() -> anyhow::Result<()> {
    let (dir, mut opts) = request(1_000_000, 2_000_000)?;
    fs::create_dir(dir.path().join("sub"))?;
    opts.output = dir.path().join("sub").join("..").join("in.mp4");
    let before = fs::read(&opts.input)?;
    let backend = FakeBackend::new(vec![hd_video(0), aac_audio(1)]);

    let err = compressor(&backend)
        .compress(&opts, &mut |_: Progress| {}, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, Error::InvalidArguments(_)), "got {err:?}");
    assert_eq!(fs::read(&opts.input)?, before);
    assert_eq!(backend.record().sources_opened, 0);
    Ok(())
}

#[test]
fn source_without_video_fails_and_leaves_nothing_behind() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000, 1_000_000)?;
    fs::write(&opts.output, b"stale")?;
    let backend = FakeBackend::new(vec![aac_audio(0)]);

    let err = compressor(&backend)
        .compress(&opts, &mut |_: Progress| {}, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, Error::NoVideoTrack));
    assert!(!opts.output.exists());
    let record = backend.record();
    assert_eq!(record.sources_opened, 1);
    assert_eq!(record.sources_closed, 1);
    Ok(())
}

#[test]
fn larger_result_is_replaced_by_the_source() -> anyhow::Result<()> {
    // 10 samples of 110 bytes: 1100 bytes out of a 1000 byte source.
    let (_dir, opts) = request(1_000, 500_000)?;
    let backend = FakeBackend::new(vec![hd_video(0)])
        .with_samples(10)
        .with_payload_len(110);

    let mut seen = Vec::new();
    let mut sink = |p: Progress| seen.push(p.percent);
    let outcome = compressor(&backend).compress(&opts, &mut sink, &CancelToken::new())?;

    assert!(outcome.kept_original);
    assert_eq!(outcome.output_bytes, outcome.input_bytes);
    assert_eq!(fs::read(&opts.output)?, fs::read(&opts.input)?);
    assert_progress_contract(&seen);
    Ok(())
}

#[test]
fn muxer_starts_only_after_every_track_registered() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000_000, 2_000_000)?;
    let backend = FakeBackend::new(vec![hd_video(0), aac_audio(1)]);

    compressor(&backend).compress(&opts, &mut |_: Progress| {}, &CancelToken::new())?;

    let record = backend.record();
    let events = &record.writer_events;
    let start = events
        .iter()
        .position(|e| *e == WriterEvent::Start)
        .ok_or_else(|| anyhow::anyhow!("writer never started"))?;

    assert_eq!(events.iter().filter(|e| **e == WriterEvent::Start).count(), 1);
    assert_eq!(
        events[..start]
            .iter()
            .filter(|e| matches!(e, WriterEvent::AddTrack(_)))
            .count(),
        2
    );
    assert!(
        events[..start]
            .iter()
            .all(|e| matches!(e, WriterEvent::AddTrack(_)))
    );
    assert_eq!(events.last(), Some(&WriterEvent::Finish));

    // Per track, timestamps never go backwards; both tracks got all their samples.
    for track in 0..2 {
        let pts: Vec<i64> = events
            .iter()
            .filter_map(|e| match e {
                WriterEvent::Write { track: t, pts_us } if *t == track => Some(*pts_us),
                _ => None,
            })
            .collect();
        assert_eq!(pts.len(), 30);
        assert!(pts.windows(2).all(|w| w[0] <= w[1]));
    }
    Ok(())
}

#[test]
fn matching_source_is_remuxed_without_codecs() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000_000, 2_000_000)?;
    let video = TrackDescriptor::video(0, "video/avc", 1280, 720)
        .with_duration_us(1_000_000)
        .with_bitrate(1_500_000);
    let audio = TrackDescriptor::audio(1, "audio/mp4a-latm", 44_100, 2)
        .with_duration_us(1_000_000)
        .with_bitrate(96_000);
    let backend = FakeBackend::new(vec![video, audio]);

    let mut seen = Vec::new();
    let mut sink = |p: Progress| seen.push(p.percent);
    let outcome = compressor(&backend).compress(&opts, &mut sink, &CancelToken::new())?;

    assert_progress_contract(&seen);
    assert_eq!(
        outcome.output_bytes,
        (2 * 30 * common::SOURCE_PAYLOAD_LEN) as u64
    );

    let record = backend.record();
    assert_eq!(record.decoders_created, 0);
    assert_eq!(record.encoders_created, 0);
    let video = record
        .formats
        .iter()
        .find(|f| f.media_type == MediaType::Video)
        .ok_or_else(|| anyhow::anyhow!("no video track registered"))?;
    assert_eq!(video.bitrate, 1_500_000);
    Ok(())
}

#[test]
fn audio_read_failure_stops_video_and_reports_the_read() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000_000, 2_000_000)?;
    let backend = FakeBackend::new(vec![hd_video(0), aac_audio(1)])
        .with_samples(2_000)
        .with_faults(Faults {
            read: Some((MediaType::Audio, 3)),
            ..Faults::default()
        });

    let err = compressor(&backend)
        .compress(&opts, &mut |_: Progress| {}, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, Error::ReadFailed(_)), "got {err:?}");
    assert!(!opts.output.exists());

    let record = backend.record();
    assert_eq!(record.decoders_released, record.decoders_created);
    assert_eq!(record.encoders_released, record.encoders_created);
    assert!(!record.writer_events.contains(&WriterEvent::Finish));
    assert_eq!(record.sources_closed, 1);
    Ok(())
}

#[test]
fn video_encoder_fault_is_a_write_failure() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000_000, 2_000_000)?;
    let backend = FakeBackend::new(vec![hd_video(0), aac_audio(1)]).with_faults(Faults {
        encode: Some((MediaType::Video, 5)),
        ..Faults::default()
    });

    let err = compressor(&backend)
        .compress(&opts, &mut |_: Progress| {}, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, Error::WriteFailed(_)), "got {err:?}");
    assert_eq!(err.code().as_str(), "WRITE_FAILED");
    assert!(!opts.output.exists());
    Ok(())
}

#[test]
fn unopenable_source_is_a_reader_start_failure() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000, 1_000_000)?;
    let backend = FakeBackend::new(vec![hd_video(0)]).with_faults(Faults {
        open_source: true,
        ..Faults::default()
    });

    let err = compressor(&backend)
        .compress(&opts, &mut |_: Progress| {}, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, Error::ReaderStartFailed(_)));
    assert!(!opts.output.exists());
    Ok(())
}

#[test]
fn unsupported_output_is_a_writer_input_error() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000, 1_000_000)?;
    let backend = FakeBackend::new(vec![hd_video(0)]).with_faults(Faults {
        check_outputs: true,
        ..Faults::default()
    });

    let err = compressor(&backend)
        .compress(&opts, &mut |_: Progress| {}, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, Error::WriterInputError(_)));
    assert!(!opts.output.exists());
    assert_eq!(backend.record().sources_closed, 1);
    Ok(())
}

#[test]
fn cancelling_mid_run_leaves_no_output() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000_000, 2_000_000)?;
    let backend = FakeBackend::new(vec![hd_video(0), aac_audio(1)]).with_samples(500);

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let mut sink = move |_: Progress| trigger.cancel();

    let err = compressor(&backend)
        .compress(&opts, &mut sink, &cancel)
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(!opts.output.exists());
    let record = backend.record();
    assert_eq!(record.decoders_released, record.decoders_created);
    assert_eq!(record.encoders_released, record.encoders_created);
    Ok(())
}

#[test]
fn spawned_job_streams_progress_then_completes() -> anyhow::Result<()> {
    let (_dir, opts) = request(1_000_000, 2_000_000)?;
    let backend = FakeBackend::new(vec![hd_video(0), aac_audio(1)]);
    let compressor = Arc::new(compressor(&backend));

    let mut job = compressor.spawn(opts.clone());
    let events = job
        .progress()
        .ok_or_else(|| anyhow::anyhow!("progress already taken"))?;
    assert!(job.progress().is_none());

    let seen: Vec<u8> = events.map(|p| p.percent).collect();
    let outcome = job.wait()?;

    assert_progress_contract(&seen);
    assert_eq!(outcome.output, opts.output);
    assert!(opts.output.exists());
    Ok(())
}

#[test]
fn progress_serializes_as_a_bridge_event() -> anyhow::Result<()> {
    let line = serde_json::to_string(&Progress { percent: 42 })?;
    assert_eq!(line, r#"{"progress":42}"#);
    Ok(())
}
