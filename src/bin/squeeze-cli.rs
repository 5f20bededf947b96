use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Value, json};

use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use squeeze::ffmpeg::FfmpegBackend;
use squeeze::logging;
use squeeze::{AudioCodec, Compressor, Error, Opts, PipelineConfig, ScalePolicy, VideoCodec};

fn main() -> Result<ExitCode> {
    logging::init();
    let params = get_params()?;

    let compressor = Arc::new(
        Compressor::new(FfmpegBackend::new()?).with_config(params.pipeline_config()),
    );

    if params.json {
        return run_json(&compressor);
    }
    run_interactive(&compressor, params.opts()?)
}

/// Compress with a progress bar on stderr and a short summary on stdout.
fn run_interactive(compressor: &Arc<Compressor<FfmpegBackend>>, opts: Opts) -> Result<ExitCode> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {wide_bar} {pos:>3}%")
            .context("invalid progress template")?,
    );

    let mut job = compressor.spawn(opts);
    if let Some(events) = job.progress() {
        for progress in events {
            bar.set_position(u64::from(progress.percent));
        }
    }

    match job.wait() {
        Ok(outcome) => {
            bar.finish();
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", outcome.output.display())?;
            if outcome.kept_original {
                writeln!(
                    stdout,
                    "kept original ({} bytes); transcoded output was not smaller",
                    outcome.input_bytes
                )?;
            } else {
                writeln!(
                    stdout,
                    "{} -> {} bytes",
                    outcome.input_bytes, outcome.output_bytes
                )?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            bar.abandon();
            eprintln!("error [{}]: {err}", err.code().as_str());
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Read one request object from stdin and answer with JSON lines on stdout.
fn run_json(compressor: &Arc<Compressor<FfmpegBackend>>) -> Result<ExitCode> {
    let mut raw = String::new();
    io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read request from stdin")?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let opts = serde_json::from_str::<Value>(&raw)
        .map_err(|e| Error::InvalidArguments(format!("request is not JSON: {e}")))
        .and_then(|request| Opts::from_json(&request));
    let opts = match opts {
        Ok(opts) => opts,
        Err(err) => {
            write_line(&mut out, &error_line(&err))?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut job = compressor.spawn(opts);
    if let Some(events) = job.progress() {
        for progress in events {
            write_line(&mut out, &serde_json::to_value(progress)?)?;
        }
    }

    match job.wait() {
        Ok(outcome) => {
            write_line(&mut out, &json!({ "output": outcome.output }))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            write_line(&mut out, &error_line(&err))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn error_line(err: &Error) -> Value {
    json!({ "error": { "code": err.code().as_str(), "message": err.to_string() } })
}

fn write_line(out: &mut impl Write, value: &Value) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    // Callers read these as they arrive.
    out.flush()?;
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "squeeze")]
#[command(about = "Compress a video into a smaller MP4")]
struct Params {
    #[arg(short = 'i', long = "input", required_unless_present = "json")]
    pub input: Option<PathBuf>,

    #[arg(short = 'o', long = "output", required_unless_present = "json")]
    pub output: Option<PathBuf>,

    /// Target video bitrate (bits/sec).
    #[arg(short = 'b', long = "bitrate", required_unless_present = "json")]
    pub bitrate: Option<u32>,

    #[arg(long = "width", requires = "height")]
    pub width: Option<u32>,

    #[arg(long = "height", requires = "width")]
    pub height: Option<u32>,

    #[arg(long = "video-codec", default_value = "h264")]
    pub video_codec: String,

    #[arg(long = "audio-codec", default_value = "aac")]
    pub audio_codec: String,

    #[arg(long = "audio-bitrate", default_value_t = squeeze::opts::DEFAULT_AUDIO_BITRATE)]
    pub audio_bitrate: u32,

    #[arg(long = "audio-sample-rate", default_value_t = squeeze::opts::DEFAULT_AUDIO_SAMPLE_RATE)]
    pub audio_sample_rate: u32,

    #[arg(long = "audio-channels", default_value_t = squeeze::opts::DEFAULT_AUDIO_CHANNELS)]
    pub audio_channels: u32,

    #[arg(long = "poll-timeout-ms", default_value_t = 10)]
    pub poll_timeout_ms: u64,

    #[arg(long = "progress-interval-ms", default_value_t = 200)]
    pub progress_interval_ms: u64,

    /// Shrink sources to fit inside WxH when no explicit size is given.
    #[arg(long = "fit-within", value_parser = parse_box)]
    pub fit_within: Option<(u32, u32)>,

    /// Read the request as JSON from stdin and report as JSON lines.
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,
}

impl Params {
    fn opts(&self) -> Result<Opts> {
        let (Some(input), Some(output), Some(bitrate)) = (&self.input, &self.output, self.bitrate)
        else {
            anyhow::bail!("--input, --output and --bitrate are required");
        };

        let mut opts = Opts::new(input, output, bitrate);
        opts.width = self.width;
        opts.height = self.height;
        opts.video_codec = VideoCodec::from_name(Some(&self.video_codec));
        opts.audio_codec = AudioCodec::from_name(Some(&self.audio_codec));
        opts.audio_bitrate = self.audio_bitrate;
        opts.audio_sample_rate = self.audio_sample_rate;
        opts.audio_channels = self.audio_channels;
        Ok(opts)
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            scale_policy: match self.fit_within {
                Some((max_width, max_height)) => ScalePolicy::FitWithin {
                    max_width,
                    max_height,
                },
                None => ScalePolicy::PreserveOriginal,
            },
        }
    }
}

fn parse_box(value: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got `{value}`"))?;
    let w = w.trim().parse().map_err(|e| format!("bad width: {e}"))?;
    let h = h.trim().parse().map_err(|e| format!("bad height: {e}"))?;
    Ok((w, h))
}

fn get_params() -> Result<Params> {
    Ok(Params::parse())
}
