//! Progress computation and delivery.
//!
//! `ProgressReporter` turns raw observations (a presentation timestamp from the video pipeline, or
//! a percentage from a managed transform) into the notification stream callers see:
//! - percentages are integers in `0..=100`
//! - the sequence never decreases and never repeats a value
//! - intermediate notifications are spaced at least `interval` apart and stop at 99
//! - `finish()` emits the single 100, regardless of throttling
//!
//! Delivery goes through a [`ProgressSink`]. A closure works, and [`channel`] gives an
//! `mpsc`-backed sink plus a finite iterator over the events for callers on another thread.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// One progress notification. Serializes as `{"progress": n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    #[serde(rename = "progress")]
    pub percent: u8,
}

/// Receives progress notifications.
pub trait ProgressSink: Send {
    fn on_progress(&mut self, progress: Progress);
}

impl<F> ProgressSink for F
where
    F: FnMut(Progress) + Send,
{
    fn on_progress(&mut self, progress: Progress) {
        self(progress)
    }
}

/// Sending half of [`channel`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Progress>,
}

impl ProgressSink for ChannelSink {
    fn on_progress(&mut self, progress: Progress) {
        // A dropped receiver means nobody is listening anymore; that's not our failure.
        let _ = self.tx.send(progress);
    }
}

/// The events of one job, in emission order.
///
/// Iteration ends once the producing side is dropped, i.e. when the job is over.
#[derive(Debug)]
pub struct ProgressEvents {
    rx: mpsc::Receiver<Progress>,
}

impl Iterator for ProgressEvents {
    type Item = Progress;

    fn next(&mut self) -> Option<Progress> {
        self.rx.recv().ok()
    }
}

/// An unbounded progress channel.
pub fn channel() -> (ChannelSink, ProgressEvents) {
    let (tx, rx) = mpsc::channel();
    (ChannelSink { tx }, ProgressEvents { rx })
}

/// Throttled, monotonic progress reporting for one job.
pub struct ProgressReporter<'a> {
    sink: &'a mut dyn ProgressSink,
    interval: Duration,
    total_duration_us: i64,
    last_percent: Option<u8>,
    last_emit: Option<Instant>,
    finished: bool,
}

impl<'a> ProgressReporter<'a> {
    /// `total_duration_us <= 0` disables timestamp-based progress; only `finish()` will emit.
    pub fn new(sink: &'a mut dyn ProgressSink, interval: Duration, total_duration_us: i64) -> Self {
        Self {
            sink,
            interval,
            total_duration_us,
            last_percent: None,
            last_emit: None,
            finished: false,
        }
    }

    /// Observe the presentation timestamp of the most recently processed video sample.
    pub fn observe_timestamp(&mut self, pts_us: i64) {
        if self.total_duration_us <= 0 {
            return;
        }

        let ratio = pts_us as f64 / self.total_duration_us as f64;
        let percent = (ratio * 100.0).clamp(0.0, 100.0) as u8;
        self.observe_percent(percent);
    }

    /// Observe an externally computed percentage.
    pub fn observe_percent(&mut self, percent: u8) {
        if self.finished {
            return;
        }

        // 100 is reserved for the success notification.
        let percent = percent.min(99);

        if self.last_percent.is_some_and(|last| percent <= last) {
            return;
        }

        let now = Instant::now();
        if let Some(last) = self.last_emit
            && now.duration_since(last) < self.interval
        {
            return;
        }

        self.emit(percent);
        self.last_emit = Some(now);
    }

    /// Emit the final 100. Only the first call has any effect.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emit(100);
    }

    /// The last percentage handed to the sink, if any.
    pub fn last_percent(&self) -> Option<u8> {
        self.last_percent
    }

    fn emit(&mut self, percent: u8) {
        tracing::trace!(percent, "progress");
        self.last_percent = Some(percent);
        self.sink.on_progress(Progress { percent });
    }
}
