//! Playback statistics and the read-only state snapshot.
//!
//! Counters are plain atomics bumped from whichever thread owns the event
//! (decoder thread for early drops, refresh scheduler for late drops, audio
//! callback for underruns). The UI pulls a [`PlaybackSnapshot`] instead of
//! poking at engine internals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock-free playback counters, shared across the pipeline threads.
#[derive(Clone, Default)]
pub struct PlaybackStats {
    inner: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    /// Frames discarded by the decoder before queueing (already behind the
    /// master clock).
    frame_drops_early: AtomicU64,
    /// Frames discarded by the scheduler because a newer frame was past due.
    frame_drops_late: AtomicU64,
    /// Frames actually handed to the renderer.
    frames_displayed: AtomicU64,
    /// Audio callback invocations that had to write silence.
    audio_underruns: AtomicU64,
    /// Packets read from the demuxer.
    packets_read: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_frame_drop_early(&self) {
        self.inner.frame_drops_early.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frame_drop_late(&self) {
        self.inner.frame_drops_late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frame_displayed(&self) {
        self.inner.frames_displayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_audio_underrun(&self) {
        self.inner.audio_underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_packet_read(&self) {
        self.inner.packets_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_drops_early(&self) -> u64 {
        self.inner.frame_drops_early.load(Ordering::Relaxed)
    }

    pub fn frame_drops_late(&self) -> u64 {
        self.inner.frame_drops_late.load(Ordering::Relaxed)
    }

    pub fn frames_displayed(&self) -> u64 {
        self.inner.frames_displayed.load(Ordering::Relaxed)
    }

    pub fn audio_underruns(&self) -> u64 {
        self.inner.audio_underruns.load(Ordering::Relaxed)
    }

    pub fn packets_read(&self) -> u64 {
        self.inner.packets_read.load(Ordering::Relaxed)
    }
}

/// Read-only state for the OSD: everything the overlay line needs, captured
/// at one instant.
#[derive(Debug, Clone)]
pub struct PlaybackSnapshot {
    /// Media file name or URL.
    pub media_name: String,
    pub paused: bool,
    /// Master clock reading in seconds (pause-frozen while paused). NaN until
    /// the first frame established a clock.
    pub position: f64,
    /// Total stream length in seconds, if known.
    pub duration: Option<f64>,
    /// Ordinal of the current frame at the master frame rate.
    pub frame_number: i64,
    pub frame_drops_early: u64,
    pub frame_drops_late: u64,
    pub frames_displayed: u64,
    pub audio_underruns: u64,
}

impl PlaybackSnapshot {
    /// `hh:mm:ss:ms` rendering of a clock value, the OSD time format.
    pub fn format_time(seconds: f64) -> String {
        let seconds = if seconds.is_nan() { 0.0 } else { seconds.max(0.0) };
        // Round to milliseconds first so 1.9996 prints as 00:00:02:000.
        let rounded = (seconds * 1000.0).round() / 1000.0;
        let millis = ((rounded * 1000.0) as i64) % 1000;
        let secs = (rounded as i64) % 60;
        let minutes = (rounded as i64 / 60) % 60;
        let hours = rounded as i64 / 3600;
        format!("{hours:02}:{minutes:02}:{secs:02}:{millis:03}")
    }

    /// The OSD state line, e.g. `Paused: clip.mkv`.
    pub fn state_line(&self) -> String {
        let state = if self.paused { "Paused" } else { "Playing" };
        format!("{state}: {}", self.media_name)
    }
}

impl std::fmt::Display for PlaybackSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | {} / {} | frame {} | drops {}/{}",
            self.state_line(),
            Self::format_time(self.position),
            Self::format_time(self.duration.unwrap_or(0.0)),
            self.frame_number,
            self.frame_drops_early,
            self.frame_drops_late,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = PlaybackStats::new();
        stats.add_frame_drop_early();
        stats.add_frame_drop_late();
        stats.add_frame_drop_late();
        stats.add_frame_displayed();
        assert_eq!(stats.frame_drops_early(), 1);
        assert_eq!(stats.frame_drops_late(), 2);
        assert_eq!(stats.frames_displayed(), 1);
    }

    #[test]
    fn counters_shared_between_clones() {
        let stats = PlaybackStats::new();
        let clone = stats.clone();
        clone.add_audio_underrun();
        assert_eq!(stats.audio_underruns(), 1);
    }

    #[test]
    fn time_formatting() {
        assert_eq!(PlaybackSnapshot::format_time(0.0), "00:00:00:000");
        assert_eq!(PlaybackSnapshot::format_time(61.5), "00:01:01:500");
        assert_eq!(PlaybackSnapshot::format_time(3723.042), "01:02:03:042");
        assert_eq!(PlaybackSnapshot::format_time(f64::NAN), "00:00:00:000");
        assert_eq!(PlaybackSnapshot::format_time(-5.0), "00:00:00:000");
    }

    #[test]
    fn state_line_reflects_pause() {
        let snapshot = PlaybackSnapshot {
            media_name: "clip.mkv".into(),
            paused: true,
            position: 1.0,
            duration: Some(10.0),
            frame_number: 25,
            frame_drops_early: 0,
            frame_drops_late: 0,
            frames_displayed: 25,
            audio_underruns: 0,
        };
        assert_eq!(snapshot.state_line(), "Paused: clip.mkv");
        let line = format!("{snapshot}");
        assert!(line.contains("frame 25"));
    }
}
