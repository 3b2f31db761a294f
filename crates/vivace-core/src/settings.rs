//! Engine configuration.

use crate::clock::SyncSource;

/// When the engine is allowed to discard decoded video frames that are
/// already behind the master clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDrop {
    /// Never drop.
    Off,
    /// Drop only when video is not the master clock (the default).
    Auto,
    /// Always drop late frames.
    Force,
}

/// Video PTS reordering policy applied after decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderPts {
    /// Use the codec's best-effort reordered timestamp (the default).
    Auto,
    /// Trust the decoder's own output PTS.
    On,
    /// Use the packet DTS instead.
    Off,
}

/// Replay behavior at end of stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Play once.
    Off,
    /// Replay this many additional times.
    Count(u32),
    /// Replay forever.
    Infinite,
}

/// Player settings, fixed at open.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Which clock the streams synchronize to.
    pub sync_source: SyncSource,
    pub frame_drop: FrameDrop,
    pub reorder_pts: ReorderPts,
    pub loop_mode: LoopMode,
    /// Exit the reader loop cleanly when playback drains and looping is off.
    pub auto_exit: bool,
    /// Never throttle the reader on queue occupancy. Forced on for realtime
    /// sources.
    pub infinite_buffer: bool,
    /// Only packets whose timestamp is at or below this many seconds are
    /// routed to the decoders; later packets are discarded.
    pub play_duration: Option<f64>,
    /// Treat `http(s)://` inputs as realtime streams (external-clock speed
    /// adjustment, infinite buffer). The rtp/rtsp/sdp/udp set is always
    /// treated as realtime.
    pub realtime_http: bool,
    pub video_disabled: bool,
    pub audio_disabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync_source: SyncSource::Audio,
            frame_drop: FrameDrop::Auto,
            reorder_pts: ReorderPts::Auto,
            loop_mode: LoopMode::Off,
            auto_exit: true,
            infinite_buffer: false,
            play_duration: None,
            realtime_http: false,
            video_disabled: false,
            audio_disabled: false,
        }
    }
}

impl Settings {
    /// Sets the master clock source.
    pub fn with_sync_source(mut self, source: SyncSource) -> Self {
        self.sync_source = source;
        self
    }

    /// Sets the frame drop policy.
    pub fn with_frame_drop(mut self, mode: FrameDrop) -> Self {
        self.frame_drop = mode;
        self
    }

    /// Sets the loop behavior.
    pub fn with_loop_mode(mut self, mode: LoopMode) -> Self {
        self.loop_mode = mode;
        self
    }

    /// Limits playback to the first `seconds` of the input.
    pub fn with_play_duration(mut self, seconds: f64) -> Self {
        self.play_duration = Some(seconds);
        self
    }

    /// True when dropping is permitted given the current master clock.
    pub fn allows_frame_drop(&self, master_is_video: bool) -> bool {
        match self.frame_drop {
            FrameDrop::Force => true,
            FrameDrop::Auto => !master_is_video,
            FrameDrop::Off => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_drops_only_when_not_video_master() {
        let settings = Settings::default();
        assert!(settings.allows_frame_drop(false));
        assert!(!settings.allows_frame_drop(true));
    }

    #[test]
    fn force_drop_ignores_master() {
        let settings = Settings::default().with_frame_drop(FrameDrop::Force);
        assert!(settings.allows_frame_drop(true));
    }

    #[test]
    fn builder_chain() {
        let settings = Settings::default()
            .with_sync_source(SyncSource::External)
            .with_loop_mode(LoopMode::Count(2))
            .with_play_duration(30.0);
        assert_eq!(settings.sync_source, SyncSource::External);
        assert_eq!(settings.loop_mode, LoopMode::Count(2));
        assert_eq!(settings.play_duration, Some(30.0));
    }
}
