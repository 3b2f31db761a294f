//! Video presentation scheduling and inter-stream synchronization.
//!
//! [`VideoScheduler::refresh`] runs on the main thread at a 10 ms baseline
//! cadence. Each call walks a small state machine:
//!
//! ```text
//! PickFrame ──(stale serial / late drop)──▶ Drop ──▶ PickFrame
//!     │
//!     ├──(not due yet / paused / no frame)──▶ Display (previous frame)
//!     │
//!     └──(due)──▶ Scheduled ──▶ Display (advance + render current)
//! ```
//!
//! The delay between frames is the nominal frame duration corrected by the
//! video clock's offset from the master clock: early frames shrink the
//! delay, late frames stretch or double it, and anything beyond the
//! no-sync threshold is left alone (a seek or timestamp jump is in flight).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::clock::now_seconds;
use crate::decoder::StreamShared;
use crate::error::PlayerError;
use crate::frame_queue::FrameInfo;
use crate::player::Shared;
use crate::renderer::{calculate_display_rect, Renderer};

/// Below this, a sync correction is not worth making.
pub const SYNC_THRESHOLD_MIN: f64 = 0.04;
/// Above this, a correction is always made.
pub const SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are never duplicated to catch up.
pub const SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;
/// Baseline refresh cadence in seconds.
pub const REFRESH_RATE: f64 = 0.01;

/// External clock speed bounds and step for realtime drift control.
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;
/// Queue occupancy bounds steering the external clock speed.
pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;

/// Duration from `frame` to `next`, trusting the PTS gap only within the
/// same serial and below the container's plausible maximum.
pub fn frame_duration(frame: &FrameInfo, next: &FrameInfo, max_frame_duration: f64) -> f64 {
    if frame.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - frame.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        frame.duration
    } else {
        duration
    }
}

/// Corrects the nominal `delay` before the next video frame by the video
/// clock's drift from the master clock.
pub fn compute_video_delay(
    delay: f64,
    video_clock: f64,
    master_clock: f64,
    max_frame_duration: f64,
    master_is_video: bool,
) -> f64 {
    if master_is_video {
        return delay;
    }
    let diff = video_clock - master_clock;
    let sync_threshold = delay.clamp(SYNC_THRESHOLD_MIN, SYNC_THRESHOLD_MAX);
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return delay;
    }
    if diff <= -sync_threshold {
        // Video is behind: shorten the wait, possibly to zero.
        (delay + diff).max(0.0)
    } else if diff >= sync_threshold && delay > SYNC_FRAMEDUP_THRESHOLD {
        // Ahead with a long frame: stretching beats duplication.
        delay + diff
    } else if diff >= sync_threshold {
        // Ahead: show the previous frame one extra period.
        2.0 * delay
    } else {
        delay
    }
}

/// Next external clock speed given the packet queue occupancy of the
/// decoded streams (`None` = stream absent): starved queues slow the clock
/// down, overfull queues speed it up, anything in between decays back
/// toward 1.0.
pub fn next_external_clock_speed(
    video_packets: Option<usize>,
    audio_packets: Option<usize>,
    speed: f64,
) -> f64 {
    let starved = |len: Option<usize>| len.is_some_and(|n| n <= EXTERNAL_CLOCK_MIN_FRAMES);
    let full = |len: Option<usize>| len.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES);

    if starved(video_packets) || starved(audio_packets) {
        (speed - EXTERNAL_CLOCK_SPEED_STEP).max(EXTERNAL_CLOCK_SPEED_MIN)
    } else if full(video_packets) && full(audio_packets) {
        (speed + EXTERNAL_CLOCK_SPEED_STEP).min(EXTERNAL_CLOCK_SPEED_MAX)
    } else if speed != 1.0 {
        speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs()
    } else {
        speed
    }
}

/// Applies [`next_external_clock_speed`] to the live clock.
pub(crate) fn update_external_clock_speed(shared: &Shared) {
    let speed = shared.external_clock.speed();
    let next = next_external_clock_speed(
        shared.video.as_ref().map(|s| s.packets.len()),
        shared.audio.as_ref().map(|s| s.packets.len()),
        speed,
    );
    if next != speed {
        shared.external_clock.set_speed(next);
    }
}

enum RefreshState {
    PickFrame,
    Scheduled(FrameInfo),
    Drop,
    Display { advanced: bool },
}

/// Main-thread presentation driver. Owns the frame timer.
pub struct VideoScheduler {
    /// Wall time at which the currently shown picture was scheduled.
    frame_timer: f64,
    /// Longest PTS gap still treated as a real frame duration.
    max_frame_duration: f64,
}

impl VideoScheduler {
    pub(crate) fn new(max_frame_duration: f64) -> Self {
        Self { frame_timer: 0.0, max_frame_duration }
    }

    /// Compensates the frame timer for a pause interval, keeping the next
    /// frame's deadline relative to playback time rather than wall time.
    pub(crate) fn add_pause_offset(&mut self, offset: f64) {
        self.frame_timer += offset;
    }

    /// One refresh pass. Lowers `remaining_time` to the wait before the next
    /// frame is due. Renders through `renderer` when a display is warranted.
    pub(crate) fn refresh(
        &mut self,
        shared: &Arc<Shared>,
        renderer: &mut dyn Renderer,
        remaining_time: &mut f64,
    ) -> Result<(), PlayerError> {
        if !shared.is_paused()
            && shared.master_is_external()
            && shared.is_realtime
        {
            update_external_clock_speed(shared);
        }

        let Some(video) = shared.video.as_ref() else {
            return Ok(());
        };

        let mut state = RefreshState::PickFrame;
        loop {
            state = match state {
                RefreshState::PickFrame => {
                    if video.frames.remaining() == 0 {
                        // Nothing decoded yet; keep showing what we have.
                        RefreshState::Display { advanced: false }
                    } else {
                        let Some(vp) = video.frames.current_info() else {
                            return Ok(());
                        };
                        if vp.serial != video.packets.serial() {
                            // Pre-seek leftover.
                            RefreshState::Drop
                        } else {
                            self.schedule(shared, video, vp, remaining_time)
                        }
                    }
                }
                RefreshState::Scheduled(vp) => {
                    // Commit the frame: clock update under the queue lock so
                    // an observer never sees clock and queue disagree.
                    let _ = video.frames.with_current(|frame| {
                        if !frame.pts.is_nan() {
                            shared.video_clock.set(frame.pts, frame.serial);
                            shared.external_clock.sync_to(&shared.video_clock);
                        }
                    });

                    // Late drop: a newer frame is already past due.
                    let now = now_seconds();
                    if let Some(next) = video.frames.next_info() {
                        let duration = frame_duration(&vp, &next, self.max_frame_duration);
                        let droppable = shared
                            .settings
                            .allows_frame_drop(shared.master_is_video());
                        if !shared.step_requested() && droppable
                            && now > self.frame_timer + duration
                        {
                            shared.stats.add_frame_drop_late();
                            tracing::trace!(
                                "late frame drop ({}/{} total)",
                                shared.stats.frame_drops_early(),
                                shared.stats.frame_drops_late()
                            );
                            RefreshState::Drop
                        } else {
                            RefreshState::Display { advanced: true }
                        }
                    } else {
                        RefreshState::Display { advanced: true }
                    }
                }
                RefreshState::Drop => {
                    video.frames.advance_read();
                    RefreshState::PickFrame
                }
                RefreshState::Display { advanced } => {
                    if advanced {
                        video.frames.advance_read();
                        shared.force_refresh.store(true, Ordering::Release);
                        // A stepped frame re-pauses after display.
                        if shared.consume_step() && !shared.is_paused() {
                            shared.pause_after_step();
                        }
                    }
                    if shared.force_refresh.swap(false, Ordering::AcqRel)
                        && video.frames.has_shown_frame()
                    {
                        self.render_last(shared, video, renderer)?;
                        shared.stats.add_frame_displayed();
                    }
                    return Ok(());
                }
            };
        }
    }

    /// Decides whether the current frame is due, rebasing the frame timer
    /// across serial boundaries and stalls.
    fn schedule(
        &mut self,
        shared: &Arc<Shared>,
        video: &StreamShared,
        vp: FrameInfo,
        remaining_time: &mut f64,
    ) -> RefreshState {
        let last = video.frames.last_info();

        // Crossing a serial boundary restarts frame pacing from now.
        if let Some(ref lastvp) = last {
            if lastvp.serial != vp.serial {
                self.frame_timer = now_seconds();
            }
        }

        if shared.is_paused() {
            return RefreshState::Display { advanced: false };
        }

        // Before the first display the kept slot aliases the current frame;
        // frame_duration then falls back to the nominal duration, which is
        // what seeds the initial frame-timer rebase below.
        let last_duration = match last {
            Some(ref lastvp) => frame_duration(lastvp, &vp, self.max_frame_duration),
            None => 0.0,
        };
        let delay = compute_video_delay(
            last_duration,
            shared.video_clock.get(),
            shared.master_clock(),
            self.max_frame_duration,
            shared.master_is_video(),
        );

        let now = now_seconds();
        if now < self.frame_timer + delay {
            *remaining_time = (self.frame_timer + delay - now).min(*remaining_time);
            return RefreshState::Display { advanced: false };
        }

        self.frame_timer += delay;
        if delay > 0.0 && now - self.frame_timer > SYNC_THRESHOLD_MAX {
            // Fell too far behind; rebase instead of chasing.
            self.frame_timer = now;
        }

        RefreshState::Scheduled(vp)
    }

    /// Re-presents the kept frame without advancing anything; used while
    /// paused to keep the picture on screen.
    pub(crate) fn re_present(
        &mut self,
        shared: &Arc<Shared>,
        renderer: &mut dyn Renderer,
    ) -> Result<(), PlayerError> {
        let Some(video) = shared.video.clone() else {
            return Ok(());
        };
        if video.frames.has_shown_frame() {
            self.render_last(shared, &video, renderer)?;
        }
        Ok(())
    }

    /// Uploads (once) and presents the kept frame.
    fn render_last(
        &mut self,
        shared: &Arc<Shared>,
        video: &StreamShared,
        renderer: &mut dyn Renderer,
    ) -> Result<(), PlayerError> {
        let (width, height) = shared.viewport();
        let mut result = Ok(());
        let _ = video.frames.with_last_mut(|frame| {
            if !frame.uploaded {
                if let crate::facade::DecodedFrame::Video(ref data) = frame.payload {
                    result = renderer.upload(data);
                }
                frame.uploaded = true;
            }
            if result.is_ok() {
                let rect =
                    calculate_display_rect(width, height, frame.width, frame.height, frame.sar);
                result = renderer.present(rect);
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Serial;

    fn info(pts: f64, duration: f64, serial: Serial) -> FrameInfo {
        FrameInfo { pts, duration, serial, pos: None }
    }

    #[test]
    fn frame_duration_uses_pts_gap_within_serial() {
        let a = info(1.0, 0.04, 1);
        let b = info(1.04, 0.04, 1);
        assert!((frame_duration(&a, &b, 10.0) - 0.04).abs() < 1e-9);
    }

    #[test]
    fn frame_duration_across_serials_is_zero() {
        let a = info(1.0, 0.04, 1);
        let b = info(9.0, 0.04, 2);
        assert_eq!(frame_duration(&a, &b, 10.0), 0.0);
    }

    #[test]
    fn frame_duration_falls_back_on_wild_gaps() {
        let a = info(1.0, 0.04, 1);
        let jump = info(100.0, 0.04, 1);
        assert!((frame_duration(&a, &jump, 10.0) - 0.04).abs() < 1e-9);
        let backwards = info(0.5, 0.04, 1);
        assert!((frame_duration(&a, &backwards, 10.0) - 0.04).abs() < 1e-9);
    }

    #[test]
    fn video_master_keeps_nominal_delay() {
        let delay = compute_video_delay(0.04, 5.0, 1.0, 10.0, true);
        assert_eq!(delay, 0.04);
    }

    #[test]
    fn behind_master_shrinks_delay() {
        // Video 80ms behind: delay collapses to zero.
        let delay = compute_video_delay(0.04, 1.0, 1.08, 10.0, false);
        assert_eq!(delay, 0.0);
    }

    #[test]
    fn ahead_of_master_doubles_delay() {
        // Video 80ms ahead with a normal frame: duplicate the previous frame.
        let delay = compute_video_delay(0.04, 1.08, 1.0, 10.0, false);
        assert!((delay - 0.08).abs() < 1e-9);
    }

    #[test]
    fn ahead_with_long_frame_stretches() {
        // 200ms frames: stretch by the diff instead of doubling.
        let delay = compute_video_delay(0.2, 1.3, 1.0, 10.0, false);
        assert!((delay - 0.5).abs() < 1e-9);
    }

    #[test]
    fn huge_divergence_leaves_delay_alone() {
        let delay = compute_video_delay(0.04, 50.0, 1.0, 10.0, false);
        assert_eq!(delay, 0.04);
    }

    #[test]
    fn nan_video_clock_leaves_delay_alone() {
        let delay = compute_video_delay(0.04, f64::NAN, 1.0, 10.0, false);
        assert_eq!(delay, 0.04);
    }

    #[test]
    fn starved_queues_decay_external_speed() {
        let mut speed = 1.0;
        for _ in 0..150 {
            speed = next_external_clock_speed(Some(1), Some(20), speed);
        }
        assert!((speed - EXTERNAL_CLOCK_SPEED_MIN).abs() < 1e-9);
    }

    #[test]
    fn full_queues_raise_external_speed() {
        let mut speed = 1.0;
        for _ in 0..50 {
            speed = next_external_clock_speed(Some(20), Some(20), speed);
        }
        assert!((speed - EXTERNAL_CLOCK_SPEED_MAX).abs() < 1e-9);
    }

    #[test]
    fn balanced_queues_recover_toward_unity() {
        // Queue refilled after a starvation dip: speed climbs back to 1.0.
        let mut speed = EXTERNAL_CLOCK_SPEED_MIN;
        for _ in 0..150 {
            speed = next_external_clock_speed(Some(5), Some(5), speed);
        }
        assert!((speed - 1.0).abs() <= EXTERNAL_CLOCK_SPEED_STEP + 1e-9);
    }

    #[test]
    fn absent_streams_count_as_full() {
        let speed = next_external_clock_speed(None, None, 1.0);
        assert!(speed > 1.0);
    }

    /// Sync convergence: a constant video offset is worked off within a
    /// bounded number of refreshes.
    #[test]
    fn delay_correction_converges() {
        let frame_duration: f64 = 1.0 / 30.0;
        let mut video_clock: f64 = 0.35; // 350ms ahead of master
        let mut master: f64 = 0.0;
        let mut refreshes = 0;
        while (video_clock - master).abs() > SYNC_THRESHOLD_MAX && refreshes < 20 {
            let delay = compute_video_delay(frame_duration, video_clock, master, 10.0, false);
            // Wall time advances by the chosen delay; the master clock runs
            // in real time, video advances one frame per display.
            master += delay;
            video_clock += frame_duration;
            refreshes += 1;
        }
        assert!(
            refreshes < 20,
            "did not converge: video={video_clock:.3} master={master:.3}"
        );
    }
}
