//! Drift-corrected playback clocks.
//!
//! Each stream owns a clock that maps presentation timestamps to wall time.
//! A clock is anchored by `set()` (recording `pts_drift = pts - now`) and
//! read back as `pts_drift + now`, adjusted for a playback speed other than
//! 1.0. A clock is tied to the serial counter of the packet queue that feeds
//! it: once the queue's serial moves past the serial the clock was set with,
//! reads return NaN and consumers treat the clock as stale.
//!
//! The audio clock is written by the audio callback, the video clock by the
//! refresh scheduler, and the external clock by the reader (on seek) and by
//! the sync paths. Readers of a foreign clock go through the internal lock,
//! so a torn read is never observable.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

use crate::packet::Serial;

/// Clocks further apart than this are snapped instead of slewed, and audio
/// drift correction gives up entirely (initial PTS errors, post-seek gaps).
pub const NOSYNC_THRESHOLD: f64 = 10.0;

/// Monotonic seconds since the first call in this process.
///
/// This is the engine-wide time source (the codec façade's microsecond clock,
/// scaled). All clock anchors and the refresh scheduler's frame timer use it.
pub fn now_seconds() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

struct ClockState {
    /// Anchor PTS in seconds (NaN until the first set).
    pts: f64,
    /// `pts - time_of_anchor`; reading adds wall time back.
    pts_drift: f64,
    /// Wall time of the last anchor, in `now_seconds()` terms.
    last_updated: f64,
    /// Playback speed; 1.0 except for the external clock on realtime input.
    speed: f64,
    /// Serial recorded at the last anchor.
    serial: Serial,
    paused: bool,
}

/// A shareable drift-corrected clock.
///
/// Cloning shares the underlying state; the queue-serial reference is shared
/// with the packet queue whose packets feed this clock.
#[derive(Clone)]
pub struct Clock {
    state: Arc<Mutex<ClockState>>,
    /// Serial of the owning packet queue. When it differs from the serial the
    /// clock was last set with, the clock is stale and reads NaN.
    queue_serial: Arc<AtomicI32>,
    /// The external clock has no packet queue; it tracks its own serial so
    /// its reads never go stale.
    follows_own_serial: bool,
}

impl Clock {
    /// Creates a clock tied to `queue_serial` (a packet queue's serial
    /// counter). Starts unset: `pts = NaN`, `serial = -1`, `speed = 1.0`.
    pub fn new(queue_serial: Arc<AtomicI32>) -> Self {
        Self::with_serial_mode(queue_serial, false)
    }

    /// Creates a clock that references its own serial (the external clock,
    /// which has no packet queue behind it).
    pub fn self_referential() -> Self {
        Self::with_serial_mode(Arc::new(AtomicI32::new(-1)), true)
    }

    fn with_serial_mode(queue_serial: Arc<AtomicI32>, follows_own_serial: bool) -> Self {
        let clock = Self {
            state: Arc::new(Mutex::new(ClockState {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: now_seconds(),
                speed: 1.0,
                serial: -1,
                paused: false,
            })),
            queue_serial,
            follows_own_serial,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    /// Reads the clock at the current wall time.
    pub fn get(&self) -> f64 {
        self.get_at(now_seconds())
    }

    /// Reads the clock at an explicit wall time (deterministic tests).
    pub fn get_at(&self, time: f64) -> f64 {
        let state = self.state.lock();
        if self.queue_serial.load(Ordering::Acquire) != state.serial {
            return f64::NAN;
        }
        if state.paused {
            state.pts
        } else {
            state.pts_drift + time - (time - state.last_updated) * (1.0 - state.speed)
        }
    }

    /// Anchors the clock to `pts` now.
    pub fn set(&self, pts: f64, serial: Serial) {
        self.set_at(pts, serial, now_seconds());
    }

    /// Anchors the clock to `pts` at an explicit wall time.
    pub fn set_at(&self, pts: f64, serial: Serial, time: f64) {
        let mut state = self.state.lock();
        state.pts = pts;
        state.last_updated = time;
        state.pts_drift = pts - time;
        state.serial = serial;
        if self.follows_own_serial {
            self.queue_serial.store(serial, Ordering::Release);
        }
    }

    /// Changes playback speed, re-anchoring first so the reading is
    /// continuous across the change.
    pub fn set_speed(&self, speed: f64) {
        let current = self.get();
        let serial = self.serial();
        self.set(current, serial);
        self.state.lock().speed = speed;
    }

    /// Current speed factor.
    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    /// Serial recorded at the last anchor.
    pub fn serial(&self) -> Serial {
        self.state.lock().serial
    }

    /// Wall time of the last anchor, in `now_seconds()` terms.
    pub fn last_updated(&self) -> f64 {
        self.state.lock().last_updated
    }

    /// Pauses or resumes the clock. A paused clock reads its anchor PTS
    /// regardless of elapsed wall time.
    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    /// True if the clock is paused.
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Snaps this clock onto `other` when the two have diverged beyond
    /// [`NOSYNC_THRESHOLD`] or this clock has no valid reading yet.
    pub fn sync_to(&self, other: &Clock) {
        let own = self.get();
        let theirs = other.get();
        if !theirs.is_nan() && (own.is_nan() || (own - theirs).abs() > NOSYNC_THRESHOLD) {
            self.set(theirs, other.serial());
        }
    }
}

/// Which clock the other streams synchronize against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    /// Audio clock is the master (default; falls back to external if no audio).
    Audio,
    /// Video clock is the master (falls back to audio if no video).
    Video,
    /// Free-running external clock; speed-adjusted for realtime sources.
    External,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_serial(value: Serial) -> Arc<AtomicI32> {
        Arc::new(AtomicI32::new(value))
    }

    #[test]
    fn unset_clock_reads_nan() {
        let clock = Clock::new(queue_serial(0));
        // serial -1 vs queue serial 0: stale
        assert!(clock.get().is_nan());
    }

    #[test]
    fn paused_clock_holds_pts() {
        let serial = queue_serial(3);
        let clock = Clock::new(Arc::clone(&serial));
        clock.set_at(12.5, 3, 100.0);
        clock.set_paused(true);
        assert_eq!(clock.get_at(100.0), 12.5);
        assert_eq!(clock.get_at(250.0), 12.5);
    }

    #[test]
    fn running_clock_advances_at_real_rate() {
        let serial = queue_serial(1);
        let clock = Clock::new(Arc::clone(&serial));
        clock.set_at(5.0, 1, 100.0);
        let read = clock.get_at(102.0);
        assert!((read - 7.0).abs() < 1e-9, "got {read}");
    }

    #[test]
    fn stale_serial_reads_nan() {
        let serial = queue_serial(1);
        let clock = Clock::new(Arc::clone(&serial));
        clock.set_at(5.0, 1, 100.0);
        assert!(!clock.get_at(101.0).is_nan());
        // Queue serial moves on (a flush happened); the clock is now stale.
        serial.store(2, Ordering::Release);
        assert!(clock.get_at(101.0).is_nan());
    }

    #[test]
    fn speed_change_preserves_reading() {
        let serial = queue_serial(1);
        let clock = Clock::new(Arc::clone(&serial));
        clock.set(3.0, 1);
        let before = clock.get();
        clock.set_speed(0.9);
        let after = clock.get();
        assert!((after - before).abs() < 0.01, "{before} vs {after}");
    }

    #[test]
    fn slowed_clock_advances_slower() {
        let serial = queue_serial(1);
        let clock = Clock::new(Arc::clone(&serial));
        clock.set_at(0.0, 1, 100.0);
        clock.state.lock().speed = 0.5;
        let read = clock.get_at(110.0);
        // drift + t - (t - last)*(1 - 0.5) = -100 + 110 - 10*0.5 = 5
        assert!((read - 5.0).abs() < 1e-9, "got {read}");
    }

    #[test]
    fn sync_to_snaps_when_diverged() {
        let a = Clock::new(queue_serial(1));
        let b = Clock::new(queue_serial(1));
        a.set(0.0, 1);
        b.set(100.0, 1);
        a.sync_to(&b);
        assert!((a.get() - b.get()).abs() < 0.01);
    }

    #[test]
    fn sync_to_ignores_small_divergence() {
        let a = Clock::new(queue_serial(1));
        let b = Clock::new(queue_serial(1));
        a.set(10.0, 1);
        b.set(10.5, 1);
        a.sync_to(&b);
        assert!((a.get() - 10.0).abs() < 0.1);
    }

    #[test]
    fn sync_to_ignores_nan_slave() {
        let a = Clock::new(queue_serial(1));
        a.set(10.0, 1);
        let b = Clock::self_referential();
        let before = a.get();
        a.sync_to(&b);
        assert!((a.get() - before).abs() < 0.01);
    }
}
