//! End-to-end playback tests on the synthetic façade.
//!
//! These run the real pipeline — reader thread, decode workers, frame
//! rings, clocks, refresh scheduler, audio callback — against scripted
//! media, so they exercise the same code paths as file playback without
//! needing codecs or media files.
//!
//! Timing assertions are deliberately loose: the scenarios run in real time
//! and CI machines stall unpredictably. What must hold exactly is the
//! protocol (EOF reached, serials advanced, position frozen), not the
//! millisecond.
//!
//! ```bash
//! cargo test --package vivace-core --test playback_test
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use vivace_core::sim::{self, SimConfig, SimResampler};
use vivace_core::{
    AudioCallback, AudioSpec, AudioWiring, NullRenderer, Player, SampleFormat, Settings,
};

/// Device format used by every test.
fn test_spec() -> AudioSpec {
    AudioSpec {
        format: SampleFormat::F32,
        channels: 2,
        rate: 48_000,
        periods: 2,
        buffer_frames: 512,
    }
}

fn test_wiring() -> AudioWiring {
    let spec = test_spec();
    AudioWiring {
        spec,
        resampler: Box::new(SimResampler::new(spec.rate, spec.channels)),
    }
}

/// Stand-in for the audio device: pulls the callback at the device cadence
/// on its own thread.
struct SimAudioDevice {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimAudioDevice {
    fn start(mut callback: AudioCallback) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            let spec = callback.spec();
            let frames = spec.buffer_frames as usize;
            let mut buffer = vec![0u8; frames * spec.bytes_per_frame()];
            let period = Duration::from_secs_f64(frames as f64 / spec.rate as f64);
            while !stop_flag.load(Ordering::Acquire) {
                callback.fill(&mut buffer);
                std::thread::sleep(period);
            }
        });
        Self { stop, thread: Some(thread) }
    }
}

impl Drop for SimAudioDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Drives refresh at the engine cadence until `done` or the wall deadline.
fn drive(
    player: &mut Player,
    renderer: &mut NullRenderer,
    wall_limit: Duration,
    mut done: impl FnMut(&Player) -> bool,
) -> bool {
    let deadline = Instant::now() + wall_limit;
    while Instant::now() < deadline {
        if done(player) {
            return true;
        }
        let remaining = player.refresh(renderer).expect("refresh failed");
        if remaining > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(remaining.min(0.01)));
        }
    }
    done(player)
}

/// A short A/V clip plays through and the engine reports a clean end of
/// stream with the clocks near the clip duration.
#[test]
fn plays_to_clean_eof() {
    let source = sim::open(SimConfig { duration: 2.0, ..Default::default() });
    let mut player =
        Player::open(source, Some(test_wiring()), Settings::default()).expect("open");
    let _device = SimAudioDevice::start(player.take_audio_callback().expect("audio callback"));

    let mut renderer = NullRenderer::new();
    let finished = drive(&mut player, &mut renderer, Duration::from_secs(15), |p| {
        p.is_finished()
    });
    assert!(finished, "engine never reached end of stream");

    // 2s at 25fps is 50 frames; allow generous slack for a loaded machine.
    let displayed = player.stats().frames_displayed();
    assert!(displayed >= 30, "only {displayed} frames displayed");

    let position = player.position();
    assert!(
        (1.4..=2.8).contains(&position),
        "final position {position:.3} not near clip end"
    );
}

/// Pausing freezes the reported position and frame ordinal; resuming lets
/// them advance again.
#[test]
fn position_freezes_while_paused() {
    let source = sim::open(SimConfig { duration: 10.0, ..Default::default() });
    let mut player =
        Player::open(source, Some(test_wiring()), Settings::default()).expect("open");
    let _device = SimAudioDevice::start(player.take_audio_callback().expect("audio callback"));
    let mut renderer = NullRenderer::new();

    // Let playback get going.
    assert!(drive(&mut player, &mut renderer, Duration::from_secs(10), |p| {
        p.position() > 0.5
    }));

    player.toggle_pause();
    let frozen = player.snapshot();
    assert!(frozen.paused);

    // Half a second of wall time must not move the paused clock.
    drive(&mut player, &mut renderer, Duration::from_millis(500), |_| false);
    let later = player.snapshot();
    assert_eq!(later.position, frozen.position);
    assert_eq!(later.frame_number, frozen.frame_number);

    player.toggle_pause();
    assert!(drive(&mut player, &mut renderer, Duration::from_secs(5), |p| {
        p.position() > frozen.position + 0.2
    }));
}

/// A forward seek lands playback past the target and playback continues
/// from there (stale pre-seek frames never come back).
#[test]
fn seek_advances_position() {
    let source = sim::open(SimConfig { duration: 10.0, ..Default::default() });
    let mut player =
        Player::open(source, Some(test_wiring()), Settings::default()).expect("open");
    let _device = SimAudioDevice::start(player.take_audio_callback().expect("audio callback"));
    let mut renderer = NullRenderer::new();

    assert!(drive(&mut player, &mut renderer, Duration::from_secs(10), |p| {
        p.position() > 0.3
    }));

    player.seek_to(5.0, 1.0);
    assert!(
        drive(&mut player, &mut renderer, Duration::from_secs(5), |p| {
            p.position() >= 4.9
        }),
        "position never reached the seek target"
    );

    // Playback continues past the target rather than snapping back.
    assert!(drive(&mut player, &mut renderer, Duration::from_secs(5), |p| {
        p.position() >= 5.2
    }));
    let position = player.position();
    assert!(position < 8.0, "position {position:.3} ran away after seek");
}

/// Audio-only input: no video worker, audio is the master clock, and the
/// position advances with audio consumption.
#[test]
fn audio_only_uses_audio_master() {
    let source = sim::open(SimConfig {
        duration: 5.0,
        with_video: false,
        ..Default::default()
    });
    let mut player =
        Player::open(source, Some(test_wiring()), Settings::default()).expect("open");
    let _device = SimAudioDevice::start(player.take_audio_callback().expect("audio callback"));
    let mut renderer = NullRenderer::new();

    assert!(drive(&mut player, &mut renderer, Duration::from_secs(10), |p| {
        p.position() > 0.5
    }));
    // Nothing was ever rendered: there is no video stream.
    assert_eq!(renderer.presents(), 0);
    assert_eq!(player.stats().frames_displayed(), 0);
}

/// Video-only input without an audio device: the master falls back from
/// audio to the external clock and pacing still works.
#[test]
fn video_only_falls_back_to_external_clock() {
    let source = sim::open(SimConfig {
        duration: 5.0,
        with_audio: false,
        ..Default::default()
    });
    let mut player = Player::open(source, None, Settings::default()).expect("open");
    let mut renderer = NullRenderer::new();

    assert!(drive(&mut player, &mut renderer, Duration::from_secs(10), |p| {
        p.position() > 0.5
    }));
    assert!(renderer.presents() > 0);

    // External clock runs in real time: one wall second moves the position
    // by roughly one second.
    let before = player.position();
    let started = Instant::now();
    drive(&mut player, &mut renderer, Duration::from_secs(1), |_| false);
    let advanced = player.position() - before;
    let wall = started.elapsed().as_secs_f64();
    assert!(
        (advanced - wall).abs() < 0.5,
        "external clock advanced {advanced:.3}s over {wall:.3}s wall"
    );
}

/// With no consumer draining frames, packet memory stays bounded by the
/// reader's byte budget.
#[test]
fn backpressure_bounds_queue_bytes() {
    let source = sim::open(SimConfig {
        duration: 600.0,
        fps: 200,
        video_packet_bytes: 512 * 1024,
        with_audio: false,
        ..Default::default()
    });
    // No refresh calls: the frame ring fills and decode stalls, so packets
    // can only pile up in the packet queue.
    let player = Player::open(source, None, Settings::default()).expect("open");
    std::thread::sleep(Duration::from_millis(1500));

    let buffered = player.buffered_bytes();
    let budget = 16 * 1024 * 1024;
    assert!(
        buffered <= budget + 1024 * 1024,
        "queue grew to {buffered} bytes, past the {budget} budget"
    );
    assert!(
        buffered > budget / 2,
        "queue only reached {buffered} bytes; backpressure never engaged"
    );
}

/// Dropping the player mid-playback unwinds every thread without hanging.
#[test]
fn clean_shutdown_mid_playback() {
    let source = sim::open(SimConfig { duration: 60.0, ..Default::default() });
    let mut player =
        Player::open(source, Some(test_wiring()), Settings::default()).expect("open");
    let device = SimAudioDevice::start(player.take_audio_callback().expect("audio callback"));
    let mut renderer = NullRenderer::new();

    drive(&mut player, &mut renderer, Duration::from_millis(300), |_| false);

    // Device first (it holds queue handles), then the player.
    drop(device);
    drop(player);
}
