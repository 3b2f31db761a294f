//! Audio output path: the device pull callback and drift correction.
//!
//! The audio device invokes [`AudioCallback::fill`] on its own thread with a
//! byte buffer to populate. The callback drains the audio frame ring through
//! a lazy conversion buffer: one decoded frame is resampled into the device
//! format at a time, then copied out in whatever chunk sizes the device asks
//! for. Silence covers pauses and underruns.
//!
//! When audio is not the master clock, [`synchronize_audio`] biases the
//! resampler's sample count (±10 % at most) so audio playback drifts toward
//! the master instead of accumulating offset. The audio clock itself is
//! updated at the end of every callback, compensated for the samples still
//! sitting in device buffers.

use std::sync::Arc;

use crate::clock::NOSYNC_THRESHOLD;
use crate::facade::{DecodedFrame, Resampler};
use crate::packet::Serial;
use crate::player::Shared;

/// Samples of master/audio clock difference folded into the EMA before it is
/// trusted.
pub const AUDIO_DIFF_AVG_NB: u32 = 20;
/// Hard bound on resampling correction, percent of the nominal count.
pub const SAMPLE_CORRECTION_PERCENT_MAX: i64 = 10;

/// Sample formats an audio device may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    S64,
    F32,
    F64,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::S64 | SampleFormat::F64 => 8,
        }
    }
}

/// Device output format, fixed at open.
#[derive(Debug, Clone, Copy)]
pub struct AudioSpec {
    pub format: SampleFormat,
    pub channels: u16,
    pub rate: u32,
    /// Device-side period count; scales the latency compensation.
    pub periods: u32,
    /// Frames per device buffer.
    pub buffer_frames: u32,
}

impl AudioSpec {
    pub fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.rate as usize
    }

    pub fn native_buffer_bytes(&self) -> usize {
        self.bytes_per_frame() * self.buffer_frames as usize
    }

    /// Audio drift below this (seconds) is ignored; one device buffer's
    /// worth of time.
    pub fn diff_threshold(&self) -> f64 {
        self.native_buffer_bytes() as f64 / self.bytes_per_second() as f64
    }
}

/// Exponential moving average of the audio/master clock difference.
pub struct AudioDiffFilter {
    coef: f64,
    cum: f64,
    count: u32,
}

impl AudioDiffFilter {
    pub fn new() -> Self {
        Self {
            coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            cum: 0.0,
            count: 0,
        }
    }

    fn reset(&mut self) {
        self.cum = 0.0;
        self.count = 0;
    }

    /// Folds `diff` in; returns the trusted average once warmed up.
    fn update(&mut self, diff: f64) -> Option<f64> {
        self.cum = diff + self.coef * self.cum;
        if self.count < AUDIO_DIFF_AVG_NB {
            self.count += 1;
            None
        } else {
            Some(self.cum * (1.0 - self.coef))
        }
    }
}

impl Default for AudioDiffFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Adjusts a frame's sample count so audio tracks the master clock.
///
/// Returns `nb_samples` untouched when audio *is* the master. Otherwise the
/// averaged drift, once past the device-buffer threshold, expands or
/// shrinks the window within ±10 %.
pub fn synchronize_audio(
    nb_samples: usize,
    diff: f64,
    filter: &mut AudioDiffFilter,
    threshold: f64,
    source_rate: u32,
) -> usize {
    if diff.is_nan() || diff.abs() >= NOSYNC_THRESHOLD {
        // Probably initial PTS garbage or a seek in flight.
        filter.reset();
        return nb_samples;
    }
    let Some(avg) = filter.update(diff) else {
        return nb_samples;
    };
    if avg.abs() < threshold {
        return nb_samples;
    }
    let wanted = nb_samples as i64 + (diff * source_rate as f64) as i64;
    let min = nb_samples as i64 * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100;
    let max = nb_samples as i64 * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100;
    wanted.clamp(min, max) as usize
}

/// State the audio device callback drives. Owned by the device thread once
/// playback starts.
pub struct AudioCallback {
    shared: Arc<Shared>,
    spec: AudioSpec,
    resampler: Box<dyn Resampler>,
    /// Conversion buffer in the device format.
    conv: Vec<u8>,
    /// Read cursor into `conv`, in frames.
    conv_index: usize,
    /// Frames still readable in `conv`.
    conv_remaining: usize,
    /// PTS at the *end* of the last converted frame, seconds.
    audio_clock: f64,
    audio_clock_serial: Serial,
    diff_filter: AudioDiffFilter,
}

impl AudioCallback {
    pub(crate) fn new(shared: Arc<Shared>, spec: AudioSpec, resampler: Box<dyn Resampler>) -> Self {
        Self {
            shared,
            spec,
            resampler,
            conv: Vec::new(),
            conv_index: 0,
            conv_remaining: 0,
            audio_clock: f64::NAN,
            audio_clock_serial: -1,
            diff_filter: AudioDiffFilter::new(),
        }
    }

    pub fn spec(&self) -> AudioSpec {
        self.spec
    }

    /// Fills `out` (whole frames of the device format) with converted audio.
    /// Called by the audio device on its own thread.
    pub fn fill(&mut self, out: &mut [u8]) {
        let callback_time = crate::clock::now_seconds();
        let stride = self.spec.bytes_per_frame();
        let total_frames = out.len() / stride;
        let mut filled = 0usize;

        while filled < total_frames {
            let remaining = total_frames - filled;
            if self.shared.is_paused() && self.conv_remaining == 0 {
                self.write_silence(remaining);
            }

            // Drain the conversion buffer first.
            if self.conv_remaining > 0 {
                let take = remaining.min(self.conv_remaining);
                let src = self.conv_index * stride;
                let dst = filled * stride;
                out[dst..dst + take * stride]
                    .copy_from_slice(&self.conv[src..src + take * stride]);
                self.conv_index += take;
                self.conv_remaining -= take;
                filled += take;
                continue;
            }

            if !self.convert_next_frame() {
                // Nothing decoded and not paused: underrun, play silence.
                self.shared.stats.add_audio_underrun();
                self.write_silence(remaining);
            }
        }

        // Anchor the audio clock behind by whatever is still buffered
        // downstream of us.
        if !self.audio_clock.is_nan() {
            let written_bytes = (filled * stride) as f64;
            let buffered = self.spec.periods as f64 * self.spec.native_buffer_bytes() as f64;
            let pts =
                self.audio_clock - (buffered + written_bytes) / self.spec.bytes_per_second() as f64;
            self.shared
                .audio_clock
                .set_at(pts, self.audio_clock_serial, callback_time);
            self.shared.external_clock.sync_to(&self.shared.audio_clock);
        }
    }

    /// Pulls the next fresh frame from the ring into the conversion buffer.
    /// Returns false when no frame was available.
    fn convert_next_frame(&mut self) -> bool {
        let Some(audio) = self.shared.audio.clone() else {
            return false;
        };
        loop {
            let Some(info) = audio.frames.current_info() else {
                return false;
            };
            if info.serial != audio.packets.serial() {
                // Pre-seek leftover.
                audio.frames.advance_read();
                continue;
            }

            let threshold = self.spec.diff_threshold();
            let audio_clock_now = self.shared.audio_clock.get();
            let master = self.shared.master_clock();
            let synced = self.shared.master_is_audio();

            let mut produced = 0usize;
            let mut end_pts = f64::NAN;
            let converted = audio.frames.with_current(|frame| {
                let DecodedFrame::Audio(ref data) = frame.payload else {
                    return false;
                };
                let wanted = if synced {
                    data.nb_samples
                } else {
                    synchronize_audio(
                        data.nb_samples,
                        audio_clock_now - master,
                        &mut self.diff_filter,
                        threshold,
                        data.sample_rate,
                    )
                };
                match self.resampler.convert(data, wanted, &mut self.conv) {
                    Ok(count) => {
                        produced = count;
                        if !frame.pts.is_nan() {
                            end_pts = frame.pts + data.nb_samples as f64 / data.sample_rate as f64;
                        }
                        true
                    }
                    Err(err) => {
                        tracing::error!("audio resample failed: {err}");
                        false
                    }
                }
            });

            self.audio_clock = end_pts;
            self.audio_clock_serial = info.serial;
            audio.frames.advance_read();

            if converted != Some(true) || produced == 0 {
                return false;
            }
            self.conv_index = 0;
            self.conv_remaining = produced;
            return true;
        }
    }

    /// Fills the conversion buffer with `frames` of silence and marks it
    /// readable.
    fn write_silence(&mut self, frames: usize) {
        let stride = self.spec.bytes_per_frame();
        self.conv.clear();
        self.conv.resize(frames * stride, self.silence_byte());
        self.conv_index = 0;
        self.conv_remaining = frames;
    }

    fn silence_byte(&self) -> u8 {
        // Unsigned formats are silent at mid-scale; everything else at zero.
        match self.spec.format {
            SampleFormat::U8 => 0x80,
            _ => 0,
        }
    }
}

// ============================================================================
// cpal-backed output device
// ============================================================================

#[cfg(feature = "audio-output")]
mod cpal_impl {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    use crate::error::PlayerError;

    /// cpal output stream driving an [`AudioCallback`].
    ///
    /// The stream runs in f32; the engine-side callback produces bytes in
    /// the negotiated [`AudioSpec`] and this glue reinterprets them.
    pub struct AudioOutput {
        stream: cpal::Stream,
        spec: AudioSpec,
    }

    impl AudioOutput {
        /// Queries the default output device and derives the fixed device
        /// format the engine will convert into.
        pub fn probe() -> Result<AudioSpec, PlayerError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| PlayerError::AudioDevice("no output device".into()))?;
            let config = device
                .default_output_config()
                .map_err(|e| PlayerError::AudioDevice(format!("default config: {e}")))?;
            Ok(AudioSpec {
                format: SampleFormat::F32,
                channels: config.channels().clamp(1, 2),
                rate: config.sample_rate().0,
                periods: 2,
                buffer_frames: 1024,
            })
        }

        /// Builds and starts the output stream around `callback`.
        pub fn start(spec: AudioSpec, mut callback: AudioCallback) -> Result<Self, PlayerError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| PlayerError::AudioDevice("no output device".into()))?;

            let config = cpal::StreamConfig {
                channels: spec.channels,
                sample_rate: cpal::SampleRate(spec.rate),
                buffer_size: cpal::BufferSize::Fixed(spec.buffer_frames),
            };

            let mut scratch: Vec<u8> = Vec::new();
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(std::mem::size_of_val(data), 0);
                        callback.fill(&mut scratch);
                        for (sample, chunk) in data.iter_mut().zip(scratch.chunks_exact(4)) {
                            *sample = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        }
                    },
                    |err| tracing::error!("audio stream error: {err}"),
                    None,
                )
                .map_err(|e| PlayerError::AudioDevice(format!("build stream: {e}")))?;

            stream
                .play()
                .map_err(|e| PlayerError::AudioDevice(format!("start stream: {e}")))?;
            tracing::info!(
                "audio output started ({} Hz, {} ch)",
                spec.rate,
                spec.channels
            );
            Ok(Self { stream, spec })
        }

        pub fn spec(&self) -> AudioSpec {
            self.spec
        }

        /// Stops device delivery. The engine keeps filling silence while the
        /// player is paused, so this is only needed at teardown.
        pub fn pause(&self) {
            let _ = self.stream.pause();
        }
    }
}

#[cfg(feature = "audio-output")]
pub use cpal_impl::AudioOutput;

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> AudioSpec {
        AudioSpec {
            format: SampleFormat::F32,
            channels: 2,
            rate: 48_000,
            periods: 2,
            buffer_frames: 1024,
        }
    }

    #[test]
    fn spec_byte_math() {
        let spec = spec();
        assert_eq!(spec.bytes_per_frame(), 8);
        assert_eq!(spec.bytes_per_second(), 384_000);
        assert_eq!(spec.native_buffer_bytes(), 8192);
        assert!((spec.diff_threshold() - 8192.0 / 384_000.0).abs() < 1e-9);
    }

    #[test]
    fn master_audio_leaves_count_untouched() {
        // The caller skips synchronize_audio entirely when audio is master;
        // a zero diff must also be a no-op.
        let mut filter = AudioDiffFilter::new();
        for _ in 0..100 {
            assert_eq!(synchronize_audio(1024, 0.0, &mut filter, 0.02, 48_000), 1024);
        }
    }

    #[test]
    fn warmup_makes_no_correction() {
        let mut filter = AudioDiffFilter::new();
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(synchronize_audio(1024, 0.5, &mut filter, 0.02, 48_000), 1024);
        }
    }

    #[test]
    fn sustained_drift_corrects_within_bounds() {
        let mut filter = AudioDiffFilter::new();
        let mut corrected = 1024;
        for _ in 0..(AUDIO_DIFF_AVG_NB + 10) {
            corrected = synchronize_audio(1024, 0.05, &mut filter, 0.02, 48_000);
        }
        // 50ms at 48kHz is 2400 extra samples; the clamp holds it to +10%.
        assert_eq!(corrected, 1024 + 102);
    }

    #[test]
    fn negative_drift_shrinks_window() {
        let mut filter = AudioDiffFilter::new();
        let mut corrected = 1024;
        for _ in 0..(AUDIO_DIFF_AVG_NB + 10) {
            corrected = synchronize_audio(1024, -0.05, &mut filter, 0.02, 48_000);
        }
        assert_eq!(corrected, 1024 - 103);
    }

    #[test]
    fn wild_drift_resets_filter() {
        let mut filter = AudioDiffFilter::new();
        for _ in 0..(AUDIO_DIFF_AVG_NB + 5) {
            synchronize_audio(1024, 0.05, &mut filter, 0.02, 48_000);
        }
        // A 10s+ jump (seek) resets the EMA; the next windows are warmup.
        assert_eq!(synchronize_audio(1024, 25.0, &mut filter, 0.02, 48_000), 1024);
        assert_eq!(filter.count, 0);
        assert_eq!(synchronize_audio(1024, 0.05, &mut filter, 0.02, 48_000), 1024);
    }

    #[test]
    fn small_average_is_ignored() {
        let mut filter = AudioDiffFilter::new();
        let mut corrected = 1024;
        for _ in 0..(AUDIO_DIFF_AVG_NB + 10) {
            corrected = synchronize_audio(1024, 0.005, &mut filter, 0.02, 48_000);
        }
        assert_eq!(corrected, 1024);
    }
}
