//! Deterministic synthetic media backend.
//!
//! Generates a scripted A/V stream entirely in memory: interleaved packets
//! with exact timestamps, one decoded frame per packet, a gradient test
//! picture. Used by the integration tests and by the demo binary when the
//! `ffmpeg` feature is off, so the whole pipeline can run without media
//! files or system codec libraries.

use crate::facade::{
    AudioFrameData, ContainerFlags, ContainerInfo, CpuPicture, DecodedFrame, Demuxer,
    DemuxedPacket, FacadeError, MediaSource, PacketPayload, PixelFormat, Plane, Rational,
    ReadOutcome, ReceiveStatus, Resampler, Scaler, SeekFlags, SendStatus, StreamDecoder,
    StreamInfo, StreamKind, VideoFrameData,
};

/// Video stream time base (90 kHz, the MPEG convention).
const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);

/// Shape of the synthetic clip.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Clip length in seconds.
    pub duration: f64,
    /// Video frame rate.
    pub fps: u32,
    /// Test picture dimensions.
    pub width: u32,
    pub height: u32,
    /// Audio sample rate.
    pub sample_rate: u32,
    /// Audio samples per packet.
    pub samples_per_packet: usize,
    pub with_video: bool,
    pub with_audio: bool,
    /// Synthetic payload size of one video packet, for backpressure tests.
    pub video_packet_bytes: usize,
    pub audio_packet_bytes: usize,
    /// Report a realtime container format (`"rtsp"`).
    pub realtime: bool,
    /// Name reported as the container URL.
    pub name: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            duration: 5.0,
            fps: 25,
            width: 64,
            height: 36,
            sample_rate: 48_000,
            samples_per_packet: 1024,
            with_video: true,
            with_audio: true,
            video_packet_bytes: 4096,
            audio_packet_bytes: 512,
            realtime: false,
            name: "sim://clip".into(),
        }
    }
}

impl SimConfig {
    fn audio_time_base(&self) -> Rational {
        Rational::new(1, self.sample_rate as i32)
    }

    fn video_pts_step(&self) -> i64 {
        (VIDEO_TIME_BASE.den as i64) / self.fps as i64
    }

    /// Nominal container byte rate, used to map byte seeks back to time.
    fn bytes_per_second(&self) -> f64 {
        let mut rate = 0.0;
        if self.with_video {
            rate += self.video_packet_bytes as f64 * self.fps as f64;
        }
        if self.with_audio {
            rate += self.audio_packet_bytes as f64 * self.sample_rate as f64
                / self.samples_per_packet as f64;
        }
        rate.max(1.0)
    }
}

/// Opens a synthetic clip as a [`MediaSource`].
pub fn open(config: SimConfig) -> MediaSource {
    let video_decoder: Option<Box<dyn StreamDecoder>> = if config.with_video {
        Some(Box::new(SimVideoDecoder::new(&config)))
    } else {
        None
    };
    let audio_decoder: Option<Box<dyn StreamDecoder>> = if config.with_audio {
        Some(Box::new(SimAudioDecoder::new(&config)))
    } else {
        None
    };
    MediaSource {
        demuxer: Box::new(SimDemuxer::new(config)),
        video_decoder,
        audio_decoder,
    }
}

// ============================================================================
// Demuxer
// ============================================================================

/// Scripted demuxer emitting interleaved packets in timestamp order.
pub struct SimDemuxer {
    config: SimConfig,
    info: ContainerInfo,
    /// Next video PTS, in video time-base units.
    next_video_pts: i64,
    /// Next audio PTS, in audio time-base units.
    next_audio_pts: i64,
    /// Running byte position.
    pos: i64,
}

impl SimDemuxer {
    pub fn new(config: SimConfig) -> Self {
        let mut streams = Vec::new();
        if config.with_video {
            streams.push(StreamInfo {
                index: 0,
                kind: StreamKind::Video,
                time_base: VIDEO_TIME_BASE,
                start_time: Some(0),
                avg_frame_rate: Rational::new(config.fps as i32, 1),
                attached_pic: false,
            });
        }
        if config.with_audio {
            streams.push(StreamInfo {
                index: streams.len(),
                kind: StreamKind::Audio,
                time_base: config.audio_time_base(),
                start_time: Some(0),
                avg_frame_rate: Rational::new(0, 0),
                attached_pic: false,
            });
        }
        let info = ContainerInfo {
            format_name: if config.realtime { "rtsp".into() } else { "sim".into() },
            url: config.name.clone(),
            duration: Some(config.duration),
            start_time: Some(0.0),
            flags: ContainerFlags::empty(),
            streams,
        };
        Self { config, info, next_video_pts: 0, next_audio_pts: 0, pos: 0 }
    }

    fn video_stream_index(&self) -> usize {
        0
    }

    fn audio_stream_index(&self) -> usize {
        if self.config.with_video {
            1
        } else {
            0
        }
    }

    fn next_video_seconds(&self) -> f64 {
        if !self.config.with_video {
            return f64::INFINITY;
        }
        self.next_video_pts as f64 * VIDEO_TIME_BASE.as_f64()
    }

    fn next_audio_seconds(&self) -> f64 {
        if !self.config.with_audio {
            return f64::INFINITY;
        }
        self.next_audio_pts as f64 / self.config.sample_rate as f64
    }

    fn make_video_packet(&mut self) -> DemuxedPacket {
        let pts = self.next_video_pts;
        self.next_video_pts += self.config.video_pts_step();
        let pos = self.pos;
        self.pos += self.config.video_packet_bytes as i64;
        DemuxedPacket {
            stream_index: self.video_stream_index(),
            pts: Some(pts),
            dts: Some(pts),
            duration: self.config.video_pts_step(),
            pos: Some(pos),
            payload: PacketPayload::Bytes(vec![0u8; self.config.video_packet_bytes]),
        }
    }

    fn make_audio_packet(&mut self) -> DemuxedPacket {
        let pts = self.next_audio_pts;
        self.next_audio_pts += self.config.samples_per_packet as i64;
        let pos = self.pos;
        self.pos += self.config.audio_packet_bytes as i64;
        DemuxedPacket {
            stream_index: self.audio_stream_index(),
            pts: Some(pts),
            dts: Some(pts),
            duration: self.config.samples_per_packet as i64,
            pos: Some(pos),
            payload: PacketPayload::Bytes(vec![0u8; self.config.audio_packet_bytes]),
        }
    }
}

impl Demuxer for SimDemuxer {
    fn container(&self) -> &ContainerInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<ReadOutcome, FacadeError> {
        let video_at = self.next_video_seconds();
        let audio_at = self.next_audio_seconds();
        let next = video_at.min(audio_at);
        if next >= self.config.duration {
            return Ok(ReadOutcome::EndOfFile);
        }
        let packet = if video_at <= audio_at {
            self.make_video_packet()
        } else {
            self.make_audio_packet()
        };
        Ok(ReadOutcome::Packet(packet))
    }

    fn seek(
        &mut self,
        _min: i64,
        target: i64,
        _max: i64,
        flags: SeekFlags,
    ) -> Result<(), FacadeError> {
        let seconds = if flags.by_bytes {
            (target as f64 / self.config.bytes_per_second()).max(0.0)
        } else {
            (target as f64 / 1_000_000.0).max(0.0)
        };
        if seconds > self.config.duration + 1.0 {
            return Err(FacadeError::SeekFailed(format!(
                "target {seconds:.3}s past end of {:.3}s clip",
                self.config.duration
            )));
        }
        if self.config.with_video {
            // Land on the frame boundary at or before the target.
            let step = self.config.video_pts_step();
            let pts = (seconds * VIDEO_TIME_BASE.den as f64) as i64;
            self.next_video_pts = (pts / step) * step;
        }
        if self.config.with_audio {
            let step = self.config.samples_per_packet as i64;
            let pts = (seconds * self.config.sample_rate as f64) as i64;
            self.next_audio_pts = (pts / step) * step;
        }
        self.pos = (seconds * self.config.bytes_per_second()) as i64;
        Ok(())
    }
}

// ============================================================================
// Decoders
// ============================================================================

/// One-frame-per-packet video decoder with a single-slot output buffer.
///
/// The single slot makes the codec report `TryAgain` whenever a frame is
/// waiting, which exercises the engine's pending-packet path the same way a
/// real codec does.
pub struct SimVideoDecoder {
    width: u32,
    height: u32,
    pending: Option<VideoFrameData>,
    draining: bool,
    frame_counter: u64,
}

impl SimVideoDecoder {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            pending: None,
            draining: false,
            frame_counter: 0,
        }
    }

    fn test_picture(&self, frame_number: u64) -> CpuPicture {
        let width = self.width;
        let height = self.height;
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        let phase = (frame_number % 255) as u8;
        for y in 0..height {
            for x in 0..width {
                let r = ((x as f32 / width as f32) * 255.0) as u8;
                let g = ((y as f32 / height as f32) * 255.0) as u8;
                data.extend_from_slice(&[r, g, phase.wrapping_mul(3), 255]);
            }
        }
        CpuPicture {
            format: PixelFormat::Rgba,
            width,
            height,
            planes: vec![Plane { data, stride: width as usize * 4 }],
        }
    }
}

impl StreamDecoder for SimVideoDecoder {
    fn send_packet(&mut self, packet: &DemuxedPacket) -> Result<SendStatus, FacadeError> {
        if self.pending.is_some() {
            return Ok(SendStatus::TryAgain);
        }
        let picture = self.test_picture(self.frame_counter);
        self.frame_counter += 1;
        self.pending = Some(VideoFrameData {
            pts: packet.pts,
            best_effort_pts: packet.pts.or(packet.dts),
            pkt_dts: packet.dts,
            pos: packet.pos,
            width: self.width,
            height: self.height,
            sar: Rational::new(1, 1),
            picture,
        });
        Ok(SendStatus::Accepted)
    }

    fn send_eof(&mut self) -> Result<(), FacadeError> {
        self.draining = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus, FacadeError> {
        if let Some(frame) = self.pending.take() {
            return Ok(ReceiveStatus::Frame(DecodedFrame::Video(frame)));
        }
        if self.draining {
            Ok(ReceiveStatus::EndOfStream)
        } else {
            Ok(ReceiveStatus::NeedsInput)
        }
    }

    fn flush(&mut self) {
        self.pending = None;
        self.draining = false;
    }
}

/// One-frame-per-packet audio decoder producing a 440 Hz sine window.
pub struct SimAudioDecoder {
    sample_rate: u32,
    samples_per_packet: usize,
    pending: Option<AudioFrameData>,
    draining: bool,
}

impl SimAudioDecoder {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            samples_per_packet: config.samples_per_packet,
            pending: None,
            draining: false,
        }
    }
}

impl StreamDecoder for SimAudioDecoder {
    fn send_packet(&mut self, packet: &DemuxedPacket) -> Result<SendStatus, FacadeError> {
        if self.pending.is_some() {
            return Ok(SendStatus::TryAgain);
        }
        let nb_samples = self.samples_per_packet;
        let base = packet.pts.unwrap_or(0);
        let mut samples = Vec::with_capacity(nb_samples * 2);
        for i in 0..nb_samples {
            let t = (base + i as i64) as f64 / self.sample_rate as f64;
            let value = (t * 440.0 * std::f64::consts::TAU).sin() as f32 * 0.2;
            samples.push(value);
            samples.push(value);
        }
        self.pending = Some(AudioFrameData {
            pts: packet.pts,
            sample_rate: self.sample_rate,
            channels: 2,
            nb_samples,
            samples,
        });
        Ok(SendStatus::Accepted)
    }

    fn send_eof(&mut self) -> Result<(), FacadeError> {
        self.draining = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus, FacadeError> {
        if let Some(frame) = self.pending.take() {
            return Ok(ReceiveStatus::Frame(DecodedFrame::Audio(frame)));
        }
        if self.draining {
            Ok(ReceiveStatus::EndOfStream)
        } else {
            Ok(ReceiveStatus::NeedsInput)
        }
    }

    fn flush(&mut self) {
        self.pending = None;
        self.draining = false;
    }
}

// ============================================================================
// Resampler / scaler
// ============================================================================

/// f32-interleaved resampler with nearest-sample rate conversion. Good
/// enough for a synthetic sine; the ffmpeg backend does the real filtering.
pub struct SimResampler {
    out_rate: u32,
    out_channels: u16,
}

impl SimResampler {
    pub fn new(out_rate: u32, out_channels: u16) -> Self {
        Self { out_rate, out_channels }
    }
}

impl Resampler for SimResampler {
    fn convert(
        &mut self,
        frame: &AudioFrameData,
        wanted_samples: usize,
        out: &mut Vec<u8>,
    ) -> Result<usize, FacadeError> {
        // Stretch/squeeze the wanted source window onto the output rate.
        let out_samples =
            (wanted_samples as u64 * self.out_rate as u64 / frame.sample_rate as u64) as usize;
        let out_samples = out_samples.max(1);
        out.clear();
        out.reserve(out_samples * self.out_channels as usize * 4);
        let src_channels = frame.channels as usize;
        for i in 0..out_samples {
            let src_index = i * frame.nb_samples / out_samples;
            for ch in 0..self.out_channels as usize {
                let src_ch = ch.min(src_channels - 1);
                let sample = frame
                    .samples
                    .get(src_index * src_channels + src_ch)
                    .copied()
                    .unwrap_or(0.0);
                out.extend_from_slice(&sample.to_ne_bytes());
            }
        }
        Ok(out_samples)
    }
}

/// Identity scaler; synthetic pictures are already RGBA.
pub struct SimScaler;

impl Scaler for SimScaler {
    fn scale(&mut self, picture: &CpuPicture) -> Result<CpuPicture, FacadeError> {
        Ok(picture.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_interleave_in_timestamp_order() {
        let mut demuxer = SimDemuxer::new(SimConfig { duration: 0.5, ..Default::default() });
        let mut last_seconds = 0.0f64;
        let mut video = 0;
        let mut audio = 0;
        loop {
            match demuxer.read_packet().unwrap() {
                ReadOutcome::EndOfFile => break,
                ReadOutcome::Packet(pkt) => {
                    let tb = demuxer.info.streams[pkt.stream_index].time_base;
                    let seconds = pkt.pts.unwrap() as f64 * tb.as_f64();
                    assert!(seconds + 1e-9 >= last_seconds, "{seconds} < {last_seconds}");
                    last_seconds = seconds;
                    if pkt.stream_index == 0 {
                        video += 1;
                    } else {
                        audio += 1;
                    }
                }
            }
        }
        // 0.5s at 25fps ≈ 13 video packets; 0.5s of 1024-sample windows ≈ 24.
        assert_eq!(video, 13);
        assert_eq!(audio, 24);
    }

    #[test]
    fn seek_repositions_on_frame_boundary() {
        let mut demuxer = SimDemuxer::new(SimConfig::default());
        for _ in 0..10 {
            demuxer.read_packet().unwrap();
        }
        demuxer.seek(i64::MIN, 2_000_000, i64::MAX, SeekFlags::default()).unwrap();
        // 2.0s at 25fps = frame 50 exactly.
        assert_eq!(demuxer.next_video_pts, 50 * 3600);
        assert_eq!(demuxer.next_audio_pts % 1024, 0);
    }

    #[test]
    fn decoder_reports_try_again_with_frame_pending() {
        let config = SimConfig::default();
        let mut demuxer = SimDemuxer::new(config.clone());
        let mut decoder = SimVideoDecoder::new(&config);
        let ReadOutcome::Packet(pkt) = demuxer.read_packet().unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(decoder.send_packet(&pkt).unwrap(), SendStatus::Accepted);
        assert_eq!(decoder.send_packet(&pkt).unwrap(), SendStatus::TryAgain);
        assert!(matches!(decoder.receive_frame().unwrap(), ReceiveStatus::Frame(_)));
        assert!(matches!(decoder.receive_frame().unwrap(), ReceiveStatus::NeedsInput));
    }

    #[test]
    fn decoder_drains_to_end_of_stream() {
        let config = SimConfig::default();
        let mut decoder = SimAudioDecoder::new(&config);
        decoder.send_eof().unwrap();
        assert!(matches!(decoder.receive_frame().unwrap(), ReceiveStatus::EndOfStream));
        decoder.flush();
        assert!(matches!(decoder.receive_frame().unwrap(), ReceiveStatus::NeedsInput));
    }

    #[test]
    fn resampler_produces_requested_window() {
        let mut resampler = SimResampler::new(48_000, 2);
        let frame = AudioFrameData {
            pts: Some(0),
            sample_rate: 48_000,
            channels: 2,
            nb_samples: 1024,
            samples: vec![0.1; 2048],
        };
        let mut out = Vec::new();
        let produced = resampler.convert(&frame, 1024, &mut out).unwrap();
        assert_eq!(produced, 1024);
        assert_eq!(out.len(), 1024 * 2 * 4);

        // Drift correction asks for 10% more samples.
        let produced = resampler.convert(&frame, 1126, &mut out).unwrap();
        assert_eq!(produced, 1126);
    }
}
