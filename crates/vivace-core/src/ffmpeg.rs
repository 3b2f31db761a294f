//! FFmpeg-backed codec façade (`ffmpeg` feature).
//!
//! Thin adapters from [`ffmpeg_next`] to the [`crate::facade`] traits:
//! demuxing via `format::context::Input`, per-stream decoding via
//! `codec::decoder`, sample conversion via `software::resampling`, and pixel
//! conversion via `software::scaling`. Raw `ffi` calls are used where the
//! safe wrappers have no surface (windowed seeks, resampler compensation,
//! read-pause for network inputs).
//!
//! FFmpeg must be installed on the system; see the ffmpeg-next crate docs
//! for per-platform setup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ffmpeg_next as ff;
use ffmpeg_next::ffi;

use crate::audio::{AudioSpec, SampleFormat};
use crate::facade::{
    AudioFrameData, ContainerFlags, ContainerInfo, CpuPicture, DecodedFrame, Demuxer,
    DemuxedPacket, FacadeError, MediaSource, PacketPayload, PixelFormat, Plane, Rational,
    ReadOutcome, ReceiveStatus, Resampler, Scaler, SeekFlags, SendStatus, StreamDecoder,
    StreamInfo, StreamKind,
};

fn rational(r: ff::Rational) -> Rational {
    Rational::new(r.0, r.1)
}

fn map_open_err(err: ff::Error) -> FacadeError {
    FacadeError::OpenFailed(err.to_string())
}

/// Opens `url` and builds decoders for the best video and audio streams.
pub fn open(url: &str) -> Result<MediaSource, FacadeError> {
    // Safe to call repeatedly; registers codecs and formats.
    ff::init().map_err(|e| FacadeError::OpenFailed(format!("ffmpeg init failed: {e}")))?;

    let demuxer = FfDemuxer::open(url)?;

    let video_decoder = demuxer
        .container()
        .best_stream(StreamKind::Video)
        .map(|info| FfVideoDecoder::open(&demuxer.input, info.index))
        .transpose()?
        .map(|d| Box::new(d) as Box<dyn StreamDecoder>);
    let audio_decoder = demuxer
        .container()
        .best_stream(StreamKind::Audio)
        .map(|info| FfAudioDecoder::open(&demuxer.input, info.index))
        .transpose()?
        .map(|d| Box::new(d) as Box<dyn StreamDecoder>);

    Ok(MediaSource {
        demuxer: Box::new(demuxer),
        video_decoder,
        audio_decoder,
    })
}

/// Builds a resampler converting decoded audio into the device format.
pub fn resampler(spec: &AudioSpec) -> Box<dyn Resampler> {
    Box::new(FfResampler::new(*spec))
}

// ============================================================================
// Demuxer
// ============================================================================

unsafe extern "C" fn interrupt_callback(opaque: *mut std::os::raw::c_void) -> i32 {
    let flag = &*(opaque as *const AtomicBool);
    flag.load(Ordering::Acquire) as i32
}

pub struct FfDemuxer {
    input: ff::format::context::Input,
    info: ContainerInfo,
    /// Raising this makes blocking reads bail out (wired into the format
    /// context's interrupt callback).
    abort: Arc<AtomicBool>,
}

// SAFETY: the format context is only ever touched from the reader thread;
// the Demuxer trait moves the whole demuxer there.
unsafe impl Send for FfDemuxer {}

impl FfDemuxer {
    pub fn open(url: &str) -> Result<Self, FacadeError> {
        let mut input = ff::format::input(&url).map_err(map_open_err)?;

        let abort = Arc::new(AtomicBool::new(false));
        unsafe {
            let ctx = input.as_mut_ptr();
            (*ctx).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_callback),
                opaque: Arc::as_ptr(&abort) as *mut std::os::raw::c_void,
            };
        }

        let mut streams = Vec::new();
        for stream in input.streams() {
            let kind = match stream.parameters().medium() {
                ff::media::Type::Video => StreamKind::Video,
                ff::media::Type::Audio => StreamKind::Audio,
                _ => continue,
            };
            let start_time = {
                let st = stream.start_time();
                if st == ffi::AV_NOPTS_VALUE {
                    None
                } else {
                    Some(st)
                }
            };
            let attached_pic = unsafe {
                let st = stream.as_ptr();
                (*st).disposition & ffi::AV_DISPOSITION_ATTACHED_PIC != 0
            };
            streams.push(StreamInfo {
                index: stream.index(),
                kind,
                time_base: rational(stream.time_base()),
                start_time,
                avg_frame_rate: rational(stream.avg_frame_rate()),
                attached_pic,
            });
        }

        let (raw_flags, format_name) = unsafe {
            let ctx = input.as_ptr();
            let iformat = (*ctx).iformat;
            let name = std::ffi::CStr::from_ptr((*iformat).name)
                .to_string_lossy()
                .into_owned();
            ((*iformat).flags, name)
        };
        let mut flags = ContainerFlags::empty();
        if raw_flags & ffi::AVFMT_TS_DISCONT != 0 {
            flags.insert(ContainerFlags::TS_DISCONT);
        }
        if raw_flags & ffi::AVFMT_NOBINSEARCH != 0 {
            flags.insert(ContainerFlags::NO_BIN_SEARCH);
        }
        if raw_flags & ffi::AVFMT_NOGENSEARCH != 0 {
            flags.insert(ContainerFlags::NO_GEN_SEARCH);
        }
        if raw_flags & ffi::AVFMT_NO_BYTE_SEEK != 0 {
            flags.insert(ContainerFlags::NO_BYTE_SEEK);
        }

        let duration = if input.duration() > 0 {
            Some(input.duration() as f64 / ffi::AV_TIME_BASE as f64)
        } else {
            None
        };
        let start_time = unsafe {
            let st = (*input.as_ptr()).start_time;
            if st == ffi::AV_NOPTS_VALUE {
                None
            } else {
                Some(st as f64 / ffi::AV_TIME_BASE as f64)
            }
        };

        let info = ContainerInfo {
            format_name,
            url: url.to_string(),
            duration,
            start_time,
            flags,
            streams,
        };
        tracing::info!(
            "opened {} ({}, {:?}s, {} streams)",
            url,
            info.format_name,
            info.duration,
            info.streams.len()
        );

        Ok(Self { input, info, abort })
    }

    /// Handle that unblocks any in-flight read when raised.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }
}

impl Demuxer for FfDemuxer {
    fn container(&self) -> &ContainerInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<ReadOutcome, FacadeError> {
        match self.input.packets().next() {
            Some((stream, packet)) => {
                let duration = packet.duration();
                let pos = packet.position() as i64;
                Ok(ReadOutcome::Packet(DemuxedPacket {
                    stream_index: stream.index(),
                    pts: packet.pts(),
                    dts: packet.dts(),
                    duration,
                    pos: (pos >= 0).then_some(pos),
                    payload: PacketPayload::Av(packet),
                }))
            }
            None => Ok(ReadOutcome::EndOfFile),
        }
    }

    fn seek(
        &mut self,
        min: i64,
        target: i64,
        max: i64,
        flags: SeekFlags,
    ) -> Result<(), FacadeError> {
        let mut raw_flags = 0;
        if flags.any {
            raw_flags |= ffi::AVSEEK_FLAG_ANY;
        }
        if flags.by_bytes {
            raw_flags |= ffi::AVSEEK_FLAG_BYTE;
        }
        if flags.backward {
            raw_flags |= ffi::AVSEEK_FLAG_BACKWARD;
        }
        let ret = unsafe {
            ffi::avformat_seek_file(self.input.as_mut_ptr(), -1, min, target, max, raw_flags)
        };
        if ret < 0 {
            Err(FacadeError::SeekFailed(format!("avformat_seek_file: {ret}")))
        } else {
            Ok(())
        }
    }

    fn pause(&mut self) -> Result<(), FacadeError> {
        unsafe { ffi::av_read_pause(self.input.as_mut_ptr()) };
        Ok(())
    }

    fn play(&mut self) -> Result<(), FacadeError> {
        unsafe { ffi::av_read_play(self.input.as_mut_ptr()) };
        Ok(())
    }
}

// ============================================================================
// Video decoder
// ============================================================================

pub struct FfVideoDecoder {
    decoder: ff::decoder::Video,
    /// Converts non-planar-YUV sources to RGBA; created on first use and
    /// recreated when the geometry changes.
    scaler: Option<ff::software::scaling::Context>,
}

// SAFETY: accessed only from the video decode thread.
unsafe impl Send for FfVideoDecoder {}

impl FfVideoDecoder {
    fn open(input: &ff::format::context::Input, stream_index: usize) -> Result<Self, FacadeError> {
        let stream = input
            .stream(stream_index)
            .ok_or_else(|| FacadeError::DecoderInit("video stream vanished".into()))?;
        let mut context = ff::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| FacadeError::DecoderInit(format!("codec context: {e}")))?;
        // Frame timestamps should come out in stream time-base units.
        unsafe {
            (*context.as_mut_ptr()).pkt_timebase = stream.time_base().into();
        }
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| FacadeError::DecoderInit(format!("open video decoder: {e}")))?;
        tracing::info!(
            "video decoder: {}x{} {:?}",
            decoder.width(),
            decoder.height(),
            decoder.format()
        );
        Ok(Self { decoder, scaler: None })
    }

    fn extract_picture(&mut self, frame: &ff::frame::Video) -> Result<CpuPicture, FacadeError> {
        if frame.format() == ff::format::Pixel::YUV420P {
            let mut planes = Vec::with_capacity(3);
            for i in 0..3 {
                planes.push(Plane {
                    data: frame.data(i).to_vec(),
                    stride: frame.stride(i),
                });
            }
            return Ok(CpuPicture {
                format: PixelFormat::Yuv420p,
                width: frame.width(),
                height: frame.height(),
                planes,
            });
        }

        // Anything else goes through the scaler to RGBA.
        let width = frame.width();
        let height = frame.height();
        let needs_recreate = self.scaler.as_ref().is_none_or(|s| {
            let input = s.input();
            input.format != frame.format() || input.width != width || input.height != height
        });
        if needs_recreate {
            self.scaler = Some(
                ff::software::scaling::Context::get(
                    frame.format(),
                    width,
                    height,
                    ff::format::Pixel::RGBA,
                    width,
                    height,
                    ff::software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| FacadeError::DecodeFailed(format!("create scaler: {e}")))?,
            );
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| FacadeError::DecodeFailed("scaler not initialized".into()))?;

        let mut rgba = ff::frame::Video::empty();
        scaler
            .run(frame, &mut rgba)
            .map_err(|e| FacadeError::DecodeFailed(format!("scale: {e}")))?;

        let stride = rgba.stride(0);
        let row_bytes = width as usize * 4;
        let data = rgba.data(0);
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            pixels.extend_from_slice(&data[start..start + row_bytes]);
        }
        Ok(CpuPicture {
            format: PixelFormat::Rgba,
            width,
            height,
            planes: vec![Plane { data: pixels, stride: row_bytes }],
        })
    }
}

impl StreamDecoder for FfVideoDecoder {
    fn send_packet(&mut self, packet: &DemuxedPacket) -> Result<SendStatus, FacadeError> {
        let PacketPayload::Av(ref av) = packet.payload else {
            return Err(FacadeError::DecodeFailed("non-ffmpeg payload".into()));
        };
        match self.decoder.send_packet(av) {
            Ok(()) => Ok(SendStatus::Accepted),
            Err(ff::Error::Other { errno }) if errno == ff::error::EAGAIN => {
                Ok(SendStatus::TryAgain)
            }
            Err(e) => Err(FacadeError::DecodeFailed(format!("send packet: {e}"))),
        }
    }

    fn send_eof(&mut self) -> Result<(), FacadeError> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ff::Error::Eof) => Ok(()),
            Err(e) => Err(FacadeError::DecodeFailed(format!("send eof: {e}"))),
        }
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus, FacadeError> {
        let mut frame = ff::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let (best_effort, pkt_dts, pos) = unsafe {
                    let ptr = frame.as_ptr();
                    let best = (*ptr).best_effort_timestamp;
                    let dts = (*ptr).pkt_dts;
                    let pos = (*ptr).pkt_pos;
                    (
                        (best != ffi::AV_NOPTS_VALUE).then_some(best),
                        (dts != ffi::AV_NOPTS_VALUE).then_some(dts),
                        (pos >= 0).then_some(pos),
                    )
                };
                let picture = self.extract_picture(&frame)?;
                Ok(ReceiveStatus::Frame(DecodedFrame::Video(
                    crate::facade::VideoFrameData {
                        pts: frame.pts(),
                        best_effort_pts: best_effort,
                        pkt_dts,
                        pos,
                        width: frame.width(),
                        height: frame.height(),
                        sar: rational(frame.aspect_ratio()),
                        picture,
                    },
                )))
            }
            Err(ff::Error::Eof) => Ok(ReceiveStatus::EndOfStream),
            Err(ff::Error::Other { errno }) if errno == ff::error::EAGAIN => {
                Ok(ReceiveStatus::NeedsInput)
            }
            Err(e) => Err(FacadeError::DecodeFailed(format!("receive frame: {e}"))),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

// ============================================================================
// Audio decoder
// ============================================================================

pub struct FfAudioDecoder {
    decoder: ff::decoder::Audio,
    /// Normalizes whatever the codec emits to packed f32 at the source rate.
    to_f32: Option<ff::software::resampling::Context>,
}

// SAFETY: accessed only from the audio decode thread.
unsafe impl Send for FfAudioDecoder {}

impl FfAudioDecoder {
    fn open(input: &ff::format::context::Input, stream_index: usize) -> Result<Self, FacadeError> {
        let stream = input
            .stream(stream_index)
            .ok_or_else(|| FacadeError::DecoderInit("audio stream vanished".into()))?;
        let mut context = ff::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| FacadeError::DecoderInit(format!("codec context: {e}")))?;
        unsafe {
            (*context.as_mut_ptr()).pkt_timebase = stream.time_base().into();
        }
        let decoder = context
            .decoder()
            .audio()
            .map_err(|e| FacadeError::DecoderInit(format!("open audio decoder: {e}")))?;
        tracing::info!(
            "audio decoder: {} Hz, {} ch, {:?}",
            decoder.rate(),
            decoder.channels(),
            decoder.format()
        );
        Ok(Self { decoder, to_f32: None })
    }

    fn to_interleaved_f32(&mut self, frame: &ff::frame::Audio) -> Result<Vec<f32>, FacadeError> {
        let packed_f32 = ff::format::Sample::F32(ff::format::sample::Type::Packed);
        if frame.format() == packed_f32 {
            let samples = frame.samples() * frame.channels() as usize;
            let data = frame.data(0);
            let mut out = Vec::with_capacity(samples);
            for chunk in data.chunks_exact(4).take(samples) {
                out.push(f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            return Ok(out);
        }

        let needs_recreate = self
            .to_f32
            .as_ref()
            .is_none_or(|ctx| ctx.input().format != frame.format() || ctx.input().rate != frame.rate());
        if needs_recreate {
            self.to_f32 = Some(
                ff::software::resampling::Context::get(
                    frame.format(),
                    frame.channel_layout(),
                    frame.rate(),
                    packed_f32,
                    frame.channel_layout(),
                    frame.rate(),
                )
                .map_err(|e| FacadeError::DecodeFailed(format!("create f32 converter: {e}")))?,
            );
        }
        let converter = self
            .to_f32
            .as_mut()
            .ok_or_else(|| FacadeError::DecodeFailed("converter not initialized".into()))?;

        let mut converted = ff::frame::Audio::empty();
        converter
            .run(frame, &mut converted)
            .map_err(|e| FacadeError::DecodeFailed(format!("convert to f32: {e}")))?;

        let samples = converted.samples() * converted.channels() as usize;
        let data = converted.data(0);
        let mut out = Vec::with_capacity(samples);
        for chunk in data.chunks_exact(4).take(samples) {
            out.push(f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(out)
    }
}

impl StreamDecoder for FfAudioDecoder {
    fn send_packet(&mut self, packet: &DemuxedPacket) -> Result<SendStatus, FacadeError> {
        let PacketPayload::Av(ref av) = packet.payload else {
            return Err(FacadeError::DecodeFailed("non-ffmpeg payload".into()));
        };
        match self.decoder.send_packet(av) {
            Ok(()) => Ok(SendStatus::Accepted),
            Err(ff::Error::Other { errno }) if errno == ff::error::EAGAIN => {
                Ok(SendStatus::TryAgain)
            }
            Err(e) => Err(FacadeError::DecodeFailed(format!("send packet: {e}"))),
        }
    }

    fn send_eof(&mut self) -> Result<(), FacadeError> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ff::Error::Eof) => Ok(()),
            Err(e) => Err(FacadeError::DecodeFailed(format!("send eof: {e}"))),
        }
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus, FacadeError> {
        let mut frame = ff::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let samples = self.to_interleaved_f32(&frame)?;
                Ok(ReceiveStatus::Frame(DecodedFrame::Audio(AudioFrameData {
                    pts: frame.pts(),
                    sample_rate: frame.rate(),
                    channels: frame.channels(),
                    nb_samples: frame.samples(),
                    samples,
                })))
            }
            Err(ff::Error::Eof) => Ok(ReceiveStatus::EndOfStream),
            Err(ff::Error::Other { errno }) if errno == ff::error::EAGAIN => {
                Ok(ReceiveStatus::NeedsInput)
            }
            Err(e) => Err(FacadeError::DecodeFailed(format!("receive frame: {e}"))),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

// ============================================================================
// Resampler / scaler
// ============================================================================

fn device_sample_format(format: SampleFormat) -> ff::format::Sample {
    use ff::format::sample::Type::Packed;
    match format {
        SampleFormat::U8 => ff::format::Sample::U8(Packed),
        SampleFormat::S16 => ff::format::Sample::I16(Packed),
        SampleFormat::S32 => ff::format::Sample::I32(Packed),
        SampleFormat::S64 => ff::format::Sample::I64(Packed),
        SampleFormat::F32 => ff::format::Sample::F32(Packed),
        SampleFormat::F64 => ff::format::Sample::F64(Packed),
    }
}

fn layout_for(channels: u16) -> ff::ChannelLayout {
    match channels {
        1 => ff::ChannelLayout::MONO,
        _ => ff::ChannelLayout::STEREO,
    }
}

/// Converts engine audio frames (packed f32) into the device output format,
/// with swr-level sample compensation for drift correction.
pub struct FfResampler {
    spec: AudioSpec,
    ctx: Option<ff::software::resampling::Context>,
    src_rate: u32,
    src_channels: u16,
}

// SAFETY: used only from the audio device callback thread.
unsafe impl Send for FfResampler {}

impl FfResampler {
    pub fn new(spec: AudioSpec) -> Self {
        Self { spec, ctx: None, src_rate: 0, src_channels: 0 }
    }

    fn ensure_context(&mut self, frame: &AudioFrameData) -> Result<(), FacadeError> {
        if self.ctx.is_some()
            && self.src_rate == frame.sample_rate
            && self.src_channels == frame.channels
        {
            return Ok(());
        }
        let packed_f32 = ff::format::Sample::F32(ff::format::sample::Type::Packed);
        self.ctx = Some(
            ff::software::resampling::Context::get(
                packed_f32,
                layout_for(frame.channels),
                frame.sample_rate,
                device_sample_format(self.spec.format),
                layout_for(self.spec.channels),
                self.spec.rate,
            )
            .map_err(|e| FacadeError::DecodeFailed(format!("create resampler: {e}")))?,
        );
        self.src_rate = frame.sample_rate;
        self.src_channels = frame.channels;
        Ok(())
    }
}

impl Resampler for FfResampler {
    fn convert(
        &mut self,
        frame: &AudioFrameData,
        wanted_samples: usize,
        out: &mut Vec<u8>,
    ) -> Result<usize, FacadeError> {
        self.ensure_context(frame)?;
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| FacadeError::DecodeFailed("resampler not initialized".into()))?;

        // Stretch/squeeze via swr compensation when sync asks for a
        // different window than the frame carries.
        if wanted_samples != frame.nb_samples {
            let delta = wanted_samples as i64 - frame.nb_samples as i64;
            let distance =
                wanted_samples as i64 * self.spec.rate as i64 / frame.sample_rate as i64;
            let ret = unsafe {
                ffi::swr_set_compensation(ctx.as_mut_ptr(), delta as i32, distance as i32)
            };
            if ret < 0 {
                return Err(FacadeError::DecodeFailed(format!(
                    "swr_set_compensation: {ret}"
                )));
            }
        }

        // Rebuild the packed-f32 source frame.
        let packed_f32 = ff::format::Sample::F32(ff::format::sample::Type::Packed);
        let mut src =
            ff::frame::Audio::new(packed_f32, frame.nb_samples, layout_for(frame.channels));
        src.set_rate(frame.sample_rate);
        {
            let needed = frame.samples.len() * 4;
            let dst = &mut src.data_mut(0)[..needed];
            for (chunk, sample) in dst.chunks_exact_mut(4).zip(frame.samples.iter()) {
                chunk.copy_from_slice(&sample.to_ne_bytes());
            }
        }

        let mut converted = ff::frame::Audio::empty();
        ctx.run(&src, &mut converted)
            .map_err(|e| FacadeError::DecodeFailed(format!("resample: {e}")))?;

        let produced = converted.samples();
        let bytes = produced * self.spec.bytes_per_frame();
        out.clear();
        out.extend_from_slice(&converted.data(0)[..bytes]);
        Ok(produced)
    }
}

/// YUV420P → RGBA conversion for presentation backends that want CPU RGBA.
pub struct FfScaler {
    ctx: Option<ff::software::scaling::Context>,
}

// SAFETY: used only from the render thread.
unsafe impl Send for FfScaler {}

impl FfScaler {
    pub fn new() -> Self {
        Self { ctx: None }
    }
}

impl Default for FfScaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scaler for FfScaler {
    fn scale(&mut self, picture: &CpuPicture) -> Result<CpuPicture, FacadeError> {
        if picture.format != PixelFormat::Yuv420p {
            return Ok(picture.clone());
        }
        let needs_recreate = self.ctx.as_ref().is_none_or(|s| {
            let input = s.input();
            input.width != picture.width || input.height != picture.height
        });
        if needs_recreate {
            self.ctx = Some(
                ff::software::scaling::Context::get(
                    ff::format::Pixel::YUV420P,
                    picture.width,
                    picture.height,
                    ff::format::Pixel::RGBA,
                    picture.width,
                    picture.height,
                    ff::software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| FacadeError::DecodeFailed(format!("create scaler: {e}")))?,
            );
        }
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| FacadeError::DecodeFailed("scaler not initialized".into()))?;

        let mut src = ff::frame::Video::new(
            ff::format::Pixel::YUV420P,
            picture.width,
            picture.height,
        );
        for (i, plane) in picture.planes.iter().enumerate().take(3) {
            let stride = src.stride(i);
            let rows = if i == 0 { picture.height as usize } else { picture.height as usize / 2 };
            let row_bytes = plane.stride.min(stride);
            for y in 0..rows {
                let dst_start = y * stride;
                let src_start = y * plane.stride;
                src.data_mut(i)[dst_start..dst_start + row_bytes]
                    .copy_from_slice(&plane.data[src_start..src_start + row_bytes]);
            }
        }

        let mut rgba = ff::frame::Video::empty();
        ctx.run(&src, &mut rgba)
            .map_err(|e| FacadeError::DecodeFailed(format!("scale: {e}")))?;

        let stride = rgba.stride(0);
        let row_bytes = picture.width as usize * 4;
        let mut data = Vec::with_capacity(row_bytes * picture.height as usize);
        for y in 0..picture.height as usize {
            let start = y * stride;
            data.extend_from_slice(&rgba.data(0)[start..start + row_bytes]);
        }
        Ok(CpuPicture {
            format: PixelFormat::Rgba,
            width: picture.width,
            height: picture.height,
            planes: vec![Plane { data, stride: row_bytes }],
        })
    }
}
