//! Built-in software encoders
//!
//! PCM and raw video are framing only. MJPEG encodes every frame as a
//! baseline JPEG through the `image` crate. None of them reorder frames,
//! so dts always equals pts.

use std::collections::VecDeque;

use image::codecs::jpeg::JpegEncoder;
use image::ColorType;

use crate::media::{ChannelLayout, CompressedPacket, FrameBuffer, PixelFormat, Rational, SampleFormat, Size};

use super::codec::{
    AudioCodecDescriptor, AudioEncoderConfig, AudioEncoderContext, AudioEncoderFactory, CodecError,
    CodecRegistry, EncoderAudioFrame, EncoderContext, EncoderVideoFrame, VideoCodecDescriptor,
    VideoEncoderConfig, VideoEncoderContext, VideoEncoderFactory,
};
use super::{AudioCodec, VideoCodec};

/// Registers the encoders every build has
pub fn register_builtin(registry: &mut CodecRegistry) {
    registry.register_audio(PcmEncoderFactory::new(AudioCodec::PcmS16le));
    registry.register_audio(PcmEncoderFactory::new(AudioCodec::PcmF32le));
    registry.register_video(MjpegEncoderFactory::new());
    registry.register_video(RawVideoEncoderFactory::new());
}

/// Packets waiting to be received, plus the draining state
#[derive(Debug, Default)]
struct PacketQueue {
    packets: VecDeque<CompressedPacket>,
    draining: bool,
}

impl PacketQueue {
    fn push(&mut self, packet: CompressedPacket) {
        self.packets.push_back(packet);
    }

    fn start_draining(&mut self) -> Result<(), CodecError> {
        if self.draining {
            return Err(CodecError::Eof);
        }
        self.draining = true;
        Ok(())
    }

    fn check_accepting(&self) -> Result<(), CodecError> {
        if self.draining {
            return Err(CodecError::Eof);
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<CompressedPacket, CodecError> {
        match self.packets.pop_front() {
            Some(packet) => Ok(packet),
            None if self.draining => Err(CodecError::Eof),
            None => Err(CodecError::Again),
        }
    }
}

// ─── PCM ────────────────────────────────────────────────────────────────────

pub struct PcmEncoderFactory {
    descriptor: AudioCodecDescriptor,
}

impl PcmEncoderFactory {
    pub fn new(codec: AudioCodec) -> Self {
        let (name, format) = match codec {
            AudioCodec::PcmF32le => ("pcm_f32le", SampleFormat::F32),
            _ => ("pcm_s16le", SampleFormat::S16),
        };
        Self {
            descriptor: AudioCodecDescriptor::new(name, codec, vec![format])
                .with_channel_layouts(pcm_channel_layouts()),
        }
    }
}

impl AudioEncoderFactory for PcmEncoderFactory {
    fn descriptor(&self) -> &AudioCodecDescriptor {
        &self.descriptor
    }

    fn open(&self, config: &AudioEncoderConfig) -> Result<AudioEncoderContext, CodecError> {
        if !self.descriptor.sample_formats.contains(&config.format.sample_format) {
            return Err(CodecError::Unsupported(format!(
                "{} cannot take {} samples",
                self.descriptor.name, config.format.sample_format
            )));
        }
        if !config.format.is_valid() {
            return Err(CodecError::InvalidInput(format!("invalid audio format {}", config.format)));
        }
        Ok(Box::new(PcmEncoder {
            bytes_per_frame: config.format.bytes_per_frame(),
            time_base: config.time_base,
            queue: PacketQueue::default(),
        }))
    }
}

struct PcmEncoder {
    bytes_per_frame: usize,
    time_base: Rational,
    queue: PacketQueue,
}

impl EncoderContext<EncoderAudioFrame> for PcmEncoder {
    fn send_frame(&mut self, frame: Option<EncoderAudioFrame>) -> Result<(), CodecError> {
        let Some(frame) = frame else {
            return self.queue.start_draining();
        };
        self.queue.check_accepting()?;

        if frame.data.len() != frame.samples * self.bytes_per_frame {
            return Err(CodecError::InvalidInput(format!(
                "{} bytes for {} samples",
                frame.data.len(),
                frame.samples
            )));
        }
        if frame.samples == 0 {
            return Ok(());
        }

        let mut packet = CompressedPacket::new(frame.data, frame.pts, self.time_base);
        packet.duration = frame.samples as i64;
        self.queue.push(packet);
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<CompressedPacket, CodecError> {
        self.queue.receive()
    }
}

// ─── Raw video ──────────────────────────────────────────────────────────────

pub struct RawVideoEncoderFactory {
    descriptor: VideoCodecDescriptor,
}

impl RawVideoEncoderFactory {
    pub fn new() -> Self {
        Self {
            descriptor: VideoCodecDescriptor::new(
                "rawvideo",
                VideoCodec::RawVideo,
                vec![
                    PixelFormat::Yuv420p,
                    PixelFormat::Nv12,
                    PixelFormat::Yuv422p,
                    PixelFormat::Yuv444p,
                    PixelFormat::Yuyv422,
                    PixelFormat::Uyvy422,
                    PixelFormat::Gray8,
                    PixelFormat::Rgb24,
                    PixelFormat::Bgr24,
                    PixelFormat::Rgba,
                    PixelFormat::Bgra,
                ],
            ),
        }
    }
}

impl Default for RawVideoEncoderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoderFactory for RawVideoEncoderFactory {
    fn descriptor(&self) -> &VideoCodecDescriptor {
        &self.descriptor
    }

    fn open(&self, config: &VideoEncoderConfig) -> Result<VideoEncoderContext, CodecError> {
        check_sw_config(&self.descriptor, config)?;
        Ok(Box::new(RawVideoEncoder {
            format: config.pixel_format,
            size: config.size,
            time_base: config.time_base,
            queue: PacketQueue::default(),
        }))
    }
}

struct RawVideoEncoder {
    format: PixelFormat,
    size: Size,
    time_base: Rational,
    queue: PacketQueue,
}

impl EncoderContext<EncoderVideoFrame> for RawVideoEncoder {
    fn send_frame(&mut self, frame: Option<EncoderVideoFrame>) -> Result<(), CodecError> {
        let Some(frame) = frame else {
            return self.queue.start_draining();
        };
        self.queue.check_accepting()?;

        let data = frame_memory(&frame, self.format, self.size)?;
        self.queue
            .push(CompressedPacket::new(data.to_vec(), frame.pts, self.time_base));
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<CompressedPacket, CodecError> {
        self.queue.receive()
    }
}

// ─── MJPEG ──────────────────────────────────────────────────────────────────

const DEFAULT_JPEG_QUALITY: u8 = 80;

pub struct MjpegEncoderFactory {
    descriptor: VideoCodecDescriptor,
}

impl MjpegEncoderFactory {
    pub fn new() -> Self {
        Self {
            descriptor: VideoCodecDescriptor::new(
                "mjpeg",
                VideoCodec::Mjpeg,
                vec![PixelFormat::Rgb24, PixelFormat::Gray8],
            )
            .with_size_limits(Some(Size::new(1, 1)), Some(Size::new(65_535, 65_535))),
        }
    }
}

impl Default for MjpegEncoderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoderFactory for MjpegEncoderFactory {
    fn descriptor(&self) -> &VideoCodecDescriptor {
        &self.descriptor
    }

    fn open(&self, config: &VideoEncoderConfig) -> Result<VideoEncoderContext, CodecError> {
        check_sw_config(&self.descriptor, config)?;
        let quality = config
            .options
            .get_parsed::<u8>("quality")
            .unwrap_or(DEFAULT_JPEG_QUALITY)
            .clamp(1, 100);

        log::debug!("[Mjpeg] Opened {} encoder at quality {}", config.size, quality);
        Ok(Box::new(MjpegEncoder {
            format: config.pixel_format,
            size: config.size,
            time_base: config.time_base,
            quality,
            queue: PacketQueue::default(),
        }))
    }
}

struct MjpegEncoder {
    format: PixelFormat,
    size: Size,
    time_base: Rational,
    quality: u8,
    queue: PacketQueue,
}

impl EncoderContext<EncoderVideoFrame> for MjpegEncoder {
    fn send_frame(&mut self, frame: Option<EncoderVideoFrame>) -> Result<(), CodecError> {
        let Some(frame) = frame else {
            return self.queue.start_draining();
        };
        self.queue.check_accepting()?;

        let data = frame_memory(&frame, self.format, self.size)?;
        let color = match self.format {
            PixelFormat::Gray8 => ColorType::L8,
            _ => ColorType::Rgb8,
        };

        let mut jpeg = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, self.quality);
            encoder
                .encode(data, self.size.width, self.size.height, color.into())
                .map_err(|e| CodecError::Backend(format!("JPEG encoding failed: {}", e)))?;
        }

        self.queue
            .push(CompressedPacket::new(jpeg, frame.pts, self.time_base));
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<CompressedPacket, CodecError> {
        self.queue.receive()
    }
}

fn check_sw_config(descriptor: &VideoCodecDescriptor, config: &VideoEncoderConfig) -> Result<(), CodecError> {
    if config.hw_accel.is_some() || !descriptor.supports_format(config.pixel_format) {
        return Err(CodecError::Unsupported(format!(
            "{} cannot take {} frames",
            descriptor.name, config.pixel_format
        )));
    }
    if config.size.is_empty() || !descriptor.supports_size(config.size) {
        return Err(CodecError::Unsupported(format!(
            "{} cannot encode {} frames",
            descriptor.name, config.size
        )));
    }
    Ok(())
}

/// Plane data of a software frame matching the encoder's configuration
fn frame_memory(frame: &EncoderVideoFrame, format: PixelFormat, size: Size) -> Result<&[u8], CodecError> {
    let FrameBuffer::Memory(data) = &frame.frame.buffer else {
        return Err(CodecError::InvalidInput("hardware frame sent to a software encoder".into()));
    };
    if frame.frame.format != format || frame.frame.size != size {
        return Err(CodecError::InvalidInput(format!(
            "frame is {} {}, encoder expects {} {}",
            frame.frame.format, frame.frame.size, format, size
        )));
    }
    let expected = format.frame_size(size).unwrap_or(0);
    if data.len() < expected {
        return Err(CodecError::InvalidInput(format!(
            "frame has {} bytes, expected {}",
            data.len(),
            expected
        )));
    }
    Ok(&data[..expected])
}

/// Channel layouts the PCM track header can describe
fn pcm_channel_layouts() -> Vec<ChannelLayout> {
    vec![
        ChannelLayout::MONO,
        ChannelLayout::STEREO,
        ChannelLayout::SURROUND,
        ChannelLayout::QUAD,
        ChannelLayout::SURROUND_5_1,
    ]
}
