//! GStreamer-backed encoders
//!
//! Each opened encoder runs a small pipeline:
//!
//! ```text
//! appsrc -> videoconvert/audioconvert -> <encoder element> -> appsink
//! ```
//!
//! Frames are pushed into the appsrc and packets are pulled from the appsink
//! without blocking, which maps directly onto the send/receive model. While
//! draining, pulls wait for the pipeline to reach EOS.
//!
//! Hardware encoders take the hardware pixel format of their device. The
//! GStreamer element uploads by itself, so surfaces are handed over as
//! system memory buffers that keep the surface alive until GStreamer is done.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_audio as gst_audio;
use gstreamer_video as gst_video;

use crate::media::{
    ChannelLayout, CompressedPacket, FrameBuffer, HwDeviceType, HwSurface, PixelFormat, Rational,
    SampleFormat, Size,
};

use super::codec::{
    AudioCodecDescriptor, AudioEncoderConfig, AudioEncoderContext, AudioEncoderFactory, CodecError,
    CodecRegistry, EncoderAudioFrame, EncoderContext, EncoderVideoFrame, VideoCodecDescriptor,
    VideoEncoderConfig, VideoEncoderContext, VideoEncoderFactory,
};
use super::presets::EncoderOptions;
use super::{AudioCodec, VideoCodec};

const NANOS: Rational = Rational::new(1, 1_000_000_000);

/// How long a draining pull waits for the encoder to flush
const DRAIN_TIMEOUT_SECS: u64 = 5;

struct VideoElement {
    element: &'static str,
    codec: VideoCodec,
    device: Option<HwDeviceType>,
    formats: &'static [PixelFormat],
}

const YUV420: &[PixelFormat] = &[PixelFormat::Nv12, PixelFormat::Yuv420p];
const YUV420_10BIT: &[PixelFormat] = &[PixelFormat::Nv12, PixelFormat::Yuv420p, PixelFormat::P010le];

/// Encoder elements worth probing, hardware first
const VIDEO_ELEMENTS: &[VideoElement] = &[
    VideoElement { element: "nvh264enc", codec: VideoCodec::H264, device: Some(HwDeviceType::Cuda), formats: YUV420 },
    VideoElement { element: "nvh265enc", codec: VideoCodec::H265, device: Some(HwDeviceType::Cuda), formats: YUV420_10BIT },
    VideoElement { element: "nvav1enc", codec: VideoCodec::Av1, device: Some(HwDeviceType::Cuda), formats: YUV420_10BIT },
    VideoElement { element: "vah264enc", codec: VideoCodec::H264, device: Some(HwDeviceType::Vaapi), formats: YUV420 },
    VideoElement { element: "vah265enc", codec: VideoCodec::H265, device: Some(HwDeviceType::Vaapi), formats: YUV420_10BIT },
    VideoElement { element: "vavp9enc", codec: VideoCodec::Vp9, device: Some(HwDeviceType::Vaapi), formats: YUV420 },
    VideoElement { element: "vaav1enc", codec: VideoCodec::Av1, device: Some(HwDeviceType::Vaapi), formats: YUV420_10BIT },
    VideoElement { element: "vajpegenc", codec: VideoCodec::Mjpeg, device: Some(HwDeviceType::Vaapi), formats: YUV420 },
    VideoElement { element: "qsvh264enc", codec: VideoCodec::H264, device: Some(HwDeviceType::Qsv), formats: YUV420 },
    VideoElement { element: "qsvh265enc", codec: VideoCodec::H265, device: Some(HwDeviceType::Qsv), formats: YUV420_10BIT },
    VideoElement { element: "qsvvp9enc", codec: VideoCodec::Vp9, device: Some(HwDeviceType::Qsv), formats: YUV420 },
    VideoElement { element: "qsvav1enc", codec: VideoCodec::Av1, device: Some(HwDeviceType::Qsv), formats: YUV420_10BIT },
    VideoElement { element: "amfh264enc", codec: VideoCodec::H264, device: Some(HwDeviceType::D3d11), formats: YUV420 },
    VideoElement { element: "amfh265enc", codec: VideoCodec::H265, device: Some(HwDeviceType::D3d11), formats: YUV420_10BIT },
    VideoElement { element: "amfav1enc", codec: VideoCodec::Av1, device: Some(HwDeviceType::D3d11), formats: YUV420_10BIT },
    VideoElement { element: "mfh264enc", codec: VideoCodec::H264, device: Some(HwDeviceType::D3d11), formats: YUV420 },
    VideoElement { element: "mfh265enc", codec: VideoCodec::H265, device: Some(HwDeviceType::D3d11), formats: YUV420 },
    VideoElement { element: "vtenc_h264", codec: VideoCodec::H264, device: Some(HwDeviceType::VideoToolbox), formats: YUV420 },
    VideoElement { element: "vtenc_h265", codec: VideoCodec::H265, device: Some(HwDeviceType::VideoToolbox), formats: YUV420_10BIT },
    VideoElement {
        element: "x264enc",
        codec: VideoCodec::H264,
        device: None,
        formats: &[PixelFormat::Yuv420p, PixelFormat::Nv12, PixelFormat::Yuv422p, PixelFormat::Yuv444p, PixelFormat::Yuv420p10le],
    },
    VideoElement {
        element: "openh264enc",
        codec: VideoCodec::H264,
        device: None,
        formats: &[PixelFormat::Yuv420p],
    },
    VideoElement {
        element: "x265enc",
        codec: VideoCodec::H265,
        device: None,
        formats: &[PixelFormat::Yuv420p, PixelFormat::Yuv444p, PixelFormat::Yuv420p10le],
    },
    VideoElement { element: "vp8enc", codec: VideoCodec::Vp8, device: None, formats: &[PixelFormat::Yuv420p] },
    VideoElement {
        element: "vp9enc",
        codec: VideoCodec::Vp9,
        device: None,
        formats: &[PixelFormat::Yuv420p, PixelFormat::Yuv444p, PixelFormat::Yuv420p10le],
    },
    VideoElement {
        element: "av1enc",
        codec: VideoCodec::Av1,
        device: None,
        formats: &[PixelFormat::Yuv420p, PixelFormat::Yuv444p, PixelFormat::Yuv420p10le],
    },
    VideoElement {
        element: "jpegenc",
        codec: VideoCodec::Mjpeg,
        device: None,
        formats: &[PixelFormat::Yuv420p, PixelFormat::Yuv422p, PixelFormat::Yuv444p, PixelFormat::Rgb24, PixelFormat::Gray8],
    },
];

struct AudioElement {
    element: &'static str,
    codec: AudioCodec,
    formats: &'static [SampleFormat],
    rates: &'static [u32],
    stereo_only: bool,
}

const AUDIO_ELEMENTS: &[AudioElement] = &[
    AudioElement {
        element: "opusenc",
        codec: AudioCodec::Opus,
        formats: &[SampleFormat::S16, SampleFormat::F32],
        rates: &[48_000, 24_000, 16_000, 12_000, 8_000],
        stereo_only: true,
    },
    AudioElement {
        element: "fdkaacenc",
        codec: AudioCodec::Aac,
        formats: &[SampleFormat::S16],
        rates: &[96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000],
        stereo_only: false,
    },
    AudioElement {
        element: "voaacenc",
        codec: AudioCodec::Aac,
        formats: &[SampleFormat::S16],
        rates: &[96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000],
        stereo_only: true,
    },
    AudioElement {
        element: "lamemp3enc",
        codec: AudioCodec::Mp3,
        formats: &[SampleFormat::S16, SampleFormat::F32],
        rates: &[48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000],
        stereo_only: true,
    },
];

/// Registers every known encoder element the GStreamer installation has,
/// and the hardware devices their presence implies.
pub fn register_available(registry: &mut CodecRegistry) {
    crate::gstreamer_init::init_gstreamer_env();
    if !crate::gstreamer_init::is_gstreamer_available() {
        log::warn!("[GstEncoder] GStreamer unavailable, only built-in encoders will be used");
        return;
    }

    for candidate in VIDEO_ELEMENTS {
        if gst::ElementFactory::find(candidate.element).is_none() {
            continue;
        }
        let mut formats = Vec::with_capacity(candidate.formats.len() + 1);
        if let Some(device) = candidate.device {
            formats.push(device.pixel_format());
            registry.add_hw_device(device);
        }
        formats.extend_from_slice(candidate.formats);

        let mut descriptor = VideoCodecDescriptor::new(candidate.element, candidate.codec, formats)
            .with_size_limits(Some(Size::new(16, 16)), Some(Size::new(8192, 8192)));
        if candidate.codec != VideoCodec::Mjpeg {
            descriptor = descriptor.with_even_dimensions();
        }
        registry.register_video(GstVideoEncoderFactory { descriptor });
    }

    for candidate in AUDIO_ELEMENTS {
        if gst::ElementFactory::find(candidate.element).is_none() {
            continue;
        }
        let layouts = if candidate.stereo_only {
            vec![ChannelLayout::MONO, ChannelLayout::STEREO]
        } else {
            vec![
                ChannelLayout::MONO,
                ChannelLayout::STEREO,
                ChannelLayout::SURROUND,
                ChannelLayout::QUAD,
                ChannelLayout::SURROUND_5_1,
            ]
        };
        let descriptor = AudioCodecDescriptor::new(candidate.element, candidate.codec, candidate.formats.to_vec())
            .with_sample_rates(candidate.rates.to_vec())
            .with_channel_layouts(layouts);
        registry.register_audio(GstAudioEncoderFactory { descriptor });
    }
}


pub(crate) fn gst_video_format(format: PixelFormat) -> Option<&'static str> {
    Some(match format {
        PixelFormat::Yuv420p => "I420",
        PixelFormat::Yuv422p => "Y42B",
        PixelFormat::Yuv444p => "Y444",
        PixelFormat::Nv12 => "NV12",
        PixelFormat::Yuyv422 => "YUY2",
        PixelFormat::Uyvy422 => "UYVY",
        PixelFormat::Gray8 => "GRAY8",
        PixelFormat::Rgb24 => "RGB",
        PixelFormat::Bgr24 => "BGR",
        PixelFormat::Rgba => "RGBA",
        PixelFormat::Bgra => "BGRA",
        PixelFormat::Argb => "ARGB",
        PixelFormat::Yuv420p10le => "I420_10LE",
        PixelFormat::Yuv420p10be => "I420_10BE",
        PixelFormat::P010le => "P010_10LE",
        _ => return None,
    })
}

pub(crate) fn gst_audio_format(format: SampleFormat) -> Option<&'static str> {
    Some(match format {
        SampleFormat::U8 => "U8",
        SampleFormat::S16 => "S16LE",
        SampleFormat::S32 => "S32LE",
        SampleFormat::F32 => "F32LE",
        SampleFormat::F64 => "F64LE",
        _ => return None,
    })
}

fn backend<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> CodecError + '_ {
    move |e| CodecError::Backend(format!("{}: {}", context, e))
}

/// Sets every option the element knows; unknown properties and unparsable
/// values are skipped.
fn apply_options(element: &gst::Element, options: &EncoderOptions) {
    for (key, value) in options.properties() {
        let Some(pspec) = element.find_property(key) else {
            log::debug!("[GstEncoder] {} has no property {}", element.name(), key);
            continue;
        };
        match gst::glib::Value::deserialize(value, pspec.value_type()) {
            Ok(v) => element.set_property(key, v),
            Err(_) => {
                log::warn!(
                    "[GstEncoder] Cannot set {}={} on {}",
                    key,
                    value,
                    element.name()
                );
            }
        }
    }
}

fn build_pipeline(
    caps: &gst::Caps,
    convert: &str,
    encoder_name: &str,
    options: &EncoderOptions,
) -> Result<(gst::Pipeline, gst_app::AppSrc, gst_app::AppSink), CodecError> {
    let pipeline = gst::Pipeline::new();

    let appsrc = gst_app::AppSrc::builder()
        .name("src")
        .caps(caps)
        .format(gst::Format::Time)
        .is_live(false)
        .stream_type(gst_app::AppStreamType::Stream)
        .build();

    let converter = gst::ElementFactory::make(convert)
        .build()
        .map_err(backend(&format!("Failed to create {}", convert)))?;

    let encoder = gst::ElementFactory::make(encoder_name)
        .build()
        .map_err(|e| CodecError::Unsupported(format!("Failed to create {}: {}", encoder_name, e)))?;
    apply_options(&encoder, options);

    let appsink = gst_app::AppSink::builder()
        .name("enc_sink")
        .sync(false)
        .build();

    pipeline
        .add_many([appsrc.upcast_ref(), &converter, &encoder, appsink.upcast_ref()])
        .map_err(backend("Failed to add elements"))?;
    gst::Element::link_many([appsrc.upcast_ref(), &converter, &encoder, appsink.upcast_ref()])
        .map_err(backend("Failed to link elements"))?;

    pipeline
        .set_state(gst::State::Playing)
        .map_err(backend(&format!("Failed to start {}", encoder_name)))?;

    Ok((pipeline, appsrc, appsink))
}

/// Keeps a hardware surface alive for as long as GStreamer holds the buffer
struct SurfaceBytes(HwSurface);

impl AsRef<[u8]> for SurfaceBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.data()
    }
}

/// Shared appsrc/appsink plumbing of the audio and video encoders
struct GstPipelineEncoder {
    name: String,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    time_base: Rational,
    extradata: Option<Vec<u8>>,
    draining: bool,
    finished: bool,
}

impl GstPipelineEncoder {
    fn push(&mut self, mut buffer: gst::Buffer, pts: i64, duration: i64) -> Result<(), CodecError> {
        if self.draining {
            return Err(CodecError::Eof);
        }
        {
            let Some(buffer_ref) = buffer.get_mut() else {
                return Err(CodecError::Backend("buffer is shared".into()));
            };
            let pts_ns = Rational::rescale(pts, self.time_base, NANOS).max(0) as u64;
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts_ns));
            if duration > 0 {
                let duration_ns = Rational::rescale(duration, self.time_base, NANOS) as u64;
                buffer_ref.set_duration(gst::ClockTime::from_nseconds(duration_ns));
            }
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| CodecError::Backend(format!("Failed to push buffer: {:?}", e)))?;
        Ok(())
    }

    fn drain(&mut self) -> Result<(), CodecError> {
        if self.draining {
            return Err(CodecError::Eof);
        }
        self.draining = true;
        self.appsrc
            .end_of_stream()
            .map_err(|e| CodecError::Backend(format!("Failed to send EOS: {:?}", e)))?;
        Ok(())
    }

    fn receive(&mut self) -> Result<CompressedPacket, CodecError> {
        if self.finished {
            return Err(CodecError::Eof);
        }
        let timeout = if self.draining {
            gst::ClockTime::from_seconds(DRAIN_TIMEOUT_SECS)
        } else {
            gst::ClockTime::ZERO
        };

        loop {
            let Some(sample) = self.appsink.try_pull_sample(timeout) else {
                if !self.draining {
                    return Err(CodecError::Again);
                }
                if !self.appsink.is_eos() {
                    log::warn!("[GstEncoder] {} did not reach EOS while draining", self.name);
                }
                self.finished = true;
                return Err(CodecError::Eof);
            };

            let new_extradata = self.take_caps_extradata(&sample);
            let Some(buffer) = sample.buffer() else {
                continue;
            };
            if buffer.flags().contains(gst::BufferFlags::HEADER) {
                continue;
            }

            let map = buffer
                .map_readable()
                .map_err(|e| CodecError::Backend(format!("Failed to map buffer: {}", e)))?;
            let to_tb = |t: gst::ClockTime| Rational::rescale(t.nseconds() as i64, NANOS, self.time_base);

            let pts = buffer.pts().map(to_tb);
            return Ok(CompressedPacket {
                data: map.as_slice().to_vec(),
                pts,
                dts: buffer.dts().map(to_tb).or(pts),
                duration: buffer.duration().map(to_tb).unwrap_or(0),
                time_base: self.time_base,
                stream_index: 0,
                key_frame: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
                new_extradata,
            });
        }
    }

    /// Codec data from the output caps, returned when it differs from what
    /// was seen before
    fn take_caps_extradata(&mut self, sample: &gst::Sample) -> Option<Vec<u8>> {
        let structure = sample.caps()?.structure(0)?;

        let data = if let Ok(codec_data) = structure.get::<gst::Buffer>("codec_data") {
            codec_data.map_readable().ok()?.as_slice().to_vec()
        } else if let Ok(headers) = structure.get::<gst::Array>("streamheader") {
            let mut data = Vec::new();
            for value in headers.iter() {
                if let Ok(buffer) = value.get::<gst::Buffer>() {
                    if let Ok(map) = buffer.map_readable() {
                        data.extend_from_slice(map.as_slice());
                    }
                }
            }
            data
        } else {
            return None;
        };

        if data.is_empty() || self.extradata.as_deref() == Some(&data[..]) {
            return None;
        }
        self.extradata = Some(data.clone());
        Some(data)
    }
}

impl Drop for GstPipelineEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

// ─── Video ──────────────────────────────────────────────────────────────────

pub struct GstVideoEncoderFactory {
    descriptor: VideoCodecDescriptor,
}

impl VideoEncoderFactory for GstVideoEncoderFactory {
    fn descriptor(&self) -> &VideoCodecDescriptor {
        &self.descriptor
    }

    fn open(&self, config: &VideoEncoderConfig) -> Result<VideoEncoderContext, CodecError> {
        let format_name = gst_video_format(config.sw_format).ok_or_else(|| {
            CodecError::Unsupported(format!("{} has no GStreamer equivalent", config.sw_format))
        })?;

        let info = gst_video::VideoInfo::builder(
            gst_video::VideoFormat::from_string(format_name),
            config.size.width,
            config.size.height,
        )
        .fps(gst::Fraction::new(config.frame_rate.num as i32, config.frame_rate.den as i32))
        .build()
        .map_err(backend("Invalid video info"))?;
        let caps = info.to_caps().map_err(backend("Invalid video caps"))?;

        let (pipeline, appsrc, appsink) =
            build_pipeline(&caps, "videoconvert", &self.descriptor.name, &config.options)?;

        log::info!(
            "[GstEncoder] Opened {} ({} {} @ {})",
            self.descriptor.name,
            config.sw_format,
            config.size,
            config.frame_rate
        );

        Ok(Box::new(GstVideoEncoder {
            inner: GstPipelineEncoder {
                name: self.descriptor.name.clone(),
                pipeline,
                appsrc,
                appsink,
                time_base: config.time_base,
                extradata: None,
                draining: false,
                finished: false,
            },
        }))
    }
}

struct GstVideoEncoder {
    inner: GstPipelineEncoder,
}

impl EncoderContext<EncoderVideoFrame> for GstVideoEncoder {
    fn send_frame(&mut self, frame: Option<EncoderVideoFrame>) -> Result<(), CodecError> {
        let Some(frame) = frame else {
            return self.inner.drain();
        };
        let buffer = match &frame.frame.buffer {
            FrameBuffer::Memory(data) => gst::Buffer::from_slice(data.clone()),
            FrameBuffer::Surface(surface) => gst::Buffer::from_slice(SurfaceBytes(surface.clone())),
        };
        self.inner.push(buffer, frame.pts, 0)
    }

    fn receive_packet(&mut self) -> Result<CompressedPacket, CodecError> {
        self.inner.receive()
    }

    fn extradata(&self) -> Option<Vec<u8>> {
        self.inner.extradata.clone()
    }
}

// ─── Audio ──────────────────────────────────────────────────────────────────

pub struct GstAudioEncoderFactory {
    descriptor: AudioCodecDescriptor,
}

impl AudioEncoderFactory for GstAudioEncoderFactory {
    fn descriptor(&self) -> &AudioCodecDescriptor {
        &self.descriptor
    }

    fn open(&self, config: &AudioEncoderConfig) -> Result<AudioEncoderContext, CodecError> {
        let format_name = gst_audio_format(config.format.sample_format).ok_or_else(|| {
            CodecError::Unsupported(format!("{} has no GStreamer equivalent", config.format.sample_format))
        })?;

        let info = gst_audio::AudioInfo::builder(
            gst_audio::AudioFormat::from_string(format_name),
            config.format.sample_rate,
            config.format.channel_count(),
        )
        .build()
        .map_err(backend("Invalid audio info"))?;
        let caps = info.to_caps().map_err(backend("Invalid audio caps"))?;

        let (pipeline, appsrc, appsink) =
            build_pipeline(&caps, "audioconvert", &self.descriptor.name, &config.options)?;

        log::info!("[GstEncoder] Opened {} ({})", self.descriptor.name, config.format);

        Ok(Box::new(GstAudioEncoder {
            inner: GstPipelineEncoder {
                name: self.descriptor.name.clone(),
                pipeline,
                appsrc,
                appsink,
                time_base: config.time_base,
                extradata: None,
                draining: false,
                finished: false,
            },
        }))
    }
}

struct GstAudioEncoder {
    inner: GstPipelineEncoder,
}

impl EncoderContext<EncoderAudioFrame> for GstAudioEncoder {
    fn send_frame(&mut self, frame: Option<EncoderAudioFrame>) -> Result<(), CodecError> {
        let Some(frame) = frame else {
            return self.inner.drain();
        };
        let duration = frame.samples as i64;
        self.inner
            .push(gst::Buffer::from_mut_slice(frame.data), frame.pts, duration)
    }

    fn receive_packet(&mut self) -> Result<CompressedPacket, CodecError> {
        self.inner.receive()
    }

    fn extradata(&self) -> Option<Vec<u8>> {
        self.inner.extradata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_encodable_software_format_maps_to_gstreamer() {
        for element in VIDEO_ELEMENTS {
            for format in element.formats {
                assert!(gst_video_format(*format).is_some(), "{} lists {}", element.element, format);
            }
        }
        for element in AUDIO_ELEMENTS {
            for format in element.formats {
                assert!(gst_audio_format(*format).is_some(), "{} lists {}", element.element, format);
            }
        }
    }
}
