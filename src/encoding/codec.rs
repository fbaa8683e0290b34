//! Codec abstraction: capability descriptors, the send/receive encoder
//! interface and the registry of available encoders.
//!
//! Encoders follow a send/receive model. A frame is submitted with
//! [`EncoderContext::send_frame`] and packets are collected with
//! [`EncoderContext::receive_packet`] until it answers [`CodecError::Again`].
//! Sending `None` starts draining; once drained, `receive_packet` answers
//! [`CodecError::Eof`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::media::{
    AudioFormat, ChannelLayout, CompressedPacket, HwAccel, HwDeviceType, PixelFormat,
    RawVideoFrame, Rational, SampleFormat, Size,
};

use super::presets::{EncoderFamily, EncoderOptions};
use super::{AudioCodec, VideoCodec};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Output is not available yet (receive) or input cannot be accepted
    /// until packets are retrieved (send)
    #[error("Resource temporarily unavailable")]
    Again,
    #[error("End of stream")]
    Eof,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Encoder backend error: {0}")]
    Backend(String),
}

/// A raw video frame stamped with its presentation time in the encoder's
/// time base
#[derive(Debug, Clone)]
pub struct EncoderVideoFrame {
    pub frame: RawVideoFrame,
    pub pts: i64,
}

/// A block of samples in the encoder's sample format. Planar formats store
/// the planes one after another.
#[derive(Debug, Clone)]
pub struct EncoderAudioFrame {
    pub data: Vec<u8>,
    pub samples: usize,
    pub pts: i64,
}

/// An opened encoder
pub trait EncoderContext<F>: Send {
    /// Submits a frame; `None` signals end of stream
    fn send_frame(&mut self, frame: Option<F>) -> Result<(), CodecError>;

    /// Retrieves the next packet, with pts/dts in the encoder's time base
    fn receive_packet(&mut self) -> Result<CompressedPacket, CodecError>;

    /// Codec private data known right after opening
    fn extradata(&self) -> Option<Vec<u8>> {
        None
    }
}

pub type VideoEncoderContext = Box<dyn EncoderContext<EncoderVideoFrame>>;
pub type AudioEncoderContext = Box<dyn EncoderContext<EncoderAudioFrame>>;

/// What a video encoder accepts
#[derive(Debug, Clone, PartialEq)]
pub struct VideoCodecDescriptor {
    pub name: String,
    pub codec: VideoCodec,
    pub family: EncoderFamily,
    /// Accepted input formats, hardware formats included
    pub pixel_formats: Vec<PixelFormat>,
    /// Supported frame rates; empty means any
    pub frame_rates: Vec<Rational>,
    pub min_size: Option<Size>,
    pub max_size: Option<Size>,
    /// Width and height must be multiples of two
    pub even_dimensions: bool,
}

impl VideoCodecDescriptor {
    pub fn new(name: impl Into<String>, codec: VideoCodec, pixel_formats: Vec<PixelFormat>) -> Self {
        let name = name.into();
        Self {
            family: EncoderFamily::from_encoder_name(&name),
            name,
            codec,
            pixel_formats,
            frame_rates: Vec::new(),
            min_size: None,
            max_size: None,
            even_dimensions: false,
        }
    }

    pub fn with_frame_rates(mut self, frame_rates: Vec<Rational>) -> Self {
        self.frame_rates = frame_rates;
        self
    }

    pub fn with_size_limits(mut self, min_size: Option<Size>, max_size: Option<Size>) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    pub fn with_even_dimensions(mut self) -> Self {
        self.even_dimensions = true;
        self
    }

    /// Hardware formats the encoder accepts directly
    pub fn hw_formats(&self) -> impl Iterator<Item = PixelFormat> + '_ {
        self.pixel_formats.iter().copied().filter(PixelFormat::is_hw)
    }

    pub fn sw_formats(&self) -> impl Iterator<Item = PixelFormat> + '_ {
        self.pixel_formats.iter().copied().filter(|f| !f.is_hw())
    }

    pub fn is_hardware(&self) -> bool {
        self.hw_formats().next().is_some()
    }

    /// Device this encoder needs, if any
    pub fn hw_device(&self) -> Option<HwDeviceType> {
        self.hw_formats().find_map(HwDeviceType::from_pixel_format)
    }

    pub fn supports_format(&self, format: PixelFormat) -> bool {
        self.pixel_formats.contains(&format)
    }

    /// Whether a frame of `size` fits the encoder's size constraints
    pub fn supports_size(&self, size: Size) -> bool {
        let fits_min = self
            .min_size
            .map_or(true, |min| size.width >= min.width && size.height >= min.height);
        let fits_max = self
            .max_size
            .map_or(true, |max| size.width <= max.width && size.height <= max.height);
        fits_min && fits_max
    }
}

/// What an audio encoder accepts
#[derive(Debug, Clone, PartialEq)]
pub struct AudioCodecDescriptor {
    pub name: String,
    pub codec: AudioCodec,
    pub family: EncoderFamily,
    /// Empty lists mean "anything"
    pub sample_formats: Vec<SampleFormat>,
    pub sample_rates: Vec<u32>,
    pub channel_layouts: Vec<ChannelLayout>,
    /// Samples per frame; `None` accepts frames of any size
    pub frame_size: Option<usize>,
}

impl AudioCodecDescriptor {
    pub fn new(name: impl Into<String>, codec: AudioCodec, sample_formats: Vec<SampleFormat>) -> Self {
        let name = name.into();
        Self {
            family: EncoderFamily::from_encoder_name(&name),
            name,
            codec,
            sample_formats,
            sample_rates: Vec::new(),
            channel_layouts: Vec::new(),
            frame_size: None,
        }
    }

    pub fn with_sample_rates(mut self, sample_rates: Vec<u32>) -> Self {
        self.sample_rates = sample_rates;
        self
    }

    pub fn with_channel_layouts(mut self, channel_layouts: Vec<ChannelLayout>) -> Self {
        self.channel_layouts = channel_layouts;
        self
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = Some(frame_size);
        self
    }
}

/// Parameters a video encoder is opened with
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    /// Format of submitted frames (a hardware format when `hw_accel` is set)
    pub pixel_format: PixelFormat,
    /// Content layout of submitted frames
    pub sw_format: PixelFormat,
    pub size: Size,
    pub frame_rate: Rational,
    pub time_base: Rational,
    pub options: EncoderOptions,
    pub hw_accel: Option<HwAccel>,
}

/// Parameters an audio encoder is opened with
#[derive(Debug, Clone)]
pub struct AudioEncoderConfig {
    pub format: AudioFormat,
    pub time_base: Rational,
    pub options: EncoderOptions,
}

pub trait VideoEncoderFactory: Send + Sync {
    fn descriptor(&self) -> &VideoCodecDescriptor;
    fn open(&self, config: &VideoEncoderConfig) -> Result<VideoEncoderContext, CodecError>;
}

pub trait AudioEncoderFactory: Send + Sync {
    fn descriptor(&self) -> &AudioCodecDescriptor;
    fn open(&self, config: &AudioEncoderConfig) -> Result<AudioEncoderContext, CodecError>;
}

/// The encoders (and hardware devices) a recording may use
#[derive(Clone, Default)]
pub struct CodecRegistry {
    video: Vec<Arc<dyn VideoEncoderFactory>>,
    audio: Vec<Arc<dyn AudioEncoderFactory>>,
    hw_devices: Vec<HwDeviceType>,
}

impl CodecRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in software encoders
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        super::software::register_builtin(&mut registry);
        registry
    }

    /// Built-in encoders plus every GStreamer encoder element found on the
    /// system, with the hardware devices those elements imply
    #[cfg(feature = "gstreamer")]
    pub fn with_gstreamer() -> Self {
        let mut registry = Self::with_builtin();
        super::gst_encoder::register_available(&mut registry);
        registry
    }

    pub fn register_video(&mut self, factory: impl VideoEncoderFactory + 'static) {
        log::debug!(
            "[Codecs] Registered video encoder {} ({})",
            factory.descriptor().name,
            factory.descriptor().codec.display_name()
        );
        self.video.push(Arc::new(factory));
    }

    pub fn register_audio(&mut self, factory: impl AudioEncoderFactory + 'static) {
        log::debug!(
            "[Codecs] Registered audio encoder {} ({})",
            factory.descriptor().name,
            factory.descriptor().codec.display_name()
        );
        self.audio.push(Arc::new(factory));
    }

    /// Marks a hardware device as usable by hardware encoders
    pub fn add_hw_device(&mut self, device: HwDeviceType) {
        if !self.hw_devices.contains(&device) {
            self.hw_devices.push(device);
        }
    }

    /// Available devices, most preferred first
    pub fn hw_devices(&self) -> &[HwDeviceType] {
        &self.hw_devices
    }

    /// Encoders for `codec` in registration order
    pub fn video_encoders(&self, codec: VideoCodec) -> impl Iterator<Item = &Arc<dyn VideoEncoderFactory>> {
        self.video
            .iter()
            .filter(move |f| f.descriptor().codec == codec)
    }

    pub fn audio_encoders(&self, codec: AudioCodec) -> impl Iterator<Item = &Arc<dyn AudioEncoderFactory>> {
        self.audio
            .iter()
            .filter(move |f| f.descriptor().codec == codec)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field(
                "video",
                &self.video.iter().map(|v| v.descriptor().name.as_str()).collect::<Vec<_>>(),
            )
            .field(
                "audio",
                &self.audio.iter().map(|a| a.descriptor().name.as_str()).collect::<Vec<_>>(),
            )
            .field("hw_devices", &self.hw_devices)
            .finish()
    }
}
