// Codec identifiers, container formats and the encoder backends
//
// To add a new codec:
// 1. Add variant to VideoCodec / AudioCodec
// 2. Add its Matroska codec id in matroska_id()
// 3. Register at least one encoder factory for it (software.rs or gst_encoder.rs)
// 4. Add an EncoderFamily in presets.rs if the encoder takes tuning options

pub mod codec;
#[cfg(feature = "gstreamer")]
pub mod gst_encoder;
pub mod presets;
pub mod software;

use serde::{Deserialize, Serialize};

pub use codec::{
    AudioCodecDescriptor, AudioEncoderConfig, AudioEncoderFactory, CodecError, CodecRegistry,
    EncoderAudioFrame, EncoderContext, EncoderVideoFrame, VideoCodecDescriptor,
    VideoEncoderConfig, VideoEncoderFactory,
};
pub use presets::{EncoderFamily, EncoderOptions};

/// Supported video codecs for recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// Motion JPEG - each frame is a complete JPEG image
    Mjpeg,
    /// H.264/AVC - widely supported, good compression
    H264,
    /// H.265/HEVC - better compression than H.264
    H265,
    /// AV1 - royalty-free, excellent compression
    Av1,
    /// VP8 - royalty-free, WebM baseline
    Vp8,
    /// VP9 - royalty-free, better compression than VP8
    Vp9,
    /// Uncompressed frames
    RawVideo,
}

impl VideoCodec {
    /// All supported codecs (for iteration)
    pub const ALL: &'static [VideoCodec] = &[
        VideoCodec::Mjpeg,
        VideoCodec::H264,
        VideoCodec::H265,
        VideoCodec::Av1,
        VideoCodec::Vp8,
        VideoCodec::Vp9,
        VideoCodec::RawVideo,
    ];

    /// Matroska CodecID for this codec
    pub fn matroska_id(&self) -> &'static str {
        match self {
            VideoCodec::Mjpeg => "V_MJPEG",
            VideoCodec::H264 => "V_MPEG4/ISO/AVC",
            VideoCodec::H265 => "V_MPEGH/ISO/HEVC",
            VideoCodec::Av1 => "V_AV1",
            VideoCodec::Vp8 => "V_VP8",
            VideoCodec::Vp9 => "V_VP9",
            VideoCodec::RawVideo => "V_UNCOMPRESSED",
        }
    }

    /// Get the GStreamer caps name for this codec
    pub fn gst_caps_name(&self) -> &'static str {
        match self {
            VideoCodec::Mjpeg => "image/jpeg",
            VideoCodec::H264 => "video/x-h264",
            VideoCodec::H265 => "video/x-h265",
            VideoCodec::Av1 => "video/x-av1",
            VideoCodec::Vp8 => "video/x-vp8",
            VideoCodec::Vp9 => "video/x-vp9",
            VideoCodec::RawVideo => "video/x-raw",
        }
    }

    /// Human-readable display name
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::Mjpeg => "MJPEG",
            VideoCodec::H264 => "H.264",
            VideoCodec::H265 => "H.265",
            VideoCodec::Av1 => "AV1",
            VideoCodec::Vp8 => "VP8",
            VideoCodec::Vp9 => "VP9",
            VideoCodec::RawVideo => "Raw",
        }
    }

    /// Codecs that reorder frames emit packets whose dts lags their pts
    pub fn has_b_frames(&self) -> bool {
        matches!(self, VideoCodec::H264 | VideoCodec::H265)
    }
}

/// Supported audio codecs for recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    /// 16-bit little endian PCM
    #[default]
    PcmS16le,
    /// 32-bit float PCM
    PcmF32le,
    Opus,
    Aac,
    Mp3,
}

impl AudioCodec {
    pub const ALL: &'static [AudioCodec] = &[
        AudioCodec::PcmS16le,
        AudioCodec::PcmF32le,
        AudioCodec::Opus,
        AudioCodec::Aac,
        AudioCodec::Mp3,
    ];

    pub fn matroska_id(&self) -> &'static str {
        match self {
            AudioCodec::PcmS16le => "A_PCM/INT/LIT",
            AudioCodec::PcmF32le => "A_PCM/FLOAT/IEEE",
            AudioCodec::Opus => "A_OPUS",
            AudioCodec::Aac => "A_AAC",
            AudioCodec::Mp3 => "A_MPEG/L3",
        }
    }

    pub fn gst_caps_name(&self) -> &'static str {
        match self {
            AudioCodec::PcmS16le | AudioCodec::PcmF32le => "audio/x-raw",
            AudioCodec::Opus => "audio/x-opus",
            AudioCodec::Aac => "audio/mpeg",
            AudioCodec::Mp3 => "audio/mpeg",
        }
    }

    /// Bits per sample for PCM codecs (written into the track header)
    pub fn pcm_bit_depth(&self) -> Option<u32> {
        match self {
            AudioCodec::PcmS16le => Some(16),
            AudioCodec::PcmF32le => Some(32),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AudioCodec::PcmS16le => "PCM 16-bit",
            AudioCodec::PcmF32le => "PCM float",
            AudioCodec::Opus => "Opus",
            AudioCodec::Aac => "AAC",
            AudioCodec::Mp3 => "MP3",
        }
    }
}

/// Supported container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// Matroska (.mkv) - flexible, supports any codec
    #[default]
    Mkv,
    /// WebM (.webm) - Matroska subset for VP8/VP9/AV1 with Opus
    WebM,
}

impl ContainerFormat {
    /// Get the file extension for this container
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::WebM => "webm",
        }
    }

    /// EBML DocType written into the file header
    pub fn doc_type(&self) -> &'static str {
        match self {
            ContainerFormat::Mkv => "matroska",
            ContainerFormat::WebM => "webm",
        }
    }

    /// GStreamer muxer element for this container
    pub fn gst_muxer(&self) -> &'static str {
        match self {
            ContainerFormat::Mkv => "matroskamux",
            ContainerFormat::WebM => "webmmux",
        }
    }

    pub fn supports_video(&self, codec: VideoCodec) -> bool {
        match self {
            ContainerFormat::Mkv => true,
            ContainerFormat::WebM => {
                matches!(codec, VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::Av1)
            }
        }
    }

    pub fn supports_audio(&self, codec: AudioCodec) -> bool {
        match self {
            ContainerFormat::Mkv => true,
            ContainerFormat::WebM => matches!(codec, AudioCodec::Opus),
        }
    }
}

/// Detect container from file extension
pub fn container_from_extension(ext: &str) -> Option<ContainerFormat> {
    match ext.to_lowercase().as_str() {
        "mkv" | "mka" => Some(ContainerFormat::Mkv),
        "webm" => Some(ContainerFormat::WebM),
        _ => None,
    }
}
