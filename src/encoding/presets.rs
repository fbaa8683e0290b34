//! Per-encoder option families
//!
//! There is no common way to express rate control across encoders, so every
//! encoder family maps the recording [`EncoderSettings`] onto its own knobs.
//! Property names are the GStreamer element property names of the encoder
//! (the built-in encoders read the same names).
//!
//! For constant quality the tables aim at roughly these bit rates for
//! 1080p at 30 fps (in Mbit/s):
//!
//! | Codec | VeryLow | Low | Normal | High | VeryHigh |
//! |-------|---------|-----|--------|------|----------|
//! | H.264 | 0.8     | 1.5 | 3.5    | 6    | 10       |
//! | H.265 | 0.5     | 1.0 | 2.5    | 4    | 7        |
//!
//! ## Adding options for a new encoder
//!
//! 1. Add a variant to [`EncoderFamily`] and map its element name(s) in
//!    [`EncoderFamily::from_encoder_name()`].
//! 2. Add an `apply_<family>()` function following the existing ones (match
//!    on the encoding mode, index the quality tables by [`Quality::index()`]).
//! 3. Dispatch to it from [`EncoderFamily::apply_video()`] or
//!    [`EncoderFamily::apply_audio()`].

use std::str::FromStr;

use crate::config::{EncoderSettings, EncodingMode, Quality};
use crate::media::Size;

use super::VideoCodec;

/// Options an encoder is opened with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderOptions {
    /// Target bit rate in bits per second, for bit rate driven modes
    pub bit_rate: Option<u64>,
    properties: Vec<(String, String)>,
}

impl EncoderOptions {
    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.properties.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.properties.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Properties in the order they were set
    pub fn properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Encoder implementations that share an option vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderFamily {
    X264,
    X265,
    Libvpx,
    Aom,
    OpenH264,
    Nvenc,
    Vaapi,
    Qsv,
    Amf,
    VideoToolbox,
    MediaFoundation,
    Jpeg,
    Raw,
    Pcm,
    Opus,
    Aac,
    Mp3,
    /// Unknown encoder, opened with its defaults
    Generic,
}

impl EncoderFamily {
    /// Family of a GStreamer encoder element (or built-in encoder name)
    pub fn from_encoder_name(name: &str) -> EncoderFamily {
        match name {
            "x264enc" => EncoderFamily::X264,
            "x265enc" => EncoderFamily::X265,
            "vp8enc" | "vp9enc" => EncoderFamily::Libvpx,
            "av1enc" => EncoderFamily::Aom,
            "openh264enc" => EncoderFamily::OpenH264,
            "jpegenc" | "mjpeg" => EncoderFamily::Jpeg,
            "rawvideo" => EncoderFamily::Raw,
            "opusenc" => EncoderFamily::Opus,
            "fdkaacenc" | "avenc_aac" | "voaacenc" => EncoderFamily::Aac,
            "lamemp3enc" => EncoderFamily::Mp3,
            n if n.starts_with("pcm_") => EncoderFamily::Pcm,
            n if n.starts_with("nv") => EncoderFamily::Nvenc,
            n if n.starts_with("va") => EncoderFamily::Vaapi,
            n if n.starts_with("qsv") => EncoderFamily::Qsv,
            n if n.starts_with("amf") => EncoderFamily::Amf,
            n if n.starts_with("vtenc") => EncoderFamily::VideoToolbox,
            n if n.starts_with("mf") => EncoderFamily::MediaFoundation,
            _ => EncoderFamily::Generic,
        }
    }

    /// Options for a video encoder of this family.
    ///
    /// `size` and `frame_rate` are the negotiated output values, used by the
    /// bit rate heuristic when the settings leave the bit rate open.
    pub fn apply_video(
        &self,
        settings: &EncoderSettings,
        codec: VideoCodec,
        size: Size,
        frame_rate: f64,
    ) -> EncoderOptions {
        let mut opts = EncoderOptions::default();
        let quality = settings.quality;
        let bit_rate = settings
            .video_bit_rate
            .unwrap_or_else(|| bitrate_for_settings(codec, quality, size, frame_rate));

        match self {
            EncoderFamily::X264 => apply_x264(&mut opts, settings.encoding_mode, quality, bit_rate),
            EncoderFamily::X265 => apply_x265(&mut opts, settings.encoding_mode, quality, bit_rate),
            EncoderFamily::Libvpx => apply_libvpx(&mut opts, settings.encoding_mode, quality, bit_rate),
            EncoderFamily::Aom => apply_aom(&mut opts, settings.encoding_mode, quality, bit_rate),
            EncoderFamily::OpenH264 => {
                apply_openh264(&mut opts, settings.encoding_mode, quality, bit_rate)
            }
            EncoderFamily::Nvenc => apply_nvenc(&mut opts, settings.encoding_mode, quality, bit_rate),
            EncoderFamily::Vaapi => {
                apply_vaapi(&mut opts, codec, settings.encoding_mode, quality, bit_rate)
            }
            EncoderFamily::Qsv | EncoderFamily::Amf => {
                apply_qp_rate_control(&mut opts, codec, settings.encoding_mode, quality, bit_rate)
            }
            EncoderFamily::VideoToolbox => {
                apply_videotoolbox(&mut opts, settings.encoding_mode, quality, bit_rate)
            }
            EncoderFamily::MediaFoundation => {
                apply_mf(&mut opts, settings.encoding_mode, quality, bit_rate)
            }
            EncoderFamily::Jpeg => apply_jpeg(&mut opts, quality),
            EncoderFamily::Raw | EncoderFamily::Generic => {}
            audio => {
                log::warn!("[Preset] {:?} is an audio encoder family, using defaults", audio);
            }
        }

        opts
    }

    /// Options for an audio encoder of this family
    pub fn apply_audio(&self, settings: &EncoderSettings) -> EncoderOptions {
        let mut opts = EncoderOptions::default();
        let mode = settings.encoding_mode;
        if mode.uses_bit_rate() {
            opts.bit_rate = settings.audio_bit_rate;
        }

        match self {
            EncoderFamily::Opus => {
                if let Some(bit_rate) = opts.bit_rate {
                    opts.set("bitrate", bit_rate);
                }
                let bitrate_type = match mode {
                    EncodingMode::ConstantBitRate => "cbr",
                    EncodingMode::ConstantQuality => "vbr",
                    _ => "constrained-vbr",
                };
                opts.set("bitrate-type", bitrate_type);
            }
            EncoderFamily::Aac => {
                if let Some(bit_rate) = opts.bit_rate {
                    opts.set("bitrate", bit_rate);
                }
            }
            EncoderFamily::Mp3 => match opts.bit_rate {
                Some(bit_rate) => {
                    opts.set("target", "bitrate");
                    opts.set("bitrate", bit_rate / 1000);
                    opts.set("cbr", mode == EncodingMode::ConstantBitRate);
                }
                None => {
                    const QUALITY: [&str; 5] = ["8", "6", "4", "2", "0"];
                    opts.set("target", "quality");
                    opts.set("quality", QUALITY[settings.quality.index()]);
                }
            },
            _ => {}
        }

        opts
    }

    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            EncoderFamily::Nvenc
                | EncoderFamily::Vaapi
                | EncoderFamily::Qsv
                | EncoderFamily::Amf
                | EncoderFamily::VideoToolbox
                | EncoderFamily::MediaFoundation
        )
    }
}

/// Bit rate heuristic from codec, resolution, frame rate and quality.
///
/// The table is for 30 fps. Doubling the frame rate is assumed to need 1.5
/// times the data, except for MJPEG which scales linearly.
pub fn bitrate_for_settings(codec: VideoCodec, quality: Quality, size: Size, frame_rate: f64) -> u64 {
    let bits_per_pixel: [f64; 5] = match codec {
        VideoCodec::H264 | VideoCodec::Vp8 => [0.4, 0.75, 1.75, 3.0, 5.0],
        VideoCodec::H265 | VideoCodec::Vp9 => [0.3, 0.5, 1.2, 2.0, 3.0],
        VideoCodec::Av1 => [0.2, 0.4, 0.9, 1.5, 2.5],
        VideoCodec::Mjpeg => [16.0, 24.0, 32.0, 40.0, 48.0],
        VideoCodec::RawVideo => [12.0; 5],
    };

    let frame_rate = if frame_rate > 0.0 { frame_rate } else { 30.0 };
    let mut bit_rate = bits_per_pixel[quality.index()] * size.area() as f64;

    if matches!(codec, VideoCodec::Mjpeg | VideoCodec::RawVideo) {
        bit_rate *= frame_rate / 30.0;
    } else {
        bit_rate *= 1.5f64.powf((frame_rate / 30.0).log2());
    }

    bit_rate.max(0.0) as u64
}

fn kbps(bit_rate: u64) -> u64 {
    (bit_rate / 1000).max(1)
}

/// x264 (x264enc)
///
/// Properties used:
/// - `pass`: `qual` (CRF) or `cbr`
/// - `quantizer`: CRF value
/// - `bitrate`: kbit/s
fn apply_x264(opts: &mut EncoderOptions, mode: EncodingMode, quality: Quality, bit_rate: u64) {
    const CRF: [u32; 5] = [29, 26, 23, 21, 19];

    opts.set("speed-preset", "veryfast");
    opts.set("tune", "zerolatency");
    if mode.uses_bit_rate() {
        opts.bit_rate = Some(bit_rate);
        opts.set("pass", "cbr");
        opts.set("bitrate", kbps(bit_rate));
    } else {
        opts.set("pass", "qual");
        opts.set("quantizer", CRF[quality.index()]);
    }
}

/// x265 (x265enc), CRF goes through the raw option string
fn apply_x265(opts: &mut EncoderOptions, mode: EncodingMode, quality: Quality, bit_rate: u64) {
    const CRF: [u32; 5] = [40, 34, 28, 26, 24];

    opts.set("speed-preset", "veryfast");
    if mode.uses_bit_rate() {
        opts.bit_rate = Some(bit_rate);
        opts.set("bitrate", kbps(bit_rate));
    } else {
        opts.set("option-string", format!("crf={}", CRF[quality.index()]));
    }
}

/// libvpx (vp8enc / vp9enc)
///
/// Properties used:
/// - `end-usage`: `q` for constant quality, `cbr`/`vbr` otherwise
/// - `cq-level`: quality level
/// - `target-bitrate`: bit/s
/// - `row-mt`: row based multithreading (vp9enc only, ignored elsewhere)
fn apply_libvpx(opts: &mut EncoderOptions, mode: EncodingMode, quality: Quality, bit_rate: u64) {
    const CQ_LEVEL: [u32; 5] = [38, 34, 31, 28, 25];

    opts.set("deadline", 1);
    opts.set("row-mt", true);
    match mode {
        EncodingMode::ConstantQuality => {
            opts.set("end-usage", "q");
            opts.set("cq-level", CQ_LEVEL[quality.index()]);
            opts.set("target-bitrate", 0);
        }
        EncodingMode::ConstantBitRate => {
            opts.bit_rate = Some(bit_rate);
            opts.set("end-usage", "cbr");
            opts.set("target-bitrate", bit_rate);
        }
        EncodingMode::AverageBitRate | EncodingMode::TwoPass => {
            opts.bit_rate = Some(bit_rate);
            opts.set("end-usage", "vbr");
            opts.set("target-bitrate", bit_rate);
        }
    }
}

/// libaom (av1enc), real-time usage profile
fn apply_aom(opts: &mut EncoderOptions, mode: EncodingMode, quality: Quality, bit_rate: u64) {
    const CQ_LEVEL: [u32; 5] = [38, 34, 31, 28, 25];

    opts.set("usage-profile", "realtime");
    opts.set("cpu-used", 8);
    if mode.uses_bit_rate() {
        opts.bit_rate = Some(bit_rate);
        opts.set(
            "end-usage",
            if mode == EncodingMode::ConstantBitRate { "cbr" } else { "vbr" },
        );
        opts.set("target-bitrate", kbps(bit_rate));
    } else {
        opts.set("end-usage", "q");
        opts.set("cq-level", CQ_LEVEL[quality.index()]);
    }
}

/// OpenH264 (openh264enc): quality mode pins min and max QP together
fn apply_openh264(opts: &mut EncoderOptions, mode: EncodingMode, quality: Quality, bit_rate: u64) {
    const QP: [u32; 5] = [51, 48, 38, 25, 5];

    if mode.uses_bit_rate() {
        opts.bit_rate = Some(bit_rate);
        opts.set("rate-control", "bitrate");
        opts.set("bitrate", bit_rate);
    } else {
        let qp = QP[quality.index()];
        opts.set("rate-control", "quality");
        opts.set("qp-min", qp);
        opts.set("qp-max", qp);
    }
}

/// NVIDIA NVENC (nvh264enc, nvh265enc, nvav1enc)
///
/// Properties used:
/// - `rc-mode`: `cbr`, `vbr`
/// - `const-quality`: target quality for constant quality in VBR mode
/// - `bitrate`: kbit/s
fn apply_nvenc(opts: &mut EncoderOptions, mode: EncodingMode, quality: Quality, bit_rate: u64) {
    const CQ: [u32; 5] = [51, 48, 35, 15, 1];

    match mode {
        EncodingMode::ConstantQuality => {
            opts.set("rc-mode", "vbr");
            opts.set("const-quality", CQ[quality.index()]);
        }
        EncodingMode::ConstantBitRate => {
            opts.bit_rate = Some(bit_rate);
            opts.set("rc-mode", "cbr");
            opts.set("bitrate", kbps(bit_rate));
            opts.set("max-bitrate", kbps(bit_rate));
        }
        EncodingMode::AverageBitRate | EncodingMode::TwoPass => {
            opts.bit_rate = Some(bit_rate);
            opts.set("rc-mode", "vbr");
            opts.set("bitrate", kbps(bit_rate));
        }
    }
}

/// VA-API (vah264enc, vah265enc, vavp8enc, vavp9enc, vajpegenc).
///
/// Every VA codec uses its own quality scale.
fn apply_vaapi(
    opts: &mut EncoderOptions,
    codec: VideoCodec,
    mode: EncodingMode,
    quality: Quality,
    bit_rate: u64,
) {
    match mode {
        EncodingMode::ConstantBitRate => {
            opts.bit_rate = Some(bit_rate);
            opts.set("rate-control", "cbr");
            opts.set("bitrate", kbps(bit_rate));
            opts.set("target-percentage", 100);
        }
        EncodingMode::AverageBitRate | EncodingMode::TwoPass => {
            opts.bit_rate = Some(bit_rate);
            opts.set("rate-control", "vbr");
            opts.set("bitrate", kbps(bit_rate));
        }
        EncodingMode::ConstantQuality => {
            let table: Option<[u32; 5]> = match codec {
                VideoCodec::H264 => Some([29, 26, 23, 21, 19]),
                VideoCodec::H265 => Some([40, 34, 28, 26, 24]),
                VideoCodec::Vp8 => Some([56, 48, 40, 34, 28]),
                VideoCodec::Vp9 => Some([124, 112, 100, 88, 76]),
                VideoCodec::Mjpeg => Some([40, 60, 80, 90, 95]),
                VideoCodec::Av1 | VideoCodec::RawVideo => None,
            };
            let Some(table) = table else {
                return;
            };
            let q = table[quality.index()];
            if codec == VideoCodec::Mjpeg {
                opts.set("quality", q);
            } else {
                opts.set("rate-control", "cqp");
                opts.set("qpi", q);
                opts.set("qpp", q);
                opts.set("qpb", q);
            }
        }
    }
}

/// Intel QSV (qsvh264enc, ...) and AMD AMF (amfh264enc, ...) both expose
/// constant QP rate control with per frame type quantizers.
fn apply_qp_rate_control(
    opts: &mut EncoderOptions,
    codec: VideoCodec,
    mode: EncodingMode,
    quality: Quality,
    bit_rate: u64,
) {
    match mode {
        EncodingMode::ConstantQuality => {
            let table: [u32; 5] = match codec {
                VideoCodec::H265 => [40, 34, 28, 26, 24],
                VideoCodec::Av1 => [200, 160, 120, 90, 60],
                _ => [29, 26, 23, 21, 19],
            };
            let q = table[quality.index()];
            opts.set("rate-control", "cqp");
            opts.set("qp-i", q);
            opts.set("qp-p", q);
        }
        EncodingMode::ConstantBitRate => {
            opts.bit_rate = Some(bit_rate);
            opts.set("rate-control", "cbr");
            opts.set("bitrate", kbps(bit_rate));
        }
        EncodingMode::AverageBitRate | EncodingMode::TwoPass => {
            opts.bit_rate = Some(bit_rate);
            opts.set("rate-control", "vbr");
            opts.set("bitrate", kbps(bit_rate));
        }
    }
}

/// Apple VideoToolbox (vtenc_h264, vtenc_h265).
///
/// Quality is a 0..1 scale; the values approximately match the bit rate
/// table in the module docs.
fn apply_videotoolbox(opts: &mut EncoderOptions, mode: EncodingMode, quality: Quality, bit_rate: u64) {
    const QUALITY: [f64; 5] = [0.25, 0.41, 0.5, 0.58, 0.65];

    opts.set("realtime", true);
    opts.set("allow-frame-reordering", false);
    if mode.uses_bit_rate() || !cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        opts.bit_rate = Some(bit_rate);
        opts.set("bitrate", kbps(bit_rate));
    } else {
        opts.set("quality", QUALITY[quality.index()]);
    }
}

/// Media Foundation (mfh264enc, mfh265enc)
fn apply_mf(opts: &mut EncoderOptions, mode: EncodingMode, quality: Quality, bit_rate: u64) {
    const QUALITY: [u32; 5] = [25, 50, 75, 90, 100];

    if mode.uses_bit_rate() {
        opts.bit_rate = Some(bit_rate);
        opts.set("rc-mode", "cbr");
        opts.set("bitrate", kbps(bit_rate));
    } else {
        opts.set("rc-mode", "quality");
        opts.set("quality-vs-speed", QUALITY[quality.index()]);
    }
}

/// JPEG (jpegenc and the built-in mjpeg encoder): `quality` 0..100
fn apply_jpeg(opts: &mut EncoderOptions, quality: Quality) {
    const QUALITY: [u32; 5] = [40, 60, 80, 90, 95];
    opts.set("quality", QUALITY[quality.index()]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mode: EncodingMode, quality: Quality) -> EncoderSettings {
        EncoderSettings {
            encoding_mode: mode,
            quality,
            ..EncoderSettings::default()
        }
    }

    #[test]
    fn x264_constant_quality_uses_crf_table() {
        let opts = EncoderFamily::X264.apply_video(
            &settings(EncodingMode::ConstantQuality, Quality::High),
            VideoCodec::H264,
            Size::new(1920, 1080),
            30.0,
        );
        assert_eq!(opts.get("pass"), Some("qual"));
        assert_eq!(opts.get_parsed::<u32>("quantizer"), Some(21));
        assert_eq!(opts.bit_rate, None);
    }

    #[test]
    fn bit_rate_modes_fall_back_to_heuristic() {
        let opts = EncoderFamily::Nvenc.apply_video(
            &settings(EncodingMode::ConstantBitRate, Quality::Normal),
            VideoCodec::H264,
            Size::new(1920, 1080),
            30.0,
        );
        let expected = bitrate_for_settings(VideoCodec::H264, Quality::Normal, Size::new(1920, 1080), 30.0);
        assert_eq!(opts.bit_rate, Some(expected));
        assert_eq!(opts.get("rc-mode"), Some("cbr"));
    }

    #[test]
    fn explicit_bit_rate_wins() {
        let mut s = settings(EncodingMode::AverageBitRate, Quality::Low);
        s.video_bit_rate = Some(2_000_000);
        let opts = EncoderFamily::Libvpx.apply_video(&s, VideoCodec::Vp9, Size::new(640, 480), 30.0);
        assert_eq!(opts.bit_rate, Some(2_000_000));
        assert_eq!(opts.get("target-bitrate"), Some("2000000"));
    }

    #[test]
    fn heuristic_scales_with_frame_rate() {
        let size = Size::new(1280, 720);
        let at30 = bitrate_for_settings(VideoCodec::H264, Quality::Normal, size, 30.0);
        let at60 = bitrate_for_settings(VideoCodec::H264, Quality::Normal, size, 60.0);
        assert_eq!(at60, (at30 as f64 * 1.5) as u64);

        let mjpeg30 = bitrate_for_settings(VideoCodec::Mjpeg, Quality::Normal, size, 30.0);
        let mjpeg60 = bitrate_for_settings(VideoCodec::Mjpeg, Quality::Normal, size, 60.0);
        assert_eq!(mjpeg60, mjpeg30 * 2);
    }

    #[test]
    fn family_lookup_by_element_name() {
        assert_eq!(EncoderFamily::from_encoder_name("nvh265enc"), EncoderFamily::Nvenc);
        assert_eq!(EncoderFamily::from_encoder_name("vah264enc"), EncoderFamily::Vaapi);
        assert_eq!(EncoderFamily::from_encoder_name("pcm_s16le"), EncoderFamily::Pcm);
        assert_eq!(EncoderFamily::from_encoder_name("mjpeg"), EncoderFamily::Jpeg);
        assert_eq!(EncoderFamily::from_encoder_name("somethingenc"), EncoderFamily::Generic);
    }

    #[test]
    fn audio_bit_rate_only_in_bit_rate_modes() {
        let mut s = settings(EncodingMode::ConstantQuality, Quality::Normal);
        s.audio_bit_rate = Some(128_000);
        assert_eq!(EncoderFamily::Opus.apply_audio(&s).bit_rate, None);

        s.encoding_mode = EncodingMode::ConstantBitRate;
        let opts = EncoderFamily::Opus.apply_audio(&s);
        assert_eq!(opts.bit_rate, Some(128_000));
        assert_eq!(opts.get("bitrate-type"), Some("cbr"));
    }
}
