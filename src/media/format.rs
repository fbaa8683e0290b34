//! Raw media formats shared by the whole pipeline
//!
//! Pixel formats carry a small descriptor (bit depth, chroma subsampling and
//! a few flags) that format negotiation scores against. Sample formats and
//! channel layouts follow the usual packed/planar and bit-mask conventions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A rational number, used for frame rates and time bases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    /// Microsecond time base, the unit of all raw media timestamps
    pub const MICROS: Rational = Rational::new(1, 1_000_000);
    /// Millisecond time base, used by the recording timeline
    pub const MILLIS: Rational = Rational::new(1, 1_000);

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    pub fn inverse(&self) -> Self {
        Self::new(self.den, self.num)
    }

    /// Closest fraction to `value` whose numerator and denominator stay
    /// within `max` (continued fraction expansion).
    pub fn from_f64(value: f64, max: i64) -> Self {
        if !value.is_finite() || value <= 0.0 {
            return Self::new(0, 1);
        }

        let (mut h0, mut h1) = (0i64, 1i64);
        let (mut k0, mut k1) = (1i64, 0i64);
        let mut x = value;

        for _ in 0..64 {
            let a = x.floor();
            if a > max as f64 {
                break;
            }
            let a = a as i64;
            let h2 = a.saturating_mul(h1).saturating_add(h0);
            let k2 = a.saturating_mul(k1).saturating_add(k0);
            if h2 > max || k2 > max {
                break;
            }
            (h0, h1) = (h1, h2);
            (k0, k1) = (k1, k2);

            let frac = x - a as f64;
            if frac.abs() < 1e-9 {
                break;
            }
            x = 1.0 / frac;
        }

        if k1 == 0 {
            return Self::new(max, 1);
        }
        Self::new(h1, k1).reduced()
    }

    pub fn reduced(&self) -> Self {
        let g = gcd(self.num.unsigned_abs(), self.den.unsigned_abs()) as i64;
        if g <= 1 {
            return *self;
        }
        Self::new(self.num / g, self.den / g)
    }

    /// Converts `value` expressed in `from` units into `to` units, rounding to
    /// the nearest integer (halves away from zero).
    pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
        let num = value as i128 * from.num as i128 * to.den as i128;
        let den = from.den as i128 * to.num as i128;
        if den == 0 {
            return 0;
        }
        let negative = (num < 0) != (den < 0);
        let (num, den) = (num.abs(), den.abs());
        let magnitude = (num + den / 2) / den;
        let rounded = if negative { -magnitude } else { magnitude };
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel formats understood by the converter and the encoders.
///
/// The hardware variants describe frames living in device memory; their
/// actual content layout is the surface's software format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Nv12,
    Yuyv422,
    Uyvy422,
    Gray8,
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
    Argb,
    Yuv420p10le,
    Yuv420p10be,
    P010le,
    Pal8,
    /// A complete JPEG still image per frame
    Jpeg,
    Vaapi,
    Cuda,
    Qsv,
    VideoToolbox,
    D3d11,
    MediaCodec,
}

/// Static properties of a pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormatDescriptor {
    /// Bits per component
    pub bit_depth: u8,
    pub log2_chroma_w: u8,
    pub log2_chroma_h: u8,
    pub big_endian: bool,
    pub palette: bool,
    pub rgb: bool,
    pub hw_accel: bool,
}

impl PixelFormatDescriptor {
    const fn yuv(bit_depth: u8, log2_chroma_w: u8, log2_chroma_h: u8) -> Self {
        Self {
            bit_depth,
            log2_chroma_w,
            log2_chroma_h,
            big_endian: false,
            palette: false,
            rgb: false,
            hw_accel: false,
        }
    }

    const fn rgb() -> Self {
        Self {
            rgb: true,
            ..Self::yuv(8, 0, 0)
        }
    }

    const fn hw() -> Self {
        Self {
            hw_accel: true,
            ..Self::yuv(8, 1, 1)
        }
    }

    pub fn is_420(&self) -> bool {
        self.log2_chroma_w == 1 && self.log2_chroma_h == 1
    }
}

/// Byte layout of one plane of a software frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
    pub rows: usize,
}

impl PixelFormat {
    pub fn descriptor(&self) -> PixelFormatDescriptor {
        use PixelFormat::*;
        match self {
            Yuv420p | Nv12 => PixelFormatDescriptor::yuv(8, 1, 1),
            Yuv422p | Yuyv422 | Uyvy422 => PixelFormatDescriptor::yuv(8, 1, 0),
            Yuv444p => PixelFormatDescriptor::yuv(8, 0, 0),
            Gray8 => PixelFormatDescriptor::yuv(8, 0, 0),
            Rgb24 | Bgr24 | Rgba | Bgra | Argb => PixelFormatDescriptor::rgb(),
            Yuv420p10le | P010le => PixelFormatDescriptor::yuv(10, 1, 1),
            Yuv420p10be => PixelFormatDescriptor {
                big_endian: true,
                ..PixelFormatDescriptor::yuv(10, 1, 1)
            },
            Pal8 => PixelFormatDescriptor {
                palette: true,
                ..PixelFormatDescriptor::rgb()
            },
            // Decoded as 8-bit RGB
            Jpeg => PixelFormatDescriptor::rgb(),
            Vaapi | Cuda | Qsv | VideoToolbox | D3d11 | MediaCodec => PixelFormatDescriptor::hw(),
        }
    }

    pub fn is_hw(&self) -> bool {
        self.descriptor().hw_accel
    }

    /// Compressed formats are carried as opaque bytes and must be decoded
    /// before any other processing.
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Jpeg)
    }

    pub fn name(&self) -> &'static str {
        use PixelFormat::*;
        match self {
            Yuv420p => "yuv420p",
            Yuv422p => "yuv422p",
            Yuv444p => "yuv444p",
            Nv12 => "nv12",
            Yuyv422 => "yuyv422",
            Uyvy422 => "uyvy422",
            Gray8 => "gray",
            Rgb24 => "rgb24",
            Bgr24 => "bgr24",
            Rgba => "rgba",
            Bgra => "bgra",
            Argb => "argb",
            Yuv420p10le => "yuv420p10le",
            Yuv420p10be => "yuv420p10be",
            P010le => "p010le",
            Pal8 => "pal8",
            Jpeg => "jpeg",
            Vaapi => "vaapi",
            Cuda => "cuda",
            Qsv => "qsv",
            VideoToolbox => "videotoolbox",
            D3d11 => "d3d11",
            MediaCodec => "mediacodec",
        }
    }

    /// Plane layout of a tightly packed software frame, `None` for hardware
    /// and compressed formats.
    pub fn planes(&self, size: Size) -> Option<Vec<PlaneLayout>> {
        use PixelFormat::*;
        let w = size.width as usize;
        let h = size.height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);

        let dims: Vec<(usize, usize)> = match self {
            Yuv420p => vec![(w, h), (cw, ch), (cw, ch)],
            Yuv422p => vec![(w, h), (cw, h), (cw, h)],
            Yuv444p => vec![(w, h), (w, h), (w, h)],
            Nv12 => vec![(w, h), (cw * 2, ch)],
            Yuyv422 | Uyvy422 => vec![(cw * 4, h)],
            Gray8 => vec![(w, h)],
            Rgb24 | Bgr24 => vec![(w * 3, h)],
            Rgba | Bgra | Argb => vec![(w * 4, h)],
            Yuv420p10le | Yuv420p10be => vec![(w * 2, h), (cw * 2, ch), (cw * 2, ch)],
            P010le => vec![(w * 2, h), (cw * 4, ch)],
            Pal8 => vec![(w, h), (1024, 1)],
            _ => return None,
        };

        let mut offset = 0;
        Some(
            dims.into_iter()
                .map(|(stride, rows)| {
                    let plane = PlaneLayout { offset, stride, rows };
                    offset += stride * rows;
                    plane
                })
                .collect(),
        )
    }

    /// Size in bytes of a tightly packed software frame
    pub fn frame_size(&self, size: Size) -> Option<usize> {
        self.planes(size)
            .map(|planes| planes.iter().map(|p| p.stride * p.rows).sum())
    }

    /// All software formats, in a stable order
    pub const SOFTWARE: &'static [PixelFormat] = &[
        PixelFormat::Yuv420p,
        PixelFormat::Yuv422p,
        PixelFormat::Yuv444p,
        PixelFormat::Nv12,
        PixelFormat::Yuyv422,
        PixelFormat::Uyvy422,
        PixelFormat::Gray8,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Rgba,
        PixelFormat::Bgra,
        PixelFormat::Argb,
        PixelFormat::Yuv420p10le,
        PixelFormat::Yuv420p10be,
        PixelFormat::P010le,
        PixelFormat::Pal8,
    ];
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Audio sample formats, packed (interleaved) and planar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
    U8p,
    S16p,
    S32p,
    F32p,
    F64p,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self.packed() {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            _ => 8,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            SampleFormat::U8p
                | SampleFormat::S16p
                | SampleFormat::S32p
                | SampleFormat::F32p
                | SampleFormat::F64p
        )
    }

    pub fn packed(&self) -> SampleFormat {
        match self {
            SampleFormat::U8p => SampleFormat::U8,
            SampleFormat::S16p => SampleFormat::S16,
            SampleFormat::S32p => SampleFormat::S32,
            SampleFormat::F32p => SampleFormat::F32,
            SampleFormat::F64p => SampleFormat::F64,
            other => *other,
        }
    }

    pub fn planar(&self) -> SampleFormat {
        match self {
            SampleFormat::U8 => SampleFormat::U8p,
            SampleFormat::S16 => SampleFormat::S16p,
            SampleFormat::S32 => SampleFormat::S32p,
            SampleFormat::F32 => SampleFormat::F32p,
            SampleFormat::F64 => SampleFormat::F64p,
            other => *other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16 => "s16",
            SampleFormat::S32 => "s32",
            SampleFormat::F32 => "flt",
            SampleFormat::F64 => "dbl",
            SampleFormat::U8p => "u8p",
            SampleFormat::S16p => "s16p",
            SampleFormat::S32p => "s32p",
            SampleFormat::F32p => "fltp",
            SampleFormat::F64p => "dblp",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Channel layout as a bit mask of speaker positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelLayout(pub u64);

impl ChannelLayout {
    pub const FRONT_LEFT: u64 = 0x1;
    pub const FRONT_RIGHT: u64 = 0x2;
    pub const FRONT_CENTER: u64 = 0x4;
    pub const LOW_FREQUENCY: u64 = 0x8;
    pub const BACK_LEFT: u64 = 0x10;
    pub const BACK_RIGHT: u64 = 0x20;
    pub const SIDE_LEFT: u64 = 0x200;
    pub const SIDE_RIGHT: u64 = 0x400;

    pub const MONO: ChannelLayout = ChannelLayout(Self::FRONT_CENTER);
    pub const STEREO: ChannelLayout = ChannelLayout(Self::FRONT_LEFT | Self::FRONT_RIGHT);
    pub const SURROUND: ChannelLayout =
        ChannelLayout(Self::FRONT_LEFT | Self::FRONT_RIGHT | Self::FRONT_CENTER);
    pub const QUAD: ChannelLayout = ChannelLayout(
        Self::FRONT_LEFT | Self::FRONT_RIGHT | Self::BACK_LEFT | Self::BACK_RIGHT,
    );
    pub const SURROUND_5_1: ChannelLayout = ChannelLayout(
        Self::FRONT_LEFT
            | Self::FRONT_RIGHT
            | Self::FRONT_CENTER
            | Self::LOW_FREQUENCY
            | Self::SIDE_LEFT
            | Self::SIDE_RIGHT,
    );

    /// Conventional layout for a plain channel count
    pub fn default_for_count(channels: u32) -> ChannelLayout {
        match channels {
            1 => Self::MONO,
            2 => Self::STEREO,
            3 => Self::SURROUND,
            4 => Self::QUAD,
            6 => Self::SURROUND_5_1,
            n => ChannelLayout(if n >= 64 { u64::MAX } else { (1u64 << n) - 1 }),
        }
    }

    pub fn channel_count(&self) -> u32 {
        self.0.count_ones()
    }

    /// True when every position of `other` is present in `self`
    pub fn contains(&self, other: ChannelLayout) -> bool {
        self.0 & other.0 == other.0
    }

    /// Speaker position bits in channel order
    pub fn positions(&self) -> impl Iterator<Item = u64> + '_ {
        (0..64).map(|bit| 1u64 << bit).filter(|mask| self.0 & mask != 0)
    }

    /// Index of a speaker position within this layout
    pub fn index_of(&self, position: u64) -> Option<usize> {
        self.positions().position(|p| p == position)
    }
}

/// Format of a raw audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
}

impl AudioFormat {
    pub fn new(sample_format: SampleFormat, sample_rate: u32, channel_layout: ChannelLayout) -> Self {
        Self {
            sample_format,
            sample_rate,
            channel_layout,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channel_layout.channel_count() > 0
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_layout.channel_count()
    }

    /// Bytes of one sample for all channels
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channel_count() as usize
    }

    pub fn frames_for_bytes(&self, bytes: usize) -> usize {
        match self.bytes_per_frame() {
            0 => 0,
            n => bytes / n,
        }
    }

    pub fn duration_us_for_frames(&self, frames: u64) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (frames as i128 * 1_000_000 / self.sample_rate as i128) as i64
    }

    pub fn frames_for_duration_us(&self, duration_us: i64) -> u64 {
        (duration_us.max(0) as i128 * self.sample_rate as i128 / 1_000_000) as u64
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {}ch",
            self.sample_format,
            self.sample_rate,
            self.channel_count()
        )
    }
}

/// Format reported by a video source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoFrameFormat {
    pub pixel_format: PixelFormat,
    pub size: Size,
    /// Nominal stream frame rate, if the source knows it
    pub frame_rate: Option<f64>,
}

impl VideoFrameFormat {
    pub fn new(pixel_format: PixelFormat, size: Size) -> Self {
        Self {
            pixel_format,
            size,
            frame_rate: None,
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.size.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_rounds_to_nearest() {
        assert_eq!(Rational::rescale(1_500, Rational::MICROS, Rational::MILLIS), 2);
        assert_eq!(Rational::rescale(1_499, Rational::MICROS, Rational::MILLIS), 1);
        assert_eq!(Rational::rescale(-1_500, Rational::MICROS, Rational::MILLIS), -2);
        assert_eq!(
            Rational::rescale(1, Rational::new(1, 30), Rational::MICROS),
            33_333
        );
    }

    #[test]
    fn from_f64_finds_common_rates() {
        assert_eq!(Rational::from_f64(30.0, 1 << 16), Rational::new(30, 1));
        let ntsc = Rational::from_f64(30000.0 / 1001.0, 1 << 16);
        assert!((ntsc.as_f64() - 30000.0 / 1001.0).abs() < 1e-6);
        assert_eq!(Rational::from_f64(0.0, 100), Rational::new(0, 1));
    }

    #[test]
    fn yuv420_frame_size_handles_odd_dimensions() {
        let size = Size::new(3, 3);
        assert_eq!(PixelFormat::Yuv420p.frame_size(size), Some(9 + 4 + 4));
        assert_eq!(PixelFormat::Nv12.frame_size(size), Some(9 + 8));
        assert_eq!(PixelFormat::Cuda.frame_size(size), None);
    }

    #[test]
    fn channel_layout_positions_follow_bit_order() {
        let layout = ChannelLayout::SURROUND_5_1;
        assert_eq!(layout.channel_count(), 6);
        assert_eq!(layout.index_of(ChannelLayout::FRONT_CENTER), Some(2));
        assert!(layout.contains(ChannelLayout::STEREO));
        assert!(!ChannelLayout::STEREO.contains(ChannelLayout::MONO));
    }

    #[test]
    fn planar_variants_keep_sample_size() {
        assert_eq!(SampleFormat::S16.planar(), SampleFormat::S16p);
        assert_eq!(SampleFormat::F32p.packed(), SampleFormat::F32);
        assert_eq!(SampleFormat::S16p.bytes_per_sample(), 2);
        assert!(!SampleFormat::S32.is_planar());
    }
}
