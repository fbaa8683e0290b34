//! Format and capability negotiation
//!
//! Every choice here is "score each candidate the codec advertises, keep the
//! best". Scores are plain integers: [`BEST_SCORE`] short-circuits the search,
//! [`NOT_SUITABLE_SCORE`] excludes a candidate and everything else is ranked
//! relative to [`DEFAULT_SCORE`]. Ties keep the first candidate, so results
//! only depend on the inputs and their order.

use thiserror::Error;

use crate::config::EncoderSettings;
use crate::encoding::{AudioCodecDescriptor, VideoCodecDescriptor};
use crate::media::{AudioFormat, ChannelLayout, HwAccel, PixelFormat, Rational, SampleFormat, Size};

pub type Score = i32;

pub const BEST_SCORE: Score = i32::MAX;
pub const DEFAULT_SCORE: Score = 0;
pub const NOT_SUITABLE_SCORE: Score = i32::MIN;

/// Penalty for choosing a value below what was requested (lower sample
/// rate, smaller samples, fewer channels)
const BELOW_REQUESTED_PENALTY: Score = 1_000_000;

/// Frame rate used when neither settings nor source provide one
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

const MAX_FRAME_RATE_DENOMINATOR: i64 = 1_000_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("Encoder {encoder} has no suitable {what}")]
    NoSuitableFormat { encoder: String, what: &'static str },
}

/// Highest scoring value and its score. Stops at the first [`BEST_SCORE`];
/// values scoring [`NOT_SUITABLE_SCORE`] are never picked.
pub fn find_best_value<T, I, F>(values: I, mut score: F) -> Option<(T, Score)>
where
    I: IntoIterator<Item = T>,
    F: FnMut(&T) -> Score,
{
    let mut best: Option<(T, Score)> = None;
    for value in values {
        let s = score(&value);
        if s > best.as_ref().map_or(NOT_SUITABLE_SCORE, |(_, b)| *b) {
            let is_best = s == BEST_SCORE;
            best = Some((value, s));
            if is_best {
                break;
            }
        }
    }
    best
}

/// Suitable values sorted by descending score, ties in input order
pub fn rank_by_score<T, I, F>(values: I, mut score: F) -> Vec<(T, Score)>
where
    I: IntoIterator<Item = T>,
    F: FnMut(&T) -> Score,
{
    let mut ranked: Vec<(T, Score)> = values
        .into_iter()
        .map(|v| {
            let s = score(&v);
            (v, s)
        })
        .filter(|(_, s)| *s != NOT_SUITABLE_SCORE)
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

// ─── Video ──────────────────────────────────────────────────────────────────

/// How well `candidate` suits frames whose software layout is `source`
pub fn target_sw_format_score(source: PixelFormat, candidate: PixelFormat) -> Score {
    if candidate == source {
        return BEST_SCORE;
    }

    let desc = candidate.descriptor();
    if desc.hw_accel || candidate.is_compressed() {
        return NOT_SUITABLE_SCORE;
    }

    let source_desc = source.descriptor();
    let mut score = DEFAULT_SCORE;

    if desc.bit_depth == source_desc.bit_depth {
        score += 100;
    }
    if desc.is_420() {
        score += 10;
    }
    if desc.big_endian {
        score -= 2000;
    }
    if desc.palette {
        score -= 10_000;
    }
    if desc.rgb {
        // Encoders handle YUV better; RGB input usually means a slow path
        score -= 1000;
    }

    score
}

/// Best software format among `candidates` for a `source_sw` layout
pub fn find_target_sw_format(
    source_sw: PixelFormat,
    candidates: impl IntoIterator<Item = PixelFormat>,
) -> Option<PixelFormat> {
    find_best_value(candidates, |f| target_sw_format_score(source_sw, *f)).map(|(f, _)| f)
}

/// Format frames must have when submitted to the encoder: the accelerator's
/// hardware format if the encoder takes it, otherwise the best software
/// format the encoder supports.
pub fn find_target_format(
    source: PixelFormat,
    source_sw: PixelFormat,
    descriptor: &VideoCodecDescriptor,
    accel: Option<&HwAccel>,
) -> Result<PixelFormat, NegotiationError> {
    if let Some(accel) = accel {
        let hw_format = accel.hw_format();
        if descriptor.supports_format(hw_format) {
            return Ok(hw_format);
        }
    }

    if !source.is_hw() && descriptor.supports_format(source) {
        return Ok(source);
    }

    find_target_sw_format(source_sw, descriptor.sw_formats()).ok_or_else(|| {
        NegotiationError::NoSuitableFormat {
            encoder: descriptor.name.clone(),
            what: "pixel format",
        }
    })
}

/// Ranks software encoders of one codec by how well they take `source_sw`
pub fn sw_format_encoder_score(descriptor: &VideoCodecDescriptor, source_sw: PixelFormat) -> Score {
    find_best_value(descriptor.sw_formats(), |f| target_sw_format_score(source_sw, *f))
        .map_or(NOT_SUITABLE_SCORE, |(_, score)| score)
}

/// Closest supported frame rate by ratio; the requested rate as a fraction
/// when the codec does not restrict rates.
pub fn adjust_frame_rate(supported: &[Rational], requested: f64) -> Rational {
    let requested = if requested > 0.0 { requested } else { DEFAULT_FRAME_RATE };

    let score = |rate: &Rational| -> Score {
        let left = requested * rate.den as f64;
        let right = rate.num as f64;
        let (lo, hi) = if left < right { (left, right) } else { (right, left) };
        if hi <= 0.0 {
            return NOT_SUITABLE_SCORE;
        }
        let ratio = lo / hi;
        if ratio >= 1.0 {
            BEST_SCORE
        } else {
            (ratio * 1e9) as Score
        }
    };

    match find_best_value(supported.iter().copied(), score) {
        Some((rate, _)) => rate,
        None => Rational::from_f64(requested, MAX_FRAME_RATE_DENOMINATOR),
    }
}

/// Stream time base: one tick per frame for fixed-rate codecs, otherwise a
/// thousand ticks per frame so variable frame timing survives.
pub fn adjust_frame_time_base(supported: &[Rational], frame_rate: Rational) -> Rational {
    if !supported.is_empty() {
        return frame_rate.inverse();
    }
    const TIME_SCALE_FACTOR: i64 = 1000;
    Rational::new(frame_rate.den, frame_rate.num * TIME_SCALE_FACTOR)
}

/// Clamps `requested` to the encoder's size limits and rounds down to even
/// dimensions where the encoder needs them.
pub fn adjust_video_resolution(descriptor: &VideoCodecDescriptor, requested: Size) -> Size {
    let mut size = requested;

    if let Some(max) = descriptor.max_size {
        size.width = size.width.min(max.width);
        size.height = size.height.min(max.height);
    }
    if let Some(min) = descriptor.min_size {
        size.width = size.width.max(min.width);
        size.height = size.height.max(min.height);
    }
    if descriptor.even_dimensions {
        size.width = (size.width & !1).max(2);
        size.height = (size.height & !1).max(2);
    }

    size
}

/// Negotiated parameters of one video stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoNegotiation {
    /// Format submitted to the encoder (hardware format with an accelerator)
    pub target_format: PixelFormat,
    /// Content layout of submitted frames
    pub target_sw_format: PixelFormat,
    pub size: Size,
    pub frame_rate: Rational,
    pub time_base: Rational,
}

/// Negotiates output size, rate, time base and formats for one encoder
pub fn negotiate_video(
    descriptor: &VideoCodecDescriptor,
    source_format: PixelFormat,
    source_sw_format: PixelFormat,
    requested_size: Size,
    requested_frame_rate: f64,
    accel: Option<&HwAccel>,
) -> Result<VideoNegotiation, NegotiationError> {
    // Compressed sources are decoded to RGB before anything else happens
    let source_sw_format = if source_sw_format.is_compressed() {
        PixelFormat::Rgb24
    } else {
        source_sw_format
    };
    let source_format = if source_format.is_compressed() {
        PixelFormat::Rgb24
    } else {
        source_format
    };

    let size = adjust_video_resolution(descriptor, requested_size);
    let frame_rate = adjust_frame_rate(&descriptor.frame_rates, requested_frame_rate);
    let time_base = adjust_frame_time_base(&descriptor.frame_rates, frame_rate);

    let target_format = find_target_format(source_format, source_sw_format, descriptor, accel)?;
    let target_sw_format = if target_format.is_hw() {
        let allowed = accel.map(HwAccel::allowed_sw_formats).unwrap_or_default();
        find_target_sw_format(source_sw_format, allowed.iter().copied()).ok_or_else(|| {
            NegotiationError::NoSuitableFormat {
                encoder: descriptor.name.clone(),
                what: "surface format",
            }
        })?
    } else {
        target_format
    };

    Ok(VideoNegotiation {
        target_format,
        target_sw_format,
        size,
        frame_rate,
        time_base,
    })
}

// ─── Audio ──────────────────────────────────────────────────────────────────

pub fn adjust_sample_format(supported: &[SampleFormat], requested: SampleFormat) -> SampleFormat {
    let score = |format: &SampleFormat| -> Score {
        if *format == requested {
            return BEST_SCORE;
        }
        if *format == requested.planar() {
            return BEST_SCORE - 1;
        }
        let bps = format.bytes_per_sample() as Score;
        let requested_bps = requested.bytes_per_sample() as Score;
        if bps >= requested_bps {
            DEFAULT_SCORE - (bps - requested_bps)
        } else {
            DEFAULT_SCORE - (requested_bps - bps) - BELOW_REQUESTED_PENALTY
        }
    };

    find_best_value(supported.iter().copied(), score).map_or(requested, |(f, _)| f)
}

pub fn adjust_sample_rate(supported: &[u32], requested: u32) -> u32 {
    let score = |rate: &u32| -> Score {
        let rate = *rate as i64;
        let requested = requested as i64;
        if rate == requested {
            BEST_SCORE
        } else if rate > requested {
            (DEFAULT_SCORE as i64 - (rate - requested)).max(i32::MIN as i64 + 1) as Score
        } else {
            (DEFAULT_SCORE as i64 - (requested - rate) - BELOW_REQUESTED_PENALTY as i64)
                .max(i32::MIN as i64 + 1) as Score
        }
    };

    find_best_value(supported.iter().copied(), score).map_or(requested, |(r, _)| r)
}

pub fn adjust_channel_layout(supported: &[ChannelLayout], requested: ChannelLayout) -> ChannelLayout {
    let score = |layout: &ChannelLayout| -> Score {
        if *layout == requested {
            return BEST_SCORE;
        }
        let count = layout.channel_count() as Score;
        let requested_count = requested.channel_count() as Score;
        if layout.contains(requested) {
            return DEFAULT_SCORE - (count - requested_count);
        }
        let mut score = DEFAULT_SCORE - 1000 - (count - requested_count).abs();
        if count < requested_count {
            score -= BELOW_REQUESTED_PENALTY;
        }
        score
    };

    find_best_value(supported.iter().copied(), score).map_or(requested, |(l, _)| l)
}

/// Ranks audio encoders of one codec: one point up or down for each of
/// sample format, rate and layout the encoder supports exactly.
pub fn audio_encoder_score(descriptor: &AudioCodecDescriptor, format: &AudioFormat) -> Score {
    let vote = |supported: bool| if supported { 1 } else { -1 };

    DEFAULT_SCORE
        + vote(descriptor.sample_formats.contains(&format.sample_format))
        + vote(descriptor.sample_rates.contains(&format.sample_rate))
        + vote(descriptor.channel_layouts.contains(&format.channel_layout))
}

/// Audio format the encoder will be opened with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioNegotiation {
    pub format: AudioFormat,
    /// Samples per frame, `None` for variable frame size encoders
    pub frame_size: Option<usize>,
    pub time_base: Rational,
}

/// Negotiates the codec side format for a source. Requested rate and
/// channel count come from the settings when set, else from the source.
pub fn negotiate_audio(
    descriptor: &AudioCodecDescriptor,
    source: &AudioFormat,
    settings: &EncoderSettings,
) -> Result<AudioNegotiation, NegotiationError> {
    let requested_rate = settings
        .audio_sample_rate
        .filter(|r| *r > 0)
        .unwrap_or(source.sample_rate);
    let requested_layout = match settings.audio_channel_count.filter(|c| *c > 0) {
        Some(count) if count != source.channel_count() => ChannelLayout::default_for_count(count),
        _ => source.channel_layout,
    };

    if requested_rate == 0 || requested_layout.channel_count() == 0 {
        return Err(NegotiationError::NoSuitableFormat {
            encoder: descriptor.name.clone(),
            what: "audio format",
        });
    }

    let format = AudioFormat::new(
        adjust_sample_format(&descriptor.sample_formats, source.sample_format),
        adjust_sample_rate(&descriptor.sample_rates, requested_rate),
        adjust_channel_layout(&descriptor.channel_layouts, requested_layout),
    );

    Ok(AudioNegotiation {
        format,
        frame_size: descriptor.frame_size,
        time_base: Rational::new(1, format.sample_rate as i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{AudioCodec, VideoCodec};
    use crate::media::HwDeviceType;

    #[test]
    fn find_best_value_keeps_first_of_equal_scores() {
        let values = [3, 1, 3, 2];
        let (value, score) = find_best_value(values.iter().enumerate(), |(_, v)| **v).unwrap();
        assert_eq!(value.0, 0);
        assert_eq!(score, 3);
    }

    #[test]
    fn find_best_value_stops_at_best() {
        let mut seen = Vec::new();
        let best = find_best_value([1, 2, 3], |v| {
            seen.push(*v);
            if *v == 2 {
                BEST_SCORE
            } else {
                DEFAULT_SCORE
            }
        });
        assert_eq!(best, Some((2, BEST_SCORE)));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn find_best_value_skips_unsuitable() {
        assert_eq!(find_best_value([1, 2], |_| NOT_SUITABLE_SCORE), None);
    }

    #[test]
    fn sw_format_prefers_same_depth_420_yuv() {
        let candidates = [PixelFormat::Rgb24, PixelFormat::Yuv444p, PixelFormat::Yuv420p, PixelFormat::Yuv420p10le];
        assert_eq!(find_target_sw_format(PixelFormat::Bgra, candidates), Some(PixelFormat::Yuv420p));
        assert_eq!(
            find_target_sw_format(PixelFormat::P010le, candidates),
            Some(PixelFormat::Yuv420p10le)
        );
        assert_eq!(find_target_sw_format(PixelFormat::Rgb24, candidates), Some(PixelFormat::Rgb24));
    }

    #[test]
    fn hardware_and_palette_formats_are_avoided() {
        assert_eq!(target_sw_format_score(PixelFormat::Nv12, PixelFormat::Cuda), NOT_SUITABLE_SCORE);
        assert!(
            target_sw_format_score(PixelFormat::Nv12, PixelFormat::Pal8)
                < target_sw_format_score(PixelFormat::Nv12, PixelFormat::Yuv420p10be)
        );
    }

    #[test]
    fn target_format_uses_accelerator_when_supported() {
        let descriptor = VideoCodecDescriptor::new(
            "vah264enc",
            VideoCodec::H264,
            vec![PixelFormat::Vaapi, PixelFormat::Nv12],
        );
        let accel = HwAccel::create(HwDeviceType::Vaapi, &[HwDeviceType::Vaapi]).unwrap();

        let negotiated = negotiate_video(
            &descriptor,
            PixelFormat::Yuyv422,
            PixelFormat::Yuyv422,
            Size::new(640, 480),
            30.0,
            Some(&accel),
        )
        .unwrap();
        assert_eq!(negotiated.target_format, PixelFormat::Vaapi);
        assert_eq!(negotiated.target_sw_format, PixelFormat::Nv12);

        let sw = find_target_format(PixelFormat::Yuyv422, PixelFormat::Yuyv422, &descriptor, None).unwrap();
        assert_eq!(sw, PixelFormat::Nv12);
    }

    #[test]
    fn encoder_without_formats_fails() {
        let descriptor = VideoCodecDescriptor::new("broken", VideoCodec::H264, vec![PixelFormat::Cuda]);
        let err = find_target_format(PixelFormat::Nv12, PixelFormat::Nv12, &descriptor, None).unwrap_err();
        assert!(matches!(err, NegotiationError::NoSuitableFormat { .. }));
    }

    #[test]
    fn frame_rate_picks_closest_ratio() {
        let supported = [Rational::new(24, 1), Rational::new(25, 1), Rational::new(30, 1)];
        assert_eq!(adjust_frame_rate(&supported, 29.0), Rational::new(30, 1));
        assert_eq!(adjust_frame_rate(&supported, 25.0), Rational::new(25, 1));
        assert_eq!(adjust_frame_rate(&[], 15.0), Rational::new(15, 1));
        assert_eq!(adjust_frame_rate(&[], 0.0), Rational::new(30, 1));
    }

    #[test]
    fn time_base_depends_on_fixed_rates() {
        let rate = Rational::new(30, 1);
        assert_eq!(adjust_frame_time_base(&[rate], rate), Rational::new(1, 30));
        assert_eq!(adjust_frame_time_base(&[], rate), Rational::new(1, 30_000));
    }

    #[test]
    fn resolution_rounds_down_to_even() {
        let descriptor = VideoCodecDescriptor::new("x264enc", VideoCodec::H264, vec![PixelFormat::Yuv420p])
            .with_even_dimensions()
            .with_size_limits(None, Some(Size::new(4096, 2304)));
        assert_eq!(adjust_video_resolution(&descriptor, Size::new(641, 481)), Size::new(640, 480));
        assert_eq!(adjust_video_resolution(&descriptor, Size::new(1, 8000)), Size::new(2, 2304));
    }

    #[test]
    fn sample_format_prefers_planar_then_larger() {
        assert_eq!(
            adjust_sample_format(&[SampleFormat::F32p, SampleFormat::S16p], SampleFormat::S16),
            SampleFormat::S16p
        );
        assert_eq!(
            adjust_sample_format(&[SampleFormat::U8, SampleFormat::S32], SampleFormat::S16),
            SampleFormat::S32
        );
        assert_eq!(adjust_sample_format(&[], SampleFormat::F32), SampleFormat::F32);
    }

    #[test]
    fn sample_rate_prefers_higher_rates() {
        let supported = [8_000, 16_000, 48_000];
        assert_eq!(adjust_sample_rate(&supported, 44_100), 48_000);
        assert_eq!(adjust_sample_rate(&supported, 16_000), 16_000);
        assert_eq!(adjust_sample_rate(&[8_000], 44_100), 8_000);
        assert_eq!(adjust_sample_rate(&[], 22_050), 22_050);
    }

    #[test]
    fn channel_layout_prefers_superset_over_fewer_channels() {
        let supported = [ChannelLayout::MONO, ChannelLayout::SURROUND_5_1, ChannelLayout::QUAD];
        assert_eq!(
            adjust_channel_layout(&supported, ChannelLayout::STEREO),
            ChannelLayout::QUAD
        );
        assert_eq!(
            adjust_channel_layout(&[ChannelLayout::MONO, ChannelLayout::SURROUND], ChannelLayout::STEREO),
            ChannelLayout::SURROUND
        );
    }

    #[test]
    fn audio_negotiation_is_idempotent() {
        let descriptor = AudioCodecDescriptor::new("opusenc", AudioCodec::Opus, vec![SampleFormat::F32, SampleFormat::S16])
            .with_sample_rates(vec![8_000, 12_000, 16_000, 24_000, 48_000])
            .with_channel_layouts(vec![ChannelLayout::MONO, ChannelLayout::STEREO])
            .with_frame_size(960);
        let source = AudioFormat::new(SampleFormat::S16, 44_100, ChannelLayout::MONO);
        let settings = EncoderSettings::default();

        let first = negotiate_audio(&descriptor, &source, &settings).unwrap();
        let second = negotiate_audio(&descriptor, &source, &settings).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.format.sample_rate, 48_000);
        assert_eq!(first.format.sample_format, SampleFormat::S16);
        assert_eq!(first.time_base, Rational::new(1, 48_000));
        assert_eq!(first.frame_size, Some(960));
    }

    #[test]
    fn video_negotiation_is_idempotent() {
        let descriptor = VideoCodecDescriptor::new(
            "x264enc",
            VideoCodec::H264,
            vec![PixelFormat::Yuv420p, PixelFormat::Nv12, PixelFormat::Yuv444p],
        )
        .with_even_dimensions();

        let run = || {
            negotiate_video(&descriptor, PixelFormat::Bgra, PixelFormat::Bgra, Size::new(333, 201), 29.97, None)
                .unwrap()
        };
        assert_eq!(run(), run());
        assert_eq!(run().size, Size::new(332, 200));
        assert_eq!(run().target_format, PixelFormat::Yuv420p);
    }

    #[test]
    fn audio_encoder_score_counts_exact_support() {
        let descriptor = AudioCodecDescriptor::new("pcm_s16le", AudioCodec::PcmS16le, vec![SampleFormat::S16]);
        let format = AudioFormat::new(SampleFormat::S16, 44_100, ChannelLayout::MONO);
        assert_eq!(audio_encoder_score(&descriptor, &format), -1);
    }
}
