mod common;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use common::{validate_mkv, TRACK_TYPE_AUDIO, TRACK_TYPE_VIDEO};
use mediarec_lib::config::{EncoderSettings, RecorderConfig};
use mediarec_lib::container::MatroskaWriter;
use mediarec_lib::encoding::codec::VideoEncoderContext;
use mediarec_lib::encoding::{
    CodecError, CodecRegistry, EncoderContext, EncoderVideoFrame, VideoCodec, VideoCodecDescriptor,
    VideoEncoderConfig, VideoEncoderFactory,
};
use mediarec_lib::media::{
    AudioFormat, ChannelLayout, CompressedPacket, PixelFormat, RawAudioBuffer, RawVideoFrame,
    Rational, SampleFormat, Size, VideoFrameFormat,
};
use mediarec_lib::recording::{
    AudioSource, EngineState, PushAudioSource, PushVideoSource, RecorderErrorKind, RecorderEvent,
    RecordingEngine, VideoSource,
};

const FRAME_SIZE: Size = Size::new(16, 16);
const SECOND_US: i64 = 1_000_000;

fn engine_for(
    path: &Path,
    settings: EncoderSettings,
    config: &RecorderConfig,
    registry: CodecRegistry,
) -> (RecordingEngine, Receiver<RecorderEvent>) {
    let writer = MatroskaWriter::create(path, settings.container, config.max_interleave_delta_ms).unwrap();
    RecordingEngine::new(settings, config, Box::new(writer), Arc::new(registry))
}

fn mjpeg_settings() -> EncoderSettings {
    let mut settings = RecorderConfig::default().encoder;
    settings.video_codec = Some(VideoCodec::Mjpeg);
    settings.hardware_acceleration = false;
    settings
}

fn one_fps_source() -> PushVideoSource {
    PushVideoSource::new(
        "camera",
        Some(VideoFrameFormat::new(PixelFormat::Rgb24, FRAME_SIZE).with_frame_rate(1.0)),
    )
}

/// A solid-color 16x16 frame covering [start, start + 1s)
fn solid_frame(start_us: i64, shade: u8) -> RawVideoFrame {
    let data = vec![shade; FRAME_SIZE.width as usize * FRAME_SIZE.height as usize * 3];
    RawVideoFrame::from_memory(PixelFormat::Rgb24, FRAME_SIZE, data)
        .with_times(Some(start_us), Some(start_us + SECOND_US))
        .with_frame_rate(1.0)
}

fn wait_until(mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(Instant::now() < deadline, "Timed out waiting for the encoder queue");
        thread::sleep(Duration::from_millis(1));
    }
}

fn push_video(source: &PushVideoSource, frame: RawVideoFrame) {
    wait_until(|| source.can_push());
    assert!(source.push(frame));
}

fn video_sources(source: &PushVideoSource) -> Vec<Box<dyn VideoSource>> {
    vec![Box::new(source.clone())]
}

fn audio_sources(source: &PushAudioSource) -> Vec<Box<dyn AudioSource>> {
    vec![Box::new(source.clone())]
}

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn one_second_of_mono_pcm_records_one_second() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audio.mkv");
    let config = RecorderConfig::default();
    let (mut engine, events) = engine_for(&path, config.encoder.clone(), &config, CodecRegistry::with_builtin());

    let format = AudioFormat::new(SampleFormat::S16, 44_100, ChannelLayout::MONO);
    let mic = PushAudioSource::new("mic", Some(format));
    engine.initialize(audio_sources(&mic), Vec::new()).unwrap();
    engine.start().unwrap();
    assert_eq!(engine.state(), EngineState::Encoding);

    // 100 buffers of 10 ms
    for i in 0..100i64 {
        let buffer = RawAudioBuffer::new(vec![0u8; 441 * 2], format, i * 10_000);
        wait_until(|| mic.can_push());
        assert!(mic.push(buffer));
    }
    engine.finalize().unwrap();

    let file = validate_mkv(&path).unwrap();
    assert_eq!(file.tracks_of_type(TRACK_TYPE_AUDIO).len(), 1);
    assert!(file.tracks_of_type(TRACK_TYPE_VIDEO).is_empty());
    assert!(
        (980.0..=1020.0).contains(&file.duration_ms),
        "duration {} ms",
        file.duration_ms
    );
    let track = file.tracks_of_type(TRACK_TYPE_AUDIO)[0];
    assert_eq!(track.codec_id, "A_PCM/INT/LIT");
    assert_eq!(track.sample_rate, 44_100.0);
    assert_eq!(track.channels, 1);

    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(events.last(), Some(&RecorderEvent::FinalizationDone));
    assert!(events.contains(&RecorderEvent::DurationChanged(1000)));
    assert!(!events.iter().any(|e| matches!(e, RecorderEvent::SessionError { .. })));
}

#[test]
fn three_one_second_frames_at_one_fps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("video.mkv");
    let config = RecorderConfig::default();
    let (mut engine, _events) = engine_for(&path, mjpeg_settings(), &config, CodecRegistry::with_builtin());

    let camera = one_fps_source();
    engine.initialize(Vec::new(), video_sources(&camera)).unwrap();
    engine.start().unwrap();

    for (i, shade) in [40u8, 120, 200].into_iter().enumerate() {
        push_video(&camera, solid_frame(i as i64 * SECOND_US, shade));
    }
    engine.finalize().unwrap();

    let file = validate_mkv(&path).unwrap();
    let video = file.tracks_of_type(TRACK_TYPE_VIDEO);
    assert_eq!(video.len(), 1);
    assert_eq!(video[0].codec_id, "V_MJPEG");
    assert_eq!((video[0].width, video[0].height), (16, 16));

    let blocks = file.blocks_for(video[0].number);
    assert!(blocks.len() >= 3, "{} blocks", blocks.len());
    let last = blocks.last().unwrap().timestamp_ms;
    assert!((2000..3500).contains(&last), "last block at {} ms", last);
    assert!(blocks.iter().all(|b| b.key_frame));
    assert!(file.has_cues);
}

#[test]
fn no_sources_fails_without_writing_a_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.mkv");
    let config = RecorderConfig::default();
    let (mut engine, events) = engine_for(&path, mjpeg_settings(), &config, CodecRegistry::with_builtin());

    engine.initialize(Vec::new(), Vec::new()).unwrap();
    assert!(engine.start().is_err());
    assert_eq!(engine.state(), EngineState::Failed);
    engine.finalize().unwrap();

    let events: Vec<_> = events.try_iter().collect();
    assert!(matches!(
        events.first(),
        Some(RecorderEvent::SessionError {
            kind: RecorderErrorKind::ResourceError,
            ..
        })
    ));
    assert_eq!(events.last(), Some(&RecorderEvent::FinalizationDone));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    assert!(validate_mkv(&path).is_err());
}

#[test]
fn pause_gap_does_not_advance_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("paused.mkv");
    let config = RecorderConfig::default();
    let (mut engine, _events) = engine_for(&path, mjpeg_settings(), &config, CodecRegistry::with_builtin());

    let camera = one_fps_source();
    engine.initialize(Vec::new(), video_sources(&camera)).unwrap();
    engine.start().unwrap();

    for i in 0..3 {
        push_video(&camera, solid_frame(i * SECOND_US, 80));
    }
    engine.set_paused(true);
    assert!(!camera.push(solid_frame(3 * SECOND_US, 80)));
    assert!(!camera.push(solid_frame(4 * SECOND_US, 80)));
    engine.set_paused(false);
    for i in 5..7 {
        push_video(&camera, solid_frame(i * SECOND_US, 80));
    }
    engine.finalize().unwrap();

    let file = validate_mkv(&path).unwrap();
    let track = file.tracks_of_type(TRACK_TYPE_VIDEO)[0].number;
    let timestamps: Vec<i64> = file.blocks_for(track).iter().map(|b| b.timestamp_ms).collect();
    assert_eq!(timestamps, vec![0, 1000, 2000, 3000, 4000]);
    assert_eq!(engine.duration_ms(), 4000);
}

#[test]
fn first_frame_anchors_the_timeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late_clock.mkv");
    let config = RecorderConfig::default();
    let (mut engine, _events) = engine_for(&path, mjpeg_settings(), &config, CodecRegistry::with_builtin());

    let camera = one_fps_source();
    engine.initialize(Vec::new(), video_sources(&camera)).unwrap();
    engine.start().unwrap();

    // The capture clock was already running for 10 s
    for i in 10..13 {
        push_video(&camera, solid_frame(i * SECOND_US, 60));
    }
    engine.finalize().unwrap();

    let file = validate_mkv(&path).unwrap();
    let track = file.tracks_of_type(TRACK_TYPE_VIDEO)[0].number;
    let timestamps: Vec<i64> = file.blocks_for(track).iter().map(|b| b.timestamp_ms).collect();
    assert_eq!(timestamps, vec![0, 1000, 2000]);
    assert_eq!(engine.duration_ms(), 2000);
    assert!(file.duration_ms < 3500.0, "{}", file.duration_ms);
}

#[test]
fn resolution_change_keeps_the_negotiated_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resized.mkv");
    let config = RecorderConfig::default();
    let mut settings = mjpeg_settings();
    settings.video_codec = Some(VideoCodec::RawVideo);
    let (mut engine, _events) = engine_for(&path, settings, &config, CodecRegistry::with_builtin());

    let camera = one_fps_source();
    engine.initialize(Vec::new(), video_sources(&camera)).unwrap();
    engine.start().unwrap();

    push_video(&camera, solid_frame(0, 90));
    push_video(&camera, solid_frame(SECOND_US, 90));
    for i in 2..4i64 {
        let size = Size::new(32, 24);
        let frame = RawVideoFrame::from_memory(PixelFormat::Rgb24, size, vec![90u8; 32 * 24 * 3])
            .with_times(Some(i * SECOND_US), Some((i + 1) * SECOND_US))
            .with_frame_rate(1.0);
        push_video(&camera, frame);
    }
    let bgr = RawVideoFrame::from_memory(PixelFormat::Bgr24, FRAME_SIZE, vec![90u8; 16 * 16 * 3])
        .with_times(Some(4 * SECOND_US), Some(5 * SECOND_US))
        .with_frame_rate(1.0);
    push_video(&camera, bgr);
    engine.finalize().unwrap();

    let file = validate_mkv(&path).unwrap();
    let video = file.tracks_of_type(TRACK_TYPE_VIDEO)[0];
    assert_eq!(video.codec_id, "V_UNCOMPRESSED");
    assert_eq!((video.width, video.height), (16, 16));

    let blocks = file.blocks_for(video.number);
    let timestamps: Vec<i64> = blocks.iter().map(|b| b.timestamp_ms).collect();
    assert_eq!(timestamps, vec![0, 1000, 2000, 3000, 4000]);
    assert!(blocks.iter().all(|b| b.size == 16 * 16 * 3), "{:?}", blocks);
}

#[test]
fn audio_and_video_are_muxed_together() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("both.mkv");
    let config = RecorderConfig::default();
    let (mut engine, _events) = engine_for(&path, mjpeg_settings(), &config, CodecRegistry::with_builtin());

    let format = AudioFormat::new(SampleFormat::S16, 48_000, ChannelLayout::STEREO);
    let mic = PushAudioSource::new("mic", Some(format));
    let camera = one_fps_source();
    engine.initialize(audio_sources(&mic), video_sources(&camera)).unwrap();
    engine.start().unwrap();

    for second in 0..2i64 {
        push_video(&camera, solid_frame(second * SECOND_US, 100));
        for chunk in 0..10i64 {
            let start = second * SECOND_US + chunk * 100_000;
            wait_until(|| mic.can_push());
            assert!(mic.push(RawAudioBuffer::new(vec![0u8; 4800 * 4], format, start)));
        }
    }
    engine.finalize().unwrap();

    let file = validate_mkv(&path).unwrap();
    assert_eq!(file.tracks.len(), 2);
    let audio = file.tracks_of_type(TRACK_TYPE_AUDIO)[0].number;
    let video = file.tracks_of_type(TRACK_TYPE_VIDEO)[0].number;
    assert_eq!(file.blocks_for(video).len(), 2);
    let audio_bytes: usize = file.blocks_for(audio).iter().map(|b| b.size).sum();
    assert_eq!(audio_bytes, 2 * 48_000 * 4);

    // Blocks are written in decoding order across tracks
    let mut previous = i64::MIN;
    for block in &file.blocks {
        assert!(block.timestamp_ms >= previous, "{:?}", file.blocks);
        previous = block.timestamp_ms;
    }
    assert!((1990.0..=2010.0).contains(&file.duration_ms), "{}", file.duration_ms);
}

#[test]
fn source_without_format_takes_it_from_its_first_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("first_frame_format.mkv");
    let config = RecorderConfig::default();
    let (mut engine, _events) = engine_for(&path, mjpeg_settings(), &config, CodecRegistry::with_builtin());

    let camera = PushVideoSource::new("camera", None);
    engine.initialize(Vec::new(), video_sources(&camera)).unwrap();
    assert!(camera.push(solid_frame(0, 10)));
    // Only the first frame is held until the encoder exists
    assert!(!camera.push(solid_frame(SECOND_US, 10)));
    engine.start().unwrap();
    push_video(&camera, solid_frame(2 * SECOND_US, 10));
    engine.finalize().unwrap();

    let file = validate_mkv(&path).unwrap();
    let track = file.tracks_of_type(TRACK_TYPE_VIDEO)[0].number;
    let timestamps: Vec<i64> = file.blocks_for(track).iter().map(|b| b.timestamp_ms).collect();
    assert_eq!(timestamps, vec![0, 2000]);
}

#[test]
fn auto_stop_fires_once_all_sources_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auto.mkv");
    let config = RecorderConfig::default();
    let (mut engine, events) = engine_for(&path, mjpeg_settings(), &config, CodecRegistry::with_builtin());

    let format = AudioFormat::new(SampleFormat::S16, 48_000, ChannelLayout::MONO);
    let mic = PushAudioSource::new("mic", Some(format));
    let camera = one_fps_source();
    engine.initialize(audio_sources(&mic), video_sources(&camera)).unwrap();
    engine.start().unwrap();
    engine.set_auto_stop(true);

    push_video(&camera, solid_frame(0, 10));
    camera.finish();
    assert!(!events.try_iter().any(|e| e == RecorderEvent::AutoStopped));

    mic.finish();
    assert!(events.try_iter().any(|e| e == RecorderEvent::AutoStopped));
    engine.finalize().unwrap();
    assert!(!events.try_iter().any(|e| e == RecorderEvent::AutoStopped));
}

// ── Misbehaving encoders ─────────────────────────────────────────────

/// An H.264 stand-in whose packets carry whatever dts `skew` computes from
/// the pts and one frame interval
struct SkewedDtsFactory {
    descriptor: VideoCodecDescriptor,
    skew: fn(i64, i64) -> i64,
    delay: Duration,
}

impl SkewedDtsFactory {
    fn new(skew: fn(i64, i64) -> i64) -> Self {
        Self {
            descriptor: VideoCodecDescriptor::new("skewed_h264", VideoCodec::H264, vec![PixelFormat::Rgb24]),
            skew,
            delay: Duration::ZERO,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct SkewedDtsEncoder {
    skew: fn(i64, i64) -> i64,
    delay: Duration,
    interval: i64,
    time_base: Rational,
    packets: VecDeque<CompressedPacket>,
    draining: bool,
}

impl VideoEncoderFactory for SkewedDtsFactory {
    fn descriptor(&self) -> &VideoCodecDescriptor {
        &self.descriptor
    }

    fn open(&self, config: &VideoEncoderConfig) -> Result<VideoEncoderContext, CodecError> {
        Ok(Box::new(SkewedDtsEncoder {
            skew: self.skew,
            delay: self.delay,
            interval: Rational::rescale(1, config.frame_rate.inverse(), config.time_base),
            time_base: config.time_base,
            packets: VecDeque::new(),
            draining: false,
        }))
    }
}

impl EncoderContext<EncoderVideoFrame> for SkewedDtsEncoder {
    fn send_frame(&mut self, frame: Option<EncoderVideoFrame>) -> Result<(), CodecError> {
        let Some(frame) = frame else {
            self.draining = true;
            return Ok(());
        };
        thread::sleep(self.delay);
        let mut packet = CompressedPacket::new(vec![0, 0, 0, 1, 0x65], frame.pts, self.time_base);
        packet.dts = Some((self.skew)(frame.pts, self.interval));
        self.packets.push_back(packet);
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<CompressedPacket, CodecError> {
        match self.packets.pop_front() {
            Some(packet) => Ok(packet),
            None if self.draining => Err(CodecError::Eof),
            None => Err(CodecError::Again),
        }
    }
}

fn skewed_settings() -> EncoderSettings {
    let mut settings = mjpeg_settings();
    settings.video_codec = Some(VideoCodec::H264);
    settings
}

#[test]
fn dts_ahead_of_pts_is_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ahead.mkv");
    let config = RecorderConfig::default();
    let mut registry = CodecRegistry::new();
    registry.register_video(SkewedDtsFactory::new(|pts, interval| pts + interval));
    let (mut engine, events) = engine_for(&path, skewed_settings(), &config, registry);

    let camera = one_fps_source();
    engine.initialize(Vec::new(), video_sources(&camera)).unwrap();
    engine.start().unwrap();
    for i in 0..4 {
        push_video(&camera, solid_frame(i * SECOND_US, 0));
    }
    engine.finalize().unwrap();

    assert!(!events.try_iter().any(|e| matches!(e, RecorderEvent::SessionError { .. })));
    let file = validate_mkv(&path).unwrap();
    let track = file.tracks_of_type(TRACK_TYPE_VIDEO)[0].number;
    let timestamps: Vec<i64> = file.blocks_for(track).iter().map(|b| b.timestamp_ms).collect();
    assert_eq!(timestamps, vec![0, 1000, 2000, 3000]);
}

#[test]
fn unrepairable_dts_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backwards.mkv");
    let mut config = RecorderConfig::default();
    config.max_dts_repair_drops = 2;
    let mut registry = CodecRegistry::new();
    registry.register_video(SkewedDtsFactory::new(|pts, _| -pts));
    let (mut engine, events) = engine_for(&path, skewed_settings(), &config, registry);

    let camera = one_fps_source();
    engine.initialize(Vec::new(), video_sources(&camera)).unwrap();
    engine.start().unwrap();
    for i in 0..5 {
        push_video(&camera, solid_frame(i * SECOND_US, 0));
    }
    engine.finalize().unwrap();

    let events: Vec<_> = events.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        RecorderEvent::SessionError {
            kind: RecorderErrorKind::FormatError,
            ..
        }
    )));
    assert_eq!(events.last(), Some(&RecorderEvent::FinalizationDone));

    // The first packet made it out before the stream failed
    let file = validate_mkv(&path).unwrap();
    let track = file.tracks_of_type(TRACK_TYPE_VIDEO)[0].number;
    assert_eq!(file.blocks_for(track).len(), 1);
}

#[test]
fn frames_beyond_the_queue_bound_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slow.mkv");
    let mut config = RecorderConfig::default();
    config.max_video_queue_frames = 2;
    let mut registry = CodecRegistry::new();
    registry.register_video(SkewedDtsFactory::new(|pts, _| pts).slow(Duration::from_millis(50)));
    let (mut engine, _events) = engine_for(&path, skewed_settings(), &config, registry);

    let camera = one_fps_source();
    engine.initialize(Vec::new(), video_sources(&camera)).unwrap();
    engine.start().unwrap();

    let started = Instant::now();
    let accepted = (0..20i64)
        .filter(|i| camera.push(solid_frame(i * SECOND_US, 0)))
        .count();
    // Pushing never waits on the encoder
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(accepted < 20, "all {} frames accepted", accepted);
    assert!(accepted >= 2);
    engine.finalize().unwrap();

    let file = validate_mkv(&path).unwrap();
    let track = file.tracks_of_type(TRACK_TYPE_VIDEO)[0].number;
    assert_eq!(file.blocks_for(track).len(), accepted);
}
