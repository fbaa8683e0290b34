//! mediarec - records a synthetic test tone and color bars into a file
//!
//! Usage:
//!   mediarec [OPTIONS]
//!
//! Options:
//!   --config <path>     Config file (default: platform config dir)
//!   --output <path>     Output file (default: timestamped file in output_dir)
//!   --duration <secs>   Recording length (default: 5)
//!   --video <codec>     Video codec, as spelled in the config file (e.g. mjpeg)
//!   --audio <codec>     Audio codec, as spelled in the config file
//!   --no-video          Record audio only
//!   --pause <secs>      Pause for this long in the middle of the recording

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;

use mediarec_lib::config::{default_config_path, RecorderConfig};
use mediarec_lib::container::create_writer;
use mediarec_lib::encoding::{CodecRegistry, VideoCodec};
use mediarec_lib::media::{
    AudioFormat, ChannelLayout, PixelFormat, RawAudioBuffer, RawVideoFrame, SampleFormat, Size,
    VideoFrameFormat,
};
use mediarec_lib::recording::{PushAudioSource, PushVideoSource, RecorderEvent, RecordingEngine};

const SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHUNK_MS: u64 = 10;
const TONE_HZ: f32 = 440.0;
const FRAME_SIZE: Size = Size::new(640, 360);
const FPS: f64 = 30.0;
const DEFAULT_DURATION_SECS: f64 = 5.0;

fn arg_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Parses a codec name the way the config file spells it
fn parse_codec<T: DeserializeOwned>(name: &str) -> anyhow::Result<T> {
    toml::Value::String(name.to_lowercase())
        .try_into()
        .map_err(|_| anyhow!("Unknown codec '{}'", name))
}

fn main() -> anyhow::Result<()> {
    mediarec_lib::init_logging();

    let args: Vec<String> = std::env::args().collect();
    let config_path = arg_value(&args, "--config")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = RecorderConfig::load_or_default(&config_path);

    let mut settings = config.encoder.clone();
    if let Some(name) = arg_value(&args, "--audio") {
        settings.audio_codec = parse_codec(name)?;
    }
    if let Some(name) = arg_value(&args, "--video") {
        settings.video_codec = Some(parse_codec(name)?);
    }
    let with_video = !args.iter().any(|a| a == "--no-video");
    if !with_video {
        settings.video_codec = None;
    } else if settings.video_codec.is_none() {
        settings.video_codec = Some(VideoCodec::Mjpeg);
    }

    let duration = Duration::from_secs_f64(
        arg_value(&args, "--duration")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DURATION_SECS),
    );
    let pause = arg_value(&args, "--pause")
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs_f64);

    let output_path = arg_value(&args, "--output")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.output_path_for_now());
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    #[cfg(feature = "gstreamer")]
    let registry = CodecRegistry::with_gstreamer();
    #[cfg(not(feature = "gstreamer"))]
    let registry = CodecRegistry::with_builtin();
    log::info!("{:?}", registry);

    let writer = create_writer(&output_path, settings.container, config.max_interleave_delta_ms)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;

    let (mut engine, events) =
        RecordingEngine::new(settings, &config, writer, std::sync::Arc::new(registry));

    let reporter = thread::Builder::new()
        .name("mediarec-events".into())
        .spawn(move || {
            for event in events {
                match event {
                    RecorderEvent::DurationChanged(ms) if ms % 1000 < 34 => {
                        println!("  {:.1}s recorded", ms as f64 / 1000.0)
                    }
                    RecorderEvent::DurationChanged(_) => {}
                    RecorderEvent::FinalizationDone => {
                        println!("  Finalized");
                        break;
                    }
                    other => println!("  {:?}", other),
                }
            }
        })?;

    let audio_format = AudioFormat::new(SampleFormat::S16, SAMPLE_RATE, ChannelLayout::STEREO);
    let audio = PushAudioSource::new("test tone", Some(audio_format));
    let video = PushVideoSource::new(
        "color bars",
        Some(VideoFrameFormat::new(PixelFormat::Rgb24, FRAME_SIZE).with_frame_rate(FPS)),
    );

    let video_sources: Vec<Box<dyn mediarec_lib::recording::VideoSource>> = if with_video {
        vec![Box::new(video.clone())]
    } else {
        Vec::new()
    };
    engine.initialize(vec![Box::new(audio.clone())], video_sources)?;
    engine.start()?;

    println!("Recording to {}", output_path.display());
    generate(&engine, &audio, with_video.then_some(&video), duration, pause);

    audio.finish();
    video.finish();
    let result = engine.finalize();
    let _ = reporter.join();
    result?;

    println!("Wrote {} ms to {}", engine.duration_ms(), output_path.display());
    Ok(())
}

/// Feeds both sources in real time. Capture timestamps keep running while
/// paused, as a real clock would.
fn generate(
    engine: &RecordingEngine,
    audio: &PushAudioSource,
    video: Option<&PushVideoSource>,
    duration: Duration,
    pause: Option<Duration>,
) {
    let start = Instant::now();
    let pause_at = duration / 2;
    let mut paused = false;
    let mut audio_sent = Duration::ZERO;
    let mut frames_sent = 0u64;
    let frame_interval = Duration::from_secs_f64(1.0 / FPS);
    let mut phase = 0.0f32;

    while start.elapsed() < duration + pause.unwrap_or_default() {
        let now = start.elapsed();

        if let Some(pause) = pause {
            let in_pause = now >= pause_at && now < pause_at + pause;
            if in_pause != paused {
                paused = in_pause;
                engine.set_paused(paused);
            }
        }

        while audio_sent <= now {
            let chunk = tone_chunk(&mut phase);
            audio.push(RawAudioBuffer::new(
                chunk,
                AudioFormat::new(SampleFormat::S16, SAMPLE_RATE, ChannelLayout::STEREO),
                audio_sent.as_micros() as i64,
            ));
            audio_sent += Duration::from_millis(AUDIO_CHUNK_MS);
        }

        if let Some(video) = video {
            while frame_interval * frames_sent as u32 <= now {
                let start_us = (frame_interval * frames_sent as u32).as_micros() as i64;
                let frame = RawVideoFrame::from_memory(PixelFormat::Rgb24, FRAME_SIZE, color_bars(frames_sent))
                    .with_times(Some(start_us), Some(start_us + frame_interval.as_micros() as i64))
                    .with_frame_rate(FPS);
                video.push(frame);
                frames_sent += 1;
            }
        }

        thread::sleep(Duration::from_millis(5));
    }
}

fn tone_chunk(phase: &mut f32) -> Vec<u8> {
    let frames = (SAMPLE_RATE as u64 * AUDIO_CHUNK_MS / 1000) as usize;
    let step = TONE_HZ * std::f32::consts::TAU / SAMPLE_RATE as f32;
    let mut data = Vec::with_capacity(frames * 4);
    for _ in 0..frames {
        let sample = (phase.sin() * 8000.0) as i16;
        data.extend_from_slice(&sample.to_le_bytes());
        data.extend_from_slice(&sample.to_le_bytes());
        *phase = (*phase + step) % std::f32::consts::TAU;
    }
    data
}

/// Classic eight bars, shifted by one pixel per frame
fn color_bars(frame_index: u64) -> Vec<u8> {
    const BARS: [[u8; 3]; 8] = [
        [235, 235, 235],
        [235, 235, 16],
        [16, 235, 235],
        [16, 235, 16],
        [235, 16, 235],
        [235, 16, 16],
        [16, 16, 235],
        [16, 16, 16],
    ];
    let width = FRAME_SIZE.width as usize;
    let height = FRAME_SIZE.height as usize;
    let mut data = Vec::with_capacity(width * height * 3);
    for _ in 0..height {
        for x in 0..width {
            let shifted = (x + frame_index as usize) % width;
            data.extend_from_slice(&BARS[shifted * BARS.len() / width]);
        }
    }
    data
}
