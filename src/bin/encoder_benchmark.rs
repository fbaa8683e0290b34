//! Encoder benchmark
//!
//! Pushes synthetic NV12 frames through the full recording pipeline (source,
//! conversion, encoder thread, muxer) as fast as the encoder accepts them,
//! once per registered video codec and with hardware acceleration on and off.
//!
//! Usage:
//!   cargo run --features tempfile --bin encoder_benchmark [-- [OPTIONS]]
//!
//! Options:
//!   --codec <filter>    Only benchmark codecs whose name contains <filter>
//!   --frames <count>    Frames per run (default: 300)
//!   --verbose           Extra debug output

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mediarec_lib::config::RecorderConfig;
use mediarec_lib::container::create_writer;
use mediarec_lib::encoding::{CodecRegistry, VideoCodec};
use mediarec_lib::media::{PixelFormat, RawVideoFrame, Size, VideoFrameFormat};
use mediarec_lib::recording::{PushVideoSource, RecorderEvent, RecordingEngine};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const FPS: f64 = 30.0;
const DEFAULT_FRAMES: u32 = 300;

/// Result for a single benchmark run
struct BenchmarkResult {
    codec: VideoCodec,
    hardware: bool,
    frames_pushed: u32,
    encoding_duration: Duration,
    file_size: u64,
    duration_ms: i64,
    error: Option<String>,
}

impl BenchmarkResult {
    fn failed(codec: VideoCodec, hardware: bool, error: String) -> Self {
        Self {
            codec,
            hardware,
            frames_pushed: 0,
            encoding_duration: Duration::ZERO,
            file_size: 0,
            duration_ms: 0,
            error: Some(error),
        }
    }

    fn content_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames_pushed as f64 / FPS)
    }

    fn average_fps(&self) -> f64 {
        let secs = self.encoding_duration.as_secs_f64();
        if secs > 0.0 {
            self.frames_pushed as f64 / secs
        } else {
            0.0
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let verbose = args.iter().any(|a| a == "--verbose");
    let frame_count = args
        .iter()
        .position(|a| a == "--frames")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(DEFAULT_FRAMES);
    let codec_filter = args
        .iter()
        .position(|a| a == "--codec")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let log_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    println!("\n=== Encoder Benchmark ===\n");
    println!("  Resolution: {}x{} NV12 @ {:.0} fps", WIDTH, HEIGHT, FPS);
    println!("  Frames:     {} per run", frame_count);
    if let Some(ref filter) = codec_filter {
        println!("  Filter:     codec contains '{}'", filter);
    }
    println!();

    #[cfg(feature = "gstreamer")]
    let registry = CodecRegistry::with_gstreamer();
    #[cfg(not(feature = "gstreamer"))]
    let registry = CodecRegistry::with_builtin();
    let registry = Arc::new(registry);

    println!("  Discovering encoders...\n");
    let mut runs: Vec<(VideoCodec, bool)> = Vec::new();
    for &codec in VideoCodec::ALL {
        if let Some(ref filter) = codec_filter {
            if !codec.display_name().to_lowercase().contains(&filter.to_lowercase()) {
                continue;
            }
        }
        let mut has_hardware = false;
        let mut has_software = false;
        for factory in registry.video_encoders(codec) {
            let descriptor = factory.descriptor();
            println!(
                "    Found: {} / {}{}",
                codec.display_name(),
                descriptor.name,
                if descriptor.is_hardware() { " (hardware)" } else { "" },
            );
            if descriptor.is_hardware() {
                has_hardware = true;
            } else {
                has_software = true;
            }
        }
        if has_hardware && !registry.hw_devices().is_empty() {
            runs.push((codec, true));
        }
        if has_software {
            runs.push((codec, false));
        }
    }

    if runs.is_empty() {
        println!("  No encoders found. Check the codec filter.");
        std::process::exit(0);
    }

    println!("\n  Running {} benchmarks...\n", runs.len());

    let mut results = Vec::new();
    for (i, &(codec, hardware)) in runs.iter().enumerate() {
        println!(
            "  [{}/{}] {} ({})...",
            i + 1,
            runs.len(),
            codec.display_name(),
            if hardware { "hardware" } else { "software" },
        );

        let result = run_benchmark(&registry, codec, hardware, frame_count, verbose);
        match &result.error {
            Some(err) => println!("  [{}/{}] FAILED: {}\n", i + 1, runs.len(), err),
            None => println!(
                "  [{}/{}] {} frames, {:.1} fps, {:.2}x realtime, {}\n",
                i + 1,
                runs.len(),
                result.frames_pushed,
                result.average_fps(),
                realtime_multiplier(&result),
                format_size(result.file_size),
            ),
        }
        results.push(result);
    }

    print_summary(&results);
}

/// Generate a single NV12 frame with gradient pattern and per-frame variation.
///
/// NV12 layout: W*H bytes of Y plane, then W*H/2 bytes of interleaved UV plane.
/// The gradient provides spatial correlation, and frame_index adds temporal
/// variation so successive frames differ.
fn generate_nv12_frame(width: u32, height: u32, frame_index: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_size = w * h / 2;
    let mut data = vec![0u8; y_size + uv_size];

    let phase = (frame_index as f64 * 0.05).sin() * 30.0;
    for row in 0..h {
        for col in 0..w {
            let horiz = col as f64 / w as f64 * 200.0;
            let vert = row as f64 / h as f64 * 55.0;
            data[row * w + col] = (horiz + vert + phase).clamp(0.0, 255.0) as u8;
        }
    }

    let uv_phase = (frame_index as f64 * 0.02).cos() * 20.0;
    let uv_h = h / 2;
    for row in 0..uv_h {
        for col in (0..w).step_by(2) {
            let u = (128.0 + (col as f64 / w as f64 * 40.0) + uv_phase).clamp(0.0, 255.0) as u8;
            let v = (128.0 + (row as f64 / uv_h as f64 * 40.0) - uv_phase).clamp(0.0, 255.0) as u8;
            data[y_size + row * w + col] = u;
            data[y_size + row * w + col + 1] = v;
        }
    }

    data
}

/// Run a single encoder benchmark
fn run_benchmark(
    registry: &Arc<CodecRegistry>,
    codec: VideoCodec,
    hardware: bool,
    frame_count: u32,
    verbose: bool,
) -> BenchmarkResult {
    let temp_dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => return BenchmarkResult::failed(codec, hardware, format!("Failed to create temp dir: {}", e)),
    };

    let config = RecorderConfig::default();
    let mut settings = config.encoder.clone();
    settings.video_codec = Some(codec);
    settings.hardware_acceleration = hardware;
    if !settings.container.supports_video(codec) {
        return BenchmarkResult::failed(codec, hardware, format!("{:?} cannot hold this codec", settings.container));
    }

    let output_path = temp_dir.path().join(format!("bench.{}", settings.container.extension()));
    let writer = match create_writer(&output_path, settings.container, config.max_interleave_delta_ms) {
        Ok(w) => w,
        Err(e) => return BenchmarkResult::failed(codec, hardware, format!("Failed to create output: {}", e)),
    };

    let size = Size::new(WIDTH, HEIGHT);
    let source = PushVideoSource::new(
        "benchmark",
        Some(VideoFrameFormat::new(PixelFormat::Nv12, size).with_frame_rate(FPS)),
    );

    let (mut engine, events) = RecordingEngine::new(settings, &config, writer, Arc::clone(registry));
    let setup = engine
        .initialize(Vec::new(), vec![Box::new(source.clone())])
        .and_then(|_| engine.start());
    if let Err(e) = setup {
        let _ = engine.finalize();
        return BenchmarkResult::failed(codec, hardware, format!("Engine start failed: {}", e));
    }

    // Frames are generated up front so the timing covers encoding only
    let frames: Vec<Vec<u8>> = (0..frame_count.min(60))
        .map(|i| generate_nv12_frame(WIDTH, HEIGHT, i))
        .collect();
    let frame_duration_us = (1_000_000.0 / FPS) as i64;

    let started = Instant::now();
    let mut frames_pushed = 0u32;
    while frames_pushed < frame_count {
        while !source.can_push() {
            thread::sleep(Duration::from_millis(1));
        }
        let start_us = frames_pushed as i64 * frame_duration_us;
        let data = frames[frames_pushed as usize % frames.len()].clone();
        let frame = RawVideoFrame::from_memory(PixelFormat::Nv12, size, data)
            .with_times(Some(start_us), Some(start_us + frame_duration_us));
        if source.push(frame) {
            frames_pushed += 1;
        }

        if verbose && frames_pushed % 100 == 0 {
            println!("    {} frames sent", frames_pushed);
        }
    }

    source.finish();
    let finalized = engine.finalize();
    let encoding_duration = started.elapsed();

    let mut error = finalized.err().map(|e| format!("Finalize failed: {}", e));
    for event in events.try_iter() {
        if let RecorderEvent::SessionError { message, .. } | RecorderEvent::StreamInitializationError { message, .. } =
            event
        {
            error.get_or_insert(message);
        }
    }

    let file_size = std::fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);

    BenchmarkResult {
        codec,
        hardware,
        frames_pushed,
        encoding_duration,
        file_size,
        duration_ms: engine.duration_ms(),
        error,
    }
}

fn realtime_multiplier(result: &BenchmarkResult) -> f64 {
    let encoding = result.encoding_duration.as_secs_f64();
    if encoding > 0.0 {
        result.content_duration().as_secs_f64() / encoding
    } else {
        0.0
    }
}

/// Print a summary table of all benchmark results
fn print_summary(results: &[BenchmarkResult]) {
    println!("\n  ╔══════════╤══════════╤════════╤═══════════╤═══════════╤════════════╤═══════════╤══════════╗");
    println!(
        "  ║ {:<8} │ {:<8} │ {:>6} │ {:>9} │ {:>9} │ {:>10} │ {:>9} │ {:>8} ║",
        "Codec", "Mode", "Frames", "FPS", "Realtime", "Size", "Bitrate", "Duration"
    );
    println!("  ╠══════════╪══════════╪════════╪═══════════╪═══════════╪════════════╪═══════════╪══════════╣");

    for result in results {
        let mode = if result.hardware { "hardware" } else { "software" };
        if let Some(ref err) = result.error {
            let err_short = if err.chars().count() > 50 {
                format!("{}...", err.chars().take(47).collect::<String>())
            } else {
                err.clone()
            };
            println!(
                "  ║ {:<8} │ {:<8} │ {:>72} ║",
                result.codec.display_name(),
                mode,
                format!("FAILED: {}", err_short),
            );
            continue;
        }

        let content_secs = result.content_duration().as_secs_f64();
        let bitrate_mbps = if content_secs > 0.0 {
            (result.file_size as f64 * 8.0) / content_secs / 1_000_000.0
        } else {
            0.0
        };
        println!(
            "  ║ {:<8} │ {:<8} │ {:>6} │ {:>7.1}   │ {:>6.2}x   │ {:>10} │ {:>6.1} Mb │ {:>6} ms ║",
            result.codec.display_name(),
            mode,
            result.frames_pushed,
            result.average_fps(),
            realtime_multiplier(result),
            format_size(result.file_size),
            bitrate_mbps,
            result.duration_ms,
        );
    }

    println!("  ╚══════════╧══════════╧════════╧═══════════╧═══════════╧════════════╧═══════════╧══════════╝");
    println!();
}

/// Format a file size in human-readable form
fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
