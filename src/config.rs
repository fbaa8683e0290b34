// Configuration management for mediarec

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::encoding::{AudioCodec, ContainerFormat, VideoCodec};
use crate::media::Size;

/// Quality level requested for a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl Quality {
    pub const ALL: &'static [Quality] = &[
        Quality::VeryLow,
        Quality::Low,
        Quality::Normal,
        Quality::High,
        Quality::VeryHigh,
    ];

    /// Position in quality tables (0 = very low, 4 = very high)
    pub fn index(&self) -> usize {
        match self {
            Quality::VeryLow => 0,
            Quality::Low => 1,
            Quality::Normal => 2,
            Quality::High => 3,
            Quality::VeryHigh => 4,
        }
    }
}

/// Rate control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncodingMode {
    #[default]
    ConstantQuality,
    ConstantBitRate,
    AverageBitRate,
    /// Treated as average bit rate; live recording cannot make two passes
    TwoPass,
}

impl EncodingMode {
    /// Whether the encoder is driven by a target bit rate
    pub fn uses_bit_rate(&self) -> bool {
        !matches!(self, EncodingMode::ConstantQuality)
    }
}

/// What to produce and how hard to try.
///
/// Per-stream copies get the source resolution and frame rate filled in
/// when the request leaves them open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    #[serde(default)]
    pub audio_codec: AudioCodec,

    /// `None` records audio only
    #[serde(default)]
    pub video_codec: Option<VideoCodec>,

    #[serde(default)]
    pub container: ContainerFormat,

    #[serde(default)]
    pub encoding_mode: EncodingMode,

    #[serde(default)]
    pub quality: Quality,

    /// Output resolution; the source resolution when unset
    #[serde(default)]
    pub video_resolution: Option<Size>,

    /// Output frame rate; the source frame rate when unset
    #[serde(default)]
    pub video_frame_rate: Option<f64>,

    /// Target video bit rate in bits per second (bit rate modes)
    #[serde(default)]
    pub video_bit_rate: Option<u64>,

    /// Target audio bit rate in bits per second (bit rate modes)
    #[serde(default)]
    pub audio_bit_rate: Option<u64>,

    #[serde(default)]
    pub audio_sample_rate: Option<u32>,

    #[serde(default)]
    pub audio_channel_count: Option<u32>,

    /// Prefer hardware encoders when a device is available
    #[serde(default = "default_true")]
    pub hardware_acceleration: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            audio_codec: AudioCodec::default(),
            video_codec: None,
            container: ContainerFormat::default(),
            encoding_mode: EncodingMode::default(),
            quality: Quality::default(),
            video_resolution: None,
            video_frame_rate: None,
            video_bit_rate: None,
            audio_bit_rate: None,
            audio_sample_rate: None,
            audio_channel_count: None,
            hardware_acceleration: true,
        }
    }
}

/// Recorder configuration: encoder settings plus pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Directory recordings are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub encoder: EncoderSettings,

    /// Frames a video encoder may queue before new frames are dropped
    #[serde(default = "default_max_video_queue_frames")]
    pub max_video_queue_frames: usize,

    /// Queued audio (in milliseconds) above which producers are asked to
    /// hold back
    #[serde(default = "default_max_audio_queue_ms")]
    pub max_audio_queue_ms: u64,

    /// How long initialization waits for sources to deliver a first buffer
    #[serde(default = "default_format_wait_timeout_ms")]
    pub format_wait_timeout_ms: u64,

    /// Consecutive packets the DTS repair may drop before the stream fails
    #[serde(default = "default_max_dts_repair_drops")]
    pub max_dts_repair_drops: u32,

    /// Largest DTS spread between streams the container buffers before
    /// writing out packets regardless
    #[serde(default = "default_max_interleave_delta_ms")]
    pub max_interleave_delta_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            encoder: EncoderSettings::default(),
            max_video_queue_frames: default_max_video_queue_frames(),
            max_audio_queue_ms: default_max_audio_queue_ms(),
            format_wait_timeout_ms: default_format_wait_timeout_ms(),
            max_dts_repair_drops: default_max_dts_repair_drops(),
            max_interleave_delta_ms: default_max_interleave_delta_ms(),
        }
    }
}

impl RecorderConfig {
    /// Load config from `path`, failing on unreadable or malformed files
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// File name for a recording started now, inside `output_dir`
    pub fn output_path_for_now(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        self.output_dir.join(format!(
            "recording_{}.{}",
            stamp,
            self.encoder.container.extension()
        ))
    }
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mediarec")
        .join("config.toml")
}

/// Get the default storage path for recordings
fn default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mediarec")
}

fn default_max_video_queue_frames() -> usize {
    10
}

fn default_max_audio_queue_ms() -> u64 {
    5_000
}

fn default_format_wait_timeout_ms() -> u64 {
    5_000
}

fn default_max_dts_repair_drops() -> u32 {
    16
}

fn default_max_interleave_delta_ms() -> u64 {
    10_000
}

/// Default true value (for serde)
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: RecorderConfig = toml::from_str(
            r#"
            max_video_queue_frames = 4

            [encoder]
            video_codec = "mjpeg"
            quality = "very_high"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_video_queue_frames, 4);
        assert_eq!(config.max_dts_repair_drops, 16);
        assert_eq!(config.encoder.video_codec, Some(VideoCodec::Mjpeg));
        assert_eq!(config.encoder.quality, Quality::VeryHigh);
        assert!(config.encoder.hardware_acceleration);
    }

    #[test]
    fn save_then_load_keeps_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = RecorderConfig::default();
        config.encoder.encoding_mode = EncodingMode::ConstantBitRate;
        config.encoder.video_resolution = Some(Size::new(640, 480));
        config.save(&path).unwrap();

        let loaded = RecorderConfig::load(&path).unwrap();
        assert_eq!(loaded.encoder, config.encoder);
        assert_eq!(loaded.output_dir, config.output_dir);
    }

    #[test]
    fn malformed_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_video_queue_frames = \"many\"").unwrap();

        let config = RecorderConfig::load_or_default(&path);
        assert_eq!(config.max_video_queue_frames, 10);
    }
}
