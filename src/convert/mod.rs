// Frame and sample conversion between capture sources and encoders

pub mod audio;
#[cfg(feature = "gstreamer")]
pub mod gst_scale;
pub mod scale;
pub mod video;

use thiserror::Error;

use crate::media::{HwAccelError, PixelFormat};

pub use audio::{AudioResampler, SampleFifo};
pub use scale::Scaler;
pub use video::{FrameLayout, VideoConverter};

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(PixelFormat),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid audio format: {0}")]
    InvalidAudioFormat(String),

    #[error("Target format {0} needs a hardware accelerator")]
    MissingHwAccel(PixelFormat),

    #[error("Conversion pipeline error: {0}")]
    Pipeline(String),

    #[error("Resampler error: {0}")]
    Resampler(String),

    #[error("JPEG decode error: {0}")]
    Jpeg(#[from] image::ImageError),

    #[error("Hardware upload failed: {0}")]
    HwAccel(#[from] HwAccelError),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
