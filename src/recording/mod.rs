// Recording modules: encoder threads, muxer thread and the engine that
// wires capture sources to them

pub mod audio;
pub mod engine;
pub mod muxer;
pub mod source;
pub mod timeline;
pub mod video;

pub use audio::{AudioEncoder, AudioEncoderInput};
pub use engine::{EngineState, RecordingEngine};
pub use muxer::Muxer;
pub use source::{AudioInput, AudioSource, PushAudioSource, PushVideoSource, VideoInput, VideoSource};
pub use timeline::RecordingTimeline;
pub use video::{
    infer_frame_rate, DtsRepair, DtsVerdict, VideoEncoder, VideoEncoderInput, VideoEncoderLimits,
    VideoFrameEncoder, VideoSourceParams,
};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::container::ContainerError;
use crate::convert::ConvertError;
use crate::encoding::CodecError;
use crate::media::HwAccelError;
use crate::negotiation::NegotiationError;

/// Category of a recording failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderErrorKind {
    /// No encoder or device could be used
    ResourceError,
    /// The output file could not be written
    FormatError,
}

impl fmt::Display for RecorderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderErrorKind::ResourceError => write!(f, "resource error"),
            RecorderErrorKind::FormatError => write!(f, "format error"),
        }
    }
}

/// Errors raised while setting up or running one encoder stream
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),

    #[error("Hardware device error: {0}")]
    HwAccel(#[from] HwAccelError),

    #[error("No encoder available: {0}")]
    NoEncoder(String),

    #[error("Invalid source format: {0}")]
    InvalidSource(String),

    #[error("Thread error: {0}")]
    Thread(String),
}

/// Errors returned by the engine's control calls. Each is also reported as
/// a [`RecorderEvent`].
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("{kind}: {message}")]
    Session { kind: RecorderErrorKind, message: String },

    #[error("Invalid engine state: {0:?}")]
    InvalidState(EngineState),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),
}

pub type Result<T> = std::result::Result<T, RecordingError>;

/// Notifications emitted by a recording session
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    /// Largest timestamp written so far, in milliseconds
    DurationChanged(i64),
    /// The session failed and cannot continue
    SessionError { kind: RecorderErrorKind, message: String },
    /// One stream could not be set up; the others keep recording
    StreamInitializationError { kind: RecorderErrorKind, message: String },
    /// Every source reported end of stream while auto stop was enabled
    AutoStopped,
    /// Output closed; always the last event of a session
    FinalizationDone,
}

/// Messages consumed by an encoder thread
pub(crate) enum EncoderMessage<T> {
    Frame(T),
    Finish,
}
