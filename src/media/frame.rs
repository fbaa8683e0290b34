//! Raw buffers flowing into the encoders and compressed packets flowing out

use std::sync::Arc;

use super::format::{AudioFormat, PixelFormat, Rational, Size};
use super::hwaccel::HwSurface;

/// A buffer of interleaved audio samples
#[derive(Debug, Clone)]
pub struct RawAudioBuffer {
    pub data: Vec<u8>,
    pub format: AudioFormat,
    /// Presentation time of the first sample, in microseconds
    pub start_time: i64,
}

impl RawAudioBuffer {
    pub fn new(data: Vec<u8>, format: AudioFormat, start_time: i64) -> Self {
        Self {
            data,
            format,
            start_time,
        }
    }

    /// Number of sample frames (one sample for every channel)
    pub fn frame_count(&self) -> usize {
        self.format.frames_for_bytes(self.data.len())
    }

    pub fn duration_us(&self) -> i64 {
        self.format.duration_us_for_frames(self.frame_count() as u64)
    }

    pub fn is_valid(&self) -> bool {
        self.format.is_valid()
    }
}

/// Storage behind a video frame
#[derive(Debug, Clone)]
pub enum FrameBuffer {
    /// Tightly packed planes in system memory (or the JPEG bitstream)
    Memory(Arc<[u8]>),
    /// A surface owned by a hardware accelerator pool
    Surface(HwSurface),
}

impl FrameBuffer {
    pub fn memory(&self) -> Option<&Arc<[u8]>> {
        match self {
            FrameBuffer::Memory(data) => Some(data),
            FrameBuffer::Surface(_) => None,
        }
    }
}

/// A raw (or JPEG-compressed) video frame
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub buffer: FrameBuffer,
    pub format: PixelFormat,
    pub size: Size,
    /// Start time in microseconds, if the source stamped it
    pub start_time: Option<i64>,
    /// End time in microseconds, if the source stamped it
    pub end_time: Option<i64>,
    /// Stream frame rate reported by the source
    pub frame_rate: Option<f64>,
}

impl RawVideoFrame {
    pub fn from_memory(format: PixelFormat, size: Size, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            buffer: FrameBuffer::Memory(data.into()),
            format,
            size,
            start_time: None,
            end_time: None,
            frame_rate: None,
        }
    }

    pub fn from_surface(surface: HwSurface) -> Self {
        Self {
            format: surface.device().pixel_format(),
            size: surface.size(),
            buffer: FrameBuffer::Surface(surface),
            start_time: None,
            end_time: None,
            frame_rate: None,
        }
    }

    pub fn with_times(mut self, start_time: Option<i64>, end_time: Option<i64>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    /// Layout of the frame content: the surface's software format for
    /// hardware frames, the frame format otherwise.
    pub fn sw_format(&self) -> PixelFormat {
        match &self.buffer {
            FrameBuffer::Surface(surface) => surface.sw_format(),
            FrameBuffer::Memory(_) => self.format,
        }
    }

    pub fn is_valid(&self) -> bool {
        if self.size.is_empty() {
            return false;
        }
        match &self.buffer {
            FrameBuffer::Surface(_) => true,
            FrameBuffer::Memory(data) if self.format.is_compressed() => !data.is_empty(),
            FrameBuffer::Memory(data) => self
                .format
                .frame_size(self.size)
                .is_some_and(|expected| data.len() >= expected),
        }
    }
}

/// One encoded access unit
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedPacket {
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Duration in `time_base` units, 0 when unknown
    pub duration: i64,
    pub time_base: Rational,
    pub stream_index: usize,
    pub key_frame: bool,
    /// Codec private data that became known after the encoder was opened
    pub new_extradata: Option<Vec<u8>>,
}

impl CompressedPacket {
    pub fn new(data: Vec<u8>, pts: i64, time_base: Rational) -> Self {
        Self {
            data,
            pts: Some(pts),
            dts: Some(pts),
            duration: 0,
            time_base,
            stream_index: 0,
            key_frame: true,
            new_extradata: None,
        }
    }

    /// Presentation time rescaled to milliseconds
    pub fn pts_ms(&self) -> Option<i64> {
        self.pts
            .map(|pts| Rational::rescale(pts, self.time_base, Rational::MILLIS))
    }

    pub fn dts_or_pts(&self) -> Option<i64> {
        self.dts.or(self.pts)
    }
}
