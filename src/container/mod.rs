// Container writing: stream registration, header, interleaved packets, trailer

#[cfg(feature = "gstreamer")]
pub mod gst_mux;
pub mod matroska;

use std::collections::VecDeque;
use std::path::Path;

use thiserror::Error;

use crate::encoding::{AudioCodec, ContainerFormat, VideoCodec};
use crate::media::{CompressedPacket, PixelFormat, Rational, Size};

#[cfg(feature = "gstreamer")]
pub use gst_mux::GstMuxWriter;
pub use matroska::MatroskaWriter;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header already written")]
    HeaderAlreadyWritten,

    #[error("Header not written yet")]
    HeaderNotWritten,

    #[error("Trailer already written")]
    TrailerAlreadyWritten,

    #[error("No streams registered")]
    NoStreams,

    #[error("Unknown stream index {0}")]
    InvalidStream(usize),

    #[error("{codec} cannot be stored in {container}")]
    UnsupportedCodec { codec: String, container: String },

    #[error("Non monotonically increasing dts in stream {stream}: {dts} after {last}")]
    NonMonotonicDts { stream: usize, dts: i64, last: i64 },

    #[error("Packet in stream {0} has no timestamp")]
    MissingTimestamp(usize),

    #[error("Output already closed")]
    Closed,

    #[error("Muxer pipeline error: {0}")]
    Pipeline(String),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

/// What a stream carries
#[derive(Debug, Clone, PartialEq)]
pub enum StreamKind {
    Video {
        codec: VideoCodec,
        size: Size,
        frame_rate: Option<Rational>,
        /// Layout of uncompressed frames
        pixel_format: Option<PixelFormat>,
    },
    Audio {
        codec: AudioCodec,
        sample_rate: u32,
        channels: u32,
    },
}

impl StreamKind {
    /// Matroska CodecID of the carried codec
    pub fn codec_id(&self) -> &'static str {
        match self {
            StreamKind::Video { codec, .. } => codec.matroska_id(),
            StreamKind::Audio { codec, .. } => codec.matroska_id(),
        }
    }
}

/// Fails for codecs the container cannot hold (WebM takes only a few)
pub(crate) fn ensure_supported(format: ContainerFormat, kind: &StreamKind) -> Result<()> {
    let supported = match kind {
        StreamKind::Video { codec, .. } => format.supports_video(*codec),
        StreamKind::Audio { codec, .. } => format.supports_audio(*codec),
    };
    if supported {
        Ok(())
    } else {
        Err(ContainerError::UnsupportedCodec {
            codec: kind.codec_id().to_string(),
            container: format.doc_type().to_string(),
        })
    }
}

/// Parameters of one output stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    pub kind: StreamKind,
    /// Time base of the packets that will be written to this stream
    pub time_base: Rational,
    /// Codec private data known when the stream is registered
    pub codec_private: Option<Vec<u8>>,
}

impl StreamParams {
    pub fn video(codec: VideoCodec, size: Size, frame_rate: Option<Rational>, time_base: Rational) -> Self {
        Self {
            kind: StreamKind::Video {
                codec,
                size,
                frame_rate,
                pixel_format: None,
            },
            time_base,
            codec_private: None,
        }
    }

    pub fn audio(codec: AudioCodec, sample_rate: u32, channels: u32, time_base: Rational) -> Self {
        Self {
            kind: StreamKind::Audio {
                codec,
                sample_rate,
                channels,
            },
            time_base,
            codec_private: None,
        }
    }

    pub fn with_codec_private(mut self, data: Option<Vec<u8>>) -> Self {
        self.codec_private = data;
        self
    }

    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        if let StreamKind::Video { pixel_format, .. } = &mut self.kind {
            *pixel_format = Some(format);
        }
        self
    }

    pub fn is_video(&self) -> bool {
        matches!(self.kind, StreamKind::Video { .. })
    }
}

/// An output container. Calls follow the order `add_stream`* →
/// `write_header` → `write_interleaved`* → `write_trailer`; `close` is
/// valid at any point and releases the output.
pub trait ContainerWriter: Send {
    /// Registers a stream and returns its index
    fn add_stream(&mut self, params: StreamParams) -> Result<usize>;

    fn write_header(&mut self) -> Result<()>;

    /// Queues a packet and writes whatever the interleaving order allows.
    /// Packet timestamps are in the packet's time base.
    fn write_interleaved(&mut self, packet: CompressedPacket) -> Result<()>;

    /// Flushes queued packets and finishes the file
    fn write_trailer(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn stream_count(&self) -> usize;
}

/// Opens `path` with the writer this build prefers: GStreamer's muxer when
/// it is built in and installed, the built-in Matroska writer otherwise.
pub fn create_writer(
    path: &Path,
    format: ContainerFormat,
    max_interleave_delta_ms: u64,
) -> Result<Box<dyn ContainerWriter>> {
    #[cfg(feature = "gstreamer")]
    match GstMuxWriter::create(path, format, max_interleave_delta_ms) {
        Ok(writer) => return Ok(Box::new(writer)),
        Err(e) => log::warn!("[Container] {}; using the built-in Matroska writer", e),
    }
    Ok(Box::new(MatroskaWriter::create(path, format, max_interleave_delta_ms)?))
}

/// Orders packets of several streams by dts.
///
/// A packet is released once every stream has something queued (so nothing
/// earlier can still arrive), or when the queued packets span more than the
/// maximum interleave delta, in which case a lagging stream no longer holds
/// the others back.
#[derive(Debug)]
pub struct Interleaver {
    queues: Vec<VecDeque<(i64, CompressedPacket)>>,
    max_delta_us: i64,
}

impl Interleaver {
    pub fn new(max_delta_us: i64) -> Self {
        Self {
            queues: Vec::new(),
            max_delta_us,
        }
    }

    pub fn add_stream(&mut self) {
        self.queues.push(VecDeque::new());
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn push(&mut self, packet: CompressedPacket) -> Result<()> {
        let stream = packet.stream_index;
        let dts = packet
            .dts_or_pts()
            .ok_or(ContainerError::MissingTimestamp(stream))?;
        let dts_us = Rational::rescale(dts, packet.time_base, Rational::MICROS);
        self.queues
            .get_mut(stream)
            .ok_or(ContainerError::InvalidStream(stream))?
            .push_back((dts_us, packet));
        Ok(())
    }

    fn earliest(&self) -> Option<(usize, i64)> {
        self.queues
            .iter()
            .enumerate()
            .filter_map(|(i, q)| q.front().map(|(dts, _)| (i, *dts)))
            .min_by_key(|&(i, dts)| (dts, i))
    }

    /// Next packet that can be written without breaking dts order
    pub fn pop_ready(&mut self) -> Option<CompressedPacket> {
        let (stream, first) = self.earliest()?;
        let all_present = self.queues.iter().all(|q| !q.is_empty());
        let last = self
            .queues
            .iter()
            .filter_map(|q| q.back().map(|(dts, _)| *dts))
            .max()
            .unwrap_or(first);

        if all_present || last - first > self.max_delta_us {
            self.queues[stream].pop_front().map(|(_, packet)| packet)
        } else {
            None
        }
    }

    /// Next packet in dts order regardless of missing streams
    pub fn pop_any(&mut self) -> Option<CompressedPacket> {
        let (stream, _) = self.earliest()?;
        self.queues[stream].pop_front().map(|(_, packet)| packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(stream: usize, dts_ms: i64) -> CompressedPacket {
        let mut packet = CompressedPacket::new(vec![0], dts_ms, Rational::MILLIS);
        packet.stream_index = stream;
        packet
    }

    #[test]
    fn waits_for_every_stream() {
        let mut interleaver = Interleaver::new(10_000_000);
        interleaver.add_stream();
        interleaver.add_stream();

        interleaver.push(packet(0, 0)).unwrap();
        interleaver.push(packet(0, 20)).unwrap();
        assert!(interleaver.pop_ready().is_none());

        interleaver.push(packet(1, 10)).unwrap();
        let order: Vec<i64> = std::iter::from_fn(|| interleaver.pop_ready())
            .map(|p| p.dts.unwrap())
            .collect();
        assert_eq!(order, vec![0, 10]);

        let rest: Vec<i64> = std::iter::from_fn(|| interleaver.pop_any())
            .map(|p| p.dts.unwrap())
            .collect();
        assert_eq!(rest, vec![20]);
        assert!(interleaver.is_empty());
    }

    #[test]
    fn lagging_stream_is_skipped_after_max_delta() {
        let mut interleaver = Interleaver::new(1_000_000);
        interleaver.add_stream();
        interleaver.add_stream();

        interleaver.push(packet(0, 0)).unwrap();
        interleaver.push(packet(0, 500)).unwrap();
        assert!(interleaver.pop_ready().is_none());

        interleaver.push(packet(0, 1500)).unwrap();
        assert_eq!(interleaver.pop_ready().unwrap().dts, Some(0));
    }

    #[test]
    fn orders_across_time_bases() {
        let mut interleaver = Interleaver::new(10_000_000);
        interleaver.add_stream();
        interleaver.add_stream();

        let mut audio = CompressedPacket::new(vec![0], 4800, Rational::new(1, 48000));
        audio.stream_index = 1;
        interleaver.push(audio).unwrap();
        interleaver.push(packet(0, 50)).unwrap();

        assert_eq!(interleaver.pop_ready().unwrap().stream_index, 0);
    }

    #[test]
    fn rejects_unknown_streams() {
        let mut interleaver = Interleaver::new(0);
        assert!(matches!(
            interleaver.push(packet(3, 0)),
            Err(ContainerError::InvalidStream(3))
        ));
    }
}
