//! Matroska / WebM writer
//!
//! Layout of a written file:
//!
//! ```text
//! EBML header
//! Segment (size patched at trailer)
//!   Info       TimecodeScale = 1ms, Duration (patched at trailer)
//!   Tracks     one TrackEntry per stream, Void reserved for late CodecPrivate
//!   Cluster*   Timecode + SimpleBlocks (size patched when the cluster closes)
//!   Cues       one CuePoint per cluster for keyframes
//! ```
//!
//! The output must be seekable; sizes and the duration are back-patched.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use crate::encoding::{AudioCodec, ContainerFormat, VideoCodec};
use crate::media::{CompressedPacket, PixelFormat, Rational};

use super::{ensure_supported, ContainerError, ContainerWriter, Interleaver, Result, StreamKind, StreamParams};

const ID_EBML: u32 = 0x1A45_DFA3;
const ID_EBML_VERSION: u32 = 0x4286;
const ID_EBML_READ_VERSION: u32 = 0x42F7;
const ID_EBML_MAX_ID_LENGTH: u32 = 0x42F2;
const ID_EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
const ID_DOC_TYPE: u32 = 0x4282;
const ID_DOC_TYPE_VERSION: u32 = 0x4287;
const ID_DOC_TYPE_READ_VERSION: u32 = 0x4285;

const ID_SEGMENT: u32 = 0x1853_8067;
const ID_INFO: u32 = 0x1549_A966;
const ID_TIMECODE_SCALE: u32 = 0x2A_D7B1;
const ID_MUXING_APP: u32 = 0x4D80;
const ID_WRITING_APP: u32 = 0x5741;
const ID_DURATION: u32 = 0x4489;

const ID_TRACKS: u32 = 0x1654_AE6B;
const ID_TRACK_ENTRY: u32 = 0xAE;
const ID_TRACK_NUMBER: u32 = 0xD7;
const ID_TRACK_UID: u32 = 0x73C5;
const ID_TRACK_TYPE: u32 = 0x83;
const ID_FLAG_LACING: u32 = 0x9C;
const ID_CODEC_ID: u32 = 0x86;
const ID_CODEC_PRIVATE: u32 = 0x63A2;
const ID_DEFAULT_DURATION: u32 = 0x23_E383;
const ID_VIDEO: u32 = 0xE0;
const ID_PIXEL_WIDTH: u32 = 0xB0;
const ID_PIXEL_HEIGHT: u32 = 0xBA;
const ID_COLOUR_SPACE: u32 = 0x2E_B524;
const ID_AUDIO: u32 = 0xE1;
const ID_SAMPLING_FREQUENCY: u32 = 0xB5;
const ID_CHANNELS: u32 = 0x9F;
const ID_BIT_DEPTH: u32 = 0x6264;

const ID_CLUSTER: u32 = 0x1F43_B675;
const ID_TIMECODE: u32 = 0xE7;
const ID_SIMPLE_BLOCK: u32 = 0xA3;

const ID_CUES: u32 = 0x1C53_BB6B;
const ID_CUE_POINT: u32 = 0xBB;
const ID_CUE_TIME: u32 = 0xB3;
const ID_CUE_TRACK_POSITIONS: u32 = 0xB7;
const ID_CUE_TRACK: u32 = 0xF7;
const ID_CUE_CLUSTER_POSITION: u32 = 0xF1;

const ID_VOID: u32 = 0xEC;

const TRACK_TYPE_VIDEO: u64 = 1;
const TRACK_TYPE_AUDIO: u64 = 2;

/// Bytes reserved in a track header for codec private data that only
/// becomes known once encoding has started
const CODEC_PRIVATE_RESERVE: usize = 256;

/// Longest span of one cluster
const CLUSTER_MAX_MS: i64 = 5_000;

const APP_NAME: &str = concat!("mediarec ", env!("CARGO_PKG_VERSION"));

/// In-memory EBML element builder
#[derive(Default)]
struct Ebml(Vec<u8>);

impl Ebml {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn id(&mut self, id: u32) {
        let bytes = id.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.0.extend_from_slice(&bytes[skip..]);
    }

    fn size(&mut self, size: u64) {
        let mut width = 1;
        while width < 8 && size >= (1u64 << (7 * width)) - 1 {
            width += 1;
        }
        self.size_with_width(size, width);
    }

    fn size_with_width(&mut self, size: u64, width: usize) {
        let marked = size | (1u64 << (7 * width));
        self.0.extend_from_slice(&marked.to_be_bytes()[8 - width..]);
    }

    fn uint(&mut self, id: u32, value: u64) {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
        self.id(id);
        self.size((8 - skip) as u64);
        self.0.extend_from_slice(&bytes[skip..]);
    }

    fn float(&mut self, id: u32, value: f64) {
        self.id(id);
        self.size(8);
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    fn string(&mut self, id: u32, value: &str) {
        self.binary(id, value.as_bytes());
    }

    fn binary(&mut self, id: u32, data: &[u8]) {
        self.id(id);
        self.size(data.len() as u64);
        self.0.extend_from_slice(data);
    }

    /// Appends a master element and returns where its content starts
    fn master(&mut self, id: u32, content: Ebml) -> usize {
        self.id(id);
        self.size(content.len() as u64);
        let start = self.len();
        self.0.extend(content.0);
        start
    }

    /// A Void element of exactly `total` bytes (at least 2)
    fn void(&mut self, total: usize) {
        self.id(ID_VOID);
        if total < 2 + 127 {
            self.size_with_width((total - 2) as u64, 1);
            self.0.resize(self.len() + total - 2, 0);
        } else {
            self.size_with_width((total - 9) as u64, 8);
            self.0.resize(self.len() + total - 9, 0);
        }
    }
}

/// 8-byte size field, used for everything patched later
fn size_field(size: u64) -> [u8; 8] {
    (size | (1u64 << 56)).to_be_bytes()
}

const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

fn colour_space(format: PixelFormat) -> Option<&'static [u8; 4]> {
    Some(match format {
        PixelFormat::Yuv420p => b"I420",
        PixelFormat::Yuv422p => b"Y42B",
        PixelFormat::Yuv444p => b"Y444",
        PixelFormat::Nv12 => b"NV12",
        PixelFormat::Yuyv422 => b"YUY2",
        PixelFormat::Uyvy422 => b"UYVY",
        PixelFormat::Gray8 => b"Y800",
        _ => return None,
    })
}

/// Whether a track may receive codec private data after the header is written
fn needs_codec_private_slot(kind: &StreamKind) -> bool {
    match kind {
        StreamKind::Video { codec, .. } => !matches!(codec, VideoCodec::Mjpeg | VideoCodec::RawVideo),
        StreamKind::Audio { codec, .. } => !matches!(codec, AudioCodec::PcmS16le | AudioCodec::PcmF32le),
    }
}

#[derive(Debug)]
struct Track {
    params: StreamParams,
    number: u64,
    uid: u64,
    /// Absolute position and size of the reserved Void
    codec_private_slot: Option<(u64, usize)>,
    late_codec_private: Option<Vec<u8>>,
    last_dts: Option<i64>,
}

#[derive(Debug)]
struct Cluster {
    size_offset: u64,
    data_start: u64,
    timecode_ms: i64,
    /// Position relative to the segment data, as Cues want it
    segment_position: u64,
}

#[derive(Debug)]
struct CuePoint {
    time_ms: i64,
    track: u64,
    cluster_position: u64,
}

pub struct MatroskaWriter<W: Write + Seek> {
    output: Option<W>,
    format: ContainerFormat,
    tracks: Vec<Track>,
    interleaver: Interleaver,
    segment_size_offset: u64,
    segment_data_start: u64,
    duration_offset: u64,
    cluster: Option<Cluster>,
    cues: Vec<CuePoint>,
    max_end_ms: i64,
    header_written: bool,
    trailer_written: bool,
}

impl MatroskaWriter<BufWriter<File>> {
    /// Creates (truncating) the output file
    pub fn create(path: &Path, format: ContainerFormat, max_interleave_delta_ms: u64) -> Result<Self> {
        let file = File::create(path)?;
        log::info!("[Matroska] Writing {} to {:?}", format.doc_type(), path);
        Ok(Self::new(BufWriter::new(file), format, max_interleave_delta_ms))
    }
}

impl<W: Write + Seek> MatroskaWriter<W> {
    pub fn new(output: W, format: ContainerFormat, max_interleave_delta_ms: u64) -> Self {
        Self {
            output: Some(output),
            format,
            tracks: Vec::new(),
            interleaver: Interleaver::new(max_interleave_delta_ms as i64 * 1000),
            segment_size_offset: 0,
            segment_data_start: 0,
            duration_offset: 0,
            cluster: None,
            cues: Vec::new(),
            max_end_ms: 0,
            header_written: false,
            trailer_written: false,
        }
    }

    /// Returns the output once the writer is done with it
    pub fn into_inner(mut self) -> Option<W> {
        self.output.take()
    }

    fn out(&mut self) -> Result<&mut W> {
        self.output.as_mut().ok_or(ContainerError::Closed)
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.out()?.stream_position()?)
    }

    fn patch(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let out = self.out()?;
        let end = out.stream_position()?;
        out.seek(SeekFrom::Start(offset))?;
        out.write_all(bytes)?;
        out.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.params.is_video())
    }

    fn track_entry(&self, track: &Track) -> (Ebml, Option<usize>) {
        let mut entry = Ebml::default();
        entry.uint(ID_TRACK_NUMBER, track.number);
        entry.uint(ID_TRACK_UID, track.uid);
        entry.uint(ID_FLAG_LACING, 0);
        entry.string(ID_CODEC_ID, track.params.kind.codec_id());

        let mut slot = None;
        match &track.params.codec_private {
            Some(data) => entry.binary(ID_CODEC_PRIVATE, data),
            None if needs_codec_private_slot(&track.params.kind) => {
                slot = Some(entry.len());
                entry.void(CODEC_PRIVATE_RESERVE);
            }
            None => {}
        }

        match &track.params.kind {
            StreamKind::Video {
                size,
                frame_rate,
                pixel_format,
                codec,
            } => {
                entry.uint(ID_TRACK_TYPE, TRACK_TYPE_VIDEO);
                if let Some(rate) = frame_rate.filter(Rational::is_valid) {
                    let frame_ns = Rational::rescale(1, rate.inverse(), Rational::new(1, 1_000_000_000));
                    entry.uint(ID_DEFAULT_DURATION, frame_ns.max(1) as u64);
                }
                let mut video = Ebml::default();
                video.uint(ID_PIXEL_WIDTH, u64::from(size.width));
                video.uint(ID_PIXEL_HEIGHT, u64::from(size.height));
                if *codec == VideoCodec::RawVideo {
                    if let Some(fourcc) = pixel_format.and_then(colour_space) {
                        video.binary(ID_COLOUR_SPACE, fourcc);
                    }
                }
                entry.master(ID_VIDEO, video);
            }
            StreamKind::Audio {
                codec,
                sample_rate,
                channels,
            } => {
                entry.uint(ID_TRACK_TYPE, TRACK_TYPE_AUDIO);
                let mut audio = Ebml::default();
                audio.float(ID_SAMPLING_FREQUENCY, f64::from(*sample_rate));
                audio.uint(ID_CHANNELS, u64::from(*channels));
                if let Some(depth) = codec.pcm_bit_depth() {
                    audio.uint(ID_BIT_DEPTH, u64::from(depth));
                }
                entry.master(ID_AUDIO, audio);
            }
        }
        (entry, slot)
    }

    fn start_cluster(&mut self, timecode_ms: i64) -> Result<()> {
        self.close_cluster()?;

        let start = self.position()?;
        let mut head = Ebml::default();
        head.id(ID_CLUSTER);
        let size_offset = start + head.len() as u64;
        head.0.extend_from_slice(&UNKNOWN_SIZE);
        let data_start = start + head.len() as u64;
        head.uint(ID_TIMECODE, timecode_ms.max(0) as u64);
        self.out()?.write_all(&head.0)?;

        log::trace!("[Matroska] Cluster at {} ms", timecode_ms);
        self.cluster = Some(Cluster {
            size_offset,
            data_start,
            timecode_ms: timecode_ms.max(0),
            segment_position: start - self.segment_data_start,
        });
        Ok(())
    }

    fn close_cluster(&mut self) -> Result<()> {
        if let Some(cluster) = self.cluster.take() {
            let end = self.position()?;
            self.patch(cluster.size_offset, &size_field(end - cluster.data_start))?;
        }
        Ok(())
    }

    fn write_block(&mut self, packet: CompressedPacket) -> Result<()> {
        let index = packet.stream_index;
        let (number, is_video) = {
            let track = self
                .tracks
                .get(index)
                .ok_or(ContainerError::InvalidStream(index))?;
            (track.number, track.params.is_video())
        };
        let pts = packet
            .pts
            .or(packet.dts)
            .ok_or(ContainerError::MissingTimestamp(index))?;
        let pts_ms = Rational::rescale(pts, packet.time_base, Rational::MILLIS);
        let key = packet.key_frame || !is_video;

        let needs_cluster = match &self.cluster {
            None => true,
            Some(cluster) => {
                let relative = pts_ms - cluster.timecode_ms;
                relative < i64::from(i16::MIN)
                    || relative > CLUSTER_MAX_MS
                    || (is_video && key && relative >= 1000)
            }
        };
        if needs_cluster {
            self.start_cluster(pts_ms)?;
        }
        let (cluster_ts, cluster_position) = match &self.cluster {
            Some(cluster) => (cluster.timecode_ms, cluster.segment_position),
            None => return Err(ContainerError::HeaderNotWritten),
        };

        if key && (is_video || !self.has_video()) {
            let already = self
                .cues
                .iter()
                .rev()
                .take_while(|c| c.cluster_position == cluster_position)
                .any(|c| c.track == number);
            if !already {
                self.cues.push(CuePoint {
                    time_ms: pts_ms.max(0),
                    track: number,
                    cluster_position,
                });
            }
        }

        let relative = (pts_ms - cluster_ts).clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
        let mut block = Ebml::default();
        block.id(ID_SIMPLE_BLOCK);
        block.size(1 + 2 + 1 + packet.data.len() as u64);
        block.size(number);
        block.0.extend_from_slice(&relative.to_be_bytes());
        block.0.push(if key { 0x80 } else { 0x00 });
        block.0.extend_from_slice(&packet.data);
        self.out()?.write_all(&block.0)?;

        let duration_ms = Rational::rescale(packet.duration.max(0), packet.time_base, Rational::MILLIS);
        self.max_end_ms = self.max_end_ms.max(pts_ms + duration_ms);
        Ok(())
    }

    fn write_cues(&mut self) -> Result<()> {
        if self.cues.is_empty() {
            return Ok(());
        }
        let mut cues = Ebml::default();
        for cue in &self.cues {
            let mut positions = Ebml::default();
            positions.uint(ID_CUE_TRACK, cue.track);
            positions.uint(ID_CUE_CLUSTER_POSITION, cue.cluster_position);
            let mut point = Ebml::default();
            point.uint(ID_CUE_TIME, cue.time_ms as u64);
            point.master(ID_CUE_TRACK_POSITIONS, positions);
            cues.master(ID_CUE_POINT, point);
        }
        let mut element = Ebml::default();
        element.master(ID_CUES, cues);
        self.out()?.write_all(&element.0)?;
        Ok(())
    }

    /// Writes late codec private data into the Void reserved for it
    fn patch_codec_private(&mut self) -> Result<()> {
        let mut patches = Vec::new();
        for track in &self.tracks {
            let (Some((offset, reserved)), Some(data)) = (track.codec_private_slot, &track.late_codec_private) else {
                continue;
            };
            // id (2) + size field + data, and whatever is left becomes a Void
            let mut width = 1;
            while width < 8 && data.len() as u64 >= (1u64 << (7 * width)) - 1 {
                width += 1;
            }
            let mut used = 2 + width + data.len();
            if used + 1 == reserved && width < 8 {
                width += 1;
                used += 1;
            }
            if used > reserved || reserved - used == 1 {
                log::warn!(
                    "[Matroska] Codec private data of track {} ({} bytes) does not fit the reserved space",
                    track.number,
                    data.len()
                );
                continue;
            }
            let mut element = Ebml::default();
            element.id(ID_CODEC_PRIVATE);
            element.size_with_width(data.len() as u64, width);
            element.0.extend_from_slice(data);
            if reserved > used {
                element.void(reserved - used);
            }
            patches.push((offset, element.0));
        }
        for (offset, bytes) in patches {
            self.patch(offset, &bytes)?;
        }
        Ok(())
    }

    fn write_header_inner(&mut self) -> Result<()> {
        let mut ebml = Ebml::default();
        ebml.uint(ID_EBML_VERSION, 1);
        ebml.uint(ID_EBML_READ_VERSION, 1);
        ebml.uint(ID_EBML_MAX_ID_LENGTH, 4);
        ebml.uint(ID_EBML_MAX_SIZE_LENGTH, 8);
        ebml.string(ID_DOC_TYPE, self.format.doc_type());
        ebml.uint(ID_DOC_TYPE_VERSION, 4);
        ebml.uint(ID_DOC_TYPE_READ_VERSION, 2);

        let base = self.position()?;
        let mut buf = Ebml::default();
        buf.master(ID_EBML, ebml);

        buf.id(ID_SEGMENT);
        self.segment_size_offset = base + buf.len() as u64;
        buf.0.extend_from_slice(&UNKNOWN_SIZE);
        self.segment_data_start = base + buf.len() as u64;

        let mut info = Ebml::default();
        info.uint(ID_TIMECODE_SCALE, 1_000_000);
        info.string(ID_MUXING_APP, APP_NAME);
        info.string(ID_WRITING_APP, APP_NAME);
        let duration_in_info = info.len() + 3;
        info.float(ID_DURATION, 0.0);
        let info_start = buf.master(ID_INFO, info);
        self.duration_offset = base + (info_start + duration_in_info) as u64;

        let mut tracks = Ebml::default();
        let mut slots = Vec::new();
        for (i, track) in self.tracks.iter().enumerate() {
            let (entry, slot) = self.track_entry(track);
            let entry_start = tracks.master(ID_TRACK_ENTRY, entry);
            if let Some(slot) = slot {
                slots.push((i, entry_start + slot));
            }
        }
        let tracks_start = buf.master(ID_TRACKS, tracks);
        for (i, offset) in slots {
            self.tracks[i].codec_private_slot = Some((base + (tracks_start + offset) as u64, CODEC_PRIVATE_RESERVE));
        }

        self.out()?.write_all(&buf.0)?;
        Ok(())
    }

    fn write_trailer_inner(&mut self) -> Result<()> {
        while let Some(packet) = self.interleaver.pop_any() {
            self.write_block(packet)?;
        }
        self.close_cluster()?;
        self.write_cues()?;

        let duration = self.max_end_ms as f64;
        self.patch(self.duration_offset, &duration.to_be_bytes())?;
        self.patch_codec_private()?;

        let end = self.position()?;
        self.patch(self.segment_size_offset, &size_field(end - self.segment_data_start))?;
        self.out()?.flush()?;

        log::info!(
            "[Matroska] Finished: {} tracks, {} ms, {} bytes",
            self.tracks.len(),
            self.max_end_ms,
            end
        );
        Ok(())
    }
}

impl<W: Write + Seek + Send> ContainerWriter for MatroskaWriter<W> {
    fn add_stream(&mut self, params: StreamParams) -> Result<usize> {
        if self.header_written {
            return Err(ContainerError::HeaderAlreadyWritten);
        }
        ensure_supported(self.format, &params.kind)?;

        let index = self.tracks.len();
        log::debug!("[Matroska] Track {}: {}", index + 1, params.kind.codec_id());
        self.tracks.push(Track {
            params,
            number: index as u64 + 1,
            uid: uuid::Uuid::new_v4().as_u64_pair().0 | 1,
            codec_private_slot: None,
            late_codec_private: None,
            last_dts: None,
        });
        self.interleaver.add_stream();
        Ok(index)
    }

    fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Err(ContainerError::HeaderAlreadyWritten);
        }
        if self.tracks.is_empty() {
            return Err(ContainerError::NoStreams);
        }
        self.write_header_inner()?;
        self.header_written = true;
        Ok(())
    }

    fn write_interleaved(&mut self, packet: CompressedPacket) -> Result<()> {
        if !self.header_written {
            return Err(ContainerError::HeaderNotWritten);
        }
        if self.trailer_written {
            return Err(ContainerError::TrailerAlreadyWritten);
        }
        let index = packet.stream_index;
        let track = self
            .tracks
            .get_mut(index)
            .ok_or(ContainerError::InvalidStream(index))?;

        let dts = packet
            .dts_or_pts()
            .ok_or(ContainerError::MissingTimestamp(index))?;
        if let Some(last) = track.last_dts {
            if dts < last {
                return Err(ContainerError::NonMonotonicDts {
                    stream: index,
                    dts,
                    last,
                });
            }
        }
        track.last_dts = Some(dts);

        if let Some(data) = &packet.new_extradata {
            log::debug!(
                "[Matroska] Track {} received {} bytes of codec private data",
                track.number,
                data.len()
            );
            track.late_codec_private = Some(data.clone());
        }

        self.interleaver.push(packet)?;
        while let Some(ready) = self.interleaver.pop_ready() {
            self.write_block(ready)?;
        }
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        if !self.header_written {
            return Err(ContainerError::HeaderNotWritten);
        }
        if self.trailer_written {
            return Err(ContainerError::TrailerAlreadyWritten);
        }
        self.trailer_written = true;
        self.write_trailer_inner()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut output) = self.output.take() {
            output.flush()?;
        }
        Ok(())
    }

    fn stream_count(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Size;
    use std::io::Cursor;

    fn writer(format: ContainerFormat) -> MatroskaWriter<Cursor<Vec<u8>>> {
        MatroskaWriter::new(Cursor::new(Vec::new()), format, 10_000)
    }

    fn finish(mut writer: MatroskaWriter<Cursor<Vec<u8>>>) -> Vec<u8> {
        writer.write_trailer().unwrap();
        writer.into_inner().unwrap().into_inner()
    }

    fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
        data.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn vint_sizes() {
        let mut e = Ebml::default();
        e.size(0);
        e.size(126);
        e.size(127);
        e.size(300);
        assert_eq!(e.0, vec![0x80, 0xFE, 0x40, 0x7F, 0x41, 0x2C]);
    }

    #[test]
    fn void_has_exact_length() {
        for total in [2usize, 50, 128, 129, 256, 1000] {
            let mut e = Ebml::default();
            e.void(total);
            assert_eq!(e.len(), total, "void of {}", total);
        }
    }

    #[test]
    fn header_requires_streams() {
        let mut w = writer(ContainerFormat::Mkv);
        assert!(matches!(w.write_header(), Err(ContainerError::NoStreams)));
    }

    #[test]
    fn webm_rejects_pcm() {
        let mut w = writer(ContainerFormat::WebM);
        let result = w.add_stream(StreamParams::audio(AudioCodec::PcmS16le, 48000, 2, Rational::new(1, 48000)));
        assert!(matches!(result, Err(ContainerError::UnsupportedCodec { .. })));
    }

    #[test]
    fn writes_header_blocks_and_duration() {
        let mut w = writer(ContainerFormat::Mkv);
        let tb = Rational::new(1, 48000);
        w.add_stream(StreamParams::audio(AudioCodec::PcmS16le, 48000, 1, tb)).unwrap();
        w.write_header().unwrap();

        for i in 0..10 {
            let mut packet = CompressedPacket::new(vec![0; 960], i * 480, tb);
            packet.duration = 480;
            w.write_interleaved(packet).unwrap();
        }
        let data = finish(w);

        assert_eq!(&data[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert!(find(&data, b"matroska").is_some());
        assert!(find(&data, b"A_PCM/INT/LIT").is_some());

        let duration_at = find(&data, &[0x44, 0x89, 0x88]).unwrap() + 3;
        let duration = f64::from_be_bytes(data[duration_at..duration_at + 8].try_into().unwrap());
        assert_eq!(duration, 100.0);

        // Segment size covers the rest of the file
        let segment_at = find(&data, &[0x18, 0x53, 0x80, 0x67]).unwrap() + 4;
        let size = u64::from_be_bytes(data[segment_at..segment_at + 8].try_into().unwrap()) & !(1u64 << 56);
        assert_eq!(size as usize, data.len() - segment_at - 8);
    }

    #[test]
    fn rejects_decreasing_dts() {
        let mut w = writer(ContainerFormat::Mkv);
        let tb = Rational::MILLIS;
        w.add_stream(StreamParams::video(VideoCodec::Mjpeg, Size::new(2, 2), None, tb))
            .unwrap();
        w.write_header().unwrap();
        w.write_interleaved(CompressedPacket::new(vec![1], 100, tb)).unwrap();
        let result = w.write_interleaved(CompressedPacket::new(vec![1], 50, tb));
        assert!(matches!(result, Err(ContainerError::NonMonotonicDts { dts: 50, last: 100, .. })));
    }

    #[test]
    fn late_codec_private_is_patched_in() {
        let mut w = writer(ContainerFormat::Mkv);
        let tb = Rational::MILLIS;
        w.add_stream(StreamParams::video(VideoCodec::H264, Size::new(16, 16), None, tb))
            .unwrap();
        w.write_header().unwrap();

        let mut packet = CompressedPacket::new(vec![0xAB; 4], 0, tb);
        packet.new_extradata = Some(vec![0x01, 0x64, 0x00, 0x1F, 0xEE]);
        w.write_interleaved(packet).unwrap();
        let data = finish(w);

        let at = find(&data, &[0x63, 0xA2]).unwrap();
        assert_eq!(data[at + 2], 0x85);
        assert_eq!(&data[at + 3..at + 8], &[0x01, 0x64, 0x00, 0x1F, 0xEE]);
        assert_eq!(data[at + 8], 0xEC);
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_writes() {
        let mut w = writer(ContainerFormat::Mkv);
        w.add_stream(StreamParams::audio(AudioCodec::PcmF32le, 8000, 1, Rational::new(1, 8000)))
            .unwrap();
        w.close().unwrap();
        w.close().unwrap();
        assert!(matches!(w.write_header(), Err(ContainerError::Closed)));
    }
}
