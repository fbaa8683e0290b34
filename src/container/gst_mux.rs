//! Matroska / WebM output through GStreamer
//!
//! One appsrc per stream feeds the container's muxer element:
//!
//! ```text
//! appsrc (video) -> [parser] -\
//!                              matroskamux/webmmux -> filesink
//! appsrc (audio) -> [parser] -/
//! ```
//!
//! Packets are ordered by the shared [`Interleaver`] before they are pushed,
//! so the muxer sees the same order the built-in writer would write.
//! The muxer itself takes care of clusters, cues and the duration.

use std::path::{Path, PathBuf};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::encoding::gst_encoder::gst_video_format;
use crate::encoding::{AudioCodec, ContainerFormat, VideoCodec};
use crate::media::{CompressedPacket, Rational};

use super::{ensure_supported, ContainerError, ContainerWriter, Interleaver, Result, StreamKind, StreamParams};

const NANOS: Rational = Rational::new(1, 1_000_000_000);

/// How long the trailer waits for the pipeline to reach EOS
const EOS_TIMEOUT_SECS: u64 = 5;

fn pipeline_error<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> ContainerError + '_ {
    move |e| ContainerError::Pipeline(format!("{}: {}", context, e))
}

/// Parser placed between the appsrc and the muxer. MJPEG goes straight in:
/// jpegparse would override the caps dimensions with whatever the JPEG
/// headers claim.
fn parser_for(kind: &StreamKind) -> Option<&'static str> {
    match kind {
        StreamKind::Video { codec, .. } => match codec {
            VideoCodec::H264 => Some("h264parse"),
            VideoCodec::H265 => Some("h265parse"),
            VideoCodec::Av1 => Some("av1parse"),
            VideoCodec::Mjpeg | VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::RawVideo => None,
        },
        StreamKind::Audio { codec, .. } => match codec {
            AudioCodec::Mp3 => Some("mpegaudioparse"),
            AudioCodec::Aac => Some("aacparse"),
            AudioCodec::PcmS16le | AudioCodec::PcmF32le | AudioCodec::Opus => None,
        },
    }
}

/// Caps describing what a stream's appsrc pushes
fn stream_caps(params: &StreamParams, codec_private: Option<&[u8]>) -> Result<gst::Caps> {
    let codec_data = codec_private.map(|data| gst::Buffer::from_slice(data.to_vec()));

    let caps = match &params.kind {
        StreamKind::Video {
            codec,
            size,
            frame_rate,
            pixel_format,
        } => {
            let framerate = frame_rate
                .filter(Rational::is_valid)
                .map(|r| gst::Fraction::new(r.num as i32, r.den as i32))
                .unwrap_or_else(|| gst::Fraction::new(0, 1));

            if *codec == VideoCodec::RawVideo {
                let format = pixel_format
                    .and_then(gst_video_format)
                    .ok_or_else(|| ContainerError::Pipeline("raw video stream without a known layout".into()))?;
                let info = gst_video::VideoInfo::builder(
                    gst_video::VideoFormat::from_string(format),
                    size.width,
                    size.height,
                )
                .fps(framerate)
                .build()
                .map_err(pipeline_error("Invalid raw video info"))?;
                return info.to_caps().map_err(pipeline_error("Invalid raw video caps"));
            }

            let mut builder = gst::Caps::builder(codec.gst_caps_name())
                .field("width", size.width as i32)
                .field("height", size.height as i32)
                .field("framerate", framerate);
            builder = match (codec, codec_data) {
                (VideoCodec::H264, Some(data)) => builder
                    .field("stream-format", "avc")
                    .field("alignment", "au")
                    .field("codec_data", data),
                (VideoCodec::H265, Some(data)) => builder
                    .field("stream-format", "hvc1")
                    .field("alignment", "au")
                    .field("codec_data", data),
                (VideoCodec::H264 | VideoCodec::H265, None) => builder
                    .field("stream-format", "byte-stream")
                    .field("alignment", "au"),
                (VideoCodec::Av1, _) => builder
                    .field("stream-format", "obu-stream")
                    .field("alignment", "tu"),
                (_, Some(data)) => builder.field("codec_data", data),
                (_, None) => builder,
            };
            builder.build()
        }
        StreamKind::Audio {
            codec,
            sample_rate,
            channels,
        } => {
            let builder = gst::Caps::builder(codec.gst_caps_name())
                .field("rate", *sample_rate as i32)
                .field("channels", *channels as i32);
            let builder = match codec {
                AudioCodec::PcmS16le => builder.field("format", "S16LE").field("layout", "interleaved"),
                AudioCodec::PcmF32le => builder.field("format", "F32LE").field("layout", "interleaved"),
                AudioCodec::Opus => builder.field("channel-mapping-family", 0i32),
                AudioCodec::Aac => match codec_data {
                    Some(data) => builder
                        .field("mpegversion", 4i32)
                        .field("stream-format", "raw")
                        .field("codec_data", data),
                    None => builder.field("mpegversion", 4i32).field("stream-format", "adts"),
                },
                AudioCodec::Mp3 => builder.field("mpegversion", 1i32).field("layer", 3i32),
            };
            builder.build()
        }
    };
    Ok(caps)
}

struct MuxStream {
    params: StreamParams,
    appsrc: Option<gst_app::AppSrc>,
    /// Codec data currently announced in the appsrc caps
    codec_private: Option<Vec<u8>>,
    last_dts: Option<i64>,
}

pub struct GstMuxWriter {
    path: PathBuf,
    format: ContainerFormat,
    streams: Vec<MuxStream>,
    interleaver: Interleaver,
    pipeline: Option<gst::Pipeline>,
    /// End of the latest packet, for the log line at the trailer
    max_end_ns: i64,
    header_written: bool,
    trailer_written: bool,
    closed: bool,
}

impl GstMuxWriter {
    /// Checks that GStreamer and the muxer element are there. Nothing is
    /// written until the header.
    pub fn create(path: &Path, format: ContainerFormat, max_interleave_delta_ms: u64) -> Result<Self> {
        crate::gstreamer_init::init_gstreamer_env();
        if !crate::gstreamer_init::is_gstreamer_available() {
            return Err(ContainerError::Pipeline("GStreamer is not available".into()));
        }
        if gst::ElementFactory::find(format.gst_muxer()).is_none() {
            return Err(ContainerError::Pipeline(format!("{} is not installed", format.gst_muxer())));
        }
        log::info!("[GstMux] Writing {} to {:?}", format.doc_type(), path);

        Ok(Self {
            path: path.to_path_buf(),
            format,
            streams: Vec::new(),
            interleaver: Interleaver::new(max_interleave_delta_ms as i64 * 1000),
            pipeline: None,
            max_end_ns: 0,
            header_written: false,
            trailer_written: false,
            closed: false,
        })
    }

    fn build_pipeline(&mut self) -> Result<gst::Pipeline> {
        let pipeline = gst::Pipeline::new();

        let muxer = gst::ElementFactory::make(self.format.gst_muxer())
            .property("writing-app", "mediarec")
            .build()
            .map_err(pipeline_error(&format!("Failed to create {}", self.format.gst_muxer())))?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", self.path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .map_err(pipeline_error("Failed to create filesink"))?;
        pipeline
            .add_many([&muxer, &filesink])
            .map_err(pipeline_error("Failed to add elements"))?;
        muxer
            .link(&filesink)
            .map_err(pipeline_error("Failed to link muxer -> filesink"))?;

        for (index, stream) in self.streams.iter_mut().enumerate() {
            let caps = stream_caps(&stream.params, stream.codec_private.as_deref())?;
            let appsrc = gst_app::AppSrc::builder()
                .name(format!("src{}", index))
                .caps(&caps)
                .format(gst::Format::Time)
                .is_live(false)
                .stream_type(gst_app::AppStreamType::Stream)
                .build();
            pipeline
                .add(&appsrc)
                .map_err(pipeline_error("Failed to add appsrc"))?;

            match parser_for(&stream.params.kind) {
                Some(name) => {
                    let parser = gst::ElementFactory::make(name)
                        .build()
                        .map_err(pipeline_error(&format!("Failed to create {}", name)))?;
                    pipeline
                        .add(&parser)
                        .map_err(pipeline_error("Failed to add parser"))?;
                    gst::Element::link_many([appsrc.upcast_ref(), &parser, &muxer])
                        .map_err(pipeline_error(&format!("Failed to link stream {}", index)))?;
                }
                None => {
                    appsrc
                        .link(&muxer)
                        .map_err(pipeline_error(&format!("Failed to link stream {}", index)))?;
                }
            }
            log::debug!("[GstMux] Stream {}: {}", index, caps);
            stream.appsrc = Some(appsrc);
        }

        pipeline
            .set_state(gst::State::Playing)
            .map_err(pipeline_error("Failed to start muxer pipeline"))?;
        Ok(pipeline)
    }

    fn push_packet(&mut self, packet: CompressedPacket) -> Result<()> {
        let index = packet.stream_index;
        let stream = self
            .streams
            .get_mut(index)
            .ok_or(ContainerError::InvalidStream(index))?;
        let appsrc = stream.appsrc.as_ref().ok_or(ContainerError::HeaderNotWritten)?;

        if let Some(data) = &packet.new_extradata {
            if stream.codec_private.as_ref() != Some(data) {
                let caps = stream_caps(&stream.params, Some(data))?;
                appsrc.set_caps(Some(&caps));
                stream.codec_private = Some(data.clone());
            }
        }

        let to_ns = |t: i64| Rational::rescale(t, packet.time_base, NANOS).max(0) as u64;
        let pts = packet.pts.map(to_ns);
        let dts = packet.dts.map(to_ns);
        let duration = (packet.duration > 0).then(|| to_ns(packet.duration));
        if let Some(end) = pts.or(dts) {
            self.max_end_ns = self.max_end_ns.max((end + duration.unwrap_or(0)) as i64);
        }

        let is_video = stream.params.is_video();
        let mut buffer = gst::Buffer::from_mut_slice(packet.data);
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| ContainerError::Pipeline("buffer is shared".into()))?;
            buffer_ref.set_pts(pts.map(gst::ClockTime::from_nseconds));
            buffer_ref.set_dts(dts.map(gst::ClockTime::from_nseconds));
            buffer_ref.set_duration(duration.map(gst::ClockTime::from_nseconds));
            if is_video && !packet.key_frame {
                buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        appsrc
            .push_buffer(buffer)
            .map_err(|e| ContainerError::Pipeline(format!("Failed to push packet: {:?}", e)))?;
        Ok(())
    }

    /// Ends every stream and waits for the muxer to finish the file
    fn finish_pipeline(&mut self) -> Result<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        for stream in &mut self.streams {
            if let Some(appsrc) = stream.appsrc.take() {
                if let Err(e) = appsrc.end_of_stream() {
                    log::warn!("[GstMux] Failed to send EOS: {:?}", e);
                }
            }
        }

        let mut pipeline_error: Option<String> = None;
        if let Some(bus) = pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        pipeline_error = Some(format!("{} ({:?})", err.error(), err.debug()));
                        break;
                    }
                    _ => {}
                }
            }
        }
        let _ = pipeline.set_state(gst::State::Null);

        match pipeline_error {
            Some(err) => Err(ContainerError::Pipeline(err)),
            None => Ok(()),
        }
    }
}

impl ContainerWriter for GstMuxWriter {
    fn add_stream(&mut self, params: StreamParams) -> Result<usize> {
        if self.closed {
            return Err(ContainerError::Closed);
        }
        if self.header_written {
            return Err(ContainerError::HeaderAlreadyWritten);
        }
        ensure_supported(self.format, &params.kind)?;

        let index = self.streams.len();
        log::debug!("[GstMux] Track {}: {}", index + 1, params.kind.codec_id());
        self.streams.push(MuxStream {
            codec_private: params.codec_private.clone(),
            params,
            appsrc: None,
            last_dts: None,
        });
        self.interleaver.add_stream();
        Ok(index)
    }

    fn write_header(&mut self) -> Result<()> {
        if self.closed {
            return Err(ContainerError::Closed);
        }
        if self.header_written {
            return Err(ContainerError::HeaderAlreadyWritten);
        }
        if self.streams.is_empty() {
            return Err(ContainerError::NoStreams);
        }
        let pipeline = self.build_pipeline()?;
        self.pipeline = Some(pipeline);
        self.header_written = true;
        Ok(())
    }

    fn write_interleaved(&mut self, packet: CompressedPacket) -> Result<()> {
        if self.closed {
            return Err(ContainerError::Closed);
        }
        if !self.header_written {
            return Err(ContainerError::HeaderNotWritten);
        }
        if self.trailer_written {
            return Err(ContainerError::TrailerAlreadyWritten);
        }
        let index = packet.stream_index;
        let stream = self
            .streams
            .get_mut(index)
            .ok_or(ContainerError::InvalidStream(index))?;

        let dts = packet
            .dts_or_pts()
            .ok_or(ContainerError::MissingTimestamp(index))?;
        if let Some(last) = stream.last_dts {
            if dts < last {
                return Err(ContainerError::NonMonotonicDts {
                    stream: index,
                    dts,
                    last,
                });
            }
        }
        stream.last_dts = Some(dts);

        self.interleaver.push(packet)?;
        while let Some(ready) = self.interleaver.pop_ready() {
            self.push_packet(ready)?;
        }
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        if self.closed {
            return Err(ContainerError::Closed);
        }
        if !self.header_written {
            return Err(ContainerError::HeaderNotWritten);
        }
        if self.trailer_written {
            return Err(ContainerError::TrailerAlreadyWritten);
        }
        self.trailer_written = true;

        while let Some(packet) = self.interleaver.pop_any() {
            self.push_packet(packet)?;
        }
        self.finish_pipeline()?;

        log::info!(
            "[GstMux] Finished: {} tracks, {} ms",
            self.streams.len(),
            self.max_end_ns / 1_000_000
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
        for stream in &mut self.streams {
            stream.appsrc = None;
        }
        Ok(())
    }

    fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

impl Drop for GstMuxWriter {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Size;

    #[test]
    fn webm_rejects_pcm_before_touching_gstreamer() {
        let dir = tempfile::tempdir().unwrap();
        let Ok(mut writer) = GstMuxWriter::create(&dir.path().join("out.webm"), ContainerFormat::WebM, 10_000) else {
            return;
        };
        let result = writer.add_stream(StreamParams::audio(AudioCodec::PcmS16le, 48000, 2, Rational::new(1, 48000)));
        assert!(matches!(result, Err(ContainerError::UnsupportedCodec { .. })));
    }

    #[test]
    fn mjpeg_packets_become_a_matroska_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mkv");
        let Ok(mut writer) = GstMuxWriter::create(&path, ContainerFormat::Mkv, 10_000) else {
            return;
        };
        let tb = Rational::MILLIS;
        writer
            .add_stream(StreamParams::video(VideoCodec::Mjpeg, Size::new(16, 16), Some(Rational::new(1, 1)), tb))
            .unwrap();
        writer.write_header().unwrap();
        for i in 0..3 {
            let mut packet = CompressedPacket::new(vec![0xFF, 0xD8, 0xFF, 0xD9], i * 1000, tb);
            packet.duration = 1000;
            writer.write_interleaved(packet).unwrap();
        }
        writer.write_trailer().unwrap();
        writer.close().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert!(data.windows(7).any(|w| w == b"V_MJPEG"));
    }

    #[test]
    fn h264_without_codec_data_is_announced_as_byte_stream() {
        if gst::init().is_err() {
            return;
        }
        let params = StreamParams::video(VideoCodec::H264, Size::new(64, 48), None, Rational::MILLIS);
        let caps = stream_caps(&params, None).unwrap();
        let structure = caps.structure(0).unwrap();
        assert_eq!(structure.get::<&str>("stream-format").unwrap(), "byte-stream");

        let caps = stream_caps(&params, Some(&[1, 2, 3])).unwrap();
        assert_eq!(caps.structure(0).unwrap().get::<&str>("stream-format").unwrap(), "avc");
    }
}
