//! Scale and color conversion through GStreamer
//!
//! ```text
//! appsrc -> videoconvert -> videoscale -> capsfilter -> appsink
//! ```
//!
//! One frame in gives exactly one frame out, so each conversion is a push
//! followed by a blocking pull. Frames enter and leave tightly packed while
//! GStreamer pads its rows, so planes are copied row by row at both ends.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::encoding::gst_encoder::gst_video_format;
use crate::media::{PixelFormat, PlaneLayout, Size};

use super::{ConvertError, Result};

/// How long a conversion may take before the pipeline is considered stuck
const PULL_TIMEOUT_SECS: u64 = 2;

fn pipeline_error<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> ConvertError + '_ {
    move |e| ConvertError::Pipeline(format!("{}: {}", context, e))
}

/// A software layout as both sides see it: tightly packed for us, padded
/// for GStreamer
struct FrameMapping {
    info: gst_video::VideoInfo,
    planes: Vec<PlaneLayout>,
}

impl FrameMapping {
    fn new(format: PixelFormat, size: Size) -> Result<Self> {
        let name = gst_video_format(format).ok_or(ConvertError::UnsupportedFormat(format))?;
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::from_string(name), size.width, size.height)
            .build()
            .map_err(pipeline_error("Invalid video info"))?;
        let planes = format.planes(size).ok_or(ConvertError::UnsupportedFormat(format))?;
        if planes.len() != info.n_planes() as usize {
            return Err(ConvertError::UnsupportedFormat(format));
        }
        Ok(Self { info, planes })
    }

    /// Tightly packed bytes into a buffer with GStreamer's strides
    fn to_buffer(&self, data: &[u8]) -> Result<gst::Buffer> {
        let mut buffer = gst::Buffer::with_size(self.info.size()).map_err(pipeline_error("Failed to allocate"))?;
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| ConvertError::Pipeline("buffer is shared".into()))?;
            let mut map = buffer_ref
                .map_writable()
                .map_err(pipeline_error("Failed to map buffer"))?;
            let out = map.as_mut_slice();
            for (i, plane) in self.planes.iter().enumerate() {
                let stride = self.info.stride()[i] as usize;
                let offset = self.info.offset()[i];
                for row in 0..plane.rows {
                    let src = plane.offset + row * plane.stride;
                    let dst = offset + row * stride;
                    out[dst..dst + plane.stride].copy_from_slice(&data[src..src + plane.stride]);
                }
            }
        }
        Ok(buffer)
    }

    /// GStreamer's padded layout back into tightly packed bytes
    fn from_buffer(&self, buffer: &gst::BufferRef) -> Result<Vec<u8>> {
        let map = buffer
            .map_readable()
            .map_err(pipeline_error("Failed to map buffer"))?;
        let input = map.as_slice();
        if input.len() < self.info.size() {
            return Err(ConvertError::InvalidFrame(format!(
                "converted frame has {} bytes, expected {}",
                input.len(),
                self.info.size()
            )));
        }

        let total = self.planes.iter().map(|p| p.stride * p.rows).sum();
        let mut out = vec![0u8; total];
        for (i, plane) in self.planes.iter().enumerate() {
            let stride = self.info.stride()[i] as usize;
            let offset = self.info.offset()[i];
            for row in 0..plane.rows {
                let src = offset + row * stride;
                let dst = plane.offset + row * plane.stride;
                out[dst..dst + plane.stride].copy_from_slice(&input[src..src + plane.stride]);
            }
        }
        Ok(out)
    }
}

pub struct GstScaler {
    src: FrameMapping,
    dst: FrameMapping,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    frames: u64,
}

impl GstScaler {
    pub fn new(src_format: PixelFormat, src_size: Size, dst_format: PixelFormat, dst_size: Size) -> Result<Self> {
        crate::gstreamer_init::init_gstreamer_env();
        if !crate::gstreamer_init::is_gstreamer_available() {
            return Err(ConvertError::Pipeline("GStreamer is not available".into()));
        }
        let src = FrameMapping::new(src_format, src_size)?;
        let dst = FrameMapping::new(dst_format, dst_size)?;

        let src_caps = src.info.to_caps().map_err(pipeline_error("Invalid source caps"))?;
        let dst_caps = dst.info.to_caps().map_err(pipeline_error("Invalid target caps"))?;

        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&src_caps)
            .format(gst::Format::Time)
            .is_live(false)
            .stream_type(gst_app::AppStreamType::Stream)
            .build();
        let convert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(pipeline_error("Failed to create videoconvert"))?;
        // Stretch like a plain resize; no letterboxing
        let scale = gst::ElementFactory::make("videoscale")
            .property("add-borders", false)
            .build()
            .map_err(pipeline_error("Failed to create videoscale"))?;
        let filter = gst::ElementFactory::make("capsfilter")
            .property("caps", &dst_caps)
            .build()
            .map_err(pipeline_error("Failed to create capsfilter"))?;
        let appsink = gst_app::AppSink::builder().name("sink").sync(false).build();

        pipeline
            .add_many([appsrc.upcast_ref(), &convert, &scale, &filter, appsink.upcast_ref()])
            .map_err(pipeline_error("Failed to add elements"))?;
        gst::Element::link_many([appsrc.upcast_ref(), &convert, &scale, &filter, appsink.upcast_ref()])
            .map_err(pipeline_error("Failed to link elements"))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(pipeline_error("Failed to start conversion pipeline"))?;

        log::debug!(
            "[GstScaler] {} {} -> {} {}",
            src_format,
            src_size,
            dst_format,
            dst_size
        );

        Ok(Self {
            src,
            dst,
            pipeline,
            appsrc,
            appsink,
            frames: 0,
        })
    }

    /// Converts one tightly packed frame
    pub fn convert(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let expected: usize = self.src.planes.iter().map(|p| p.stride * p.rows).sum();
        if data.len() < expected {
            return Err(ConvertError::InvalidFrame(format!(
                "frame needs {} bytes, got {}",
                expected,
                data.len()
            )));
        }

        let mut buffer = self.src.to_buffer(data)?;
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_mseconds(self.frames));
        }
        self.frames += 1;
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| ConvertError::Pipeline(format!("Failed to push frame: {:?}", e)))?;

        let sample = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_seconds(PULL_TIMEOUT_SECS))
            .ok_or_else(|| ConvertError::Pipeline("no converted frame".into()))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| ConvertError::Pipeline("converted sample has no buffer".into()))?;
        self.dst.from_buffer(buffer)
    }
}

impl Drop for GstScaler {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_width_rgb_survives_row_padding() {
        // 5 pixels of RGB are 15 bytes; GStreamer pads rows to 16
        let size = Size::new(5, 3);
        let Ok(mut scaler) = GstScaler::new(PixelFormat::Rgb24, size, PixelFormat::Bgr24, size) else {
            return;
        };
        let data = [10u8, 20, 30].repeat(15);
        let converted = scaler.convert(&data).unwrap();
        assert_eq!(converted.len(), 45);
        assert_eq!(&converted[..3], &[30, 20, 10]);
        assert_eq!(&converted[42..], &[30, 20, 10]);
    }

    #[test]
    fn downscales_to_the_target_size() {
        let Ok(mut scaler) = GstScaler::new(PixelFormat::Rgb24, Size::new(32, 24), PixelFormat::Yuv420p, Size::new(16, 16))
        else {
            return;
        };
        let converted = scaler.convert(&vec![128u8; 32 * 24 * 3]).unwrap();
        assert_eq!(converted.len(), PixelFormat::Yuv420p.frame_size(Size::new(16, 16)).unwrap());
    }
}
