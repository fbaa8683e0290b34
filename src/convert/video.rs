//! Video frame conversion into what the encoder was opened with
//!
//! Up to three stages run per frame: download (hardware surface or JPEG
//! still into system memory), software scale/recolor, and upload into the
//! encoder's surface pool. A frame that already matches the target is passed
//! through untouched.

use crate::media::{FrameBuffer, HwAccel, PixelFormat, RawVideoFrame, Size};

#[cfg(feature = "gstreamer")]
use super::gst_scale::GstScaler;
use super::scale::Scaler;
use super::{ConvertError, Result};

/// The scale/recolor stage: GStreamer's `videoconvert ! videoscale` when it
/// is built in and running, the built-in scaler otherwise
enum ScaleStage {
    #[cfg(feature = "gstreamer")]
    Gst(GstScaler),
    Software(Scaler),
}

impl ScaleStage {
    fn new(src_format: PixelFormat, src_size: Size, dst_format: PixelFormat, dst_size: Size) -> Result<Self> {
        #[cfg(feature = "gstreamer")]
        match GstScaler::new(src_format, src_size, dst_format, dst_size) {
            Ok(scaler) => return Ok(Self::Gst(scaler)),
            Err(e) => log::warn!("[VideoConverter] GStreamer conversion unavailable ({}), using built-in scaler", e),
        }
        Ok(Self::Software(Scaler::new(src_format, src_size, dst_format, dst_size)?))
    }

    fn convert(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            #[cfg(feature = "gstreamer")]
            Self::Gst(scaler) => scaler.convert(data),
            Self::Software(scaler) => scaler.convert(data),
        }
    }
}

/// Format, content layout and size of frames at one end of the converter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Frame format; a hardware format for surface frames
    pub format: PixelFormat,
    /// Content layout (equal to `format` for software frames)
    pub sw_format: PixelFormat,
    pub size: Size,
}

impl FrameLayout {
    pub fn new(format: PixelFormat, sw_format: PixelFormat, size: Size) -> Self {
        Self {
            format,
            sw_format,
            size,
        }
    }

    pub fn software(format: PixelFormat, size: Size) -> Self {
        Self::new(format, format, size)
    }

    pub fn of(frame: &RawVideoFrame) -> Self {
        Self::new(frame.format, frame.sw_format(), frame.size)
    }

    /// Layout after the download stage
    fn downloaded(&self) -> PixelFormat {
        if self.format.is_compressed() {
            PixelFormat::Rgb24
        } else {
            self.sw_format
        }
    }
}

pub struct VideoConverter {
    source: FrameLayout,
    target: FrameLayout,
    hw_accel: Option<HwAccel>,
    scaler: Option<ScaleStage>,
    zero_copy: bool,
    allocations: usize,
}

impl VideoConverter {
    /// Plans the conversion from `source` to `target`. `hw_accel` is the
    /// encoder's accelerator and must be given when the target is a hardware
    /// format.
    pub fn new(source: FrameLayout, target: FrameLayout, hw_accel: Option<HwAccel>) -> Result<Self> {
        if target.format.is_hw() && hw_accel.is_none() {
            return Err(ConvertError::MissingHwAccel(target.format));
        }
        let mut converter = Self {
            source,
            target,
            hw_accel,
            scaler: None,
            zero_copy: false,
            allocations: 0,
        };
        converter.plan()?;
        Ok(converter)
    }

    fn plan(&mut self) -> Result<()> {
        let (source, target) = (self.source, self.target);
        self.zero_copy = source.format == target.format
            && source.sw_format == target.sw_format
            && source.size == target.size
            && !source.format.is_compressed();

        self.scaler = None;
        if self.zero_copy {
            log::debug!(
                "[VideoConverter] Zero-copy path for {} {}",
                source.format,
                source.size
            );
            return Ok(());
        }

        let downloaded = source.downloaded();
        if downloaded != target.sw_format || source.size != target.size {
            self.scaler = Some(ScaleStage::new(downloaded, source.size, target.sw_format, target.size)?);
        }

        log::debug!(
            "[VideoConverter] {}({}) {} -> {}({}) {}{}{}",
            source.format,
            source.sw_format,
            source.size,
            target.format,
            target.sw_format,
            target.size,
            if self.scaler.is_some() { " [scale]" } else { "" },
            if target.format.is_hw() { " [upload]" } else { "" },
        );
        Ok(())
    }

    pub fn source(&self) -> FrameLayout {
        self.source
    }

    pub fn target(&self) -> FrameLayout {
        self.target
    }

    pub fn is_zero_copy(&self) -> bool {
        self.zero_copy
    }

    /// Buffers allocated by conversions so far
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Replans for a new source layout; does nothing when it is unchanged
    pub fn update_source(&mut self, source: FrameLayout) -> Result<()> {
        if source == self.source {
            return Ok(());
        }
        log::info!(
            "[VideoConverter] Source changed from {} {} to {} {}",
            self.source.format,
            self.source.size,
            source.format,
            source.size
        );
        self.source = source;
        self.plan()
    }

    pub fn convert(&mut self, frame: RawVideoFrame) -> Result<RawVideoFrame> {
        if self.zero_copy {
            return Ok(frame);
        }

        // Stage outputs are fresh buffers the result can take over
        let mut fresh: Option<Vec<u8>> = None;

        if let (FrameBuffer::Memory(data), true) = (&frame.buffer, frame.format.is_compressed()) {
            let image = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.to_rgb8();
            self.allocations += 1;
            // JPEG stills report their real size only once decoded
            let size = Size::new(image.width(), image.height());
            if size != self.source.size {
                self.update_source(FrameLayout::new(PixelFormat::Jpeg, PixelFormat::Jpeg, size))?;
            }
            fresh = Some(image.into_raw());
        }

        if let Some(scaler) = &mut self.scaler {
            let scaled = scaler.convert(content(&fresh, &frame.buffer))?;
            self.allocations += 1;
            fresh = Some(scaled);
        }

        let expected = self
            .target
            .sw_format
            .frame_size(self.target.size)
            .ok_or(ConvertError::UnsupportedFormat(self.target.sw_format))?;
        let available = content(&fresh, &frame.buffer).len();
        if available < expected {
            return Err(ConvertError::InvalidFrame(format!(
                "expected {} bytes for {} {}, got {}",
                expected, self.target.sw_format, self.target.size, available
            )));
        }

        let converted = if self.target.format.is_hw() {
            let accel = self
                .hw_accel
                .as_ref()
                .ok_or(ConvertError::MissingHwAccel(self.target.format))?;
            let surface = accel.upload(&content(&fresh, &frame.buffer)[..expected])?;
            self.allocations += 1;
            RawVideoFrame::from_surface(surface)
        } else {
            let data = match fresh {
                Some(mut data) => {
                    data.truncate(expected);
                    data
                }
                None => {
                    self.allocations += 1;
                    content(&None, &frame.buffer)[..expected].to_vec()
                }
            };
            RawVideoFrame::from_memory(self.target.sw_format, self.target.size, data)
        };

        let mut converted = converted.with_times(frame.start_time, frame.end_time);
        converted.frame_rate = frame.frame_rate;
        Ok(converted)
    }
}

/// Bytes the next stage reads: the last stage output, else the frame itself
fn content<'a>(fresh: &'a Option<Vec<u8>>, buffer: &'a FrameBuffer) -> &'a [u8] {
    match (fresh, buffer) {
        (Some(data), _) => data,
        (None, FrameBuffer::Memory(data)) => data,
        (None, FrameBuffer::Surface(surface)) => surface.data(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::HwDeviceType;
    use std::sync::Arc;

    fn rgb_frame(size: Size) -> RawVideoFrame {
        let data = [30u8, 60, 90].repeat(size.area() as usize);
        RawVideoFrame::from_memory(PixelFormat::Rgb24, size, data).with_times(Some(1000), Some(2000))
    }

    #[test]
    fn matching_frames_pass_through_without_allocation() {
        let size = Size::new(4, 4);
        let layout = FrameLayout::software(PixelFormat::Rgb24, size);
        let mut converter = VideoConverter::new(layout, layout, None).unwrap();

        let frame = rgb_frame(size);
        let original = frame.buffer.memory().unwrap().clone();
        let converted = converter.convert(frame).unwrap();

        assert!(converter.is_zero_copy());
        assert!(Arc::ptr_eq(&original, converted.buffer.memory().unwrap()));
        assert_eq!(converter.allocations(), 0);
    }

    #[test]
    fn recolors_and_scales_keeping_timestamps() {
        let src = Size::new(8, 8);
        let dst = Size::new(4, 4);
        let mut converter = VideoConverter::new(
            FrameLayout::software(PixelFormat::Rgb24, src),
            FrameLayout::software(PixelFormat::Yuv420p, dst),
            None,
        )
        .unwrap();

        let converted = converter.convert(rgb_frame(src)).unwrap();
        assert_eq!(converted.format, PixelFormat::Yuv420p);
        assert_eq!(converted.size, dst);
        assert_eq!(converted.start_time, Some(1000));
        assert_eq!(converted.end_time, Some(2000));
        assert!(converted.is_valid());
        assert_eq!(converter.allocations(), 1);
    }

    #[test]
    fn uploads_into_the_encoder_pool() {
        let size = Size::new(4, 4);
        let accel = HwAccel::create(HwDeviceType::Vaapi, &[HwDeviceType::Vaapi]).unwrap();
        accel.create_frames_context(PixelFormat::Nv12, size).unwrap();

        let mut converter = VideoConverter::new(
            FrameLayout::software(PixelFormat::Rgb24, size),
            FrameLayout::new(PixelFormat::Vaapi, PixelFormat::Nv12, size),
            Some(accel.clone()),
        )
        .unwrap();

        let converted = converter.convert(rgb_frame(size)).unwrap();
        assert_eq!(converted.format, PixelFormat::Vaapi);
        assert_eq!(converted.sw_format(), PixelFormat::Nv12);
        assert_eq!(accel.surfaces_in_use(), 1);
        drop(converted);
        assert_eq!(accel.surfaces_in_use(), 0);
    }

    #[test]
    fn downloads_surfaces() {
        let size = Size::new(2, 2);
        let accel = HwAccel::create(HwDeviceType::Cuda, &[HwDeviceType::Cuda]).unwrap();
        accel.create_frames_context(PixelFormat::Nv12, size).unwrap();
        let surface = accel.upload(&[16, 16, 16, 16, 128, 128]).unwrap();

        let mut converter = VideoConverter::new(
            FrameLayout::new(PixelFormat::Cuda, PixelFormat::Nv12, size),
            FrameLayout::software(PixelFormat::Nv12, size),
            None,
        )
        .unwrap();
        let converted = converter.convert(RawVideoFrame::from_surface(surface)).unwrap();
        assert_eq!(&converted.buffer.memory().unwrap()[..], &[16, 16, 16, 16, 128, 128]);
        assert_eq!(converter.allocations(), 1);
    }

    #[test]
    fn decodes_jpeg_stills() {
        let size = Size::new(8, 8);
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode(&[128u8; 8 * 8 * 3], 8, 8, image::ColorType::Rgb8.into())
            .unwrap();

        let mut converter = VideoConverter::new(
            FrameLayout::software(PixelFormat::Jpeg, size),
            FrameLayout::software(PixelFormat::Yuv420p, size),
            None,
        )
        .unwrap();
        let frame = RawVideoFrame::from_memory(PixelFormat::Jpeg, size, jpeg);
        let converted = converter.convert(frame).unwrap();
        assert_eq!(converted.format, PixelFormat::Yuv420p);
        assert!(converted.is_valid());
    }

    #[test]
    fn update_source_replans() {
        let size = Size::new(4, 4);
        let target = FrameLayout::software(PixelFormat::Rgb24, size);
        let mut converter = VideoConverter::new(target, target, None).unwrap();
        assert!(converter.is_zero_copy());

        converter
            .update_source(FrameLayout::software(PixelFormat::Bgr24, size))
            .unwrap();
        assert!(!converter.is_zero_copy());

        let frame = RawVideoFrame::from_memory(PixelFormat::Bgr24, size, [90u8, 60, 30].repeat(16));
        let converted = converter.convert(frame).unwrap();
        assert_eq!(converted.format, PixelFormat::Rgb24);
        assert_eq!(&converted.buffer.memory().unwrap()[..3], &[30, 60, 90]);
    }

    #[test]
    fn hardware_target_needs_an_accelerator() {
        let size = Size::new(4, 4);
        let result = VideoConverter::new(
            FrameLayout::software(PixelFormat::Nv12, size),
            FrameLayout::new(PixelFormat::Cuda, PixelFormat::Nv12, size),
            None,
        );
        assert!(matches!(result, Err(ConvertError::MissingHwAccel(PixelFormat::Cuda))));
    }
}
