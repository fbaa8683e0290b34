//! Hardware acceleration contexts
//!
//! Each video encoder that targets a hardware pixel format owns one
//! [`HwAccel`]. The accelerator owns a pool of surfaces; frames refer to a
//! surface through a [`HwSurface`] handle, and the surface goes back to the
//! pool when the last handle is dropped. Encoders never manage surface
//! lifetimes by hand.
//!
//! Surfaces live in system memory. Nothing here talks to a device driver:
//! `upload` is a copy into a pooled buffer, and the GStreamer hardware
//! encoder element does the real transfer to the GPU when the buffer is
//! pushed. "Zero-copy" therefore means no conversion pass on our side, not
//! a frame that stays on the device end to end.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::format::{PixelFormat, Size};

#[derive(Error, Debug)]
pub enum HwAccelError {
    #[error("Hardware device {0:?} is not available")]
    DeviceUnavailable(HwDeviceType),
    #[error("Surface pool is not configured")]
    PoolNotConfigured,
    #[error("Surface pool exhausted ({0} surfaces in use)")]
    PoolExhausted(usize),
    #[error("Surface data has {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("{0} cannot be stored in a hardware surface")]
    UnsupportedFormat(PixelFormat),
}

/// Hardware device families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwDeviceType {
    Cuda,
    Vaapi,
    Qsv,
    VideoToolbox,
    D3d11,
    MediaCodec,
}

impl HwDeviceType {
    /// Pixel format of frames stored on this device
    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            HwDeviceType::Cuda => PixelFormat::Cuda,
            HwDeviceType::Vaapi => PixelFormat::Vaapi,
            HwDeviceType::Qsv => PixelFormat::Qsv,
            HwDeviceType::VideoToolbox => PixelFormat::VideoToolbox,
            HwDeviceType::D3d11 => PixelFormat::D3d11,
            HwDeviceType::MediaCodec => PixelFormat::MediaCodec,
        }
    }

    pub fn from_pixel_format(format: PixelFormat) -> Option<HwDeviceType> {
        match format {
            PixelFormat::Cuda => Some(HwDeviceType::Cuda),
            PixelFormat::Vaapi => Some(HwDeviceType::Vaapi),
            PixelFormat::Qsv => Some(HwDeviceType::Qsv),
            PixelFormat::VideoToolbox => Some(HwDeviceType::VideoToolbox),
            PixelFormat::D3d11 => Some(HwDeviceType::D3d11),
            PixelFormat::MediaCodec => Some(HwDeviceType::MediaCodec),
            _ => None,
        }
    }

    /// Software formats a surface of this device can hold
    pub fn sw_formats(&self) -> &'static [PixelFormat] {
        match self {
            HwDeviceType::VideoToolbox => &[PixelFormat::Nv12, PixelFormat::P010le, PixelFormat::Bgra],
            HwDeviceType::Cuda => &[
                PixelFormat::Nv12,
                PixelFormat::P010le,
                PixelFormat::Yuv420p,
                PixelFormat::Yuv444p,
                PixelFormat::Bgra,
                PixelFormat::Rgba,
            ],
            _ => &[PixelFormat::Nv12, PixelFormat::P010le],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HwDeviceType::Cuda => "cuda",
            HwDeviceType::Vaapi => "vaapi",
            HwDeviceType::Qsv => "qsv",
            HwDeviceType::VideoToolbox => "videotoolbox",
            HwDeviceType::D3d11 => "d3d11va",
            HwDeviceType::MediaCodec => "mediacodec",
        }
    }

    /// Devices worth probing on the current platform, most preferred first
    pub fn platform_candidates() -> &'static [HwDeviceType] {
        if cfg!(target_os = "macos") {
            &[HwDeviceType::VideoToolbox]
        } else if cfg!(target_os = "windows") {
            &[HwDeviceType::Cuda, HwDeviceType::D3d11, HwDeviceType::Qsv]
        } else if cfg!(target_os = "android") {
            &[HwDeviceType::MediaCodec]
        } else {
            &[HwDeviceType::Cuda, HwDeviceType::Vaapi, HwDeviceType::Qsv]
        }
    }
}

const DEFAULT_POOL_SIZE: usize = 16;

#[derive(Debug)]
struct PoolConfig {
    sw_format: PixelFormat,
    size: Size,
    frame_bytes: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    config: Option<PoolConfig>,
    free: Vec<Vec<u8>>,
    in_use: usize,
}

#[derive(Debug)]
struct SurfacePool {
    device: HwDeviceType,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl SurfacePool {
    fn release(&self, mut data: Vec<u8>) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if state.free.len() < self.capacity {
            data.clear();
            state.free.push(data);
        }
    }
}

/// An opened hardware device together with its surface pool
#[derive(Debug, Clone)]
pub struct HwAccel {
    pool: Arc<SurfacePool>,
}

impl HwAccel {
    /// Opens `device` if it is among the `available` devices
    pub fn create(device: HwDeviceType, available: &[HwDeviceType]) -> Result<HwAccel, HwAccelError> {
        if !available.contains(&device) {
            return Err(HwAccelError::DeviceUnavailable(device));
        }
        log::debug!("[HwAccel] Opened {} device", device.name());
        Ok(HwAccel {
            pool: Arc::new(SurfacePool {
                device,
                capacity: DEFAULT_POOL_SIZE,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    pub fn device(&self) -> HwDeviceType {
        self.pool.device
    }

    pub fn hw_format(&self) -> PixelFormat {
        self.pool.device.pixel_format()
    }

    /// Software formats an encoder may upload into this device
    pub fn allowed_sw_formats(&self) -> &'static [PixelFormat] {
        self.pool.device.sw_formats()
    }

    /// (Re)configures the surface pool; surfaces handed out before keep their
    /// old layout until dropped.
    pub fn create_frames_context(&self, sw_format: PixelFormat, size: Size) -> Result<(), HwAccelError> {
        if !self.allowed_sw_formats().contains(&sw_format) {
            return Err(HwAccelError::UnsupportedFormat(sw_format));
        }
        let frame_bytes = sw_format
            .frame_size(size)
            .ok_or(HwAccelError::UnsupportedFormat(sw_format))?;

        let mut state = self.pool.state.lock();
        state.free.clear();
        state.config = Some(PoolConfig {
            sw_format,
            size,
            frame_bytes,
        });
        Ok(())
    }

    pub fn frames_context(&self) -> Option<(PixelFormat, Size)> {
        let state = self.pool.state.lock();
        state.config.as_ref().map(|c| (c.sw_format, c.size))
    }

    /// Copies a software frame into a pool surface (system memory)
    pub fn upload(&self, data: &[u8]) -> Result<HwSurface, HwAccelError> {
        let (mut buffer, sw_format, size) = {
            let mut state = self.pool.state.lock();
            let (sw_format, size, frame_bytes) = match &state.config {
                Some(c) => (c.sw_format, c.size, c.frame_bytes),
                None => return Err(HwAccelError::PoolNotConfigured),
            };
            if data.len() != frame_bytes {
                return Err(HwAccelError::SizeMismatch {
                    expected: frame_bytes,
                    actual: data.len(),
                });
            }
            if state.in_use >= self.pool.capacity {
                return Err(HwAccelError::PoolExhausted(state.in_use));
            }
            state.in_use += 1;
            (state.free.pop().unwrap_or_default(), sw_format, size)
        };

        buffer.extend_from_slice(data);
        Ok(HwSurface {
            inner: Arc::new(SurfaceInner {
                pool: self.pool.clone(),
                sw_format,
                size,
                data: buffer,
            }),
        })
    }

    pub fn surfaces_in_use(&self) -> usize {
        self.pool.state.lock().in_use
    }
}

#[derive(Debug)]
struct SurfaceInner {
    pool: Arc<SurfacePool>,
    sw_format: PixelFormat,
    size: Size,
    data: Vec<u8>,
}

impl Drop for SurfaceInner {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}

/// Handle to a surface owned by a [`HwAccel`] pool
#[derive(Debug, Clone)]
pub struct HwSurface {
    inner: Arc<SurfaceInner>,
}

impl HwSurface {
    pub fn device(&self) -> HwDeviceType {
        self.inner.pool.device
    }

    pub fn sw_format(&self) -> PixelFormat {
        self.inner.sw_format
    }

    pub fn size(&self) -> Size {
        self.inner.size
    }

    /// Surface content in its software layout (the download path)
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_device_is_rejected() {
        let err = HwAccel::create(HwDeviceType::Cuda, &[HwDeviceType::Vaapi]).unwrap_err();
        assert!(matches!(err, HwAccelError::DeviceUnavailable(HwDeviceType::Cuda)));
    }

    #[test]
    fn surfaces_return_to_pool_on_drop() {
        let accel = HwAccel::create(HwDeviceType::Vaapi, &[HwDeviceType::Vaapi]).unwrap();
        let size = Size::new(4, 2);
        accel.create_frames_context(PixelFormat::Nv12, size).unwrap();

        let data = vec![7u8; PixelFormat::Nv12.frame_size(size).unwrap()];
        let surface = accel.upload(&data).unwrap();
        let copy = surface.clone();
        assert_eq!(accel.surfaces_in_use(), 1);
        assert_eq!(copy.data(), &data[..]);

        drop(surface);
        assert_eq!(accel.surfaces_in_use(), 1);
        drop(copy);
        assert_eq!(accel.surfaces_in_use(), 0);
    }

    #[test]
    fn upload_is_a_copy_that_reuses_pooled_memory() {
        let accel = HwAccel::create(HwDeviceType::Qsv, &[HwDeviceType::Qsv]).unwrap();
        let size = Size::new(2, 2);
        accel.create_frames_context(PixelFormat::Nv12, size).unwrap();

        let data = vec![3u8; PixelFormat::Nv12.frame_size(size).unwrap()];
        let surface = accel.upload(&data).unwrap();
        assert_eq!(surface.data(), &data[..]);
        assert_ne!(surface.data().as_ptr(), data.as_ptr());

        let first = surface.data().as_ptr();
        drop(surface);
        let again = accel.upload(&[9u8; 6]).unwrap();
        assert_eq!(again.data().as_ptr(), first);
        assert_eq!(again.data(), &[9u8; 6]);
    }

    #[test]
    fn upload_checks_frame_size() {
        let accel = HwAccel::create(HwDeviceType::Cuda, &[HwDeviceType::Cuda]).unwrap();
        assert!(matches!(accel.upload(&[0; 4]), Err(HwAccelError::PoolNotConfigured)));

        accel
            .create_frames_context(PixelFormat::Yuv420p, Size::new(2, 2))
            .unwrap();
        assert!(matches!(
            accel.upload(&[0; 4]),
            Err(HwAccelError::SizeMismatch { expected: 6, actual: 4 })
        ));
    }
}
