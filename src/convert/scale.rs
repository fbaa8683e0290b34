//! Software scaling and color conversion
//!
//! Frames are unpacked into a full resolution three-plane intermediate
//! (YUV 4:4:4 or RGB, 8-bit scale floats), resized bilinearly, converted
//! between YUV and RGB when the color models differ (BT.601, limited range)
//! and packed into the destination layout.

use crate::media::{PixelFormat, Size};

use super::{ConvertError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorModel {
    Yuv,
    Rgb,
}

/// Three full resolution planes; Y/U/V or R/G/B depending on `model`
struct Planes {
    width: usize,
    height: usize,
    model: ColorModel,
    c: [Vec<f32>; 3],
}

impl Planes {
    fn new(width: usize, height: usize, model: ColorModel) -> Self {
        let n = width * height;
        Self {
            width,
            height,
            model,
            c: [vec![0.0; n], vec![0.0; n], vec![0.0; n]],
        }
    }
}

/// Whether the scaler can read and write `format`
pub fn is_supported(format: PixelFormat) -> bool {
    use PixelFormat::*;
    matches!(
        format,
        Yuv420p
            | Yuv422p
            | Yuv444p
            | Nv12
            | Yuyv422
            | Uyvy422
            | Gray8
            | Rgb24
            | Bgr24
            | Rgba
            | Bgra
            | Argb
            | Yuv420p10le
            | P010le
    )
}

/// A configured conversion between two software layouts
#[derive(Debug, Clone, PartialEq)]
pub struct Scaler {
    src_format: PixelFormat,
    src_size: Size,
    dst_format: PixelFormat,
    dst_size: Size,
}

impl Scaler {
    pub fn new(src_format: PixelFormat, src_size: Size, dst_format: PixelFormat, dst_size: Size) -> Result<Self> {
        for format in [src_format, dst_format] {
            if !is_supported(format) {
                return Err(ConvertError::UnsupportedFormat(format));
            }
        }
        if src_size.is_empty() || dst_size.is_empty() {
            return Err(ConvertError::InvalidFrame(format!(
                "cannot scale {} to {}",
                src_size, dst_size
            )));
        }
        Ok(Self {
            src_format,
            src_size,
            dst_format,
            dst_size,
        })
    }

    pub fn src_format(&self) -> PixelFormat {
        self.src_format
    }

    pub fn src_size(&self) -> Size {
        self.src_size
    }

    pub fn dst_format(&self) -> PixelFormat {
        self.dst_format
    }

    pub fn dst_size(&self) -> Size {
        self.dst_size
    }

    /// Converts one tightly packed frame
    pub fn convert(&self, data: &[u8]) -> Result<Vec<u8>> {
        let expected = self
            .src_format
            .frame_size(self.src_size)
            .ok_or(ConvertError::UnsupportedFormat(self.src_format))?;
        if data.len() < expected {
            return Err(ConvertError::InvalidFrame(format!(
                "{} {} frame needs {} bytes, got {}",
                self.src_format,
                self.src_size,
                expected,
                data.len()
            )));
        }

        let planes = unpack(data, self.src_format, self.src_size)?;
        let planes = resize(planes, self.dst_size);
        let planes = to_model(planes, model_of(self.dst_format));
        pack(&planes, self.dst_format)
    }
}

fn model_of(format: PixelFormat) -> ColorModel {
    if format.descriptor().rgb {
        ColorModel::Rgb
    } else {
        ColorModel::Yuv
    }
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn ten_to_eight(v: u16) -> f32 {
    f32::from(v.min(1023)) * 255.0 / 1023.0
}

fn eight_to_ten(v: f32) -> u16 {
    (v * 1023.0 / 255.0).round().clamp(0.0, 1023.0) as u16
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn unpack(data: &[u8], format: PixelFormat, size: Size) -> Result<Planes> {
    use PixelFormat::*;
    let layout = format
        .planes(size)
        .ok_or(ConvertError::UnsupportedFormat(format))?;
    let (w, h) = (size.width as usize, size.height as usize);
    let mut out = Planes::new(w, h, model_of(format));
    let desc = format.descriptor();
    let (sx, sy) = (desc.log2_chroma_w as usize, desc.log2_chroma_h as usize);

    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let (cx, cy) = (x >> sx, y >> sy);
            let px = match format {
                Yuv420p | Yuv422p | Yuv444p => [
                    data[layout[0].offset + y * layout[0].stride + x],
                    data[layout[1].offset + cy * layout[1].stride + cx],
                    data[layout[2].offset + cy * layout[2].stride + cx],
                ]
                .map(f32::from),
                Nv12 => {
                    let uv = layout[1].offset + cy * layout[1].stride + cx * 2;
                    [data[layout[0].offset + y * layout[0].stride + x], data[uv], data[uv + 1]].map(f32::from)
                }
                Yuyv422 | Uyvy422 => {
                    let base = y * layout[0].stride + (x / 2) * 4;
                    let (luma, u, v) = if format == Yuyv422 {
                        (base + (x % 2) * 2, base + 1, base + 3)
                    } else {
                        (base + 1 + (x % 2) * 2, base, base + 2)
                    };
                    [data[luma], data[u], data[v]].map(f32::from)
                }
                Gray8 => [f32::from(data[y * w + x]), 128.0, 128.0],
                Rgb24 | Bgr24 | Rgba | Bgra | Argb => {
                    let (bpp, order) = match format {
                        Rgb24 => (3, [0, 1, 2]),
                        Bgr24 => (3, [2, 1, 0]),
                        Rgba => (4, [0, 1, 2]),
                        Bgra => (4, [2, 1, 0]),
                        _ => (4, [1, 2, 3]),
                    };
                    let p = y * layout[0].stride + x * bpp;
                    order.map(|o| f32::from(data[p + o]))
                }
                Yuv420p10le => [
                    read_u16_le(data, layout[0].offset + y * layout[0].stride + x * 2),
                    read_u16_le(data, layout[1].offset + cy * layout[1].stride + cx * 2),
                    read_u16_le(data, layout[2].offset + cy * layout[2].stride + cx * 2),
                ]
                .map(ten_to_eight),
                P010le => {
                    let uv = layout[1].offset + cy * layout[1].stride + cx * 4;
                    [
                        read_u16_le(data, layout[0].offset + y * layout[0].stride + x * 2),
                        read_u16_le(data, uv),
                        read_u16_le(data, uv + 2),
                    ]
                    .map(|v| ten_to_eight(v >> 6))
                }
                other => return Err(ConvertError::UnsupportedFormat(other)),
            };
            for (plane, value) in out.c.iter_mut().zip(px) {
                plane[i] = value;
            }
        }
    }
    Ok(out)
}

fn resize(planes: Planes, size: Size) -> Planes {
    let (dw, dh) = (size.width as usize, size.height as usize);
    if dw == planes.width && dh == planes.height {
        return planes;
    }
    let (sw, sh) = (planes.width, planes.height);
    let mut out = Planes::new(dw, dh, planes.model);

    let sample_pos = |d: usize, dst: usize, src: usize| -> (usize, usize, f32) {
        let pos = ((d as f32 + 0.5) * src as f32 / dst as f32 - 0.5).clamp(0.0, (src - 1) as f32);
        let p0 = pos.floor() as usize;
        (p0, (p0 + 1).min(src - 1), pos - p0 as f32)
    };

    for y in 0..dh {
        let (y0, y1, fy) = sample_pos(y, dh, sh);
        for x in 0..dw {
            let (x0, x1, fx) = sample_pos(x, dw, sw);
            for (dst, src) in out.c.iter_mut().zip(&planes.c) {
                let top = src[y0 * sw + x0] * (1.0 - fx) + src[y0 * sw + x1] * fx;
                let bottom = src[y1 * sw + x0] * (1.0 - fx) + src[y1 * sw + x1] * fx;
                dst[y * dw + x] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    out
}

fn to_model(mut planes: Planes, model: ColorModel) -> Planes {
    if planes.model == model {
        return planes;
    }
    let [a, b, c] = &mut planes.c;
    for ((p0, p1), p2) in a.iter_mut().zip(b.iter_mut()).zip(c.iter_mut()) {
        let (x0, x1, x2) = (*p0, *p1, *p2);
        let converted = match model {
            ColorModel::Yuv => {
                let (r, g, b) = (x0 / 255.0, x1 / 255.0, x2 / 255.0);
                [
                    16.0 + 65.481 * r + 128.553 * g + 24.966 * b,
                    128.0 - 37.797 * r - 74.203 * g + 112.0 * b,
                    128.0 + 112.0 * r - 93.786 * g - 18.214 * b,
                ]
            }
            ColorModel::Rgb => {
                let (y, u, v) = (1.164 * (x0 - 16.0), x1 - 128.0, x2 - 128.0);
                [y + 1.596 * v, y - 0.392 * u - 0.813 * v, y + 2.017 * u]
            }
        };
        *p0 = converted[0];
        *p1 = converted[1];
        *p2 = converted[2];
    }
    planes.model = model;
    planes
}

/// Box average of a chroma block
fn chroma_at(plane: &[f32], width: usize, height: usize, cx: usize, cy: usize, sx: usize, sy: usize) -> f32 {
    let mut sum = 0.0;
    let mut count = 0.0;
    for y in (cy << sy)..((cy + 1) << sy).min(height) {
        for x in (cx << sx)..((cx + 1) << sx).min(width) {
            sum += plane[y * width + x];
            count += 1.0;
        }
    }
    if count > 0.0 {
        sum / count
    } else {
        128.0
    }
}

fn pack(planes: &Planes, format: PixelFormat) -> Result<Vec<u8>> {
    use PixelFormat::*;
    let size = Size::new(planes.width as u32, planes.height as u32);
    let layout = format
        .planes(size)
        .ok_or(ConvertError::UnsupportedFormat(format))?;
    let total: usize = layout.iter().map(|p| p.stride * p.rows).sum();
    let mut out = vec![0u8; total];
    let (w, h) = (planes.width, planes.height);
    let desc = format.descriptor();
    let (sx, sy) = (desc.log2_chroma_w as usize, desc.log2_chroma_h as usize);
    let (cw, ch) = ((w + (1 << sx) - 1) >> sx, (h + (1 << sy) - 1) >> sy);
    let chroma = |plane: usize, cx: usize, cy: usize| chroma_at(&planes.c[plane], w, h, cx, cy, sx, sy);

    match format {
        Yuv420p | Yuv422p | Yuv444p | Nv12 | Yuv420p10le | P010le => {
            let wide = desc.bit_depth > 8;
            for y in 0..h {
                for x in 0..w {
                    let v = planes.c[0][y * w + x];
                    if wide {
                        let mut sample = eight_to_ten(v);
                        if format == P010le {
                            sample <<= 6;
                        }
                        let o = layout[0].offset + y * layout[0].stride + x * 2;
                        out[o..o + 2].copy_from_slice(&sample.to_le_bytes());
                    } else {
                        out[layout[0].offset + y * layout[0].stride + x] = to_u8(v);
                    }
                }
            }
            for cy in 0..ch {
                for cx in 0..cw {
                    let (u, v) = (chroma(1, cx, cy), chroma(2, cx, cy));
                    match format {
                        Nv12 => {
                            let o = layout[1].offset + cy * layout[1].stride + cx * 2;
                            out[o] = to_u8(u);
                            out[o + 1] = to_u8(v);
                        }
                        P010le => {
                            let o = layout[1].offset + cy * layout[1].stride + cx * 4;
                            out[o..o + 2].copy_from_slice(&(eight_to_ten(u) << 6).to_le_bytes());
                            out[o + 2..o + 4].copy_from_slice(&(eight_to_ten(v) << 6).to_le_bytes());
                        }
                        Yuv420p10le => {
                            let ou = layout[1].offset + cy * layout[1].stride + cx * 2;
                            let ov = layout[2].offset + cy * layout[2].stride + cx * 2;
                            out[ou..ou + 2].copy_from_slice(&eight_to_ten(u).to_le_bytes());
                            out[ov..ov + 2].copy_from_slice(&eight_to_ten(v).to_le_bytes());
                        }
                        _ => {
                            out[layout[1].offset + cy * layout[1].stride + cx] = to_u8(u);
                            out[layout[2].offset + cy * layout[2].stride + cx] = to_u8(v);
                        }
                    }
                }
            }
        }
        Yuyv422 | Uyvy422 => {
            for y in 0..h {
                for cx in 0..cw {
                    let x0 = cx * 2;
                    let x1 = (x0 + 1).min(w - 1);
                    let y0 = to_u8(planes.c[0][y * w + x0]);
                    let y1 = to_u8(planes.c[0][y * w + x1]);
                    let u = to_u8(chroma(1, cx, y));
                    let v = to_u8(chroma(2, cx, y));
                    let o = y * layout[0].stride + cx * 4;
                    let bytes = if format == Yuyv422 { [y0, u, y1, v] } else { [u, y0, v, y1] };
                    out[o..o + 4].copy_from_slice(&bytes);
                }
            }
        }
        Gray8 => {
            for (dst, src) in out.iter_mut().zip(&planes.c[0]) {
                *dst = to_u8(*src);
            }
        }
        Rgb24 | Bgr24 | Rgba | Bgra | Argb => {
            let (bpp, order, alpha) = match format {
                Rgb24 => (3, [0, 1, 2], None),
                Bgr24 => (3, [2, 1, 0], None),
                Rgba => (4, [0, 1, 2], Some(3)),
                Bgra => (4, [2, 1, 0], Some(3)),
                _ => (4, [1, 2, 3], Some(0)),
            };
            for i in 0..w * h {
                let o = i * bpp;
                for (component, offset) in order.iter().enumerate() {
                    out[o + offset] = to_u8(planes.c[component][i]);
                }
                if let Some(a) = alpha {
                    out[o + a] = 255;
                }
            }
        }
        other => return Err(ConvertError::UnsupportedFormat(other)),
    }
    Ok(out)
}
