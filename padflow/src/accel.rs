// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Pixel conversion back ends.
//!
//! Fan-out stages hand their scale, crop and colour conversion work to a
//! [`Converter`]. The call is synchronous: it returns once the output frame
//! is fully written. Hardware back ends implement the trait on top of their
//! own engines; [`SoftwareConverter`] is a portable nearest-neighbour
//! implementation.

use crate::buffer::CropRect;
use crate::error::{Error, Result};
use crate::format::{PixelFormat, VideoInfo};

/// A mapped, readable frame.
#[derive(Debug, Clone, Copy)]
pub struct VideoFrame<'a> {
    info: VideoInfo,
    data: &'a [u8],
}

impl<'a> VideoFrame<'a> {
    /// Maps `data` as a frame of `info`. Fails when `data` is too short.
    pub fn new(info: VideoInfo, data: &'a [u8]) -> Result<Self> {
        check_size(&info, data.len())?;
        Ok(VideoFrame { info, data })
    }

    /// Frame format.
    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    /// Frame bytes.
    pub fn data(&self) -> &[u8] {
        self.data
    }
}

/// A mapped, writable frame.
#[derive(Debug)]
pub struct VideoFrameMut<'a> {
    info: VideoInfo,
    data: &'a mut [u8],
}

impl<'a> VideoFrameMut<'a> {
    /// Maps `data` as a frame of `info`. Fails when `data` is too short.
    pub fn new(info: VideoInfo, data: &'a mut [u8]) -> Result<Self> {
        check_size(&info, data.len())?;
        Ok(VideoFrameMut { info, data })
    }

    /// Frame format.
    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    /// Frame bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }
}

fn check_size(info: &VideoInfo, actual: usize) -> Result<()> {
    let expected = info.size();
    if actual < expected {
        return Err(Error::FrameSize { expected, actual });
    }
    Ok(())
}

/// Options of one conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Source rectangle; `None` converts the whole input frame.
    pub crop: Option<CropRect>,
}

/// Scale, crop and colour conversion engine.
pub trait Converter: Send + Sync {
    /// Back end name, used in logs.
    fn name(&self) -> &str;

    /// Whether `from` frames can be converted into `to` frames. Same-format
    /// scaling must always be supported.
    fn can_convert(&self, from: PixelFormat, to: PixelFormat) -> bool;

    /// Converts `input` into `output`, scaling the selected source rectangle
    /// to the output dimensions.
    fn convert(
        &self,
        input: &VideoFrame<'_>,
        output: &mut VideoFrameMut<'_>,
        options: &ConvertOptions,
    ) -> Result<()>;
}

/// Nearest-neighbour software converter.
///
/// Scales and crops every [`PixelFormat`] in place and converts NV12 or I420
/// into RGB, BGR, RGBA, BGRA and GRAY8.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareConverter;

impl SoftwareConverter {
    /// Creates the converter.
    pub fn new() -> Self {
        SoftwareConverter
    }
}

impl Converter for SoftwareConverter {
    fn name(&self) -> &str {
        "software"
    }

    fn can_convert(&self, from: PixelFormat, to: PixelFormat) -> bool {
        from == to
            || (matches!(from, PixelFormat::Nv12 | PixelFormat::I420)
                && matches!(
                    to,
                    PixelFormat::Rgb
                        | PixelFormat::Bgr
                        | PixelFormat::Rgba
                        | PixelFormat::Bgra
                        | PixelFormat::Gray8
                ))
    }

    fn convert(
        &self,
        input: &VideoFrame<'_>,
        output: &mut VideoFrameMut<'_>,
        options: &ConvertOptions,
    ) -> Result<()> {
        let (src, dst) = (*input.info(), *output.info());
        if !self.can_convert(src.format, dst.format) {
            return Err(Error::UnsupportedConversion {
                from: src.format,
                to: dst.format,
            });
        }
        let rect = options
            .crop
            .unwrap_or_else(|| CropRect::full(src.width, src.height))
            .clamp_to(src.width, src.height)
            .ok_or_else(|| Error::Accelerator("crop rectangle outside the frame".to_owned()))?;

        let data = input.data();
        let out = output.data_mut();
        for oy in 0..dst.height {
            let sy = rect.y + (oy as u64 * rect.height as u64 / dst.height as u64) as u32;
            for ox in 0..dst.width {
                let sx = rect.x + (ox as u64 * rect.width as u64 / dst.width as u64) as u32;
                let pixel = read_pixel(&src, data, sx, sy);
                write_pixel(&dst, out, ox, oy, pixel);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Pixel {
    Yuv(u8, u8, u8),
    Rgba(u8, u8, u8, u8),
}

impl Pixel {
    fn to_rgba(self) -> (u8, u8, u8, u8) {
        match self {
            Pixel::Rgba(r, g, b, a) => (r, g, b, a),
            Pixel::Yuv(y, u, v) => {
                let c = y as i32 - 16;
                let d = u as i32 - 128;
                let e = v as i32 - 128;
                let clamp = |x: i32| x.clamp(0, 255) as u8;
                (
                    clamp((298 * c + 409 * e + 128) >> 8),
                    clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
                    clamp((298 * c + 516 * d + 128) >> 8),
                    255,
                )
            }
        }
    }

    fn to_yuv(self) -> (u8, u8, u8) {
        match self {
            Pixel::Yuv(y, u, v) => (y, u, v),
            Pixel::Rgba(r, g, b, _) => {
                let (r, g, b) = (r as i32, g as i32, b as i32);
                let clamp = |x: i32| x.clamp(0, 255) as u8;
                (
                    clamp(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16),
                    clamp(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128),
                    clamp(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128),
                )
            }
        }
    }
}

/// Byte offsets of the Y, U and V samples of pixel `(x, y)` in a YUV frame.
fn yuv_offsets(info: &VideoInfo, x: u32, y: u32) -> (usize, usize, usize) {
    let (w, h) = (info.width as usize, info.height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let (x, y) = (x as usize, y as usize);
    let (cx, cy) = (x / 2, y / 2);
    match info.format {
        PixelFormat::Nv12 => {
            let uv = w * h + cy * 2 * cw + 2 * cx;
            (y * w + x, uv, uv + 1)
        }
        PixelFormat::I420 => (y * w + x, w * h + cy * cw + cx, w * h + cw * ch + cy * cw + cx),
        PixelFormat::Yuy2 => {
            let base = y * cw * 4 + cx * 4;
            (base + (x % 2) * 2, base + 1, base + 3)
        }
        PixelFormat::Uyvy => {
            let base = y * cw * 4 + cx * 4;
            (base + 1 + (x % 2) * 2, base, base + 2)
        }
        _ => unreachable!("not a YUV format"),
    }
}

fn read_pixel(info: &VideoInfo, data: &[u8], x: u32, y: u32) -> Pixel {
    match info.format {
        PixelFormat::Nv12 | PixelFormat::I420 | PixelFormat::Yuy2 | PixelFormat::Uyvy => {
            let (yo, uo, vo) = yuv_offsets(info, x, y);
            Pixel::Yuv(data[yo], data[uo], data[vo])
        }
        format => {
            let stride = format.packed_pixel_stride().unwrap_or(1);
            let o = (y as usize * info.width as usize + x as usize) * stride;
            match format {
                PixelFormat::Rgb => Pixel::Rgba(data[o], data[o + 1], data[o + 2], 255),
                PixelFormat::Bgr => Pixel::Rgba(data[o + 2], data[o + 1], data[o], 255),
                PixelFormat::Rgba => Pixel::Rgba(data[o], data[o + 1], data[o + 2], data[o + 3]),
                PixelFormat::Bgra => Pixel::Rgba(data[o + 2], data[o + 1], data[o], data[o + 3]),
                _ => Pixel::Yuv(data[o], 128, 128),
            }
        }
    }
}

fn write_pixel(info: &VideoInfo, data: &mut [u8], x: u32, y: u32, pixel: Pixel) {
    match info.format {
        PixelFormat::Nv12 | PixelFormat::I420 | PixelFormat::Yuy2 | PixelFormat::Uyvy => {
            let (yv, uv, vv) = pixel.to_yuv();
            let (yo, uo, vo) = yuv_offsets(info, x, y);
            data[yo] = yv;
            data[uo] = uv;
            data[vo] = vv;
        }
        PixelFormat::Gray8 => {
            data[y as usize * info.width as usize + x as usize] = pixel.to_yuv().0;
        }
        format => {
            let stride = format.packed_pixel_stride().unwrap_or(1);
            let o = (y as usize * info.width as usize + x as usize) * stride;
            let (r, g, b, a) = pixel.to_rgba();
            let bytes: &[u8] = match format {
                PixelFormat::Rgb => &[r, g, b],
                PixelFormat::Bgr => &[b, g, r],
                PixelFormat::Rgba => &[r, g, b, a],
                _ => &[b, g, r, a],
            };
            data[o..o + stride].copy_from_slice(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(info: &VideoInfo) -> Vec<u8> {
        (0..info.size()).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn short_frames_are_rejected() {
        let info = VideoInfo::new(PixelFormat::Rgba, 4, 4);
        assert!(matches!(
            VideoFrame::new(info, &[0; 10]),
            Err(Error::FrameSize {
                expected: 64,
                actual: 10
            })
        ));
    }

    #[test]
    fn identity_scale_copies_frame() {
        for format in [PixelFormat::Nv12, PixelFormat::I420, PixelFormat::Rgb, PixelFormat::Bgra] {
            let info = VideoInfo::new(format, 8, 6);
            let input = gradient(&info);
            let mut output = vec![0; info.size()];
            SoftwareConverter
                .convert(
                    &VideoFrame::new(info, &input).unwrap(),
                    &mut VideoFrameMut::new(info, &mut output).unwrap(),
                    &ConvertOptions::default(),
                )
                .unwrap();
            assert_eq!(input, output, "{format}");
        }
    }

    #[test]
    fn crop_selects_source_rectangle() {
        let src = VideoInfo::new(PixelFormat::Gray8, 4, 4);
        let input: Vec<u8> = (0..16).collect();
        let dst = VideoInfo::new(PixelFormat::Gray8, 2, 2);
        let mut output = vec![0; 4];
        SoftwareConverter
            .convert(
                &VideoFrame::new(src, &input).unwrap(),
                &mut VideoFrameMut::new(dst, &mut output).unwrap(),
                &ConvertOptions {
                    crop: Some(CropRect::new(2, 2, 2, 2)),
                },
            )
            .unwrap();
        assert_eq!(output, vec![10, 11, 14, 15]);
    }

    #[test]
    fn downscale_picks_nearest_samples() {
        let src = VideoInfo::new(PixelFormat::Gray8, 4, 2);
        let input = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let dst = VideoInfo::new(PixelFormat::Gray8, 2, 1);
        let mut output = vec![0; 2];
        SoftwareConverter
            .convert(
                &VideoFrame::new(src, &input).unwrap(),
                &mut VideoFrameMut::new(dst, &mut output).unwrap(),
                &ConvertOptions::default(),
            )
            .unwrap();
        assert_eq!(output, vec![1, 3]);
    }

    #[test]
    fn nv12_to_rgb_white_and_black() {
        let src = VideoInfo::new(PixelFormat::Nv12, 2, 2);
        let mut input = vec![235, 16, 235, 16];
        input.extend([128, 128]);
        let dst = VideoInfo::new(PixelFormat::Rgb, 2, 2);
        let mut output = vec![0; dst.size()];
        SoftwareConverter
            .convert(
                &VideoFrame::new(src, &input).unwrap(),
                &mut VideoFrameMut::new(dst, &mut output).unwrap(),
                &ConvertOptions::default(),
            )
            .unwrap();
        assert_eq!(&output[0..3], &[255, 255, 255]);
        assert_eq!(&output[3..6], &[0, 0, 0]);
    }

    #[test]
    fn unsupported_conversion() {
        let converter = SoftwareConverter::new();
        assert!(converter.can_convert(PixelFormat::Nv12, PixelFormat::Rgba));
        assert!(!converter.can_convert(PixelFormat::Rgba, PixelFormat::Nv12));
        let src = VideoInfo::new(PixelFormat::Rgba, 2, 2);
        let dst = VideoInfo::new(PixelFormat::Nv12, 2, 2);
        let input = vec![0; src.size()];
        let mut output = vec![0; dst.size()];
        let err = converter
            .convert(
                &VideoFrame::new(src, &input).unwrap(),
                &mut VideoFrameMut::new(dst, &mut output).unwrap(),
                &ConvertOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedConversion { .. }));
    }
}
