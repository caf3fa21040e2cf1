// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Format descriptors exchanged during negotiation.
//!
//! [`Caps`] is a small model of the host framework's capability sets: either
//! ANY, or an ordered list of [`CapsStructure`] alternatives where an absent
//! field means "unconstrained". It supports exactly what the elements need:
//! intersection, fixation, and frame-rate extraction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Media type of raw video caps.
pub const VIDEO_MEDIA_TYPE: &str = "video/x-raw";

/// Raw pixel layouts understood by the elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Y plane followed by an interleaved half-resolution UV plane.
    Nv12,
    /// Y plane followed by half-resolution U and V planes.
    I420,
    /// Packed 24-bit RGB.
    Rgb,
    /// Packed 24-bit BGR.
    Bgr,
    /// Packed 32-bit RGBA.
    Rgba,
    /// Packed 32-bit BGRA.
    Bgra,
    /// Single 8-bit luma plane.
    Gray8,
    /// Packed 4:2:2, U0 Y0 V0 Y1.
    Uyvy,
    /// Packed 4:2:2, Y0 U0 Y1 V0.
    Yuy2,
}

impl PixelFormat {
    /// All formats, in preference order.
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Nv12,
        PixelFormat::I420,
        PixelFormat::Rgb,
        PixelFormat::Bgr,
        PixelFormat::Rgba,
        PixelFormat::Bgra,
        PixelFormat::Gray8,
        PixelFormat::Uyvy,
        PixelFormat::Yuy2,
    ];

    /// Name used in caps (`format` field).
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Nv12 => "NV12",
            PixelFormat::I420 => "I420",
            PixelFormat::Rgb => "RGB",
            PixelFormat::Bgr => "BGR",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Gray8 => "GRAY8",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Yuy2 => "YUY2",
        }
    }

    /// Bytes per pixel for packed formats, `None` for planar ones.
    pub fn packed_pixel_stride(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb | PixelFormat::Bgr => Some(3),
            PixelFormat::Rgba | PixelFormat::Bgra => Some(4),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Nv12 | PixelFormat::I420 | PixelFormat::Uyvy | PixelFormat::Yuy2 => None,
        }
    }

    /// Size in bytes of one tightly packed frame.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        match self {
            PixelFormat::Nv12 | PixelFormat::I420 => w * h + 2 * cw * ch,
            PixelFormat::Uyvy | PixelFormat::Yuy2 => cw * 4 * h,
            other => other.packed_pixel_stride().unwrap_or(1) * w * h,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PixelFormat::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Negotiation(format!("unknown pixel format {s:?}")))
    }
}

/// A rational number, used for frame rates.
///
/// Equality, ordering and hashing compare the value, so `60/2 == 30/1`.
#[derive(Debug, Clone, Copy)]
pub struct Fraction {
    /// Numerator.
    pub numer: i32,
    /// Denominator.
    pub denom: i32,
}

impl Fraction {
    /// Creates a new fraction.
    pub const fn new(numer: i32, denom: i32) -> Self {
        Self { numer, denom }
    }

    /// Duration of one frame at this rate, `None` for zero or negative rates.
    pub fn frame_duration(&self) -> Option<Duration> {
        if self.numer <= 0 || self.denom <= 0 {
            return None;
        }
        let nanos = (self.denom as u128 * 1_000_000_000) / self.numer as u128;
        Some(Duration::from_nanos(nanos as u64))
    }
}

impl Fraction {
    /// Lowest terms with a non-negative denominator.
    fn reduced(&self) -> (i64, i64) {
        let (mut numer, mut denom) = (self.numer as i64, self.denom as i64);
        if denom < 0 {
            numer = -numer;
            denom = -denom;
        }
        let (mut a, mut b) = (numer.unsigned_abs(), denom.unsigned_abs());
        while b != 0 {
            (a, b) = (b, a % b);
        }
        if a > 1 {
            numer /= a as i64;
            denom /= a as i64;
        }
        (numer, denom)
    }
}

impl PartialEq for Fraction {
    fn eq(&self, other: &Self) -> bool {
        self.reduced() == other.reduced()
    }
}

impl Eq for Fraction {}

impl std::hash::Hash for Fraction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.reduced().hash(state);
    }
}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fraction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let (lhs_numer, lhs_denom) = self.reduced();
        let (rhs_numer, rhs_denom) = other.reduced();
        // Zero denominators tie on cross-multiplication; fall back to the terms.
        (lhs_numer * rhs_denom)
            .cmp(&(rhs_numer * lhs_denom))
            .then((lhs_numer, lhs_denom).cmp(&(rhs_numer, rhs_denom)))
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numer, self.denom)
    }
}

/// A fully specified raw video format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    /// Pixel layout.
    pub format: PixelFormat,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame rate, if known.
    pub framerate: Option<Fraction>,
}

impl VideoInfo {
    /// Creates a video info without frame rate.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            framerate: None,
        }
    }

    /// Sets the frame rate.
    pub fn with_framerate(mut self, framerate: Fraction) -> Self {
        self.framerate = Some(framerate);
        self
    }

    /// Bytes of one frame.
    pub fn size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Number of pixels, used to order fan-out stages.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Builds fixed caps for this format.
    pub fn to_caps(&self) -> Caps {
        Caps::from_structure(self.to_structure())
    }

    /// Builds a fixed caps structure for this format.
    pub fn to_structure(&self) -> CapsStructure {
        CapsStructure {
            media_type: VIDEO_MEDIA_TYPE.to_owned(),
            format: Some(self.format),
            width: Some(self.width),
            height: Some(self.height),
            framerate: self.framerate,
        }
    }

    /// Extracts a video info from fixed video caps.
    pub fn from_caps(caps: &Caps) -> Result<Self> {
        let structure = caps
            .structures()
            .first()
            .ok_or_else(|| Error::Negotiation(format!("no structure in caps {caps}")))?;
        Self::from_structure(structure)
    }

    /// Extracts a video info from a fixed video caps structure.
    pub fn from_structure(structure: &CapsStructure) -> Result<Self> {
        if structure.media_type != VIDEO_MEDIA_TYPE {
            return Err(Error::Negotiation(format!(
                "not raw video: {}",
                structure.media_type
            )));
        }
        match (structure.format, structure.width, structure.height) {
            (Some(format), Some(width), Some(height)) if width > 0 && height > 0 => Ok(Self {
                format,
                width,
                height,
                framerate: structure.framerate,
            }),
            _ => Err(Error::Negotiation(format!(
                "caps structure {structure} is not fixed"
            ))),
        }
    }
}

/// One alternative of a [`Caps`] set. `None` fields are unconstrained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsStructure {
    /// Media type, e.g. `video/x-raw`.
    pub media_type: String,
    /// Pixel format.
    pub format: Option<PixelFormat>,
    /// Width in pixels.
    pub width: Option<u32>,
    /// Height in pixels.
    pub height: Option<u32>,
    /// Frame rate.
    pub framerate: Option<Fraction>,
}

fn merge_field<T: PartialEq + Copy>(a: Option<T>, b: Option<T>) -> Option<Option<T>> {
    match (a, b) {
        (Some(a), Some(b)) if a != b => None,
        (Some(a), _) => Some(Some(a)),
        (None, b) => Some(b),
    }
}

impl CapsStructure {
    /// Creates an unconstrained structure of the given media type.
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            format: None,
            width: None,
            height: None,
            framerate: None,
        }
    }

    /// Creates an unconstrained raw video structure.
    pub fn video() -> Self {
        Self::new(VIDEO_MEDIA_TYPE)
    }

    /// Constrains the pixel format.
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Constrains width and height.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Constrains the frame rate.
    pub fn with_framerate(mut self, framerate: Fraction) -> Self {
        self.framerate = Some(framerate);
        self
    }

    /// True for raw video structures.
    pub fn is_video(&self) -> bool {
        self.media_type == VIDEO_MEDIA_TYPE
    }

    /// Field-wise intersection; `None` when any constrained field conflicts.
    pub fn intersect(&self, other: &CapsStructure) -> Option<CapsStructure> {
        if self.media_type != other.media_type {
            return None;
        }
        Some(CapsStructure {
            media_type: self.media_type.clone(),
            format: merge_field(self.format, other.format)?,
            width: merge_field(self.width, other.width)?,
            height: merge_field(self.height, other.height)?,
            framerate: merge_field(self.framerate, other.framerate)?,
        })
    }

    /// Raw video needs format and size to be fixed; other media types are
    /// always considered fixed.
    pub fn is_fixed(&self) -> bool {
        !self.is_video() || (self.format.is_some() && self.width.is_some() && self.height.is_some())
    }
}

impl fmt::Display for CapsStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.media_type)?;
        if let Some(format) = self.format {
            write!(f, ", format={format}")?;
        }
        if let Some(width) = self.width {
            write!(f, ", width={width}")?;
        }
        if let Some(height) = self.height {
            write!(f, ", height={height}")?;
        }
        if let Some(framerate) = self.framerate {
            write!(f, ", framerate={framerate}")?;
        }
        Ok(())
    }
}

/// A capability set: ANY, or an ordered list of alternatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caps {
    /// Accepts every format.
    Any,
    /// Accepts any of the listed alternatives; empty accepts nothing.
    List(Vec<CapsStructure>),
}

impl Caps {
    /// Caps accepting everything.
    pub fn new_any() -> Self {
        Caps::Any
    }

    /// Caps accepting nothing.
    pub fn new_empty() -> Self {
        Caps::List(Vec::new())
    }

    /// Caps with a single alternative.
    pub fn from_structure(structure: CapsStructure) -> Self {
        Caps::List(vec![structure])
    }

    /// Raw video caps listing each of the given formats.
    pub fn video_formats(formats: &[PixelFormat]) -> Self {
        Caps::List(
            formats
                .iter()
                .map(|format| CapsStructure::video().with_format(*format))
                .collect(),
        )
    }

    /// True for ANY caps.
    pub fn is_any(&self) -> bool {
        matches!(self, Caps::Any)
    }

    /// True when nothing is accepted.
    pub fn is_empty(&self) -> bool {
        matches!(self, Caps::List(list) if list.is_empty())
    }

    /// Exactly one alternative, itself fixed.
    pub fn is_fixed(&self) -> bool {
        matches!(self, Caps::List(list) if list.len() == 1 && list[0].is_fixed())
    }

    /// Alternatives; empty for ANY.
    pub fn structures(&self) -> &[CapsStructure] {
        match self {
            Caps::Any => &[],
            Caps::List(list) => list,
        }
    }

    /// Intersection, keeping the preference order of `self`.
    pub fn intersect(&self, other: &Caps) -> Caps {
        match (self, other) {
            (Caps::Any, other) => other.clone(),
            (this, Caps::Any) => this.clone(),
            (Caps::List(lhs), Caps::List(rhs)) => {
                let mut out: Vec<CapsStructure> = Vec::new();
                for a in lhs {
                    for b in rhs {
                        match a.intersect(b) {
                            Some(merged) if !out.contains(&merged) => out.push(merged),
                            _ => {}
                        }
                    }
                }
                Caps::List(out)
            }
        }
    }

    /// True when the two sets share at least one alternative.
    pub fn can_intersect(&self, other: &Caps) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Copy with the frame rate removed from every alternative.
    pub fn without_framerate(&self) -> Caps {
        match self {
            Caps::Any => Caps::Any,
            Caps::List(list) => Caps::List(
                list.iter()
                    .map(|s| CapsStructure {
                        framerate: None,
                        ..s.clone()
                    })
                    .collect(),
            ),
        }
    }

    /// Numerically highest frame rate mentioned by any video alternative.
    pub fn highest_framerate(&self) -> Option<Fraction> {
        self.structures()
            .iter()
            .filter(|s| s.is_video())
            .filter_map(|s| s.framerate)
            .max()
    }

    /// Picks the first alternative. Unconstrained video fields stay
    /// unconstrained; callers complete them against their own defaults.
    pub fn fixate(&self) -> Option<CapsStructure> {
        self.structures().first().cloned()
    }
}

impl From<CapsStructure> for Caps {
    fn from(structure: CapsStructure) -> Self {
        Caps::from_structure(structure)
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caps::Any => f.write_str("ANY"),
            Caps::List(list) if list.is_empty() => f.write_str("EMPTY"),
            Caps::List(list) => {
                for (i, s) in list.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{s}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Nv12.frame_size(4, 4), 24);
        assert_eq!(PixelFormat::Nv12.frame_size(3, 3), 9 + 8);
        assert_eq!(PixelFormat::Rgba.frame_size(2, 2), 16);
        assert_eq!(PixelFormat::Yuy2.frame_size(3, 1), 8);
    }

    #[test]
    fn fraction_ordering_and_duration() {
        assert!(Fraction::new(60, 1) > Fraction::new(30000, 1001));
        assert_eq!(
            Fraction::new(30, 1).frame_duration(),
            Some(Duration::from_nanos(33_333_333))
        );
        assert_eq!(Fraction::new(0, 1).frame_duration(), None);
    }

    #[test]
    fn equal_fractions_compare_by_value() {
        use std::collections::HashSet;

        let thirty = Fraction::new(30, 1);
        assert_eq!(thirty, Fraction::new(60, 2));
        assert_eq!(thirty, Fraction::new(-30, -1));
        assert_eq!(thirty.cmp(&Fraction::new(60, 2)), std::cmp::Ordering::Equal);
        assert_ne!(thirty, Fraction::new(30000, 1001));
        assert_ne!(Fraction::new(0, 0), Fraction::new(1, 0));

        let rates: HashSet<_> = [thirty, Fraction::new(60, 2), Fraction::new(90, 3)].into();
        assert_eq!(rates.len(), 1);
    }

    #[test]
    fn intersect_merges_constraints() {
        let a = Caps::video_formats(&[PixelFormat::Nv12, PixelFormat::Rgba]);
        let b = Caps::from_structure(CapsStructure::video().with_size(640, 480));
        let c = a.intersect(&b);
        assert_eq!(c.structures().len(), 2);
        assert!(c.structures().iter().all(|s| s.width == Some(640)));

        let d = Caps::from_structure(CapsStructure::video().with_format(PixelFormat::Gray8));
        assert!(a.intersect(&d).is_empty());
        assert_eq!(Caps::Any.intersect(&d), d);
    }

    #[test]
    fn framerate_helpers() {
        let caps = Caps::List(vec![
            CapsStructure::video().with_framerate(Fraction::new(15, 1)),
            CapsStructure::video().with_framerate(Fraction::new(30, 1)),
        ]);
        assert_eq!(caps.highest_framerate(), Some(Fraction::new(30, 1)));
        assert_eq!(caps.without_framerate().highest_framerate(), None);
    }

    #[test]
    fn video_info_from_caps() {
        let info = VideoInfo::new(PixelFormat::Nv12, 1920, 1080);
        assert_eq!(VideoInfo::from_caps(&info.to_caps()).unwrap(), info);
        assert!(VideoInfo::from_caps(&Caps::video_formats(&[PixelFormat::Nv12])).is_err());
        assert_eq!("nv12".parse::<PixelFormat>().unwrap(), PixelFormat::Nv12);
    }
}
