// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Metadata carried by buffers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bitmask of the input channels that contributed memory to a composite
/// buffer. Bit `n` corresponds to the `n`-th attached sink pad.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChannelMask(pub u64);

impl ChannelMask {
    /// Maximum number of channels a mask can describe.
    pub const CAPACITY: usize = u64::BITS as usize;

    /// Sets bit `position`. Positions beyond [`Self::CAPACITY`] are ignored.
    pub fn set(&mut self, position: usize) {
        if position < Self::CAPACITY {
            self.0 |= 1 << position;
        }
    }

    /// True when bit `position` is set.
    pub fn contains(&self, position: usize) -> bool {
        position < Self::CAPACITY && self.0 & (1 << position) != 0
    }

    /// Number of bits set.
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Raw bits.
    pub fn bits(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

/// Pixel rectangle inside a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CropRect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width; zero means "up to the right edge".
    pub width: u32,
    /// Height; zero means "up to the bottom edge".
    pub height: u32,
}

impl CropRect {
    /// Creates a rectangle.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The full frame of the given size.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Resolves zero sizes and clamps the rectangle into a frame. Returns
    /// `None` when nothing of the rectangle lies inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<CropRect> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let max_w = frame_width - self.x;
        let max_h = frame_height - self.y;
        let width = if self.width == 0 { max_w } else { self.width.min(max_w) };
        let height = if self.height == 0 { max_h } else { self.height.min(max_h) };
        Some(CropRect::new(self.x, self.y, width, height))
    }

    /// True when the rectangle covers exactly a frame of the given size.
    pub fn is_full(&self, frame_width: u32, frame_height: u32) -> bool {
        *self == CropRect::full(frame_width, frame_height)
    }
}

/// Region-of-interest metadata, as attached by detectors upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoiMeta {
    /// Region in frame coordinates.
    pub rect: CropRect,
    /// Free-form label of the region (e.g. detected class).
    pub label: String,
}

impl RoiMeta {
    /// Creates a region.
    pub fn new(rect: CropRect, label: impl Into<String>) -> Self {
        Self {
            rect,
            label: label.into(),
        }
    }
}

/// Buffer flags copied along with timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// First buffer after a discontinuity.
    pub discont: bool,
    /// Buffer carries no meaningful data.
    pub gap: bool,
}
