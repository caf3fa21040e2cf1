// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Element settings.
//!
//! Both settings structs deserialize from JSON with every field optional,
//! missing fields taking their default:
//!
//! ```
//! use padflow::config::CropSettings;
//!
//! # fn main() -> Result<(), padflow::Error> {
//! let settings = CropSettings::from_json(r#"{"crop": {"x": 16, "y": 16}, "max-rois": 4}"#)?;
//! assert_eq!(settings.crop.x, 16);
//! assert_eq!(settings.max_rois, 4);
//! assert_eq!(settings.pool_max_buffers, CropSettings::default().pool_max_buffers);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::CropRect;
use crate::delivery::FullnessCheck;
use crate::error::Result;

/// Output frame duration used when no input carries a frame rate (30 fps).
pub const DEFAULT_FRAME_DURATION_NS: u64 = 33_333_333;

/// Settings of the batch element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BatchSettings {
    /// Output buffer duration in nanoseconds when the inputs carry no
    /// frame rate.
    pub default_duration_ns: u64,
    /// Maximum composite buffers waiting for delivery; 0 never reports full.
    pub max_queued_buffers: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings {
            default_duration_ns: DEFAULT_FRAME_DURATION_NS,
            max_queued_buffers: 0,
        }
    }
}

impl BatchSettings {
    /// Parses settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// [`Self::default_duration_ns`] as a duration.
    pub fn default_duration(&self) -> Duration {
        Duration::from_nanos(self.default_duration_ns)
    }
}

/// Settings of the multi-output crop element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CropSettings {
    /// Crop rectangle applied when a buffer carries no region of interest.
    pub crop: CropRect,
    /// Maximum number of regions of interest per buffer.
    pub max_rois: usize,
    /// Frames preallocated by each stage pool.
    pub pool_min_buffers: usize,
    /// Upper bound of frames per stage pool; 0 is unlimited.
    pub pool_max_buffers: usize,
    /// Maximum buffers waiting for delivery per output; 0 never reports full.
    pub max_queued_buffers: usize,
}

impl Default for CropSettings {
    fn default() -> Self {
        CropSettings {
            crop: CropRect::default(),
            max_rois: 16,
            pool_min_buffers: 2,
            pool_max_buffers: 8,
            max_queued_buffers: 0,
        }
    }
}

impl CropSettings {
    /// Parses settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Fullness predicate capping the number of visible queued items. The cap
/// can be changed while the queue is in use.
pub(crate) fn max_buffers_check(max: Arc<AtomicUsize>) -> FullnessCheck {
    Box::new(move |level| {
        let max = max.load(Ordering::Relaxed);
        max != 0 && level.visible >= max
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_defaults_and_overrides() {
        let settings = BatchSettings::from_json("{}").unwrap();
        assert_eq!(settings, BatchSettings::default());
        assert_eq!(settings.default_duration(), Duration::from_nanos(33_333_333));

        let settings = BatchSettings::from_json(r#"{"max-queued-buffers": 3}"#).unwrap();
        assert_eq!(settings.max_queued_buffers, 3);
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        assert!(matches!(
            CropSettings::from_json(r#"{"max-rois": "many"}"#),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn fullness_check() {
        use crate::delivery::QueueLevel;
        let level = QueueLevel {
            visible: 2,
            ..QueueLevel::default()
        };
        let max = Arc::new(AtomicUsize::new(0));
        let check = max_buffers_check(max.clone());
        assert!(!check(&level));
        max.store(2, Ordering::Relaxed);
        assert!(check(&level));
        max.store(3, Ordering::Relaxed);
        assert!(!check(&level));
    }
}
