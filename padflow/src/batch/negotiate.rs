// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Output format of the batch element.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::format::{Caps, Fraction};

/// Result of a successful negotiation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Negotiated {
    pub(crate) caps: Caps,
    pub(crate) duration: Duration,
}

/// Combines the caps of every sink pad into one output format.
///
/// Frame rates are taken out before intersecting, so pads running at
/// different rates still combine; the output runs at the highest input rate.
/// Without any rate the output uses `default_duration` per buffer.
pub(crate) fn combine(
    pad_caps: impl IntoIterator<Item = Caps>,
    peer_caps: Option<Caps>,
    default_duration: Duration,
) -> Result<Negotiated> {
    let mut combined = Caps::new_any();
    let mut rate: Option<Fraction> = None;
    for caps in pad_caps {
        rate = rate.max(caps.highest_framerate());
        combined = combined.intersect(&caps.without_framerate());
        if combined.is_empty() {
            return Err(Error::Negotiation(format!(
                "no common format across sink pads (failed at {caps})"
            )));
        }
    }

    if let Some(peer) = peer_caps {
        let restricted = combined.intersect(&peer.without_framerate());
        if restricted.is_empty() {
            return Err(Error::Negotiation(format!(
                "downstream accepts none of {combined}"
            )));
        }
        combined = restricted;
    }

    let caps = match combined.fixate() {
        Some(mut structure) => {
            if structure.is_video() {
                structure.framerate = rate;
            }
            Caps::from_structure(structure)
        }
        None => Caps::new_any(),
    };
    let duration = rate
        .and_then(|rate| rate.frame_duration())
        .unwrap_or(default_duration);

    Ok(Negotiated { caps, duration })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{CapsStructure, PixelFormat};

    const DEFAULT: Duration = Duration::from_nanos(33_333_333);

    fn video(format: PixelFormat, rate: i32) -> Caps {
        Caps::from_structure(
            CapsStructure::video()
                .with_format(format)
                .with_size(320, 240)
                .with_framerate(Fraction::new(rate, 1)),
        )
    }

    #[test]
    fn keeps_highest_rate() {
        let negotiated = combine(
            [video(PixelFormat::Nv12, 15), video(PixelFormat::Nv12, 60)],
            None,
            DEFAULT,
        )
        .unwrap();
        assert_eq!(negotiated.caps.highest_framerate(), Some(Fraction::new(60, 1)));
        assert_eq!(negotiated.duration, Duration::from_nanos(16_666_666));
        assert!(negotiated.caps.is_fixed());
    }

    #[test]
    fn conflicting_formats_fail() {
        let err = combine(
            [video(PixelFormat::Nv12, 30), video(PixelFormat::Rgba, 30)],
            None,
            DEFAULT,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
    }

    #[test]
    fn downstream_restricts_output() {
        let peer = Caps::video_formats(&[PixelFormat::Rgba]);
        assert!(combine([video(PixelFormat::Nv12, 30)], Some(peer), DEFAULT).is_err());
    }

    #[test]
    fn unconstrained_inputs_use_default_duration() {
        let negotiated = combine([Caps::new_any(), Caps::new_any()], None, DEFAULT).unwrap();
        assert!(negotiated.caps.is_any());
        assert_eq!(negotiated.duration, DEFAULT);
    }
}
