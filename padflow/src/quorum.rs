// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! "Have all pads reached state X" queries over a dynamic pad set.
//!
//! A [`Quorum`] borrows the pad list, so it can only be built while the
//! caller holds the element-wide lock protecting that list. Each pad's flags
//! are read under that pad's own lock, one pad at a time.

use std::sync::Arc;

use crate::pad::{Pad, PadFlags};

/// Quorum view over the currently attached pads.
pub struct Quorum<'a, P> {
    pads: &'a [Arc<P>],
}

impl<'a, P: Pad> Quorum<'a, P> {
    /// Creates a view over `pads`.
    pub fn new(pads: &'a [Arc<P>]) -> Self {
        Quorum { pads }
    }

    fn others(&self, excluding: Option<&P>) -> impl Iterator<Item = PadFlags> + '_ {
        let excluded = excluding.map(|pad| pad as *const P);
        self.pads
            .iter()
            .filter(move |pad| excluded != Some(Arc::as_ptr(pad)))
            .map(|pad| pad.flags())
    }

    /// Every pad but `excluding` is flushing.
    pub fn all_flushing(&self, excluding: Option<&P>) -> bool {
        self.others(excluding).all(|flags| flags.flushing)
    }

    /// No pad but `excluding` is flushing.
    pub fn all_non_flushing(&self, excluding: Option<&P>) -> bool {
        self.others(excluding).all(|flags| !flags.flushing)
    }

    /// Every pad but `excluding` received EOS.
    pub fn all_eos(&self, excluding: Option<&P>) -> bool {
        self.others(excluding).all(|flags| flags.eos)
    }

    /// Every pad received caps.
    pub fn all_negotiated(&self) -> bool {
        self.others(None).all(|flags| flags.negotiated)
    }

    /// At least one pad received caps.
    pub fn any_negotiated(&self) -> bool {
        self.others(None).any(|flags| flags.negotiated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pad::SinkPad;

    fn pads(n: u32) -> Vec<Arc<SinkPad>> {
        (0..n)
            .map(|i| Arc::new(SinkPad::new(format!("sink_{i}"), i, false)))
            .collect()
    }

    #[test]
    fn flushing_quorum_excludes_self() {
        for n in [1, 2, 5] {
            let pads = pads(n);
            let me = &pads[0];
            me.set_flushing(true);
            let quorum = Quorum::new(&pads);
            assert_eq!(quorum.all_flushing(Some(me)), n == 1, "n = {n}");

            for pad in &pads[1..] {
                pad.set_flushing(true);
            }
            assert!(quorum.all_flushing(Some(me)));
            assert!(quorum.all_flushing(None));

            for pad in &pads {
                pad.set_flushing(false);
            }
            me.set_flushing(true);
            assert!(quorum.all_non_flushing(Some(me)));
            assert!(!quorum.all_non_flushing(None));
        }
    }

    #[test]
    fn quorum_tracks_added_and_removed_pads() {
        let mut pads = pads(2);
        pads[0].set_eos(true);
        pads[1].set_eos(true);
        assert!(Quorum::new(&pads).all_eos(None));

        pads.push(Arc::new(SinkPad::new("sink_2".into(), 2, false)));
        assert!(!Quorum::new(&pads).all_eos(None));
        assert!(Quorum::new(&pads).all_eos(Some(&pads[2])));

        pads.remove(2);
        assert!(Quorum::new(&pads).all_eos(None));
    }

    #[test]
    fn negotiation_quorum() {
        let pads = pads(3);
        let quorum = Quorum::new(&pads);
        assert!(!quorum.any_negotiated());
        pads[1].set_caps(crate::Caps::new_any());
        assert!(quorum.any_negotiated());
        assert!(!quorum.all_negotiated());
        pads[0].set_caps(crate::Caps::new_any());
        pads[2].set_caps(crate::Caps::new_any());
        assert!(quorum.all_negotiated());
    }
}
