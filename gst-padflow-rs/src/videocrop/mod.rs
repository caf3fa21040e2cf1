//! Multi-output Video Crop Element
//!
//! This module implements `multivideocrop`: one `sink` pad fanned out to
//! any number of `video_%u` request pads.
//!
//! ## Behaviour
//! - The `crop-*` rectangle (or the region-of-interest metas on the input
//!   buffer, when present) selects the area each output receives
//! - Every output scales and converts to whatever size and format its
//!   downstream peer settles on
//! - An output whose caps match the input and whose crop is the full frame
//!   gets the input buffer without a copy
//! - A failing output posts a warning and skips the buffer; the others
//!   keep streaming
//!
//! ## Properties
//! - `crop-x`, `crop-y`, `crop-width`, `crop-height`: crop rectangle
//!   (width/height 0 = up to the frame edge), changeable while playing
//! - `max-rois`: region-of-interest metas accepted per buffer
//! - `pool-min-buffers`, `pool-max-buffers`: per-output frame pool bounds
//! - `max-queued-buffers`: per-output delivery queue bound (0 = unlimited)
//!
//! ## Example Pipeline
//! ```bash
//! gst-launch-1.0 videotestsrc ! video/x-raw,format=NV12,width=1920,height=1080 ! \
//!     multivideocrop name=c crop-width=960 crop-height=540 \
//!     c.video_0 ! video/x-raw,width=640,height=360 ! autovideosink \
//!     c.video_1 ! video/x-raw,format=RGBA,width=224,height=224 ! fakesink
//! ```

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gst::glib;
use gst::prelude::*;
use gstreamer as gst;

mod imp;

glib::wrapper! {
    pub struct MultiVideoCrop(ObjectSubclass<imp::MultiVideoCrop>) @extends gst::Element, gst::Object;
}

/// Registers `multivideocrop` with rank NONE.
pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "multivideocrop",
        gst::Rank::NONE,
        MultiVideoCrop::static_type(),
    )
}
