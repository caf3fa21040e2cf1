//! Batch Element
//!
//! This module implements `batch`, an element aggregating N `sink_%u`
//! request pads onto a single `src` pad.
//!
//! ## Responsibilities
//! - Queues buffers per sink pad without blocking upstream
//! - Emits one output buffer per output frame period, holding one memory per
//!   input that delivered in time
//! - Tags every output buffer with a `PadflowChannelMeta` whose `mask` field
//!   has bit `n` set when the `n`-th attached sink pad contributed
//! - Forwards flushes once all sink pads flush, and EOS once all sink pads
//!   reached EOS and were drained
//!
//! ## Properties
//! - `max-queued-buffers`: output buffers waiting for delivery before the
//!   aggregation blocks (0 = unlimited)
//!
//! ## Example Pipeline
//! ```bash
//! gst-launch-1.0 batch name=b ! fakesink \
//!     videotestsrc ! video/x-raw,framerate=30/1 ! b.sink_0 \
//!     videotestsrc pattern=ball ! video/x-raw,framerate=15/1 ! b.sink_1
//! ```

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gst::glib;
use gst::prelude::*;
use gstreamer as gst;

/// Core implementation (properties, pads, GStreamer trait impls)
mod imp;

/// GLib wrapper type for the Batch element.
///
/// ## Inheritance Chain (GStreamer class hierarchy)
/// - `gst::Object` (base GStreamer object with name, parent, etc.)
/// - `gst::Element` (has pads, state machine, clock)
/// - `Batch` (our custom implementation)
glib::wrapper! {
    pub struct Batch(ObjectSubclass<imp::Batch>) @extends gst::Element, gst::Object;
}

/// Registers the batch element with GStreamer.
///
/// # Rank
/// The rank is NONE, meaning this element won't be auto-selected during
/// autoplugging. Users must explicitly request it by name.
pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "batch",
        gst::Rank::NONE,
        Batch::static_type(),
    )
}
