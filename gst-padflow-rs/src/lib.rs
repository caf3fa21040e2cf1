//! GStreamer plugin exposing the padflow elements
//!
//! - **batch**: N `sink_%u` request pads aggregated onto one `src` pad. Each
//!   output buffer holds one memory per contributing input, and a
//!   `PadflowChannelMeta` custom meta records which inputs contributed.
//! - **multivideocrop**: one `sink` pad fanned out to N `video_%u` request
//!   pads, each cropping, scaling and converting to the format its
//!   downstream peer asks for.
//!
//! Both elements are thin bridges: buffers, events and queries are
//! translated by [`bridge`] and handed to the `padflow` engine, which owns
//! the queues and worker threads.
//!
//! ## Example Pipelines
//! ```bash
//! gst-launch-1.0 videotestsrc ! batch name=b ! fakesink \
//!     videotestsrc pattern=ball ! b.
//!
//! gst-launch-1.0 videotestsrc ! video/x-raw,format=NV12,width=1920,height=1080 ! \
//!     multivideocrop name=c \
//!     c.video_0 ! video/x-raw,width=1280,height=720 ! fakesink \
//!     c.video_1 ! video/x-raw,format=RGB,width=640,height=360 ! fakesink
//! ```

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

// Allow non-Send fields in Send types (required for GStreamer's threading model)
// and unused doc comments (sometimes present in macro-generated code)
#![allow(clippy::non_send_fields_in_send_ty, unused_doc_comments)]

use gst::glib;
use gstreamer as gst;

/// Translation between GStreamer and engine types
mod bridge;

/// Batch element (N sink pads, one source pad)
mod batch;

/// Multi-output crop element (one sink pad, N source pads)
pub mod videocrop;

/// Initializes the plugin by registering all elements with GStreamer.
///
/// Also registers the custom meta carrying the batch channel mask, so
/// downstream elements can look it up by name.
fn plugin_init(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    bridge::register_channel_meta();

    batch::register(plugin)?;
    videocrop::register(plugin)?;

    Ok(())
}

/// Installs the console subscriber behind the `tracing` feature.
///
/// Called from each element's `constructed`; only the first call installs
/// a subscriber.
pub(crate) fn init_tracing() {
    #[cfg(feature = "tracing")]
    {
        use tracing_subscriber::filter::LevelFilter;
        use tracing_subscriber::util::SubscriberInitExt;

        // Configure console logging with file/line/thread info
        let _ = tracing_subscriber::fmt()
            .compact()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(false)
            .with_max_level(LevelFilter::TRACE)
            .with_ansi(true)
            .finish()
            .try_init();
    }
}

gst::plugin_define!(
    padflow,
    env!("CARGO_PKG_DESCRIPTION"),
    plugin_init,
    concat!(env!("CARGO_PKG_VERSION"), "-", env!("COMMIT_ID")),
    "Apache-2.0",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_REPOSITORY"),
    env!("BUILD_REL_DATE")
);
