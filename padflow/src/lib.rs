// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! # padflow
//!
//! Engine of two streaming-pipeline elements with non-trivial pad topology:
//!
//! - [`Batch`]: N `sink_%u` request pads aggregated onto one source pad. One
//!   buffer per input is stitched into a composite buffer carrying a
//!   [`ChannelMask`] of the contributing inputs.
//! - [`VideoCrop`]: one sink pad fanned out to N `video_%u` request pads, each
//!   cropping, scaling and colour-converting through a [`Converter`].
//!
//! The host pipeline framework is represented by three narrow traits:
//! [`Downstream`] (the peer of a source pad), [`MessageSink`] (the bus) and
//! [`Converter`] (the pixel accelerator). Everything else, including buffer
//! lifetime, lives in this crate.
//!
//! ## Architecture
//!
//! ```text
//!  sink_0 ─► SinkPad FIFO ─┐
//!  sink_1 ─► SinkPad FIFO ─┼─► aggregation worker ─► DeliveryQueue ─► worker ─► src
//!  sink_N ─► SinkPad FIFO ─┘        (Notify, Quorum)
//!
//!  sink ─► chain ─► Stage(1080p) ─► Stage(720p) ─► Stage(480p)
//!                       │               │               │
//!                 DeliveryQueue   DeliveryQueue   DeliveryQueue
//!                       ▼               ▼               ▼
//!                   video_2         video_0         video_1
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use padflow::{Batch, BatchSettings, Bus, Caps, Event, StateChange};
//!
//! # fn main() -> Result<(), padflow::Error> {
//! let bus = Arc::new(Bus::new());
//! let batch = Batch::new("batch0", BatchSettings::default(), bus.clone());
//! let left = batch.request_pad(None)?;
//! let right = batch.request_pad(None)?;
//! batch.change_state(StateChange::ReadyToPaused)?;
//!
//! for pad in [&left, &right] {
//!     batch.sink_event(pad, Event::Caps(Caps::new_any()));
//! }
//! let frame = batch.arena().from_vec(vec![0; 640 * 480]);
//! batch.chain(&left, frame).ok();
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! Elements are `Send + Sync`; `chain`, `sink_event` and pad requests may be
//! called from any thread. Locks are always taken element first, pad second.

mod accel;
mod batch;
mod bus;
mod delivery;
mod error;
mod event;
mod notify;
mod pad;
mod quorum;
mod videocrop;

pub mod buffer;
pub mod config;
pub mod format;

pub use accel::{ConvertOptions, Converter, SoftwareConverter, VideoFrame, VideoFrameMut};
pub use batch::{Batch, SINK_TEMPLATE};
pub use buffer::{Buffer, BufferArena, BufferFlags, BufferId, ChannelMask, CropRect, Memory, RoiMeta};
pub use bus::{Bus, Domain, Message, MessageSink, Severity};
pub use config::{BatchSettings, CropSettings};
pub use delivery::{DeliveryItem, DeliveryQueue, DeliveryWorker, Downstream, FullnessCheck, Payload, QueueLevel};
pub use error::{Error, FlowError, FlowResult, Result};
pub use event::{Event, Query, QueryAnswer, Segment, StateChange};
pub use format::{Caps, CapsStructure, Fraction, PixelFormat, VideoInfo};
pub use notify::{Notify, WaitOutcome};
pub use pad::{Pad, PadDirection, PadFlags, PadNames, SinkPad, SrcPad};
pub use quorum::Quorum;
pub use videocrop::{FramePool, PooledFrame, SRC_TEMPLATE, VideoCrop};
