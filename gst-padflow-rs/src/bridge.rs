//! GStreamer ↔ engine translation
//!
//! The engine knows nothing about GStreamer. This module converts caps,
//! buffers and events in both directions, and implements the engine's two
//! host traits on top of GStreamer objects:
//!
//! - [`PadDownstream`]: an engine source pad pushing into a `gst::Pad`
//! - [`ElementBus`]: engine messages posted on the element's bus
//!
//! Buffer memory is never copied. Incoming memories are mapped and wrapped
//! in `bytes::Bytes`; outgoing ones are wrapped back into `gst::Memory`
//! while keeping the engine buffer alive.

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gst::glib;
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_video as gst_video;

use padflow::{
    Buffer, BufferArena, BufferFlags, Caps, CapsStructure, CropRect, Domain, Downstream, Event,
    FlowError, FlowResult, Fraction, Message, MessageSink, PixelFormat, Query, QueryAnswer,
    RoiMeta, Segment, Severity, StateChange,
};

/// Name of the custom meta carrying a batch buffer's channel mask in its
/// `mask` field (`guint64`).
pub(crate) const CHANNEL_META: &str = "PadflowChannelMeta";

/// Registers [`CHANNEL_META`] once per process.
pub(crate) fn register_channel_meta() {
    if !gst::meta::CustomMeta::is_registered(CHANNEL_META) {
        gst::meta::CustomMeta::register(CHANNEL_META, &[]);
    }
}

pub(crate) fn to_clock_time(duration: Duration) -> gst::ClockTime {
    gst::ClockTime::from_nseconds(duration.as_nanos() as u64)
}

pub(crate) fn to_duration(time: gst::ClockTime) -> Duration {
    Duration::from_nanos(time.nseconds())
}

/// Converts GStreamer caps. Format lists expand into one structure per
/// known format; structures whose formats are all unknown are dropped.
/// Ranges are treated as unconstrained.
pub(crate) fn caps_to_engine(caps: &gst::CapsRef) -> Caps {
    if caps.is_any() {
        return Caps::new_any();
    }
    Caps::List(caps.iter().flat_map(structure_to_engine).collect())
}

fn structure_to_engine(s: &gst::StructureRef) -> Vec<CapsStructure> {
    let mut base = CapsStructure::new(s.name().as_str());
    base.width = s.get::<i32>("width").ok().and_then(|w| u32::try_from(w).ok());
    base.height = s.get::<i32>("height").ok().and_then(|h| u32::try_from(h).ok());
    base.framerate = s
        .get::<gst::Fraction>("framerate")
        .ok()
        .map(|rate| Fraction::new(rate.numer(), rate.denom()));

    let formats: Vec<Option<PixelFormat>> = if !s.has_field("format") {
        vec![None]
    } else if let Ok(format) = s.get::<&str>("format") {
        format.parse().ok().map(Some).into_iter().collect()
    } else if let Ok(list) = s.get::<gst::List>("format") {
        list.iter()
            .filter_map(|value| value.get::<&str>().ok())
            .filter_map(|format| format.parse().ok())
            .map(Some)
            .collect()
    } else {
        vec![None]
    };

    formats
        .into_iter()
        .map(|format| CapsStructure {
            format,
            ..base.clone()
        })
        .collect()
}

/// Converts engine caps; unconstrained fields are left out.
pub(crate) fn caps_from_engine(caps: &Caps) -> gst::Caps {
    let Caps::List(list) = caps else {
        return gst::Caps::new_any();
    };
    let mut out = gst::Caps::new_empty();
    {
        let out = out.make_mut();
        for structure in list {
            out.append_structure(structure_from_engine(structure));
        }
    }
    out
}

fn structure_from_engine(structure: &CapsStructure) -> gst::Structure {
    let mut builder = gst::Structure::builder(structure.media_type.as_str());
    if let Some(format) = structure.format {
        builder = builder.field("format", format.as_str());
    }
    if let Some(width) = structure.width {
        builder = builder.field("width", width as i32);
    }
    if let Some(height) = structure.height {
        builder = builder.field("height", height as i32);
    }
    if let Some(rate) = structure.framerate {
        builder = builder.field("framerate", gst::Fraction::new(rate.numer, rate.denom));
    }
    builder.build()
}

/// Wraps a GStreamer buffer into an engine buffer allocated from `arena`.
///
/// Every memory is mapped read-only and stays mapped for as long as the
/// engine holds it. Region-of-interest metas become [`RoiMeta`]s.
// TODO: honour GstVideoMeta strides; planes are assumed tightly packed.
pub(crate) fn buffer_to_engine(
    arena: &BufferArena,
    buffer: gst::Buffer,
) -> Result<Buffer, gst::FlowError> {
    let rois: Vec<RoiMeta> = buffer
        .iter_meta::<gst_video::VideoRegionOfInterestMeta>()
        .map(|meta| {
            let (x, y, width, height) = meta.rect();
            RoiMeta::new(CropRect::new(x, y, width, height), meta.roi_type())
        })
        .collect();
    let flags = BufferFlags {
        discont: buffer.flags().contains(gst::BufferFlags::DISCONT),
        gap: buffer.flags().contains(gst::BufferFlags::GAP),
    };
    let (pts, dts, duration) = (buffer.pts(), buffer.dts(), buffer.duration());

    let memories = buffer
        .iter_memories_owned()
        .map(|memory| {
            memory
                .into_mapped_memory_readable()
                .map(Bytes::from_owner)
                .map_err(|_| gst::FlowError::Error)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let out = arena.allocate(memories);
    out.set_pts(pts.map(to_duration));
    out.set_dts(dts.map(to_duration));
    out.set_duration(duration.map(to_duration));
    out.set_flags(flags);
    for roi in rois {
        out.add_roi(roi);
    }
    Ok(out)
}

/// Memory block handed to GStreamer. Holding the engine buffer keeps the
/// buffers it pins alive until downstream frees the memory.
struct EngineMemory {
    data: Bytes,
    _owner: Buffer,
}

impl AsRef<[u8]> for EngineMemory {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Converts an engine buffer, attaching its channel mask as
/// [`CHANNEL_META`].
pub(crate) fn buffer_from_engine(buffer: &Buffer) -> gst::Buffer {
    let mut out = gst::Buffer::new();
    {
        let out = out.make_mut();
        for data in buffer.memories() {
            out.append_memory(gst::Memory::from_slice(EngineMemory {
                data,
                _owner: buffer.clone(),
            }));
        }
        out.set_pts(buffer.pts().map(to_clock_time));
        out.set_dts(buffer.dts().map(to_clock_time));
        out.set_duration(buffer.duration().map(to_clock_time));

        let mut flags = gst::BufferFlags::empty();
        if buffer.flags().discont {
            flags |= gst::BufferFlags::DISCONT;
        }
        if buffer.flags().gap {
            flags |= gst::BufferFlags::GAP;
        }
        out.set_flags(flags);

        if let Some(mask) = buffer.channel_mask() {
            match gst::meta::CustomMeta::add(out, CHANNEL_META) {
                Ok(mut meta) => meta.mut_structure().set("mask", mask.bits()),
                Err(err) => tracing::warn!(%err, "Cannot attach channel mask"),
            }
        }
    }
    out
}

/// Translates the events the engine understands; everything else is `None`.
pub(crate) fn event_to_engine(event: &gst::Event) -> Option<Event> {
    use gst::EventView;

    match event.view() {
        EventView::StreamStart(e) => Some(Event::StreamStart {
            stream_id: e.stream_id().to_owned(),
        }),
        EventView::Caps(e) => Some(Event::Caps(caps_to_engine(e.caps()))),
        EventView::Segment(e) => e
            .segment()
            .downcast_ref::<gst::ClockTime>()
            .map(|segment| {
                Event::Segment(Segment {
                    rate: segment.rate(),
                    start: segment.start().map(to_duration).unwrap_or_default(),
                    stop: segment.stop().map(to_duration),
                    position: segment.position().map(to_duration).unwrap_or_default(),
                })
            }),
        EventView::FlushStart(_) => Some(Event::FlushStart),
        EventView::FlushStop(e) => Some(Event::FlushStop {
            reset_time: e.resets_time(),
        }),
        EventView::Eos(_) => Some(Event::Eos),
        _ => None,
    }
}

pub(crate) fn event_from_engine(event: &Event) -> gst::Event {
    match event {
        Event::StreamStart { stream_id } => gst::event::StreamStart::new(stream_id),
        Event::Caps(caps) => gst::event::Caps::new(&caps_from_engine(caps)),
        Event::Segment(segment) => {
            let mut out = gst::FormattedSegment::<gst::ClockTime>::new();
            out.set_rate(segment.rate);
            out.set_start(to_clock_time(segment.start));
            out.set_stop(segment.stop.map(to_clock_time));
            out.set_position(to_clock_time(segment.position));
            gst::event::Segment::new(&out)
        }
        Event::FlushStart => gst::event::FlushStart::new(),
        Event::FlushStop { reset_time } => gst::event::FlushStop::new(*reset_time),
        Event::Eos => gst::event::Eos::new(),
    }
}

/// Translates the queries the engine answers; everything else is `None`.
pub(crate) fn query_to_engine(query: &gst::QueryRef) -> Option<Query> {
    use gst::QueryView;

    match query.view() {
        QueryView::Caps(q) => Some(Query::Caps(q.filter().map(caps_to_engine))),
        QueryView::AcceptCaps(q) => Some(Query::AcceptCaps(caps_to_engine(q.caps()))),
        QueryView::Position(q) if q.format() == gst::Format::Time => Some(Query::Position),
        QueryView::Latency(_) => Some(Query::Latency),
        _ => None,
    }
}

/// Stores an engine answer in `query`. Returns false when the answer does
/// not match the query type or carries no value.
pub(crate) fn answer_query(query: &mut gst::QueryRef, answer: QueryAnswer) -> bool {
    use gst::QueryViewMut;

    match (query.view_mut(), answer) {
        (QueryViewMut::Caps(q), QueryAnswer::Caps(caps)) => {
            q.set_result(&caps_from_engine(&caps));
            true
        }
        (QueryViewMut::AcceptCaps(q), QueryAnswer::AcceptCaps(accepted)) => {
            q.set_result(accepted);
            true
        }
        (QueryViewMut::Position(q), QueryAnswer::Position(Some(position))) => {
            q.set(to_clock_time(position));
            true
        }
        (QueryViewMut::Latency(q), QueryAnswer::Latency { live, min, max }) => {
            q.set(live, to_clock_time(min), max.map(to_clock_time));
            true
        }
        _ => false,
    }
}

/// The transitions the engine reacts to; `None` for the rest.
pub(crate) fn state_change_to_engine(transition: gst::StateChange) -> Option<StateChange> {
    match transition {
        gst::StateChange::ReadyToPaused => Some(StateChange::ReadyToPaused),
        gst::StateChange::PausedToPlaying => Some(StateChange::PausedToPlaying),
        gst::StateChange::PlayingToPaused => Some(StateChange::PlayingToPaused),
        gst::StateChange::PausedToReady => Some(StateChange::PausedToReady),
        _ => None,
    }
}

pub(crate) fn flow_to_gst(result: FlowResult) -> Result<gst::FlowSuccess, gst::FlowError> {
    match result {
        Ok(()) => Ok(gst::FlowSuccess::Ok),
        Err(FlowError::Flushing) => Err(gst::FlowError::Flushing),
        Err(FlowError::Eos) => Err(gst::FlowError::Eos),
        Err(FlowError::NotLinked) => Err(gst::FlowError::NotLinked),
        Err(FlowError::NotNegotiated) => Err(gst::FlowError::NotNegotiated),
        Err(FlowError::Error) => Err(gst::FlowError::Error),
    }
}

fn flow_from_gst(result: Result<gst::FlowSuccess, gst::FlowError>) -> FlowResult {
    match result {
        Ok(_) => Ok(()),
        Err(gst::FlowError::Flushing) => Err(FlowError::Flushing),
        Err(gst::FlowError::Eos) => Err(FlowError::Eos),
        Err(gst::FlowError::NotLinked) => Err(FlowError::NotLinked),
        Err(gst::FlowError::NotNegotiated) => Err(FlowError::NotNegotiated),
        Err(_) => Err(FlowError::Error),
    }
}

/// Engine view of a GStreamer source pad.
pub(crate) struct PadDownstream {
    pad: gst::Pad,
}

impl PadDownstream {
    pub(crate) fn new(pad: &gst::Pad) -> Arc<Self> {
        Arc::new(PadDownstream { pad: pad.clone() })
    }
}

impl Downstream for PadDownstream {
    fn push(&self, buffer: Buffer) -> FlowResult {
        flow_from_gst(self.pad.push(buffer_from_engine(&buffer)))
    }

    fn push_event(&self, event: Event) -> bool {
        self.pad.push_event(event_from_engine(&event))
    }

    fn query_caps(&self, filter: Option<&Caps>) -> Option<Caps> {
        if !self.pad.is_linked() {
            return None;
        }
        let filter = filter.map(caps_from_engine);
        let caps = self.pad.peer_query_caps(filter.as_ref());
        Some(caps_to_engine(&caps))
    }
}

/// Posts engine messages on the element's bus.
pub(crate) struct ElementBus {
    element: glib::WeakRef<gst::Element>,
}

impl ElementBus {
    pub(crate) fn new(element: &gst::Element) -> Arc<Self> {
        Arc::new(ElementBus {
            element: element.downgrade(),
        })
    }
}

impl MessageSink for ElementBus {
    fn post(&self, message: Message) {
        let Some(element) = self.element.upgrade() else {
            return;
        };
        let text = message.text.as_str();
        let gst_message = match (message.severity, message.domain) {
            (Severity::Error, Domain::Negotiation) => {
                gst::message::Error::builder(gst::CoreError::Negotiation, text)
                    .src(&element)
                    .build()
            }
            (Severity::Error, Domain::Resource) => {
                gst::message::Error::builder(gst::ResourceError::Failed, text)
                    .src(&element)
                    .build()
            }
            (Severity::Error, Domain::Stream) => {
                gst::message::Error::builder(gst::StreamError::Failed, text)
                    .src(&element)
                    .build()
            }
            (Severity::Warning, Domain::Negotiation) => {
                gst::message::Warning::builder(gst::CoreError::Negotiation, text)
                    .src(&element)
                    .build()
            }
            (Severity::Warning, Domain::Resource) => {
                gst::message::Warning::builder(gst::ResourceError::Failed, text)
                    .src(&element)
                    .build()
            }
            (Severity::Warning, Domain::Stream) => {
                gst::message::Warning::builder(gst::StreamError::Failed, text)
                    .src(&element)
                    .build()
            }
            (Severity::Info, _) => gst::message::Info::builder(gst::CoreError::Failed, text)
                .src(&element)
                .build(),
        };
        if element.post_message(gst_message).is_err() {
            tracing::debug!(element = %element.name(), "No bus to post on: {message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use padflow::ChannelMask;
    use tracing_test::traced_test;

    fn init() {
        gst::init().unwrap();
        register_channel_meta();
    }

    #[test]
    fn format_lists_expand_and_unknown_formats_drop() {
        init();
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", gst::List::new(["NV12", "v210", "RGB"]))
            .field("width", 640i32)
            .field("height", 480i32)
            .build();
        let engine = caps_to_engine(&caps);
        let formats: Vec<_> = engine.structures().iter().map(|s| s.format).collect();
        assert_eq!(formats, [Some(PixelFormat::Nv12), Some(PixelFormat::Rgb)]);
        assert!(engine.structures().iter().all(|s| s.width == Some(640)));

        let v210 = gst::Caps::builder("video/x-raw").field("format", "v210").build();
        assert!(caps_to_engine(&v210).is_empty());
        assert!(caps_to_engine(&gst::Caps::new_any()).is_any());
    }

    #[test]
    fn fixed_caps_survive_a_round_trip() {
        init();
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", 320i32)
            .field("height", 240i32)
            .field("framerate", gst::Fraction::new(30, 1))
            .build();
        assert_eq!(caps_from_engine(&caps_to_engine(&caps)), caps);
    }

    #[test]
    fn buffers_keep_timing_and_channel_mask() {
        init();
        let arena = BufferArena::new();
        let mut input = gst::Buffer::from_slice(vec![7u8; 16]);
        {
            let input = input.get_mut().unwrap();
            input.set_pts(gst::ClockTime::from_mseconds(40));
            input.set_flags(gst::BufferFlags::DISCONT);
            gst_video::VideoRegionOfInterestMeta::add(input, "face", (1, 2, 3, 4));
        }

        let engine = buffer_to_engine(&arena, input).unwrap();
        assert_eq!(engine.pts(), Some(Duration::from_millis(40)));
        assert!(engine.flags().discont);
        assert_eq!(engine.rois()[0].rect, CropRect::new(1, 2, 3, 4));
        assert_eq!(engine.rois()[0].label, "face");

        let mut mask = ChannelMask::default();
        mask.set(0);
        mask.set(2);
        engine.set_channel_mask(mask);
        let output = buffer_from_engine(&engine);
        assert_eq!(output.pts(), Some(gst::ClockTime::from_mseconds(40)));
        assert_eq!(output.map_readable().unwrap().as_slice(), &[7u8; 16]);
        let meta = gst::meta::CustomMeta::from_buffer(&output, CHANNEL_META).unwrap();
        assert_eq!(meta.structure().get::<u64>("mask").unwrap(), 0b101);

        drop(engine);
        assert_eq!(arena.live_count(), 1);
        drop(output);
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn engine_answers_fill_queries() {
        init();
        let mut latency = gst::query::Latency::new();
        assert_eq!(query_to_engine(&latency), Some(Query::Latency));
        assert!(answer_query(
            &mut latency,
            QueryAnswer::Latency {
                live: true,
                min: Duration::from_millis(20),
                max: None,
            }
        ));
        assert_eq!(
            latency.result(),
            (true, gst::ClockTime::from_mseconds(20), None)
        );
        assert!(!answer_query(&mut latency, QueryAnswer::AcceptCaps(true)));

        let bytes = gst::query::Position::new(gst::Format::Bytes);
        assert_eq!(query_to_engine(&bytes), None);
    }

    #[traced_test]
    #[test]
    fn messages_without_a_bus_are_logged() {
        init();
        let bin = gst::Bin::new();
        let sink = ElementBus::new(bin.upcast_ref());
        sink.post(Message {
            source: bin.name().to_string(),
            severity: Severity::Warning,
            domain: Domain::Stream,
            text: "Dropping buffer".into(),
        });
        assert!(logs_contain("No bus to post on"));
        assert!(logs_contain("Dropping buffer"));
    }
}
