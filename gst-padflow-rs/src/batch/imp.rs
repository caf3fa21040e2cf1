//! Batch Implementation
//!
//! GStreamer side of the `batch` element. The aggregation itself lives in
//! [`padflow::Batch`]; this module owns the `gst::Pad`s and routes their
//! buffers, events and queries to the engine.
//!
//! ## Implementation Structure
//! - `Batch`: the source pad, the engine and the sink pad lookup table
//! - `ObjectImpl`: `max-queued-buffers` property, engine construction
//! - `ElementImpl`: metadata, pad templates, request pads, state changes

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gstreamer as gst;

use padflow::{BatchSettings, Pad as _, Query, QueryAnswer, SinkPad};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::time::Duration;

use crate::batch;
use crate::bridge;
use crate::bridge::{ElementBus, PadDownstream};

/// GStreamer debug category for batch messages.
///
/// Set GST_DEBUG=batch:6 to see per-buffer logs.
pub(crate) static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "batch",
        gst::DebugColorFlags::empty(),
        Some("Batch aggregator"),
    )
});

const DEFAULT_MAX_QUEUED_BUFFERS: u32 = 0;

#[derive(Debug, Clone, Copy)]
struct Settings {
    max_queued_buffers: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_queued_buffers: DEFAULT_MAX_QUEUED_BUFFERS,
        }
    }
}

/// Batch element implementation.
pub struct Batch {
    srcpad: gst::Pad,
    settings: Mutex<Settings>,

    /// Created in `constructed`, once the element has its name.
    engine: OnceLock<padflow::Batch>,

    /// Engine pad behind each requested `sink_%u` pad.
    sinkpads: Mutex<HashMap<gst::Pad, Arc<SinkPad>>>,
}

#[glib::object_subclass]
impl ObjectSubclass for Batch {
    const NAME: &'static str = "GstRsPadflowBatch";
    type Type = batch::Batch;
    type ParentType = gst::Element;

    fn with_class(klass: &Self::Class) -> Self {
        let builder = match klass.pad_template("src") {
            Some(templ) => gst::Pad::builder_from_template(&templ),
            None => gst::Pad::builder(gst::PadDirection::Src).name("src"),
        };
        let srcpad = builder
            .query_function(|pad, parent, query| {
                Batch::catch_panic_pad_function(parent, || false, |imp| imp.src_query(pad, query))
            })
            .event_function(|pad, parent, event| {
                Batch::catch_panic_pad_function(parent, || false, |imp| imp.src_event(pad, event))
            })
            .build();

        Batch {
            srcpad,
            settings: Mutex::new(Settings::default()),
            engine: OnceLock::new(),
            sinkpads: Mutex::new(HashMap::new()),
        }
    }
}

impl ObjectImpl for Batch {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: LazyLock<Vec<glib::ParamSpec>> = LazyLock::new(|| {
            vec![
                glib::ParamSpecUInt::builder("max-queued-buffers")
                    .nick("Max Queued Buffers")
                    .blurb("Output buffers waiting for delivery before aggregation blocks (0 = unlimited)")
                    .default_value(DEFAULT_MAX_QUEUED_BUFFERS)
                    .mutable_playing()
                    .build(),
            ]
        });

        PROPERTIES.as_ref()
    }

    fn constructed(&self) {
        crate::init_tracing();
        self.parent_constructed();

        let obj = self.obj();
        let settings = BatchSettings {
            max_queued_buffers: self.settings().max_queued_buffers as usize,
            ..BatchSettings::default()
        };
        let engine = padflow::Batch::new(
            obj.name().to_string(),
            settings,
            ElementBus::new(obj.upcast_ref()),
        );
        engine.src_pad().link(PadDownstream::new(&self.srcpad));
        if self.engine.set(engine).is_err() {
            gst::error!(CAT, imp = self, "Engine already constructed");
        }

        if let Err(err) = obj.add_pad(&self.srcpad) {
            gst::error!(CAT, imp = self, "Failed to add src pad: {err}");
        }
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        match pspec.name() {
            "max-queued-buffers" => match value.get::<u32>() {
                Ok(max) => {
                    gst::info!(CAT, imp = self, "Changing max-queued-buffers to {max}");
                    self.settings
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .max_queued_buffers = max;
                    if let Some(engine) = self.engine.get() {
                        engine.set_max_queued_buffers(max as usize);
                    }
                }
                Err(err) => {
                    gst::error!(CAT, imp = self, "Invalid max-queued-buffers: {err}");
                }
            },
            name => {
                gst::error!(CAT, imp = self, "Unknown property {name}");
            }
        }
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        match pspec.name() {
            "max-queued-buffers" => self.settings().max_queued_buffers.to_value(),
            name => {
                gst::error!(CAT, imp = self, "Unknown property {name}");
                glib::Value::from_type(pspec.value_type())
            }
        }
    }
}

impl GstObjectImpl for Batch {}

impl ElementImpl for Batch {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "Batch",
                "Generic",
                "Aggregates buffers from several sink pads into one multi-memory buffer",
                "Contributors to the Media eXchange Layer project",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Result<Vec<gst::PadTemplate>, glib::BoolError>> =
            LazyLock::new(|| {
                let caps = gst::Caps::new_any();
                let src = gst::PadTemplate::new(
                    "src",
                    gst::PadDirection::Src,
                    gst::PadPresence::Always,
                    &caps,
                )?;
                let sink = gst::PadTemplate::new(
                    padflow::SINK_TEMPLATE,
                    gst::PadDirection::Sink,
                    gst::PadPresence::Request,
                    &caps,
                )?;
                Ok(vec![src, sink])
            });

        match PAD_TEMPLATES.as_ref() {
            Ok(templates) => templates,
            Err(err) => {
                gst::error!(CAT, "Failed to create pad templates: {err}");
                &[]
            }
        }
    }

    fn request_new_pad(
        &self,
        templ: &gst::PadTemplate,
        name: Option<&str>,
        _caps: Option<&gst::Caps>,
    ) -> Option<gst::Pad> {
        let engine = self.engine.get()?;
        let sink = match engine.request_pad(name) {
            Ok(sink) => sink,
            Err(err) => {
                gst::error!(CAT, imp = self, "Cannot create sink pad: {err}");
                return None;
            }
        };

        let pad = gst::Pad::builder_from_template(templ)
            .name(sink.name())
            .chain_function(|pad, parent, buffer| {
                Batch::catch_panic_pad_function(
                    parent,
                    || Err(gst::FlowError::Error),
                    |imp| imp.sink_chain(pad, buffer),
                )
            })
            .event_function(|pad, parent, event| {
                Batch::catch_panic_pad_function(parent, || false, |imp| imp.sink_event(pad, event))
            })
            .query_function(|pad, parent, query| {
                Batch::catch_panic_pad_function(parent, || false, |imp| imp.sink_query(pad, query))
            })
            .build();

        self.sinkpads().insert(pad.clone(), sink.clone());
        if let Err(err) = self.obj().add_pad(&pad) {
            gst::error!(CAT, imp = self, "Failed to add {}: {err}", pad.name());
            self.sinkpads().remove(&pad);
            if let Err(err) = engine.release_pad(&sink) {
                gst::warning!(CAT, imp = self, "Failed to release {}: {err}", sink.name());
            }
            return None;
        }

        gst::debug!(CAT, imp = self, "Requested pad {}", pad.name());
        Some(pad)
    }

    fn release_pad(&self, pad: &gst::Pad) {
        let Some(sink) = self.sinkpads().remove(pad) else {
            gst::error!(
                CAT,
                imp = self,
                "Requested to remove pad {}, which is not a request pad of this element",
                pad.name()
            );
            return;
        };

        if let Some(engine) = self.engine.get() {
            if let Err(err) = engine.release_pad(&sink) {
                gst::warning!(CAT, imp = self, "Failed to release {}: {err}", sink.name());
            }
        }

        if let Err(err) = pad.set_active(false) {
            gst::warning!(CAT, obj = pad, "Failed to deactivate: {err}");
        }
        if let Err(err) = self.obj().remove_pad(pad) {
            gst::warning!(CAT, imp = self, "Failed to remove {}: {err}", pad.name());
        }
    }

    fn change_state(
        &self,
        transition: gst::StateChange,
    ) -> Result<gst::StateChangeSuccess, gst::StateChangeError> {
        gst::debug!(CAT, imp = self, "Changing state {transition:?}");

        // The engine stops before the pads deactivate, so chain calls blocked
        // on a full delivery queue return and release their stream locks.
        if let (Some(engine), Some(change)) = (
            self.engine.get(),
            bridge::state_change_to_engine(transition),
        ) {
            engine.change_state(change).map_err(|err| {
                gst::element_imp_error!(
                    self,
                    gst::CoreError::StateChange,
                    ["Failed to change state: {}", err]
                );
                gst::StateChangeError
            })?;
        }

        self.parent_change_state(transition)
    }
}

impl Batch {
    fn settings(&self) -> Settings {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sinkpads(&self) -> std::sync::MutexGuard<'_, HashMap<gst::Pad, Arc<SinkPad>>> {
        self.sinkpads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn engine_pad(&self, pad: &gst::Pad) -> Option<(&padflow::Batch, Arc<SinkPad>)> {
        let engine = self.engine.get()?;
        let sink = self.sinkpads().get(pad).cloned()?;
        Some((engine, sink))
    }

    fn sink_chain(
        &self,
        pad: &gst::Pad,
        buffer: gst::Buffer,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let Some((engine, sink)) = self.engine_pad(pad) else {
            gst::error!(CAT, obj = pad, "Buffer on a released pad");
            return Err(gst::FlowError::NotLinked);
        };

        gst::trace!(CAT, obj = pad, "Queueing buffer {:?}", buffer.pts());
        let buffer = bridge::buffer_to_engine(engine.arena(), buffer)?;
        bridge::flow_to_gst(engine.chain(&sink, buffer))
    }

    fn sink_event(&self, pad: &gst::Pad, event: gst::Event) -> bool {
        gst::log!(CAT, obj = pad, "Handling event {event:?}");
        let Some((engine, sink)) = self.engine_pad(pad) else {
            return false;
        };

        match bridge::event_to_engine(&event) {
            Some(event) => engine.sink_event(&sink, event),
            None => {
                gst::debug!(CAT, obj = pad, "Dropping {:?} event", event.type_());
                true
            }
        }
    }

    fn sink_query(&self, pad: &gst::Pad, query: &mut gst::QueryRef) -> bool {
        gst::log!(CAT, obj = pad, "Handling query {query:?}");
        let answer = self.engine_pad(pad).and_then(|(engine, sink)| {
            bridge::query_to_engine(query).and_then(|q| engine.sink_query(&sink, &q))
        });

        match answer {
            Some(answer) => bridge::answer_query(query, answer),
            None => gst::Pad::query_default(pad, Some(&*self.obj()), query),
        }
    }

    fn src_query(&self, pad: &gst::Pad, query: &mut gst::QueryRef) -> bool {
        gst::log!(CAT, obj = pad, "Handling query {query:?}");
        let Some(engine) = self.engine.get() else {
            return false;
        };

        match bridge::query_to_engine(query) {
            Some(Query::Latency) => self.report_latency(engine, query),
            Some(q) => match engine.src_query(&q) {
                Some(answer) => bridge::answer_query(query, answer),
                None => false,
            },
            None => gst::Pad::query_default(pad, Some(&*self.obj()), query),
        }
    }

    /// Upstream latency of all inputs combined, plus one output period.
    fn report_latency(&self, engine: &padflow::Batch, query: &mut gst::QueryRef) -> bool {
        let pads: Vec<gst::Pad> = self.sinkpads().keys().cloned().collect();

        let mut live = false;
        let mut min = Duration::ZERO;
        let mut max: Option<Duration> = None;
        for pad in &pads {
            let mut peer = gst::query::Latency::new();
            if !pad.peer_query(&mut peer) {
                gst::debug!(CAT, obj = pad, "Upstream latency query failed");
                continue;
            }
            let (peer_live, peer_min, peer_max) = peer.result();
            live |= peer_live;
            min = min.max(bridge::to_duration(peer_min));
            max = match (max, peer_max.map(bridge::to_duration)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }

        let Some(QueryAnswer::Latency {
            min: own_min,
            max: own_max,
            ..
        }) = engine.src_query(&Query::Latency)
        else {
            return false;
        };

        gst::debug!(
            CAT,
            imp = self,
            "Reporting latency live={live} min={:?} max={:?}",
            min + own_min,
            max
        );
        bridge::answer_query(
            query,
            QueryAnswer::Latency {
                live,
                min: min + own_min,
                max: max.zip(own_max).map(|(a, b)| a + b),
            },
        )
    }

    /// Upstream events go to every input.
    fn src_event(&self, pad: &gst::Pad, event: gst::Event) -> bool {
        gst::log!(CAT, obj = pad, "Forwarding event {event:?} upstream");
        let pads: Vec<gst::Pad> = self.sinkpads().keys().cloned().collect();

        let mut handled = !pads.is_empty();
        for sinkpad in pads {
            handled &= sinkpad.push_event(event.clone());
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use padflow::Pad as _;

    fn init() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| {
            gst::init().unwrap();
            crate::plugin_register_static().unwrap();
        });
    }

    #[test]
    fn request_pads_map_to_engine_pads() {
        init();
        let element = gst::ElementFactory::make("batch")
            .property("max-queued-buffers", 3u32)
            .build()
            .unwrap();
        assert_eq!(element.property::<u32>("max-queued-buffers"), 3);

        let first = element.request_pad_simple("sink_%u").unwrap();
        let second = element.request_pad_simple("sink_%u").unwrap();
        assert_eq!(first.name(), "sink_0");
        assert_eq!(second.name(), "sink_1");

        let batch = element.downcast_ref::<batch::Batch>().unwrap();
        let engine = batch.imp().engine.get().unwrap();
        assert_eq!(engine.sink_pads().len(), 2);

        element.release_request_pad(&first);
        assert_eq!(engine.sink_pads().len(), 1);
        assert_eq!(engine.sink_pads()[0].name(), "sink_1");
        assert_eq!(element.sink_pads().len(), 1);
    }

    #[test]
    fn sink_pads_accept_any_caps_before_negotiation() {
        init();
        let element = gst::ElementFactory::make("batch").build().unwrap();
        let pad = element.request_pad_simple("sink_%u").unwrap();

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "NV12")
            .field("width", 64i32)
            .field("height", 48i32)
            .build();
        assert!(pad.query_accept_caps(&caps));
    }
}
