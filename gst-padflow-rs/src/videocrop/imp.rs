// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gstreamer as gst;

use padflow::{BufferArena, CropRect, CropSettings, Pad as _, PixelFormat, SoftwareConverter, SrcPad};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;

use crate::bridge;
use crate::bridge::{ElementBus, PadDownstream};
use crate::videocrop;

pub(crate) static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "multivideocrop",
        gst::DebugColorFlags::empty(),
        Some("Multi-output video crop"),
    )
});

pub struct MultiVideoCrop {
    sinkpad: gst::Pad,
    arena: BufferArena,
    engine: OnceLock<padflow::VideoCrop>,
    srcpads: Mutex<HashMap<gst::Pad, Arc<SrcPad>>>,
}

#[glib::object_subclass]
impl ObjectSubclass for MultiVideoCrop {
    const NAME: &'static str = "GstRsPadflowMultiVideoCrop";
    type Type = videocrop::MultiVideoCrop;
    type ParentType = gst::Element;

    fn with_class(klass: &Self::Class) -> Self {
        let builder = match klass.pad_template("sink") {
            Some(templ) => gst::Pad::builder_from_template(&templ),
            None => gst::Pad::builder(gst::PadDirection::Sink).name("sink"),
        };
        let sinkpad = builder
            .chain_function(|pad, parent, buffer| {
                MultiVideoCrop::catch_panic_pad_function(
                    parent,
                    || Err(gst::FlowError::Error),
                    |imp| imp.sink_chain(pad, buffer),
                )
            })
            .event_function(|pad, parent, event| {
                MultiVideoCrop::catch_panic_pad_function(
                    parent,
                    || false,
                    |imp| imp.sink_event(pad, event),
                )
            })
            .query_function(|pad, parent, query| {
                MultiVideoCrop::catch_panic_pad_function(
                    parent,
                    || false,
                    |imp| imp.sink_query(pad, query),
                )
            })
            .build();

        MultiVideoCrop {
            sinkpad,
            arena: BufferArena::new(),
            engine: OnceLock::new(),
            srcpads: Mutex::new(HashMap::new()),
        }
    }
}

impl ObjectImpl for MultiVideoCrop {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: LazyLock<Vec<glib::ParamSpec>> = LazyLock::new(|| {
            let defaults = CropSettings::default();
            vec![
                glib::ParamSpecUInt::builder("crop-x")
                    .nick("Crop X")
                    .blurb("Left edge of the crop rectangle")
                    .default_value(defaults.crop.x)
                    .mutable_playing()
                    .build(),
                glib::ParamSpecUInt::builder("crop-y")
                    .nick("Crop Y")
                    .blurb("Top edge of the crop rectangle")
                    .default_value(defaults.crop.y)
                    .mutable_playing()
                    .build(),
                glib::ParamSpecUInt::builder("crop-width")
                    .nick("Crop Width")
                    .blurb("Width of the crop rectangle (0 = up to the right edge)")
                    .default_value(defaults.crop.width)
                    .mutable_playing()
                    .build(),
                glib::ParamSpecUInt::builder("crop-height")
                    .nick("Crop Height")
                    .blurb("Height of the crop rectangle (0 = up to the bottom edge)")
                    .default_value(defaults.crop.height)
                    .mutable_playing()
                    .build(),
                glib::ParamSpecUInt::builder("max-rois")
                    .nick("Max ROIs")
                    .blurb("Region-of-interest metas accepted per buffer")
                    .minimum(1)
                    .default_value(defaults.max_rois as u32)
                    .mutable_ready()
                    .build(),
                glib::ParamSpecUInt::builder("pool-min-buffers")
                    .nick("Pool Min Buffers")
                    .blurb("Frames preallocated per output")
                    .default_value(defaults.pool_min_buffers as u32)
                    .mutable_ready()
                    .build(),
                glib::ParamSpecUInt::builder("pool-max-buffers")
                    .nick("Pool Max Buffers")
                    .blurb("Frames in flight per output before it skips buffers (0 = unlimited)")
                    .default_value(defaults.pool_max_buffers as u32)
                    .mutable_ready()
                    .build(),
                glib::ParamSpecUInt::builder("max-queued-buffers")
                    .nick("Max Queued Buffers")
                    .blurb("Buffers waiting for delivery per output before processing blocks (0 = unlimited)")
                    .default_value(defaults.max_queued_buffers as u32)
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
        let engine = padflow::VideoCrop::new(
            obj.name().to_string(),
            CropSettings::default(),
            Arc::new(SoftwareConverter::new()),
            ElementBus::new(obj.upcast_ref()),
        );
        if self.engine.set(engine).is_err() {
            gst::error!(CAT, imp = self, "Engine already constructed");
        }

        if let Err(err) = obj.add_pad(&self.sinkpad) {
            gst::error!(CAT, imp = self, "Failed to add sink pad: {err}");
        }
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        let Some(engine) = self.engine.get() else {
            gst::error!(CAT, imp = self, "Property set before construction");
            return;
        };
        let value = match value.get::<u32>() {
            Ok(value) => value,
            Err(err) => {
                gst::error!(CAT, imp = self, "Invalid value for {}: {err}", pspec.name());
                return;
            }
        };
        gst::info!(CAT, imp = self, "Changing {} to {value}", pspec.name());

        let mut settings = engine.settings();
        let mut crop = settings.crop;
        match pspec.name() {
            "crop-x" => crop.x = value,
            "crop-y" => crop.y = value,
            "crop-width" => crop.width = value,
            "crop-height" => crop.height = value,
            "max-rois" => settings.max_rois = value as usize,
            "pool-min-buffers" => settings.pool_min_buffers = value as usize,
            "pool-max-buffers" => settings.pool_max_buffers = value as usize,
            "max-queued-buffers" => settings.max_queued_buffers = value as usize,
            name => {
                gst::error!(CAT, imp = self, "Unknown property {name}");
                return;
            }
        }

        // The crop rectangle may change mid-stream without touching the rest.
        if crop != settings.crop {
            engine.set_crop(crop);
        } else {
            engine.set_settings(settings);
        }
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        let settings = self
            .engine
            .get()
            .map(padflow::VideoCrop::settings)
            .unwrap_or_default();
        let CropRect {
            x,
            y,
            width,
            height,
        } = settings.crop;

        match pspec.name() {
            "crop-x" => x.to_value(),
            "crop-y" => y.to_value(),
            "crop-width" => width.to_value(),
            "crop-height" => height.to_value(),
            "max-rois" => (settings.max_rois as u32).to_value(),
            "pool-min-buffers" => (settings.pool_min_buffers as u32).to_value(),
            "pool-max-buffers" => (settings.pool_max_buffers as u32).to_value(),
            "max-queued-buffers" => (settings.max_queued_buffers as u32).to_value(),
            name => {
                gst::error!(CAT, imp = self, "Unknown property {name}");
                glib::Value::from_type(pspec.value_type())
            }
        }
    }
}

impl GstObjectImpl for MultiVideoCrop {}

impl ElementImpl for MultiVideoCrop {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "Multi-output video crop",
                "Filter/Converter/Video/Scaler",
                "Crops, scales and converts one video stream into several outputs",
                "Contributors to the Media eXchange Layer project",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Result<Vec<gst::PadTemplate>, glib::BoolError>> =
            LazyLock::new(|| {
                let caps = bridge::caps_from_engine(&padflow::Caps::video_formats(
                    &PixelFormat::ALL,
                ));
                let sink = gst::PadTemplate::new(
                    "sink",
                    gst::PadDirection::Sink,
                    gst::PadPresence::Always,
                    &caps,
                )?;
                let src = gst::PadTemplate::new(
                    padflow::SRC_TEMPLATE,
                    gst::PadDirection::Src,
                    gst::PadPresence::Request,
                    &caps,
                )?;
                Ok(vec![sink, src])
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
        let src = match engine.request_pad(name) {
            Ok(src) => src,
            Err(err) => {
                gst::error!(CAT, imp = self, "Cannot create output pad: {err}");
                return None;
            }
        };

        let pad = gst::Pad::builder_from_template(templ)
            .name(src.name())
            .event_function(|pad, parent, event| {
                MultiVideoCrop::catch_panic_pad_function(
                    parent,
                    || false,
                    |imp| imp.src_event(pad, event),
                )
            })
            .query_function(|pad, parent, query| {
                MultiVideoCrop::catch_panic_pad_function(
                    parent,
                    || false,
                    |imp| imp.src_query(pad, query),
                )
            })
            .build();
        src.link(PadDownstream::new(&pad));

        self.srcpads().insert(pad.clone(), src.clone());
        if let Err(err) = self.obj().add_pad(&pad) {
            gst::error!(CAT, imp = self, "Failed to add {}: {err}", pad.name());
            self.srcpads().remove(&pad);
            if let Err(err) = engine.release_pad(&src) {
                gst::warning!(CAT, imp = self, "Failed to release {}: {err}", src.name());
            }
            return None;
        }

        gst::debug!(CAT, imp = self, "Requested pad {}", pad.name());
        Some(pad)
    }

    fn release_pad(&self, pad: &gst::Pad) {
        let Some(src) = self.srcpads().remove(pad) else {
            gst::error!(
                CAT,
                imp = self,
                "Requested to remove pad {}, which is not a request pad of this element",
                pad.name()
            );
            return;
        };

        if let Some(engine) = self.engine.get() {
            if let Err(err) = engine.release_pad(&src) {
                gst::warning!(CAT, imp = self, "Failed to release {}: {err}", src.name());
            }
        }
        src.unlink();

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

impl MultiVideoCrop {
    fn srcpads(&self) -> MutexGuard<'_, HashMap<gst::Pad, Arc<SrcPad>>> {
        self.srcpads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sink_chain(
        &self,
        pad: &gst::Pad,
        buffer: gst::Buffer,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let engine = self.engine.get().ok_or(gst::FlowError::Error)?;

        gst::trace!(CAT, obj = pad, "Handling buffer {:?}", buffer.pts());
        let buffer = bridge::buffer_to_engine(&self.arena, buffer)?;
        bridge::flow_to_gst(engine.chain(buffer))
    }

    fn sink_event(&self, pad: &gst::Pad, event: gst::Event) -> bool {
        gst::log!(CAT, obj = pad, "Handling event {event:?}");
        let Some(engine) = self.engine.get() else {
            return false;
        };

        match bridge::event_to_engine(&event) {
            Some(event) => engine.sink_event(event),
            None => gst::Pad::event_default(pad, Some(&*self.obj()), event),
        }
    }

    fn sink_query(&self, pad: &gst::Pad, query: &mut gst::QueryRef) -> bool {
        gst::log!(CAT, obj = pad, "Handling query {query:?}");
        let answer = self
            .engine
            .get()
            .and_then(|engine| bridge::query_to_engine(query).and_then(|q| engine.sink_query(&q)));

        match answer {
            Some(answer) => bridge::answer_query(query, answer),
            None => gst::Pad::query_default(pad, Some(&*self.obj()), query),
        }
    }

    fn src_event(&self, pad: &gst::Pad, event: gst::Event) -> bool {
        gst::log!(CAT, obj = pad, "Handling event {event:?}");

        // Sent when a peer links or changes its caps; fixate every output again.
        if event.type_() == gst::EventType::Reconfigure {
            if let Some(engine) = self.engine.get() {
                if !engine.reconfigure() {
                    gst::warning!(CAT, obj = pad, "Reconfiguration failed");
                }
            }
        }

        self.sinkpad.push_event(event)
    }

    fn src_query(&self, pad: &gst::Pad, query: &mut gst::QueryRef) -> bool {
        gst::log!(CAT, obj = pad, "Handling query {query:?}");
        let src = self.srcpads().get(pad).cloned();
        let answer = match (self.engine.get(), src) {
            (Some(engine), Some(src)) => match bridge::query_to_engine(query) {
                // Own latency is zero; upstream's answer stands.
                Some(padflow::Query::Latency) | None => None,
                Some(q) => engine.src_query(&src, &q),
            },
            _ => None,
        };

        match answer {
            Some(answer) => bridge::answer_query(query, answer),
            None => gst::Pad::query_default(pad, Some(&*self.obj()), query),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| {
            gst::init().unwrap();
            crate::plugin_register_static().unwrap();
        });
    }

    fn engine(element: &gst::Element) -> &padflow::VideoCrop {
        let element = element.downcast_ref::<videocrop::MultiVideoCrop>().unwrap();
        element.imp().engine.get().unwrap()
    }

    #[test]
    fn crop_properties_reach_the_engine() {
        init();
        let element = gst::ElementFactory::make("multivideocrop")
            .property("crop-x", 8u32)
            .property("crop-width", 320u32)
            .property("max-rois", 4u32)
            .build()
            .unwrap();

        let settings = engine(&element).settings();
        assert_eq!(settings.crop, CropRect::new(8, 0, 320, 0));
        assert_eq!(settings.max_rois, 4);
        assert_eq!(element.property::<u32>("crop-width"), 320);
    }

    #[test]
    fn request_pads_follow_the_template() {
        init();
        let element = gst::ElementFactory::make("multivideocrop").build().unwrap();

        let first = element.request_pad_simple("video_%u").unwrap();
        let second = element.request_pad_simple("video_5").unwrap();
        assert_eq!(first.name(), "video_0");
        assert_eq!(second.name(), "video_5");
        assert!(element.request_pad_simple("video_5").is_none());

        element.release_request_pad(&first);
        assert_eq!(element.src_pads().len(), 1);
        assert_eq!(engine(&element).stage_order(), ["video_5"]);
    }
}
