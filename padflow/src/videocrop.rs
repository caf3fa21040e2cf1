// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! 1 sink pad → N `video_%u` source pads, each with its own crop, scale and
//! convert stage.
//!
//! Stages run synchronously on the thread calling [`VideoCrop::chain`]; only
//! delivery to downstream happens on per-pad worker threads. A buffer
//! carrying regions of interest runs the stage chain once per region.

mod chain;
mod pool;
mod stage;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::accel::Converter;
use crate::buffer::{Buffer, CropRect};
use crate::bus::{Domain, MessageSink, Poster};
use crate::config::{CropSettings, max_buffers_check};
use crate::delivery::DeliveryQueue;
use crate::error::{Error, FlowError, FlowResult, Result};
use crate::event::{Event, Query, QueryAnswer, StateChange};
use crate::format::{Caps, PixelFormat, VideoInfo};
use crate::pad::{Pad, PadNames, SrcPad};

pub use pool::{FramePool, PooledFrame};

use stage::{EventCache, Stage};

/// Template of the crop element's request pads.
pub const SRC_TEMPLATE: &str = "video_%u";

struct CropState {
    stages: Vec<Stage>,
    names: PadNames,
    input: Option<VideoInfo>,
    cache: EventCache,
    active: bool,
    flushing: bool,
    eos: bool,
}

/// The multi-output crop element.
pub struct VideoCrop {
    name: String,
    poster: Poster,
    converter: Arc<dyn Converter>,
    settings: Mutex<CropSettings>,
    max_queued: Arc<AtomicUsize>,
    // Kept outside `state` so a flush can reach the pads while a chain call
    // is blocked on a full delivery queue.
    src_pads: Mutex<Vec<Arc<SrcPad>>>,
    state: Mutex<CropState>,
}

impl VideoCrop {
    /// Creates an idle element converting with `converter`.
    pub fn new(
        name: impl Into<String>,
        settings: CropSettings,
        converter: Arc<dyn Converter>,
        bus: Arc<dyn MessageSink>,
    ) -> Self {
        let name = name.into();
        VideoCrop {
            poster: Poster::new(name.clone(), bus),
            name,
            converter,
            max_queued: Arc::new(AtomicUsize::new(settings.max_queued_buffers)),
            settings: Mutex::new(settings),
            src_pads: Mutex::new(Vec::new()),
            state: Mutex::new(CropState {
                stages: Vec::new(),
                names: PadNames::new(SRC_TEMPLATE),
                input: None,
                cache: EventCache::default(),
                active: false,
                flushing: false,
                eos: false,
            }),
        }
    }

    /// Element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current settings.
    pub fn settings(&self) -> CropSettings {
        self.settings.lock().clone()
    }

    /// Replaces the settings. Crop and region limits apply to the next
    /// buffer, pool sizes to the next (re)configuration.
    pub fn set_settings(&self, settings: CropSettings) {
        self.max_queued
            .store(settings.max_queued_buffers, Ordering::Relaxed);
        *self.settings.lock() = settings;
    }

    /// Changes the crop rectangle, also while streaming.
    pub fn set_crop(&self, crop: CropRect) {
        self.settings.lock().crop = crop;
    }

    /// Negotiated input format.
    pub fn input_info(&self) -> Option<VideoInfo> {
        self.state.lock().input
    }

    /// Output pads in processing order.
    pub fn src_pads(&self) -> Vec<Arc<SrcPad>> {
        self.state
            .lock()
            .stages
            .iter()
            .map(|stage| stage.pad().clone())
            .collect()
    }

    /// Names of the output pads in processing order.
    pub fn stage_order(&self) -> Vec<String> {
        self.state
            .lock()
            .stages
            .iter()
            .map(|stage| stage.pad().name().to_owned())
            .collect()
    }

    /// Output format of `pad`, once configured.
    pub fn output_info(&self, pad: &SrcPad) -> Option<VideoInfo> {
        self.state
            .lock()
            .stages
            .iter()
            .find(|stage| std::ptr::eq(stage.pad().as_ref(), pad))
            .and_then(|stage| stage.output_info())
    }

    /// Requests an output pad, named `video_<n>` or the lowest free index.
    pub fn request_pad(&self, name: Option<&str>) -> Result<Arc<SrcPad>> {
        let settings = self.settings();
        let mut state = self.state.lock();
        let (name, index) = state.names.acquire(name)?;
        let queue = DeliveryQueue::with_fullness(max_buffers_check(self.max_queued.clone()));
        let pad = Arc::new(SrcPad::new(name, Some(index), queue));
        if state.active {
            if let Err(err) = pad.activate(&self.poster) {
                state.names.release(index);
                return Err(err);
            }
        }

        let mut stage = Stage::new(pad.clone());
        if let Some(input) = state.input {
            if let Err(err) = stage.configure(&input, self.converter.as_ref(), &settings, state.active) {
                self.poster.error(Domain::Negotiation, format!("{}: {err}", pad.name()));
            }
        }
        state.stages.push(stage);
        sort_stages(&mut state.stages);
        self.src_pads.lock().push(pad.clone());
        tracing::debug!(element = %self.name, pad = pad.name(), "Added output pad");
        Ok(pad)
    }

    /// Releases an output pad, freeing its stage.
    pub fn release_pad(&self, pad: &SrcPad) -> Result<()> {
        let mut stage = {
            let mut state = self.state.lock();
            let position = state
                .stages
                .iter()
                .position(|stage| std::ptr::eq(stage.pad().as_ref(), pad))
                .ok_or_else(|| Error::UnknownPad(pad.name().to_owned()))?;
            let stage = state.stages.remove(position);
            if let Some(index) = pad.index() {
                state.names.release(index);
            }
            stage
        };
        self.src_pads
            .lock()
            .retain(|p| !std::ptr::eq(p.as_ref(), pad));
        stage.pad().deactivate();
        stage.reset();
        tracing::debug!(element = %self.name, pad = pad.name(), "Released output pad");
        Ok(())
    }

    /// Re-runs output fixation for every stage, e.g. after pads were linked.
    pub fn reconfigure(&self) -> bool {
        let settings = self.settings();
        let mut state = self.state.lock();
        self.configure_stages(&mut state, &settings)
    }

    fn configure_stages(&self, state: &mut CropState, settings: &CropSettings) -> bool {
        let Some(input) = state.input else {
            return true;
        };
        let mut ok = true;
        for stage in &mut state.stages {
            if let Err(err) = stage.configure(&input, self.converter.as_ref(), settings, state.active) {
                self.poster
                    .error(Domain::Negotiation, format!("{}: {err}", stage.pad().name()));
                ok = false;
            }
        }
        sort_stages(&mut state.stages);
        tracing::info!(
            element = %self.name,
            order = ?state.stages.iter().map(|s| s.pad().name()).collect::<Vec<_>>(),
            "Stage order"
        );
        ok
    }

    /// Processes one input buffer on every output.
    pub fn chain(&self, buffer: Buffer) -> FlowResult {
        let settings = self.settings();
        let mut state = self.state.lock();
        if state.flushing {
            return Err(FlowError::Flushing);
        }
        if state.eos {
            return Err(FlowError::Eos);
        }
        let info = state.input.ok_or(FlowError::NotNegotiated)?;

        let rois = buffer.rois();
        if rois.len() > settings.max_rois {
            let err = Error::MalformedMeta(format!(
                "{} regions of interest, at most {} supported",
                rois.len(),
                settings.max_rois
            ));
            // Recoverable for this buffer only; the stream keeps flowing.
            self.poster
                .warning(Domain::Stream, format!("Dropping buffer: {err}"));
            return Ok(());
        }

        let CropState { stages, cache, .. } = &mut *state;
        let regions: Vec<(CropRect, bool)> = if rois.is_empty() {
            vec![(settings.crop, true)]
        } else {
            rois.iter().map(|roi| (roi.rect, false)).collect()
        };
        for (crop, input_is_free) in regions {
            let report = chain::run(
                stages,
                cache,
                self.converter.as_ref(),
                &buffer,
                &info,
                crop,
                input_is_free,
                &self.poster,
            );
            tracing::trace!(
                element = %self.name,
                ?crop,
                produced = report.produced,
                failed = report.failed,
                "Processed buffer"
            );
        }
        Ok(())
    }

    /// Handles an event arriving on the sink pad.
    pub fn sink_event(&self, event: Event) -> bool {
        tracing::debug!(element = %self.name, event = event.name(), "Handling event");
        match event {
            Event::FlushStart => {
                for pad in self.src_pads.lock().iter() {
                    pad.flush_start();
                }
                self.state.lock().flushing = true;
                true
            }
            Event::FlushStop { reset_time } => {
                let mut state = self.state.lock();
                state.flushing = false;
                state.eos = false;
                for stage in &mut state.stages {
                    stage.pad().flush_stop(reset_time);
                    stage.mark_segment();
                }
                true
            }
            Event::StreamStart { stream_id } => {
                let mut state = self.state.lock();
                state.cache.stream_id = Some(stream_id);
                for stage in &mut state.stages {
                    stage.mark_stream_start();
                }
                true
            }
            Event::Segment(segment) => {
                let mut state = self.state.lock();
                state.cache.segment = Some(segment);
                for stage in &mut state.stages {
                    stage.mark_segment();
                }
                true
            }
            Event::Caps(caps) => {
                let info = match VideoInfo::from_caps(&caps) {
                    Ok(info) => info,
                    Err(err) => {
                        self.poster.error(Domain::Negotiation, err.to_string());
                        return false;
                    }
                };
                tracing::info!(element = %self.name, input = %info.to_structure(), "Input format");
                let settings = self.settings();
                let mut state = self.state.lock();
                state.input = Some(info);
                self.configure_stages(&mut state, &settings)
            }
            Event::Eos => {
                let mut state = self.state.lock();
                state.eos = true;
                let CropState { stages, cache, .. } = &mut *state;
                for stage in stages.iter_mut() {
                    stage.emit_pending(cache);
                    stage.pad().enqueue_event(Event::Eos);
                }
                true
            }
        }
    }

    /// Answers a query arriving on the sink pad.
    pub fn sink_query(&self, query: &Query) -> Option<QueryAnswer> {
        let template = Caps::video_formats(&PixelFormat::ALL);
        match query {
            Query::Caps(filter) => Some(QueryAnswer::Caps(match filter {
                Some(filter) => filter.intersect(&template),
                None => template,
            })),
            Query::AcceptCaps(caps) => Some(QueryAnswer::AcceptCaps(
                caps.is_fixed() && VideoInfo::from_caps(caps).is_ok(),
            )),
            Query::Position | Query::Latency => None,
        }
    }

    /// Answers a query arriving on output pad `pad`.
    pub fn src_query(&self, pad: &SrcPad, query: &Query) -> Option<QueryAnswer> {
        match query {
            Query::Caps(filter) => {
                let caps = self.src_caps(pad);
                Some(QueryAnswer::Caps(match filter {
                    Some(filter) => filter.intersect(&caps),
                    None => caps,
                }))
            }
            Query::AcceptCaps(caps) => Some(QueryAnswer::AcceptCaps(
                self.src_caps(pad).can_intersect(caps),
            )),
            Query::Position => Some(QueryAnswer::Position(pad.last_pushed_pts())),
            Query::Latency => Some(QueryAnswer::Latency {
                live: false,
                min: std::time::Duration::ZERO,
                max: None,
            }),
        }
    }

    fn src_caps(&self, pad: &SrcPad) -> Caps {
        if let Some(info) = self.output_info(pad) {
            return info.to_caps();
        }
        let Some(input) = self.input_info() else {
            return Caps::video_formats(&PixelFormat::ALL);
        };
        let producible: Vec<PixelFormat> = PixelFormat::ALL
            .into_iter()
            .filter(|format| self.converter.can_convert(input.format, *format))
            .collect();
        Caps::video_formats(&producible)
    }

    /// Reacts to an element state change.
    pub fn change_state(&self, transition: StateChange) -> Result<()> {
        match transition {
            StateChange::ReadyToPaused => self.start(),
            StateChange::PausedToReady => {
                self.stop();
                Ok(())
            }
            StateChange::PausedToPlaying | StateChange::PlayingToPaused => Ok(()),
        }
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        for stage in &state.stages {
            stage.pad().activate(&self.poster)?;
            stage.set_pools_active(true);
        }
        state.active = true;
        state.flushing = false;
        state.eos = false;
        tracing::debug!(element = %self.name, "Started");
        Ok(())
    }

    fn stop(&self) {
        for pad in self.src_pads.lock().iter() {
            pad.deactivate();
        }
        let mut state = self.state.lock();
        for stage in &mut state.stages {
            stage.reset();
        }
        state.active = false;
        state.input = None;
        state.cache = EventCache::default();
        tracing::debug!(element = %self.name, "Stopped");
    }
}

impl Drop for VideoCrop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sort_stages(stages: &mut [Stage]) {
    stages.sort_by(|a, b| b.area().cmp(&a.area()));
}
