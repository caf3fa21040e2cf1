// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! N sink pads → 1 source pad, synchronized buffer aggregation.
//!
//! Each `sink_%u` pad queues buffers independently. A worker thread waits
//! until every live pad has a buffer, or until the next output deadline,
//! then moves one buffer's memory from each pad into a composite buffer.
//! Bit `n` of the composite's [`ChannelMask`](crate::ChannelMask) is set
//! when the `n`-th attached pad contributed.
//!
//! Control events are propagated by quorum: a flush starts downstream once
//! every sink pad flushes, and EOS is sent once every sink pad is at EOS and
//! all queued input was aggregated.

mod negotiate;
mod worker;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferArena};
use crate::bus::{MessageSink, Poster};
use crate::config::{BatchSettings, max_buffers_check};
use crate::delivery::DeliveryQueue;
use crate::error::{Error, FlowError, FlowResult, Result};
use crate::event::{Event, Query, QueryAnswer, StateChange};
use crate::format::Caps;
use crate::notify::Notify;
use crate::pad::{Pad, PadNames, SinkPad, SrcPad};
use crate::quorum::Quorum;

use negotiate::Negotiated;

/// Template of the batch element's request pads.
pub const SINK_TEMPLATE: &str = "sink_%u";

struct BatchState {
    pads: Vec<Arc<SinkPad>>,
    names: PadNames,
    active: bool,
    failed: bool,
    output: Option<Negotiated>,
    renegotiate: bool,
    stream_id: Option<String>,
    segment_pending: bool,
    eos_sent: bool,
}

impl BatchState {
    fn reset(&mut self) {
        self.output = None;
        self.renegotiate = false;
        self.stream_id = None;
        self.segment_pending = false;
        self.eos_sent = false;
    }
}

/// State shared between the element and its aggregation worker.
struct BatchInner {
    name: String,
    settings: BatchSettings,
    max_queued: Arc<AtomicUsize>,
    arena: BufferArena,
    poster: Poster,
    state: Mutex<BatchState>,
    notify: Notify,
    src: SrcPad,
}

impl BatchInner {
    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn needs_negotiation(&self) -> bool {
        let state = self.state.lock();
        state.output.is_none() || state.renegotiate
    }

    fn output_duration(&self) -> Duration {
        self.state
            .lock()
            .output
            .as_ref()
            .map(|output| output.duration)
            .unwrap_or_else(|| self.settings.default_duration())
    }

    fn any_data(&self) -> bool {
        self.state.lock().pads.iter().any(|pad| pad.has_data())
    }

    /// All pads at EOS with nothing left to aggregate.
    fn drained_eos(state: &BatchState) -> bool {
        !state.eos_sent
            && !state.pads.is_empty()
            && Quorum::new(&state.pads).all_eos(None)
            && state.pads.iter().all(|pad| !pad.has_data())
    }

    fn wake_for_any_data(&self) -> bool {
        let state = self.state.lock();
        !state.active
            || state.renegotiate
            || Self::drained_eos(&state)
            || state.pads.iter().any(|pad| pad.has_data())
    }

    /// Every pad that is neither flushing nor at EOS has data, and at least
    /// one pad has data.
    fn wake_for_quorum(&self) -> bool {
        let state = self.state.lock();
        if !state.active || state.renegotiate || Self::drained_eos(&state) {
            return true;
        }
        let mut any = false;
        for pad in &state.pads {
            let flags = pad.flags();
            let has_data = pad.has_data();
            any |= has_data;
            if !flags.flushing && !flags.eos && !has_data {
                return false;
            }
        }
        any
    }

    /// Sends EOS downstream once every pad is at EOS and drained. Returns
    /// whether EOS has been sent.
    fn forward_eos_when_drained(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !Self::drained_eos(&state) {
                return state.eos_sent;
            }
            state.eos_sent = true;
        }
        tracing::debug!(element = %self.name, "All sink pads drained at EOS");
        self.src.enqueue_event(Event::Eos);
        true
    }

    fn negotiate(&self) -> Result<()> {
        let pad_caps: Vec<Caps> = {
            let mut state = self.state.lock();
            state.renegotiate = false;
            state
                .pads
                .iter()
                .map(|pad| pad.caps().unwrap_or_else(Caps::new_any))
                .collect()
        };
        let peer_caps = self.src.peer_query_caps(None);
        let negotiated = negotiate::combine(pad_caps, peer_caps, self.settings.default_duration())?;
        tracing::info!(
            element = %self.name,
            caps = %negotiated.caps,
            duration = ?negotiated.duration,
            "Negotiated output format"
        );

        let caps = negotiated.caps.clone();
        let stream_start = {
            let mut state = self.state.lock();
            state.output = Some(negotiated);
            match state.stream_id {
                Some(_) => None,
                None => {
                    let stream_id = format!("batch-{}", uuid::Uuid::new_v4());
                    state.stream_id = Some(stream_id.clone());
                    state.segment_pending = true;
                    Some(stream_id)
                }
            }
        };
        if let Some(stream_id) = stream_start {
            self.src.enqueue_event(Event::StreamStart { stream_id });
        }
        self.src.enqueue_event(Event::Caps(caps));
        Ok(())
    }

    fn sink_caps(&self) -> Caps {
        let output = self
            .state
            .lock()
            .output
            .as_ref()
            .map(|output| output.caps.clone());
        match output {
            Some(caps) => caps.without_framerate(),
            None => self
                .src
                .peer_query_caps(None)
                .map(|caps| caps.without_framerate())
                .unwrap_or_else(Caps::new_any),
        }
    }
}

/// The batch element: N `sink_%u` request pads aggregated onto one `src` pad.
pub struct Batch {
    inner: Arc<BatchInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Batch {
    /// Creates an idle element posting its messages to `bus`.
    pub fn new(name: impl Into<String>, settings: BatchSettings, bus: Arc<dyn MessageSink>) -> Self {
        let name = name.into();
        let max_queued = Arc::new(AtomicUsize::new(settings.max_queued_buffers));
        let queue = DeliveryQueue::with_fullness(max_buffers_check(max_queued.clone()));
        let src = SrcPad::new(format!("{name}:src"), None, queue);
        Batch {
            inner: Arc::new(BatchInner {
                poster: Poster::new(name.clone(), bus),
                name,
                settings,
                max_queued,
                arena: BufferArena::new(),
                state: Mutex::new(BatchState {
                    pads: Vec::new(),
                    names: PadNames::new(SINK_TEMPLATE),
                    active: false,
                    failed: false,
                    output: None,
                    renegotiate: false,
                    stream_id: None,
                    segment_pending: false,
                    eos_sent: false,
                }),
                notify: Notify::new(),
                src,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Element name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Arena composite buffers are allocated from. Input buffers allocated
    /// here are pinned by the composites that consume them.
    pub fn arena(&self) -> &BufferArena {
        &self.inner.arena
    }

    /// The single source pad.
    pub fn src_pad(&self) -> &SrcPad {
        &self.inner.src
    }

    /// Currently attached sink pads, in attachment order.
    pub fn sink_pads(&self) -> Vec<Arc<SinkPad>> {
        self.inner.state.lock().pads.clone()
    }

    /// Runs `f` on a quorum view of the attached sink pads.
    pub fn with_quorum<R>(&self, f: impl FnOnce(&Quorum<'_, SinkPad>) -> R) -> R {
        let state = self.inner.state.lock();
        f(&Quorum::new(&state.pads))
    }

    /// Changes the delivery queue limit; 0 never reports full.
    pub fn set_max_queued_buffers(&self, max: usize) {
        self.inner
            .max_queued
            .store(max, std::sync::atomic::Ordering::Relaxed);
    }

    /// Negotiated output caps.
    pub fn output_caps(&self) -> Option<Caps> {
        self.inner
            .state
            .lock()
            .output
            .as_ref()
            .map(|output| output.caps.clone())
    }

    /// Duration of each composite buffer.
    pub fn output_duration(&self) -> Duration {
        self.inner.output_duration()
    }

    /// Requests a sink pad, named `sink_<n>` or the lowest free index.
    pub fn request_pad(&self, name: Option<&str>) -> Result<Arc<SinkPad>> {
        let pad = {
            let mut state = self.inner.state.lock();
            let (name, index) = state.names.acquire(name)?;
            let pad = Arc::new(SinkPad::new(name, index, !state.active));
            state.pads.push(pad.clone());
            pad
        };
        tracing::debug!(element = %self.inner.name, pad = pad.name(), "Added sink pad");
        self.inner.notify.notify();
        Ok(pad)
    }

    /// Releases a sink pad, dropping everything it still queues.
    pub fn release_pad(&self, pad: &SinkPad) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let position = state
                .pads
                .iter()
                .position(|p| std::ptr::eq(p.as_ref(), pad))
                .ok_or_else(|| Error::UnknownPad(pad.name().to_owned()))?;
            let removed = state.pads.remove(position);
            if let Some(index) = removed.index() {
                state.names.release(index);
            }
            removed.start_flushing();
        }
        tracing::debug!(element = %self.inner.name, pad = pad.name(), "Released sink pad");
        self.inner.notify.notify();
        Ok(())
    }

    /// Queues one buffer arriving on `pad`.
    pub fn chain(&self, pad: &SinkPad, buffer: Buffer) -> FlowResult {
        if self.inner.state.lock().failed {
            return Err(FlowError::NotNegotiated);
        }
        tracing::trace!(pad = pad.name(), pts = ?buffer.pts(), "Queueing buffer");
        pad.push_checked(buffer)?;
        self.inner.notify.notify();
        Ok(())
    }

    /// Handles an event arriving on `pad`.
    pub fn sink_event(&self, pad: &SinkPad, event: Event) -> bool {
        tracing::debug!(pad = pad.name(), event = event.name(), "Handling event");
        match event {
            Event::FlushStart => {
                pad.start_flushing();
                let forward = self.with_quorum(|quorum| quorum.all_flushing(Some(pad)));
                self.inner.notify.notify();
                if forward {
                    tracing::debug!(element = %self.inner.name, "All sink pads flushing");
                    self.inner.src.flush_start();
                }
            }
            Event::FlushStop { reset_time } => {
                pad.set_flushing(false);
                pad.set_eos(false);
                let forward = {
                    let mut state = self.inner.state.lock();
                    let forward = Quorum::new(&state.pads).all_non_flushing(Some(pad));
                    if forward {
                        state.eos_sent = false;
                        state.segment_pending = true;
                    }
                    forward
                };
                if forward {
                    tracing::debug!(element = %self.inner.name, "All sink pads stopped flushing");
                    self.inner.src.flush_stop(reset_time);
                }
                self.inner.notify.notify();
            }
            Event::Eos => {
                pad.set_eos(true);
                self.inner.notify.notify();
            }
            Event::Caps(caps) => {
                tracing::debug!(pad = pad.name(), %caps, "Received caps");
                pad.set_caps(caps);
                {
                    let mut state = self.inner.state.lock();
                    if state.output.is_some() {
                        state.renegotiate = true;
                    }
                }
                self.inner.notify.notify();
            }
            Event::Segment(segment) => pad.set_segment(segment),
            Event::StreamStart { .. } => {}
        }
        true
    }

    /// Answers a query arriving on a sink pad.
    pub fn sink_query(&self, _pad: &SinkPad, query: &Query) -> Option<QueryAnswer> {
        match query {
            Query::Caps(filter) => {
                let caps = self.inner.sink_caps();
                Some(QueryAnswer::Caps(match filter {
                    Some(filter) => filter.intersect(&caps),
                    None => caps,
                }))
            }
            Query::AcceptCaps(caps) => Some(QueryAnswer::AcceptCaps(
                self.inner.sink_caps().can_intersect(caps),
            )),
            Query::Position | Query::Latency => None,
        }
    }

    /// Answers a query arriving on the source pad.
    pub fn src_query(&self, query: &Query) -> Option<QueryAnswer> {
        let output = self.output_caps().unwrap_or_else(Caps::new_any);
        match query {
            Query::Caps(filter) => Some(QueryAnswer::Caps(match filter {
                Some(filter) => filter.intersect(&output),
                None => output,
            })),
            Query::AcceptCaps(caps) => Some(QueryAnswer::AcceptCaps(output.can_intersect(caps))),
            Query::Position => Some(QueryAnswer::Position(Some(self.inner.src.position()))),
            Query::Latency => {
                let duration = self.output_duration();
                Some(QueryAnswer::Latency {
                    live: false,
                    min: duration,
                    max: Some(duration),
                })
            }
        }
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
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.inner.src.activate(&self.inner.poster)?;
        {
            let mut state = self.inner.state.lock();
            state.active = true;
            state.failed = false;
            for pad in &state.pads {
                pad.set_flushing(false);
            }
        }
        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-aggregate", self.inner.name))
            .spawn(move || worker::run(inner));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                tracing::debug!(element = %self.inner.name, "Started");
                Ok(())
            }
            Err(err) => {
                self.inner.state.lock().active = false;
                self.inner.src.deactivate();
                Err(err.into())
            }
        }
    }

    fn stop(&self) {
        self.inner.state.lock().active = false;
        self.inner.notify.notify();
        self.inner.src.deactivate();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!(element = %self.inner.name, "Aggregation worker panicked");
            }
        }
        let mut state = self.inner.state.lock();
        for pad in &state.pads {
            pad.start_flushing();
            pad.set_eos(false);
        }
        state.reset();
        tracing::debug!(element = %self.inner.name, "Stopped");
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    fn element() -> Batch {
        Batch::new("batch0", BatchSettings::default(), Arc::new(Bus::new()))
    }

    #[test]
    fn explicit_index_collision_leaves_pads_unchanged() {
        let batch = element();
        batch.request_pad(Some("sink_1")).unwrap();
        assert!(matches!(
            batch.request_pad(Some("sink_1")),
            Err(Error::PadIndexInUse(1))
        ));
        assert_eq!(batch.sink_pads().len(), 1);
        assert_eq!(batch.request_pad(None).unwrap().name(), "sink_0");
        assert_eq!(batch.request_pad(None).unwrap().name(), "sink_2");
    }

    #[test]
    fn released_pad_is_flushed_and_index_reusable() {
        let batch = element();
        let pad = batch.request_pad(None).unwrap();
        pad.push(batch.arena().allocate_empty());
        batch.release_pad(&pad).unwrap();
        assert!(pad.flags().flushing);
        assert!(!pad.has_data());
        assert_eq!(batch.arena().live_count(), 0);
        assert!(matches!(batch.release_pad(&pad), Err(Error::UnknownPad(_))));
        assert_eq!(batch.request_pad(None).unwrap().name(), "sink_0");
    }

    #[test]
    fn chain_refuses_data_before_caps_and_while_inactive() {
        let batch = element();
        let pad = batch.request_pad(None).unwrap();
        let buffer = batch.arena().allocate_empty();
        assert_eq!(batch.chain(&pad, buffer.clone()), Err(FlowError::Flushing));
        batch.change_state(StateChange::ReadyToPaused).unwrap();
        assert_eq!(batch.chain(&pad, buffer.clone()), Err(FlowError::NotNegotiated));
        batch.sink_event(&pad, Event::Eos);
        assert_eq!(batch.chain(&pad, buffer), Err(FlowError::Eos));
        batch.change_state(StateChange::PausedToReady).unwrap();
    }

    #[test]
    fn flush_is_forwarded_only_when_all_pads_flush() {
        let batch = element();
        let a = batch.request_pad(None).unwrap();
        let b = batch.request_pad(None).unwrap();
        batch.change_state(StateChange::ReadyToPaused).unwrap();

        batch.sink_event(&a, Event::FlushStart);
        assert!(!batch.src_pad().flags().flushing);
        batch.sink_event(&b, Event::FlushStart);
        assert!(batch.src_pad().flags().flushing);

        batch.sink_event(&a, Event::FlushStop { reset_time: true });
        assert!(batch.src_pad().flags().flushing);
        batch.sink_event(&b, Event::FlushStop { reset_time: true });
        assert!(!batch.src_pad().flags().flushing);
        batch.change_state(StateChange::PausedToReady).unwrap();
    }

    #[test]
    fn nothing_survives_a_flush_start() {
        let batch = Arc::new(element());
        let pad = batch.request_pad(None).unwrap();
        batch.change_state(StateChange::ReadyToPaused).unwrap();
        batch.sink_event(&pad, Event::Caps(Caps::new_any()));

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let producer = {
            let (batch, pad, done) = (batch.clone(), pad.clone(), done.clone());
            std::thread::spawn(move || {
                while !done.load(std::sync::atomic::Ordering::Relaxed) {
                    let _ = batch.chain(&pad, batch.arena().allocate_empty());
                }
            })
        };

        for _ in 0..500 {
            batch.sink_event(&pad, Event::FlushStart);
            assert!(!pad.has_data());
            assert_eq!(
                batch.chain(&pad, batch.arena().allocate_empty()),
                Err(FlowError::Flushing)
            );
            assert!(!pad.has_data());
            batch.sink_event(&pad, Event::FlushStop { reset_time: true });
        }

        done.store(true, std::sync::atomic::Ordering::Relaxed);
        producer.join().unwrap();
        batch.change_state(StateChange::PausedToReady).unwrap();
    }

    #[test]
    fn latency_is_one_output_frame() {
        let batch = element();
        assert_eq!(
            batch.src_query(&Query::Latency),
            Some(QueryAnswer::Latency {
                live: false,
                min: Duration::from_nanos(33_333_333),
                max: Some(Duration::from_nanos(33_333_333)),
            })
        );
    }
}
