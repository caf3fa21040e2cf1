// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Sink and source pads.
//!
//! A [`SinkPad`] owns the inbound FIFO filled by upstream and drained by the
//! aggregation worker. A [`SrcPad`] owns the outbound [`DeliveryQueue`] and
//! the [`DeliveryWorker`] pushing it downstream. Both expose their flags
//! through the [`Pad`] trait, which is all the quorum tracker needs.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::bus::Poster;
use crate::delivery::{DeliveryItem, DeliveryQueue, DeliveryWorker, Downstream, Outlet};
use crate::error::{Error, Result};
use crate::event::{Event, Segment};
use crate::format::Caps;

/// Direction of a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadDirection {
    /// Receives data from upstream.
    Sink,
    /// Sends data downstream.
    Src,
}

/// Snapshot of a pad's control flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PadFlags {
    /// Between flush-start and flush-stop, or while inactive.
    pub flushing: bool,
    /// End-of-stream received (sink) or sent (source).
    pub eos: bool,
    /// Caps were received (sink) or announced (source).
    pub negotiated: bool,
}

/// Common view of sink and source pads.
pub trait Pad: Send + Sync {
    /// Pad name, e.g. `sink_0`.
    fn name(&self) -> &str;

    /// Numeric index of request pads.
    fn index(&self) -> Option<u32>;

    /// Direction.
    fn direction(&self) -> PadDirection;

    /// Current flags, read under the pad's own lock.
    fn flags(&self) -> PadFlags;
}

#[derive(Default)]
struct SinkPadState {
    queue: VecDeque<Buffer>,
    flags: PadFlags,
    caps: Option<Caps>,
    segment: Option<Segment>,
}

/// Input pad with an unbounded inbound FIFO.
pub struct SinkPad {
    name: String,
    index: u32,
    state: Mutex<SinkPadState>,
}

impl SinkPad {
    pub(crate) fn new(name: String, index: u32, flushing: bool) -> Self {
        SinkPad {
            name,
            index,
            state: Mutex::new(SinkPadState {
                flags: PadFlags {
                    flushing,
                    ..PadFlags::default()
                },
                ..SinkPadState::default()
            }),
        }
    }

    /// Appends a buffer to the tail of the FIFO. Never blocks or drops.
    pub fn push(&self, buffer: Buffer) {
        self.state.lock().queue.push_back(buffer);
    }

    /// Removes the oldest buffer.
    pub fn pop_head(&self) -> Option<Buffer> {
        self.state.lock().queue.pop_front()
    }

    /// True when at least one buffer is queued.
    pub fn has_data(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    /// Number of queued buffers.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Releases every queued buffer.
    pub fn flush(&self) {
        let drained = std::mem::take(&mut self.state.lock().queue);
        drop(drained);
    }

    pub(crate) fn set_flushing(&self, flushing: bool) {
        self.state.lock().flags.flushing = flushing;
    }

    pub(crate) fn set_eos(&self, eos: bool) {
        self.state.lock().flags.eos = eos;
    }

    pub(crate) fn set_caps(&self, caps: Caps) {
        let mut state = self.state.lock();
        state.caps = Some(caps);
        state.flags.negotiated = true;
    }

    /// Caps received on this pad.
    pub fn caps(&self) -> Option<Caps> {
        self.state.lock().caps.clone()
    }

    pub(crate) fn set_segment(&self, segment: Segment) {
        self.state.lock().segment = Some(segment);
    }

    /// Segment received on this pad.
    pub fn segment(&self) -> Option<Segment> {
        self.state.lock().segment
    }

    /// Appends `buffer` if the pad is ready for data: not flushing, not EOS,
    /// negotiated. Checked and appended under one lock, so a concurrent
    /// flush either drains the buffer or makes this call fail.
    pub(crate) fn push_checked(&self, buffer: Buffer) -> crate::FlowResult {
        let mut state = self.state.lock();
        let flags = state.flags;
        if flags.flushing {
            Err(crate::FlowError::Flushing)
        } else if flags.eos {
            Err(crate::FlowError::Eos)
        } else if !flags.negotiated {
            Err(crate::FlowError::NotNegotiated)
        } else {
            state.queue.push_back(buffer);
            Ok(())
        }
    }

    /// Marks the pad flushing and releases every queued buffer.
    pub(crate) fn start_flushing(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.flags.flushing = true;
            std::mem::take(&mut state.queue)
        };
        drop(drained);
    }
}

impl Pad for SinkPad {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> Option<u32> {
        Some(self.index)
    }

    fn direction(&self) -> PadDirection {
        PadDirection::Sink
    }

    fn flags(&self) -> PadFlags {
        self.state.lock().flags
    }
}

impl fmt::Debug for SinkPad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkPad")
            .field("name", &self.name)
            .field("flags", &self.flags())
            .field("queued", &self.queued())
            .finish()
    }
}

#[derive(Default)]
struct SrcPadState {
    flags: PadFlags,
    caps: Option<Caps>,
    position: Duration,
    base_time: Option<Instant>,
}

/// Output pad with its own delivery queue and worker thread.
pub struct SrcPad {
    name: String,
    index: Option<u32>,
    state: Mutex<SrcPadState>,
    queue: Arc<DeliveryQueue>,
    outlet: Arc<Outlet>,
    worker: Mutex<Option<DeliveryWorker>>,
}

impl SrcPad {
    pub(crate) fn new(name: String, index: Option<u32>, queue: DeliveryQueue) -> Self {
        queue.set_flushing(true);
        SrcPad {
            name,
            index,
            state: Mutex::new(SrcPadState {
                flags: PadFlags {
                    flushing: true,
                    ..PadFlags::default()
                },
                ..SrcPadState::default()
            }),
            queue: Arc::new(queue),
            outlet: Arc::new(Outlet::default()),
            worker: Mutex::new(None),
        }
    }

    /// Connects the pad to its downstream peer.
    pub fn link(&self, peer: Arc<dyn Downstream>) {
        self.outlet.link(peer);
    }

    /// Disconnects the pad from its downstream peer.
    pub fn unlink(&self) {
        self.outlet.unlink();
    }

    /// Downstream peer, if linked.
    pub fn peer(&self) -> Option<Arc<dyn Downstream>> {
        self.outlet.peer()
    }

    /// Caps the downstream peer accepts.
    pub fn peer_query_caps(&self, filter: Option<&Caps>) -> Option<Caps> {
        self.peer().and_then(|peer| peer.query_caps(filter))
    }

    /// Starts the delivery worker.
    pub(crate) fn activate(&self, poster: &Poster) -> Result<()> {
        self.queue.set_flushing(false);
        self.state.lock().flags.flushing = false;
        let mut worker = self.worker.lock();
        match worker.as_ref() {
            Some(worker) => worker.resume(),
            None => {
                *worker = Some(DeliveryWorker::spawn(
                    &self.name,
                    self.queue.clone(),
                    self.outlet.clone(),
                    poster.clone(),
                )?)
            }
        }
        Ok(())
    }

    /// Flushes the queue, stops the worker and resets the timeline.
    pub(crate) fn deactivate(&self) {
        self.queue.set_flushing(true);
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
        *self.state.lock() = SrcPadState {
            flags: PadFlags {
                flushing: true,
                ..PadFlags::default()
            },
            ..SrcPadState::default()
        };
        self.outlet.reset();
    }

    /// Enqueues an item and wakes the worker. A rejected item is destroyed.
    fn enqueue(&self, item: DeliveryItem) -> bool {
        match self.queue.push(item) {
            Ok(()) => {
                if let Some(worker) = self.worker.lock().as_ref() {
                    worker.resume();
                }
                true
            }
            Err(item) => {
                tracing::debug!(pad = %self.name, "Queue is flushing, dropping item");
                item.destroy();
                false
            }
        }
    }

    /// Queues a buffer for delivery.
    pub(crate) fn enqueue_buffer(&self, buffer: Buffer) -> bool {
        self.enqueue(DeliveryItem::buffer(buffer))
    }

    /// Queues a serialized event, ordered with the buffers around it.
    pub(crate) fn enqueue_event(&self, event: Event) -> bool {
        match &event {
            Event::Caps(caps) => {
                let mut state = self.state.lock();
                state.caps = Some(caps.clone());
                state.flags.negotiated = true;
            }
            Event::Eos => self.state.lock().flags.eos = true,
            _ => {}
        }
        self.enqueue(DeliveryItem::event(event))
    }

    /// Starts flushing: drops everything queued and forwards the flush
    /// downstream right away.
    pub(crate) fn flush_start(&self) -> bool {
        self.state.lock().flags.flushing = true;
        self.queue.set_flushing(true);
        self.peer()
            .is_some_and(|peer| peer.push_event(Event::FlushStart))
    }

    /// Ends flushing and forwards the flush-stop downstream.
    pub(crate) fn flush_stop(&self, reset_time: bool) -> bool {
        {
            let mut state = self.state.lock();
            state.flags.flushing = false;
            state.flags.eos = false;
            if reset_time {
                state.position = Duration::ZERO;
                state.base_time = None;
            }
        }
        self.queue.set_flushing(false);
        if reset_time {
            self.outlet.reset();
        }
        self.peer()
            .is_some_and(|peer| peer.push_event(Event::FlushStop { reset_time }))
    }

    /// Caps announced on this pad.
    pub fn caps(&self) -> Option<Caps> {
        self.state.lock().caps.clone()
    }

    /// Accumulated output position.
    pub fn position(&self) -> Duration {
        self.state.lock().position
    }

    /// Returns the current position and advances it by `duration`.
    pub(crate) fn advance(&self, duration: Duration) -> Duration {
        let mut state = self.state.lock();
        let position = state.position;
        state.position += duration;
        position
    }

    /// Wall-clock reference of the output timeline, set on first use.
    pub(crate) fn base_time(&self) -> Instant {
        *self.state.lock().base_time.get_or_insert_with(Instant::now)
    }

    /// Whether the output timeline has started.
    pub(crate) fn has_base_time(&self) -> bool {
        self.state.lock().base_time.is_some()
    }

    /// Timestamp of the last buffer pushed downstream.
    pub fn last_pushed_pts(&self) -> Option<Duration> {
        self.outlet.last_pts()
    }

    /// Items waiting for delivery.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Pad for SrcPad {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> Option<u32> {
        self.index
    }

    fn direction(&self) -> PadDirection {
        PadDirection::Src
    }

    fn flags(&self) -> PadFlags {
        self.state.lock().flags
    }
}

impl fmt::Debug for SrcPad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrcPad")
            .field("name", &self.name)
            .field("flags", &self.flags())
            .field("queued", &self.queued())
            .finish()
    }
}

impl Drop for SrcPad {
    fn drop(&mut self) {
        self.queue.set_flushing(true);
    }
}

/// Allocates request-pad names of the form `<prefix><index>`.
#[derive(Debug, Clone)]
pub struct PadNames {
    template: &'static str,
    prefix: &'static str,
    used: BTreeSet<u32>,
}

impl PadNames {
    /// Creates an allocator for a template such as `sink_%u`.
    pub fn new(template: &'static str) -> Self {
        PadNames {
            template,
            prefix: template.strip_suffix("%u").unwrap_or(template),
            used: BTreeSet::new(),
        }
    }

    /// Pad template.
    pub fn template(&self) -> &'static str {
        self.template
    }

    /// Reserves a name. An explicit name must match the template and use a
    /// free index; without a name the lowest free index is taken.
    pub fn acquire(&mut self, requested: Option<&str>) -> Result<(String, u32)> {
        let index = match requested {
            Some(name) => {
                let index = name
                    .strip_prefix(self.prefix)
                    .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
                    .and_then(|digits| digits.parse::<u32>().ok())
                    .ok_or_else(|| Error::InvalidPadName {
                        name: name.to_owned(),
                        template: self.template,
                    })?;
                if self.used.contains(&index) {
                    return Err(Error::PadIndexInUse(index));
                }
                index
            }
            None => (0..=u32::MAX)
                .find(|index| !self.used.contains(index))
                .ok_or_else(|| Error::Other("no free pad index".to_owned()))?,
        };
        self.used.insert(index);
        Ok((format!("{}{index}", self.prefix), index))
    }

    /// Returns an index to the free set.
    pub fn release(&mut self, index: u32) {
        self.used.remove(&index);
    }

    /// Indices currently in use.
    pub fn in_use(&self) -> impl Iterator<Item = u32> + '_ {
        self.used.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_requests_take_lowest_free_index() {
        let mut names = PadNames::new("sink_%u");
        assert_eq!(names.acquire(None).unwrap(), ("sink_0".to_owned(), 0));
        assert_eq!(names.acquire(Some("sink_5")).unwrap().1, 5);
        assert_eq!(names.acquire(None).unwrap().1, 1);
        names.release(0);
        assert_eq!(names.acquire(None).unwrap().1, 0);
        assert_eq!(names.acquire(None).unwrap().1, 2);
    }

    #[test]
    fn explicit_collisions_are_rejected() {
        let mut names = PadNames::new("video_%u");
        names.acquire(Some("video_3")).unwrap();
        assert!(matches!(
            names.acquire(Some("video_3")),
            Err(Error::PadIndexInUse(3))
        ));
        assert_eq!(names.in_use().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn malformed_names_are_rejected() {
        let mut names = PadNames::new("sink_%u");
        for bad in ["src_0", "sink_", "sink_x", "sink_-1", "sink_+1"] {
            assert!(matches!(
                names.acquire(Some(bad)),
                Err(Error::InvalidPadName { .. })
            ));
        }
        assert_eq!(names.in_use().count(), 0);
    }

    #[test]
    fn sink_pad_fifo_order() {
        let arena = crate::buffer::BufferArena::new();
        let pad = SinkPad::new("sink_0".into(), 0, false);
        let first = arena.allocate_empty();
        let second = arena.allocate_empty();
        let first_id = first.id();
        pad.push(first);
        pad.push(second);
        assert_eq!(pad.queued(), 2);
        assert_eq!(pad.pop_head().unwrap().id(), first_id);
        pad.flush();
        assert!(!pad.has_data());
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn flushing_pad_refuses_and_drains() {
        let arena = crate::buffer::BufferArena::new();
        let pad = SinkPad::new("sink_0".into(), 0, false);
        pad.set_caps(Caps::new_any());
        assert_eq!(pad.push_checked(arena.allocate_empty()), Ok(()));

        pad.start_flushing();
        assert!(pad.flags().flushing);
        assert!(!pad.has_data());
        assert_eq!(
            pad.push_checked(arena.allocate_empty()),
            Err(crate::FlowError::Flushing)
        );
        assert_eq!(arena.live_count(), 0);

        pad.set_flushing(false);
        pad.set_eos(true);
        assert_eq!(
            pad.push_checked(arena.allocate_empty()),
            Err(crate::FlowError::Eos)
        );
    }
}
