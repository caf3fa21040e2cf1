// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Outbound delivery queue and the worker thread draining it.
//!
//! Every source pad owns one [`DeliveryQueue`] and one [`DeliveryWorker`].
//! Producers (the aggregation worker, fan-out stages) only enqueue; the
//! worker pushes to the downstream peer so that downstream backpressure
//! never blocks the producer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::buffer::Buffer;
use crate::bus::{Domain, Poster};
use crate::error::{FlowError, FlowResult, Result};
use crate::event::Event;
use crate::format::Caps;

/// Downstream peer of a source pad, implemented by the host bridge.
pub trait Downstream: Send + Sync {
    /// Pushes one buffer downstream.
    fn push(&self, buffer: Buffer) -> FlowResult;

    /// Pushes one event downstream. Returns whether it was handled.
    fn push_event(&self, event: Event) -> bool;

    /// Caps the peer can accept, `None` when it does not constrain them.
    fn query_caps(&self, _filter: Option<&Caps>) -> Option<Caps> {
        None
    }
}

/// What a [`DeliveryItem`] carries.
#[derive(Debug)]
pub enum Payload {
    /// A media buffer.
    Buffer(Buffer),
    /// A serialized event, kept in order with the buffers around it.
    Event(Event),
}

type DestroyFn = Box<dyn FnOnce(Payload) + Send>;

/// Queue entry: payload plus accounting data and a destroy callback.
pub struct DeliveryItem {
    payload: Payload,
    size: usize,
    duration: Option<Duration>,
    visible: bool,
    destroy: Option<DestroyFn>,
}

impl DeliveryItem {
    /// Wraps a buffer. Buffers count towards the queue level.
    pub fn buffer(buffer: Buffer) -> Self {
        DeliveryItem {
            size: buffer.size(),
            duration: buffer.duration(),
            payload: Payload::Buffer(buffer),
            visible: true,
            destroy: None,
        }
    }

    /// Wraps an event. Events are invisible to the queue level.
    pub fn event(event: Event) -> Self {
        DeliveryItem {
            payload: Payload::Event(event),
            size: 0,
            duration: None,
            visible: false,
            destroy: None,
        }
    }

    /// Sets the callback releasing the payload when the item is discarded
    /// instead of delivered.
    pub fn with_destroy(mut self, destroy: impl FnOnce(Payload) + Send + 'static) -> Self {
        self.destroy = Some(Box::new(destroy));
        self
    }

    /// Whether the item counts towards the queue level.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Payload duration.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Releases the wrapper only and hands out the payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Discards the item through its destroy callback.
    pub fn destroy(self) {
        match self.destroy {
            Some(destroy) => destroy(self.payload),
            None => drop(self.payload),
        }
    }
}

impl fmt::Debug for DeliveryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryItem")
            .field("payload", &self.payload)
            .field("size", &self.size)
            .field("visible", &self.visible)
            .finish()
    }
}

/// Current fill level of a [`DeliveryQueue`], visible items only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLevel {
    /// Number of visible items.
    pub visible: usize,
    /// Sum of item sizes.
    pub bytes: usize,
    /// Sum of item durations.
    pub time: Duration,
}

/// Decides whether the queue is full. Producers block while it returns true.
pub type FullnessCheck = Box<dyn Fn(&QueueLevel) -> bool + Send + Sync>;

struct QueueState {
    items: VecDeque<DeliveryItem>,
    level: QueueLevel,
    flushing: bool,
}

/// Bounded queue of [`DeliveryItem`]s with a flushing flag.
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    not_full: Condvar,
    is_full: FullnessCheck,
}

impl DeliveryQueue {
    /// Creates a queue that never reports full.
    pub fn unbounded() -> Self {
        Self::with_fullness(Box::new(|_| false))
    }

    /// Creates a queue with a custom fullness predicate.
    pub fn with_fullness(is_full: FullnessCheck) -> Self {
        DeliveryQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                level: QueueLevel::default(),
                flushing: false,
            }),
            not_full: Condvar::new(),
            is_full,
        }
    }

    /// Appends an item, blocking while the queue is full.
    ///
    /// Fails when the queue is flushing, handing the item back so the caller
    /// can destroy it.
    pub fn push(&self, item: DeliveryItem) -> core::result::Result<(), DeliveryItem> {
        let mut state = self.state.lock();
        while !state.flushing && item.visible && (self.is_full)(&state.level) {
            self.not_full.wait(&mut state);
        }
        if state.flushing {
            return Err(item);
        }
        if item.visible {
            state.level.visible += 1;
            state.level.bytes += item.size;
            state.level.time += item.duration.unwrap_or_default();
        }
        state.items.push_back(item);
        Ok(())
    }

    /// Removes the oldest item. Fails fast while flushing.
    pub fn pop(&self) -> Option<DeliveryItem> {
        let mut state = self.state.lock();
        if state.flushing {
            return None;
        }
        let item = state.items.pop_front()?;
        if item.visible {
            state.level.visible -= 1;
            state.level.bytes -= item.size;
            state.level.time = state
                .level
                .time
                .saturating_sub(item.duration.unwrap_or_default());
        }
        self.not_full.notify_all();
        Some(item)
    }

    /// Sets the flushing flag. Entering flushing destroys every queued item
    /// and releases blocked producers.
    pub fn set_flushing(&self, flushing: bool) {
        let drained: Vec<DeliveryItem> = {
            let mut state = self.state.lock();
            state.flushing = flushing;
            if !flushing {
                return;
            }
            state.level = QueueLevel::default();
            self.not_full.notify_all();
            state.items.drain(..).collect()
        };
        for item in drained {
            item.destroy();
        }
    }

    /// Whether the queue is flushing.
    pub fn is_flushing(&self) -> bool {
        self.state.lock().flushing
    }

    /// Number of queued items, visible or not.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Current fill level.
    pub fn level(&self) -> QueueLevel {
        self.state.lock().level
    }
}

/// Downstream link of a source pad, shared with its delivery worker.
#[derive(Default)]
pub(crate) struct Outlet {
    peer: Mutex<Option<Arc<dyn Downstream>>>,
    last_pts: Mutex<Option<Duration>>,
}

impl Outlet {
    pub(crate) fn link(&self, peer: Arc<dyn Downstream>) {
        *self.peer.lock() = Some(peer);
    }

    pub(crate) fn unlink(&self) {
        self.peer.lock().take();
    }

    pub(crate) fn peer(&self) -> Option<Arc<dyn Downstream>> {
        self.peer.lock().clone()
    }

    pub(crate) fn last_pts(&self) -> Option<Duration> {
        *self.last_pts.lock()
    }

    pub(crate) fn reset(&self) {
        self.last_pts.lock().take();
    }

    fn deliver(&self, payload: Payload) -> FlowResult {
        let Some(peer) = self.peer() else {
            return Err(FlowError::NotLinked);
        };
        match payload {
            Payload::Buffer(buffer) => {
                let pts = buffer.pts();
                peer.push(buffer)?;
                if pts.is_some() {
                    *self.last_pts.lock() = pts;
                }
                Ok(())
            }
            Payload::Event(event) => {
                let name = event.name();
                if !peer.push_event(event) {
                    tracing::debug!(event = name, "Downstream did not handle event");
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Started,
    Paused,
    Stopped,
}

struct Task {
    state: Mutex<TaskState>,
    cond: Condvar,
}

impl Task {
    fn set(&self, state: TaskState) {
        *self.state.lock() = state;
        self.cond.notify_all();
    }
}

/// Thread pushing the items of one [`DeliveryQueue`] downstream.
///
/// The thread pauses itself when the queue runs empty or downstream stops
/// accepting data, and continues after [`DeliveryWorker::resume`].
pub struct DeliveryWorker {
    task: Arc<Task>,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryWorker {
    pub(crate) fn spawn(
        name: &str,
        queue: Arc<DeliveryQueue>,
        outlet: Arc<Outlet>,
        poster: Poster,
    ) -> Result<Self> {
        let task = Arc::new(Task {
            state: Mutex::new(TaskState::Started),
            cond: Condvar::new(),
        });
        let pad = name.to_owned();
        let handle = std::thread::Builder::new()
            .name(format!("padflow-{name}"))
            .spawn({
                let task = task.clone();
                move || run(&pad, &task, &queue, &outlet, &poster)
            })?;
        Ok(DeliveryWorker {
            task,
            handle: Some(handle),
        })
    }

    /// Restarts a paused worker.
    pub fn resume(&self) {
        let mut state = self.task.state.lock();
        if *state == TaskState::Paused {
            *state = TaskState::Started;
            self.task.cond.notify_all();
        }
    }

    /// Stops the worker and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.task.set(TaskState::Stopped);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Delivery worker panicked");
            }
        }
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(pad: &str, task: &Task, queue: &DeliveryQueue, outlet: &Outlet, poster: &Poster) {
    tracing::trace!(pad, "Delivery worker started");
    loop {
        {
            let mut state = task.state.lock();
            loop {
                match *state {
                    TaskState::Stopped => {
                        tracing::trace!(pad, "Delivery worker stopped");
                        return;
                    }
                    TaskState::Paused => task.cond.wait(&mut state),
                    TaskState::Started => break,
                }
            }
        }

        let Some(item) = queue.pop() else {
            let mut state = task.state.lock();
            if *state == TaskState::Started && queue.is_empty() {
                *state = TaskState::Paused;
            }
            continue;
        };

        match outlet.deliver(item.into_payload()) {
            Ok(()) => {}
            Err(FlowError::NotLinked) => {
                tracing::warn!(pad, "Dropping item, pad is not linked");
            }
            Err(err @ (FlowError::Flushing | FlowError::Eos)) => {
                tracing::debug!(pad, %err, "Downstream refused data, pausing");
                pause(task);
            }
            Err(err) => {
                poster.error(Domain::Stream, format!("Pushing on {pad} failed: {err}"));
                pause(task);
            }
        }
    }
}

fn pause(task: &Task) {
    let mut state = task.state.lock();
    if *state == TaskState::Started {
        *state = TaskState::Paused;
    }
}
