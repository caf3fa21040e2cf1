// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The aggregation worker thread.
//!
//! One iteration produces at most one composite buffer:
//!
//! 1. negotiate the output format if it is missing or stale,
//! 2. wait until every live pad has data or the output deadline passes,
//! 3. pop one buffer per pad and move their memory into a composite,
//! 4. stamp the composite and hand it to the source pad's delivery queue.

use std::sync::Arc;

use crate::buffer::ChannelMask;
use crate::bus::Domain;
use crate::event::{Event, Segment};
use crate::notify::WaitOutcome;
use crate::quorum::Quorum;

use super::BatchInner;

enum Step {
    Continue,
    Exit,
}

pub(super) fn run(inner: Arc<BatchInner>) {
    tracing::debug!(element = %inner.name, "Aggregation worker started");
    while let Step::Continue = step(&inner) {}
    tracing::debug!(element = %inner.name, "Aggregation worker stopped");
}

fn step(inner: &BatchInner) -> Step {
    if !inner.is_active() {
        return Step::Exit;
    }

    if inner.needs_negotiation() {
        inner.notify.wait_until(None, || {
            let state = inner.state.lock();
            !state.active || Quorum::new(&state.pads).any_negotiated()
        });
        if !inner.is_active() {
            return Step::Exit;
        }
        if let Err(err) = inner.negotiate() {
            inner.state.lock().failed = true;
            inner.poster.error(Domain::Negotiation, err.to_string());
            return Step::Exit;
        }
    }

    if inner.forward_eos_when_drained() {
        inner.notify.wait_until(None, || {
            let state = inner.state.lock();
            !state.active || !state.eos_sent || state.renegotiate
        });
        return Step::Continue;
    }

    if !inner.src.has_base_time() && !inner.any_data() {
        inner.notify.wait_until(None, || inner.wake_for_any_data());
        return Step::Continue;
    }

    let duration = inner.output_duration();
    let deadline = inner.src.base_time() + inner.src.position() + duration;
    let outcome = inner.notify.wait_until(Some(deadline), || inner.wake_for_quorum());
    if !inner.is_active() {
        return Step::Exit;
    }
    if inner.needs_negotiation() {
        return Step::Continue;
    }
    if outcome == WaitOutcome::TimedOut && !inner.any_data() {
        // The deadline is already behind us, park until something arrives.
        inner.notify.wait_until(None, || inner.wake_for_any_data());
        return Step::Continue;
    }

    compose_and_enqueue(inner, duration);
    Step::Continue
}

fn compose_and_enqueue(inner: &BatchInner, duration: std::time::Duration) {
    let (drained, attached) = {
        let state = inner.state.lock();
        let drained: Vec<_> = state
            .pads
            .iter()
            .enumerate()
            .filter_map(|(position, pad)| pad.pop_head().map(|buffer| (position, buffer)))
            .collect();
        (drained, state.pads.len())
    };
    if drained.is_empty() {
        return;
    }

    let composite = inner.arena.allocate_empty();
    let mut mask = ChannelMask::default();
    for (position, buffer) in &drained {
        for memory in buffer.take_memories() {
            composite.append_memory(memory);
        }
        if !composite.add_parent(buffer) {
            tracing::warn!(
                element = %inner.name,
                "Input buffer was allocated outside the element's arena, not pinning it"
            );
        }
        mask.set(*position);
    }
    drop(drained);

    if composite.n_memory() == 0 {
        tracing::debug!(element = %inner.name, "Discarding composite without memory");
        return;
    }

    if (mask.count() as usize) < attached {
        tracing::info!(
            element = %inner.name,
            channels = %mask,
            attached,
            "Deadline passed, sending partial composite"
        );
    }

    let pts = inner.src.advance(duration);
    composite.set_pts(Some(pts));
    composite.set_duration(Some(duration));
    composite.set_channel_mask(mask);

    let segment_pending = std::mem::take(&mut inner.state.lock().segment_pending);
    if segment_pending {
        inner.src.enqueue_event(Event::Segment(Segment::default()));
    }
    tracing::trace!(element = %inner.name, ?pts, channels = %mask, "Enqueueing composite");
    if !inner.src.enqueue_buffer(composite) {
        tracing::debug!(element = %inner.name, ?pts, "Delivery queue rejected composite");
    }
}
